//! Collaborator seams consumed by the connection core.
//!
//! The runtime does not decide who may connect, how streams are layered,
//! where codebases come from, or who hears about faults; it consumes these
//! four traits.  Reasonable permissive defaults are provided for all of
//! them.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use rmi_msg::ObjectId;

use crate::util::err::Error;

/// Object-safe alias for the byte streams the runtime moves frames over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// A boxed byte stream.
pub type BoxedIo = Box<dyn IoStream + 'static>;

/// Decides whether peers may connect and whether invocations may run.
///
/// Both methods may block (on a directory service, say); the runtime never
/// calls them while holding a registry lock, and `authorize` runs on the
/// worker task of the invocation it guards, not on the connection reactor.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Decide whether a peer presenting `auth_id`/`passphrase` from
    /// `remote` may hold a connection.
    async fn authenticate(&self, remote: SocketAddr, auth_id: &str, passphrase: &str) -> bool;

    /// Decide whether the peer authenticated as `auth_id` may invoke
    /// `method` on the object `target`.
    ///
    /// `auth_id` is None for connections that skipped authentication
    /// (loopback); the runtime does not consult `authorize` for those.
    async fn authorize(&self, auth_id: Option<&str>, target: &ObjectId, method: &str) -> bool;
}

/// The default authenticator: everyone may connect, everyone may invoke.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct AcceptAll;

#[async_trait]
impl Authenticator for AcceptAll {
    async fn authenticate(&self, _remote: SocketAddr, _auth_id: &str, _passphrase: &str) -> bool {
        true
    }
    async fn authorize(&self, _auth_id: Option<&str>, _target: &ObjectId, _method: &str) -> bool {
        true
    }
}

/// Wraps raw byte streams into layered streams (TLS, compression) before
/// the handshake runs over them.
#[async_trait]
pub trait StreamLayer: Send + Sync + 'static {
    /// Layer an outbound stream that was just connected to `peer`.
    async fn wrap_outbound(&self, io: BoxedIo, peer: SocketAddr) -> Result<BoxedIo, Error>;
    /// Layer an inbound stream that was just accepted from `peer`.
    async fn wrap_inbound(&self, io: BoxedIo, peer: SocketAddr) -> Result<BoxedIo, Error>;
}

/// The default stream layer: plain streams, unchanged.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct PlainStreams;

#[async_trait]
impl StreamLayer for PlainStreams {
    async fn wrap_outbound(&self, io: BoxedIo, _peer: SocketAddr) -> Result<BoxedIo, Error> {
        Ok(io)
    }
    async fn wrap_inbound(&self, io: BoxedIo, _peer: SocketAddr) -> Result<BoxedIo, Error> {
        Ok(io)
    }
}

/// Receives codebase source hints carried by CodebaseUpdate messages.
pub trait CodebaseResolver: Send + Sync + 'static {
    /// A peer announced the given set of codebase source URLs.
    fn codebase_updated(&self, urls: BTreeSet<String>);
}

/// Hears about connection handlers that were disposed by a fault.
///
/// Observers must not panic; if one does anyway, the panic is swallowed so
/// that one misbehaving observer cannot take the runtime down with it.
pub trait FaultObserver: Send + Sync + 'static {
    /// The handler talking to `peer` was disposed because of `error`.
    fn handler_faulted(&self, peer: SocketAddr, error: &Error);
}

/// Credentials presented to a peer during the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Credentials {
    /// The identifier to authenticate as.
    pub auth_id: String,
    /// The passphrase proving the identifier.
    pub passphrase: String,
}

impl Credentials {
    /// Construct credentials from an identifier and a passphrase.
    pub fn new(auth_id: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Credentials {
            auth_id: auth_id.into(),
            passphrase: passphrase.into(),
        }
    }
}
