//! Define an error type for the rmi-proto crate.
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use rmi_msg::value::Fault;
use rmi_msg::ObjectId;
use thiserror::Error;

/// An error type for the rmi-proto crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error from the message codec while encoding or decoding a frame.
    #[error("message codec error: {0}")]
    Codec(#[source] rmi_msg::Error),
    /// An error that occurred from the io system when using a connection.
    #[error("io error on connection: {0}")]
    ChanIoErr(#[source] Arc<std::io::Error>),
    /// An error from the io system that occurred when trying to connect or
    /// handshake.
    #[error("io error in handshake: {0}")]
    HandshakeIoErr(#[source] Arc<std::io::Error>),
    /// Handshake protocol violation.
    #[error("handshake protocol violation: {0}")]
    HandshakeProto(String),
    /// We could not verify the peer's credentials.
    #[error("could not authenticate the peer")]
    LocalAuthentication,
    /// The peer refused our credentials.
    #[error("the peer refused our credentials")]
    RemoteAuthentication,
    /// The connection handler was disposed while the operation was in
    /// flight.
    #[error("{0}")]
    ChannelClosed(#[from] ChannelClosed),
    /// A value in an invocation could not be rewritten into wire form.
    #[error("value is not serializable: {0}")]
    NotSerializable(String),
    /// An argument to a registry operation was rejected.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    /// An object identifier did not resolve in the local registry.
    #[error("no such object: {0}")]
    NoSuchObject(ObjectId),
    /// The remote side reported a fault while running the invocation.
    #[error("remote fault: {0}")]
    Fault(#[from] Fault),
    /// A connection-related failure observed by a stub, after any retries
    /// were exhausted.
    #[error("{0}")]
    Remote(RemoteError),
    /// There was a programming error somewhere in our code, or the calling
    /// code.
    #[error("internal programming error: {0}")]
    Internal(String),
}

/// Error which indicates that the connection handler was disposed.
#[derive(Error, Debug, Clone, Default)]
#[error("connection handler disposed")]
#[non_exhaustive]
pub struct ChannelClosed;

/// A connection-related failure surfaced to the caller of a stub.
///
/// The kind name defaults to `RemoteError`; a registry may be configured
/// to stamp a replacement kind name onto these instead.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RemoteError {
    /// Name of the error kind to present.
    pub kind: String,
    /// Description of the underlying failure.
    pub detail: String,
}

impl RemoteError {
    /// Construct a new RemoteError with the default kind name.
    pub fn new<D: Into<String>>(detail: D) -> Self {
        RemoteError {
            kind: "RemoteError".into(),
            detail: detail.into(),
        }
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for RemoteError {}

impl From<rmi_msg::Error> for Error {
    fn from(err: rmi_msg::Error) -> Error {
        Error::Codec(err)
    }
}

/// Internal error produced by the reactor loop: either a request to shut
/// down cleanly, or a real error.
#[derive(Debug)]
pub(crate) enum ReactorError {
    /// The reactor should shut down with a clean exit.
    Shutdown,
    /// The reactor should shut down because of a problem.
    Err(Error),
}

impl From<Error> for ReactorError {
    fn from(e: Error) -> ReactorError {
        ReactorError::Err(e)
    }
}

/// Construct an [`Error::Internal`] from a format string.
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::util::err::Error::Internal(format!($($arg)*))
    }
}
pub(crate) use internal;
