//! Implementation for the connection handshake.
//!
//! Before any frame travels, the two sides exchange raw bytes: registry
//! identifiers and listener ports, a loopback test, and (unless the
//! connection loops back to the local registry) credentials and verdicts.
//! Only then does the stream switch to the framed codec.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use asynchronous_codec as futures_codec;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::stream::StreamExt;
use tracing::{debug, trace};

use rmi_bytes::Writer;
use rmi_msg::{RegistryId, REGISTRY_ID_LEN};

use crate::channel::codec::MsgCodec;
use crate::channel::{Channel, PeerInfo, Reactor, UniqId};
use crate::registry::Registry;
use crate::util::err::{internal, Error};
use crate::Result;

/// Longest registry-identifier string we will read during a handshake.
///
/// The identifier is always exactly 80 hex nibbles; anything longer is a
/// peer speaking some other protocol.
const MAX_ID_LEN: usize = REGISTRY_ID_LEN * 2;

/// A raw connection on which nothing has been done.
pub(crate) struct Handshake<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    /// Underlying (possibly layered) byte stream.
    stream: T,
    /// The peer's socket address.
    peer_addr: SocketAddr,
    /// Our own address on this connection, for the loopback test.
    local_ip: IpAddr,
    /// The registry this connection belongs to.
    registry: Arc<Registry>,
    /// Logging identifier for this connection.
    unique_id: UniqId,
}

/// A connection on which the handshake has completed, ready to become a
/// channel and reactor.
pub(crate) struct NegotiatedChannel<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> {
    /// The Source+Sink on which we're reading and writing frames.
    framed: futures_codec::Framed<T, MsgCodec>,
    /// What the handshake learned about the peer.
    peer: PeerInfo,
    /// Logging identifier for this connection.
    unique_id: UniqId,
}

/// Helper: wrap an IoError as a HandshakeIoErr.
fn io_err_to_handshake(err: std::io::Error) -> Error {
    Error::HandshakeIoErr(Arc::new(err))
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Handshake<T> {
    /// Construct a new Handshake over `stream`.
    pub(crate) fn new(
        stream: T,
        peer_addr: SocketAddr,
        local_ip: IpAddr,
        registry: Arc<Registry>,
    ) -> Self {
        Handshake {
            stream,
            peer_addr,
            local_ip,
            registry,
            unique_id: UniqId::new(),
        }
    }

    /// Run the handshake.  Both sides run the same sequence; writes go
    /// first so that neither side can deadlock waiting for the other.
    pub(crate) async fn perform(mut self) -> Result<NegotiatedChannel<T>> {
        debug!(
            "{}: starting handshake with {}",
            self.unique_id, self.peer_addr
        );

        // Greeting: our registry id (as hex) and our listener port.
        {
            let mut greeting: Vec<u8> = Vec::new();
            greeting
                .write_utf8(&self.registry.id().to_string())
                .map_err(|_| internal!("registry id did not fit in a greeting"))?;
            greeting.write_u32(u32::from(self.registry.listener_port()));
            self.stream
                .write_all(&greeting)
                .await
                .map_err(io_err_to_handshake)?;
            self.stream.flush().await.map_err(io_err_to_handshake)?;
        }

        let peer_id: RegistryId = {
            let id_str = self.read_utf8().await?;
            id_str
                .parse()
                .map_err(|_| Error::HandshakeProto("unparseable registry identifier".into()))?
        };
        let peer_port = {
            let mut buf = [0_u8; 4];
            self.stream
                .read_exact(&mut buf)
                .await
                .map_err(io_err_to_handshake)?;
            let port = u32::from_be_bytes(buf);
            u16::try_from(port)
                .map_err(|_| Error::HandshakeProto("listener port out of range".into()))?
        };
        trace!(
            "{}: peer is {:?}, listener port {}",
            self.unique_id,
            peer_id,
            peer_port
        );

        // Loopback test: same registry id, and an address that resolves
        // to this host.
        let loopback = peer_id == self.registry.id()
            && (self.peer_addr.ip().is_loopback() || self.peer_addr.ip() == self.local_ip);
        self.write_bool(loopback).await?;
        let peer_ack = self.read_bool().await?;

        let (loopback, auth_id) = if loopback || peer_ack {
            trace!("{}: loopback connection; skipping authentication", self.unique_id);
            (true, None)
        } else {
            let auth_id = self.authenticate().await?;
            (false, Some(auth_id))
        };

        debug!("{}: handshake with {} complete", self.unique_id, self.peer_addr);
        Ok(NegotiatedChannel {
            framed: futures_codec::Framed::new(self.stream, MsgCodec::new()),
            peer: PeerInfo {
                registry_id: peer_id,
                addr: self.peer_addr,
                listener_port: peer_port,
                loopback,
                auth_id,
            },
            unique_id: self.unique_id,
        })
    }

    /// Exchange credentials and verdicts with the peer.
    ///
    /// On success, returns the identity the peer authenticated as.
    async fn authenticate(&mut self) -> Result<String> {
        let ours = self.registry.credentials_for(self.peer_addr.ip());
        {
            let mut creds: Vec<u8> = Vec::new();
            creds
                .write_utf8(&ours.auth_id)
                .map_err(|_| Error::HandshakeProto("auth id too long".into()))?;
            creds
                .write_utf8(&ours.passphrase)
                .map_err(|_| Error::HandshakeProto("passphrase too long".into()))?;
            self.stream
                .write_all(&creds)
                .await
                .map_err(io_err_to_handshake)?;
            self.stream.flush().await.map_err(io_err_to_handshake)?;
        }

        let peer_auth_id = self.read_utf8().await?;
        let peer_passphrase = self.read_utf8().await?;

        let verdict = self
            .registry
            .authenticator()
            .authenticate(self.peer_addr, &peer_auth_id, &peer_passphrase)
            .await;
        self.write_bool(verdict).await?;
        let peer_verdict = self.read_bool().await?;

        if !verdict {
            return Err(Error::LocalAuthentication);
        }
        if !peer_verdict {
            return Err(Error::RemoteAuthentication);
        }
        Ok(peer_auth_id)
    }

    /// Read one u16-length-prefixed UTF-8 string from the raw stream.
    async fn read_utf8(&mut self) -> Result<String> {
        let mut len_buf = [0_u8; 2];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(io_err_to_handshake)?;
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len > MAX_ID_LEN.max(1024) {
            return Err(Error::HandshakeProto("handshake string too long".into()));
        }
        let mut buf = vec![0_u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(io_err_to_handshake)?;
        String::from_utf8(buf)
            .map_err(|_| Error::HandshakeProto("handshake string was not UTF-8".into()))
    }

    /// Write one boolean byte to the raw stream.
    async fn write_bool(&mut self, value: bool) -> Result<()> {
        self.stream
            .write_all(&[u8::from(value)])
            .await
            .map_err(io_err_to_handshake)?;
        self.stream.flush().await.map_err(io_err_to_handshake)?;
        Ok(())
    }

    /// Read one boolean byte from the raw stream.
    async fn read_bool(&mut self) -> Result<bool> {
        let mut buf = [0_u8; 1];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(io_err_to_handshake)?;
        match buf[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::HandshakeProto("boolean was not 0 or 1".into())),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> NegotiatedChannel<T> {
    /// Return what the handshake learned about the peer.
    pub(crate) fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Complete the handshake and produce an open channel and Reactor.
    pub(crate) fn finish(self, registry: Arc<Registry>) -> (Channel, Reactor) {
        let (sink, stream) = self.framed.split();
        Channel::new(
            registry,
            Box::new(sink),
            Box::new(stream),
            self.peer,
            self.unique_id,
        )
    }
}
