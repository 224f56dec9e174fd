//! Code for talking to another registry over a message-framed connection.
//!
//! A connection between two registries carries every kind of traffic the
//! runtime has: invocations and their returns, the reference-counting
//! notices that feed the distributed garbage collector, interface
//! introspection, codebase hints, and cancellations.
//!
//! This code splits a connection into two pieces: a [`Channel`] object
//! that callers use to enqueue messages, and a reactor object that runs
//! as a task in the background, reading inbound frames, dispatching
//! invocations onto worker tasks, and writing queued frames out in FIFO
//! order.
//!
//! To open a connection, perform the handshake over a byte stream and
//! call `finish()` on the result; then launch an asynchronous task to
//! call the reactor's `run()` method.

/// The size of the outbound queue between a `Channel` and its reactor.
///
/// Enqueues block when the queue is full; that is the backpressure the
/// writer side exerts on callers.
pub const CHANNEL_BUFFER_SIZE: usize = 128;

pub(crate) mod codec;
pub(crate) mod handshake;
mod pending;
mod reactor;
mod unique_id;

pub use unique_id::UniqId;

pub(crate) use handshake::Handshake;
pub(crate) use reactor::{BoxedMsgSink, BoxedMsgStream, CtrlMsg, QueuedItem, Reactor};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::SinkExt;
use tracing::trace;

use rmi_msg::msg::{AnyMsg, Invocation, RemoteInterface, Return};
use rmi_msg::RegistryId;

use crate::registry::Registry;
use crate::util::err::{ChannelClosed, Error};
use crate::Result;

/// Everything the handshake learned about the peer of a connection.
#[derive(Clone, Debug)]
pub(crate) struct PeerInfo {
    /// The peer registry's identifier.
    pub(crate) registry_id: RegistryId,
    /// The address the connection goes to.
    pub(crate) addr: SocketAddr,
    /// The peer's listener port, or 0 if it accepts no connections.
    pub(crate) listener_port: u16,
    /// True if the handshake detected that the peer is our own registry.
    pub(crate) loopback: bool,
    /// The identity the peer authenticated as; None on loopback
    /// connections, which skip authentication.
    pub(crate) auth_id: Option<String>,
}

/// An open connection to another registry, ready to carry messages.
///
/// This is the cheaply-cloneable frontend; the work happens in the
/// [`Reactor`] behind it.
#[derive(Clone)]
pub struct Channel {
    /// A unique identifier for this connection.
    unique_id: UniqId,
    /// What the handshake learned about the peer.
    peer: Arc<PeerInfo>,
    /// If true, this connection has been disposed.
    closed: Arc<AtomicBool>,
    /// A channel used to send control messages to the Reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// A channel used to send queued messages to the Reactor.
    msg_tx: mpsc::Sender<QueuedItem>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Channel({} -> {})", self.unique_id, self.peer.addr)
    }
}

impl Channel {
    /// Construct a channel and reactor.
    ///
    /// Internal method, called to finalize the connection once the
    /// handshake is done and the codec streams are in place.
    pub(crate) fn new(
        registry: Arc<Registry>,
        sink: BoxedMsgSink,
        stream: BoxedMsgStream,
        peer: PeerInfo,
        unique_id: UniqId,
    ) -> (Self, Reactor) {
        let (control_tx, control_rx) = mpsc::unbounded();
        let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let peer = Arc::new(peer);

        let channel = Channel {
            unique_id,
            peer: Arc::clone(&peer),
            closed: Arc::clone(&closed),
            control: control_tx,
            msg_tx,
        };

        let reactor = Reactor::new(
            registry,
            channel.clone(),
            control_rx,
            msg_rx,
            sink,
            stream,
            peer,
            unique_id,
            closed,
        );

        (channel, reactor)
    }

    /// Return a process-unique identifier for this connection.
    pub fn unique_id(&self) -> UniqId {
        self.unique_id
    }

    /// Return the peer registry's identifier.
    pub fn peer_registry_id(&self) -> RegistryId {
        self.peer.registry_id
    }

    /// Return the address this connection goes to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.addr
    }

    /// Return the peer's listener port, or 0 if it accepts no
    /// connections.
    pub fn peer_listener_port(&self) -> u16 {
        self.peer.listener_port
    }

    /// Return true if the handshake detected a loopback connection.
    pub fn is_loopback(&self) -> bool {
        self.peer.loopback
    }

    /// Return the identity the peer authenticated as, if any.
    pub fn peer_auth_id(&self) -> Option<&str> {
        self.peer.auth_id.as_deref()
    }

    /// Return true if this connection is disposed and therefore unusable.
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue an invocation and return the slot its Return will arrive
    /// on.
    ///
    /// The reactor registers the pending entry before the frame is
    /// written, so the response cannot race the table.
    pub(crate) async fn call(
        &self,
        msg: Invocation,
    ) -> Result<oneshot::Receiver<Result<Return>>> {
        if self.is_closing() {
            return Err(Error::ChannelClosed(ChannelClosed));
        }
        trace!("{}: sending {} invocation {}", self.unique_id, msg.method(), msg.id());
        let (tx, rx) = oneshot::channel();
        let mut sender = self.msg_tx.clone();
        sender
            .send(QueuedItem::Call { msg, tx })
            .await
            .map_err(|_| Error::ChannelClosed(ChannelClosed))?;
        Ok(rx)
    }

    /// Enqueue an interface introspection request and return the slot its
    /// response will arrive on.
    pub(crate) async fn request_interfaces(
        &self,
        msg: RemoteInterface,
    ) -> Result<oneshot::Receiver<Result<Vec<String>>>> {
        if self.is_closing() {
            return Err(Error::ChannelClosed(ChannelClosed));
        }
        let (tx, rx) = oneshot::channel();
        let mut sender = self.msg_tx.clone();
        sender
            .send(QueuedItem::InterfaceRequest { msg, tx })
            .await
            .map_err(|_| Error::ChannelClosed(ChannelClosed))?;
        Ok(rx)
    }

    /// Enqueue a message on the FIFO queue, blocking when it is full.
    pub(crate) async fn send_msg(&self, msg: AnyMsg) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ChannelClosed(ChannelClosed));
        }
        let mut sender = self.msg_tx.clone();
        sender
            .send(QueuedItem::Msg(msg))
            .await
            .map_err(|_| Error::ChannelClosed(ChannelClosed))?;
        Ok(())
    }

    /// Hand a message to the reactor outside the FIFO queue.
    ///
    /// For fire-and-forget traffic (Finalize, ReferenceUse, Interruption)
    /// from contexts that cannot block, destructors included.
    pub(crate) fn send_control(&self, msg: AnyMsg) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ChannelClosed(ChannelClosed));
        }
        self.control
            .unbounded_send(CtrlMsg::Send(msg))
            .map_err(|_| Error::ChannelClosed(ChannelClosed))?;
        Ok(())
    }

    /// Shut down this connection immediately.
    ///
    /// Every pending invocation is completed with a disposal error, and
    /// every reference the peer holds through this connection is
    /// released.  Disposal is idempotent.
    pub fn terminate(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Shutdown);
    }
}

#[cfg(test)]
pub(crate) mod test {
    // Most of this module is tested via tests that also check on the
    // reactor code; there are just a few more cases to examine here.
    #![allow(clippy::unwrap_used)]
    use super::*;
    pub(crate) use crate::channel::reactor::test::{new_reactor, new_reactor_with_peer, test_peer};
    use rmi_msg::msg::NewReference;

    /// Make a new fake reactor-less channel.  For testing only, obviously.
    pub(crate) fn fake_channel() -> Channel {
        Channel {
            unique_id: UniqId::new(),
            peer: Arc::new(test_peer(false)),
            closed: Arc::new(AtomicBool::new(false)),
            control: mpsc::unbounded().0,
            msg_tx: mpsc::channel(CHANNEL_BUFFER_SIZE).0,
        }
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends() {
        let chan = fake_channel();
        chan.closed.store(true, Ordering::SeqCst);

        let e = chan.send_msg(NewReference::new("x").into()).await;
        assert!(matches!(e, Err(Error::ChannelClosed(_))));
        let e = chan.send_control(NewReference::new("x").into());
        assert!(matches!(e, Err(Error::ChannelClosed(_))));
        let e = chan
            .call(Invocation::new(0, "x".into(), "m", vec![], vec![], false))
            .await;
        assert!(matches!(e, Err(Error::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn peer_accessors() {
        let chan = fake_channel();
        assert_eq!(chan.peer_listener_port(), 0);
        assert!(!chan.is_loopback());
        assert!(chan.peer_auth_id().is_none());
        assert!(!chan.is_closing());
        let dbg = format!("{:?}", chan);
        assert!(dbg.starts_with("Channel(Conn "));
    }
}
