//! Code to handle incoming messages on a connection.
//!
//! The role of this code is to run in a separate asynchronous task,
//! routing inbound messages to skeletons, waiters, and the garbage
//! collector, and draining the outbound queue in FIFO order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{AbortHandle, Abortable, FutureExt};
use futures::select_biased;
use futures::sink::{Sink, SinkExt};
use futures::stream::{Fuse, Stream, StreamExt};
use tracing::{debug, trace};

use rmi_msg::msg::{AnyMsg, NewReference, RemoteInterface, Return};
use rmi_msg::value::{kind, Fault};
use rmi_msg::ObjectId;

use crate::channel::codec::CodecError;
use crate::channel::pending::{InterfacesSender, PendingTable, ReturnSender};
use crate::channel::{Channel, PeerInfo, UniqId};
use crate::registry::Registry;
use crate::rewrite::{hydrate_value, Arg};
use crate::util::err::{ChannelClosed, Error, ReactorError};
use crate::Result;

/// A boxed trait object that can provide inbound messages.
pub(crate) type BoxedMsgStream =
    Box<dyn Stream<Item = std::result::Result<AnyMsg, CodecError>> + Send + Unpin + 'static>;
/// A boxed trait object that can sink outbound messages.
pub(crate) type BoxedMsgSink =
    Box<dyn Sink<AnyMsg, Error = CodecError> + Send + Unpin + 'static>;

/// A message telling the reactor to do something.
#[derive(Debug)]
pub(crate) enum CtrlMsg {
    /// Dispose the connection.
    Shutdown,
    /// Write this message to the peer, bypassing the bounded queue.
    ///
    /// Used for fire-and-forget traffic whose senders cannot block:
    /// Finalize from destructors, ReferenceUse on cache hits, and
    /// Interruption from abandoned callers.
    Send(AnyMsg),
}

/// An entry in the reactor's outbound queue.
pub(crate) enum QueuedItem {
    /// An invocation, with the slot its Return is delivered on.
    Call {
        /// The invocation to send.
        msg: rmi_msg::msg::Invocation,
        /// Where to deliver the outcome.
        tx: ReturnSender,
    },
    /// An interface introspection request, with its response slot.
    InterfaceRequest {
        /// The request to send.
        msg: RemoteInterface,
        /// Where to deliver the interface list.
        tx: InterfacesSender,
    },
    /// Any other message, sent without a response slot.
    Msg(AnyMsg),
}

/// Object to handle incoming messages and background tasks on a
/// connection.
///
/// This type is returned when you finish a handshake; you need to spawn a
/// new task that calls `run()` on it.
#[must_use = "If you don't call run() on a reactor, the channel won't work."]
pub(crate) struct Reactor {
    /// The registry this connection belongs to.
    registry: Arc<Registry>,
    /// Frontend handle for this connection; hydrated stubs bind to it.
    channel: Channel,
    /// A receiver for control messages from `Channel` objects.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// A receiver for the outbound FIFO queue.
    msgs: mpsc::Receiver<QueuedItem>,
    /// A Stream from which we can read inbound messages.
    input: Fuse<BoxedMsgStream>,
    /// A Sink to which we can write outbound messages.
    output: BoxedMsgSink,
    /// Waiters for Returns and interface responses.
    pending: PendingTable,
    /// Ids of local skeletons the peer holds references to through this
    /// connection, so disposal can release them.
    referenced: HashSet<ObjectId>,
    /// Handles for cooperatively interrupting the workers of inbound
    /// invocations, by invocation id.
    workers: HashMap<u64, AbortHandle>,
    /// What the handshake learned about the peer.
    peer: Arc<PeerInfo>,
    /// A unique identifier for this connection.
    unique_id: UniqId,
    /// Set at disposal; `Channel` objects check it to fail sends fast.
    closed: Arc<AtomicBool>,
    /// Fault simulation: dispose this handler after this lifetime.
    sim_life: Option<Duration>,
}

impl std::fmt::Display for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.unique_id)
    }
}

impl Reactor {
    /// Construct a new reactor.  Called from `Channel::new`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<Registry>,
        channel: Channel,
        control: mpsc::UnboundedReceiver<CtrlMsg>,
        msgs: mpsc::Receiver<QueuedItem>,
        output: BoxedMsgSink,
        input: BoxedMsgStream,
        peer: Arc<PeerInfo>,
        unique_id: UniqId,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let sim_life = registry
            .config()
            .fault_sim_max_life
            .map(|max| max.mul_f64(rand::random::<f64>()));
        Reactor {
            registry,
            channel,
            control,
            msgs,
            input: StreamExt::fuse(input),
            output,
            pending: PendingTable::new(),
            referenced: HashSet::new(),
            workers: HashMap::new(),
            peer,
            unique_id,
            closed,
            sim_life,
        }
    }

    /// Launch the reactor, and run until the connection closes or we
    /// encounter an error.
    ///
    /// Once this function returns, the connection is dead, and can't be
    /// used again.
    pub(crate) async fn run(mut self) -> Result<()> {
        debug!("{}: Running reactor", self);

        // Fault simulation: a handler with a bounded life disposes itself
        // when the timer fires.
        let sim_life = self.sim_life;
        let simulated_fault = async move {
            match sim_life {
                Some(life) => tokio::time::sleep(life).await,
                None => futures::future::pending::<()>().await,
            }
        }
        .fuse();
        futures::pin_mut!(simulated_fault);

        let result: Result<()> = loop {
            select_biased! {
                _ = simulated_fault => {
                    debug!("{}: fault simulation disposing handler", self);
                    break Err(Error::ChannelClosed(ChannelClosed));
                }
                r = self.run_once().fuse() => match r {
                    Ok(()) => (),
                    Err(ReactorError::Shutdown) => break Ok(()),
                    Err(ReactorError::Err(e)) => break Err(e),
                },
            }
        };

        match &result {
            Ok(()) => debug!("{}: Reactor stopped", self),
            Err(e) => debug!("{}: Reactor stopped: {}", self, e),
        }
        self.dispose(result.as_ref().err());
        result
    }

    /// Helper for run(): handles only one action.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorError> {
        select_biased! {
            ret = self.control.next() => {
                let ctrl = match ret {
                    None | Some(CtrlMsg::Shutdown) => return Err(ReactorError::Shutdown),
                    Some(x) => x,
                };
                match ctrl {
                    CtrlMsg::Shutdown => unreachable!(), // handled above
                    CtrlMsg::Send(msg) => self.send_to_peer(msg).await?,
                }
            }

            // See if the output sink can take a frame yet; if so, pull
            // the next queued item.  Checking readiness first keeps the
            // reader responsive while the peer is slow to drain us.
            ret = next_sendable(&mut self.output, &mut self.msgs).fuse() => {
                let item = ret?.ok_or(ReactorError::Shutdown)?;
                self.handle_outbound(item).await?;
            }

            ret = self.input.next() => {
                let item = ret
                    .ok_or(ReactorError::Shutdown)?
                    .map_err(|e| ReactorError::Err(e.into()))?;
                self.handle_msg(item).await?;
            }
        }
        Ok(())
    }

    /// Write one message to the peer.
    async fn send_to_peer(&mut self, msg: AnyMsg) -> std::result::Result<(), ReactorError> {
        trace!("{}: sending {}", self, msg.cmd());
        self.output
            .send(msg)
            .await
            .map_err(|e| ReactorError::Err(e.into()))
    }

    /// Process one item from the outbound queue.
    async fn handle_outbound(&mut self, item: QueuedItem) -> std::result::Result<(), ReactorError> {
        match item {
            QueuedItem::Call { msg, tx } => {
                // The pending entry goes in BEFORE the frame is written,
                // so the response cannot race the table.
                self.pending.insert_call(msg.id(), tx);
                self.send_to_peer(msg.into()).await?;
            }
            QueuedItem::InterfaceRequest { msg, tx } => {
                self.pending.insert_interfaces(msg.id(), tx);
                self.send_to_peer(msg.into()).await?;
            }
            QueuedItem::Msg(msg) => {
                // A Return passing outward means its worker is done.
                if let AnyMsg::Return(r) = &msg {
                    self.workers.remove(&r.id());
                }
                self.send_to_peer(msg).await?;
            }
        }
        Ok(())
    }

    /// Process one inbound message.
    async fn handle_msg(&mut self, msg: AnyMsg) -> std::result::Result<(), ReactorError> {
        trace!("{}: received {}", self, msg.cmd());
        match msg {
            AnyMsg::Invocation(inv) => self.handle_invocation(inv).await?,
            AnyMsg::Return(r) => {
                self.pending.complete_call(r.id(), Ok(r));
            }
            AnyMsg::NewReference(m) => {
                let object_id = m.object_id().clone();
                if self.registry.add_ref(&object_id, self.unique_id) {
                    self.referenced.insert(object_id);
                } else {
                    trace!("{}: NewReference for unknown object {}", self, object_id);
                }
            }
            AnyMsg::Finalize(m) => {
                let remaining = self.registry.remove_ref(m.object_id(), self.unique_id);
                if remaining == 0 {
                    self.referenced.remove(m.object_id());
                }
            }
            AnyMsg::ReferenceUse(m) => {
                self.registry.touch(m.object_id());
            }
            AnyMsg::RemoteInterface(m) => {
                let id = m.id();
                let object_id = m.object_id().clone();
                match m.into_interfaces() {
                    // A response: complete the waiter.
                    Some(interfaces) => self.pending.complete_interfaces(id, Ok(interfaces)),
                    // A request: compute and reply on the same id.
                    None => {
                        let interfaces =
                            self.registry.interfaces_of(&object_id).unwrap_or_default();
                        self.send_to_peer(
                            RemoteInterface::response(id, object_id, interfaces).into(),
                        )
                        .await?;
                    }
                }
            }
            AnyMsg::CodebaseUpdate(m) => {
                if self.registry.config().code_downloading {
                    if let Some(resolver) = self.registry.codebase_resolver() {
                        resolver.codebase_updated(m.into_urls());
                    }
                }
            }
            AnyMsg::Interruption(m) => {
                match self.workers.remove(&m.id()) {
                    Some(handle) => handle.abort(),
                    None => trace!("{}: Interruption for unknown invocation {}", self, m.id()),
                }
            }
            _ => trace!("{}: received unhandled message {}", self, msg.cmd()),
        }
        Ok(())
    }

    /// Process one inbound invocation: hydrate its arguments, announce
    /// any new references, and hand the work to a spawned worker.
    async fn handle_invocation(
        &mut self,
        inv: rmi_msg::msg::Invocation,
    ) -> std::result::Result<(), ReactorError> {
        let (id, object_id, method, param_types, params, _asynchronous) = inv.into_parts();

        let mut new_refs = Vec::new();
        let args: Vec<Arg> = params
            .into_iter()
            .map(|v| hydrate_value(&self.registry, &self.channel, v, &mut new_refs))
            .collect();
        // The stubs we just hydrated point back at the peer; announce our
        // references before anything can travel through them.
        for object_id in new_refs {
            self.send_to_peer(NewReference::new(object_id).into()).await?;
        }

        let Some(skeleton) = self.registry.lookup(&object_id) else {
            let fault = Fault::new(kind::NO_SUCH_OBJECT, object_id.to_string());
            self.send_to_peer(Return::new(id, None, Err(fault)).into())
                .await?;
            return Ok(());
        };

        let registry = Arc::clone(&self.registry);
        let chan = self.channel.clone();
        let peer = Arc::clone(&self.peer);
        let (abort_handle, abort_reg) = AbortHandle::new_pair();
        self.workers.insert(id, abort_handle);

        let work = Abortable::new(
            async move {
                // Loopback connections skipped authentication, and skip
                // authorization with it.
                let authorized = peer.loopback
                    || registry
                        .authenticator()
                        .authorize(peer.auth_id.as_deref(), &object_id, &method)
                        .await;
                if !authorized {
                    let fault = Fault::new(
                        kind::AUTHORIZATION,
                        format!("{} on {}", method, object_id),
                    );
                    return Return::new(id, None, Err(fault));
                }
                let outcome = skeleton
                    .invoke(&registry, peer.registry_id, id, &method, param_types, args)
                    .await;
                Return::new(id, None, outcome)
            },
            abort_reg,
        );

        tokio::spawn(async move {
            let ret = match work.await {
                Ok(ret) => ret,
                // Interrupted: the caller still gets a sentinel Return so
                // its pending entry is cleaned up.
                Err(_aborted) => Return::new(
                    id,
                    None,
                    Err(Fault::new(kind::INTERRUPTED, "invocation interrupted")),
                ),
            };
            let _ = chan.send_msg(ret.into()).await;
        });
        Ok(())
    }

    /// Dispose this connection: unblock every waiter, release every
    /// reference the peer held through us, and tell the registry and its
    /// fault observers.
    fn dispose(&mut self, error: Option<&Error>) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.drain_on_disposal();
        let referenced: Vec<ObjectId> = self.referenced.drain().collect();
        for object_id in referenced {
            self.registry.remove_all_refs(&object_id, self.unique_id);
        }
        // In-flight workers are NOT aborted: their outcomes still land in
        // the invocation cache, which is what lets a reconnecting caller
        // replay the same invocation id and get the original result.
        self.workers.clear();
        self.registry
            .channel_closed(self.peer.registry_id, self.unique_id);
        if let Some(e) = error {
            self.registry.notify_fault(self.peer.addr, e);
        }
    }
}

/// Wait until `output` can accept a frame, then pull the next queued
/// item.
async fn next_sendable(
    output: &mut BoxedMsgSink,
    msgs: &mut mpsc::Receiver<QueuedItem>,
) -> std::result::Result<Option<QueuedItem>, ReactorError> {
    futures::future::poll_fn(|cx| output.poll_ready_unpin(cx))
        .await
        .map_err(|e| ReactorError::Err(e.into()))?;
    Ok(msgs.next().await)
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::RegistryConfig;
    use crate::service::{MethodCall, RemoteService};
    use crate::util::err::Error;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::sink::SinkExt;
    use rmi_msg::msg::{Finalize, Interruption, Invocation, ReferenceUse};
    use rmi_msg::value::Value;
    use rmi_msg::{RegistryId, REGISTRY_ID_LEN};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    pub(crate) type CodecResult = std::result::Result<AnyMsg, CodecError>;

    /// A PeerInfo for tests.
    pub(crate) fn test_peer(loopback: bool) -> PeerInfo {
        PeerInfo {
            registry_id: RegistryId::from_bytes([9; REGISTRY_ID_LEN]),
            addr: "127.0.0.1:9".parse().expect("bad addr"),
            listener_port: 0,
            loopback,
            auth_id: None,
        }
    }

    /// Make a reactor backed by in-memory queues instead of a socket.
    pub(crate) fn new_reactor_with_peer(
        registry: Arc<Registry>,
        peer: PeerInfo,
    ) -> (
        Channel,
        Reactor,
        mpsc::Receiver<AnyMsg>,
        mpsc::Sender<CodecResult>,
    ) {
        let (send1, recv1) = mpsc::channel(32);
        let (send2, recv2) = mpsc::channel(32);
        let unique_id = UniqId::new();
        let send1 = send1.sink_map_err(|e| {
            trace!("got sink error: {:?}", e);
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "test sink gone",
            ))
        });
        let (chan, reactor) = Channel::new(
            registry,
            Box::new(send1),
            Box::new(recv2),
            peer,
            unique_id,
        );
        (chan, reactor, recv1, send2)
    }

    pub(crate) fn new_reactor(
        registry: Arc<Registry>,
    ) -> (
        Channel,
        Reactor,
        mpsc::Receiver<AnyMsg>,
        mpsc::Sender<CodecResult>,
    ) {
        new_reactor_with_peer(registry, test_peer(false))
    }

    /// A service that counts its executions and can run slowly.
    struct SlowEcho {
        /// Number of dispatches that have started.
        executed: AtomicUsize,
        /// How long each dispatch takes.
        delay: Duration,
    }

    impl SlowEcho {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(SlowEcho {
                executed: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl RemoteService for SlowEcho {
        fn interfaces(&self) -> Vec<String> {
            vec!["demo.Echo".into()]
        }
        async fn dispatch(&self, call: MethodCall) -> std::result::Result<Arg, Fault> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match call.method.as_str() {
                "echo" => Ok(call.args.into_iter().next().unwrap_or_else(Arg::null)),
                _ => Err(call.no_such_method()),
            }
        }
    }

    fn invocation(id: u64, object: &str, method: &str, arg: Value) -> Invocation {
        Invocation::new(id, object.into(), method, vec![], vec![arg], false)
    }

    // Try shutdown from inside run_once.
    #[tokio::test]
    async fn shutdown() {
        let registry = Registry::new();
        let (chan, mut reactor, _output, _input) = new_reactor(registry);

        chan.terminate();
        let r = reactor.run_once().await;
        assert!(matches!(r, Err(ReactorError::Shutdown)));
    }

    // A call inserts its pending entry and writes the frame; the Return
    // completes the waiter.
    #[tokio::test]
    async fn call_and_return() {
        let registry = Registry::new();
        let (chan, mut reactor, mut output, mut input) = new_reactor(registry);

        let rx = chan
            .call(invocation(3, "svc", "echo", Value::Int(1)))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();
        assert_eq!(reactor.pending.len(), 1);

        let sent = output.next().await.unwrap();
        assert!(matches!(sent, AnyMsg::Invocation(ref i) if i.id() == 3));

        input
            .send(Ok(Return::new(3, None, Ok(Value::Int(1))).into()))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();
        assert_eq!(reactor.pending.len(), 0);

        let ret = rx.await.unwrap().unwrap();
        assert_eq!(ret.outcome(), &Ok(Value::Int(1)));
    }

    // Disposal completes pending waiters with ChannelClosed and the
    // channel rejects further traffic.
    #[tokio::test]
    async fn disposal_unblocks_waiters() {
        let registry = Registry::new();
        let (chan, reactor, mut output, _input) = new_reactor(registry);

        let rx = chan
            .call(invocation(0, "svc", "echo", Value::Null))
            .await
            .unwrap();

        // Let the reactor pick up the call (the frame appearing on the
        // output proves the pending entry exists), then dispose it.
        let handle = tokio::spawn(reactor.run());
        let sent = output.next().await.unwrap();
        assert!(matches!(sent, AnyMsg::Invocation(_)));
        chan.terminate();
        handle.await.unwrap().unwrap();

        let out = rx.await.unwrap();
        assert!(matches!(out, Err(Error::ChannelClosed(_))));
        assert!(chan.is_closing());
        let e = chan.send_msg(Finalize::new("svc").into()).await;
        assert!(matches!(e, Err(Error::ChannelClosed(_))));
    }

    // NewReference / Finalize / ReferenceUse feed the skeleton's counts,
    // and disposal releases what the peer still held.
    #[tokio::test]
    async fn reference_counting() {
        let registry = Registry::new();
        let svc = SlowEcho::new(Duration::ZERO);
        registry.publish("svc", svc).unwrap();
        let skeleton = registry.lookup(&"svc".into()).unwrap();

        let (_chan, mut reactor, _output, mut input) = new_reactor(Arc::clone(&registry));

        input
            .send(Ok(NewReference::new("svc").into()))
            .await
            .unwrap();
        input
            .send(Ok(NewReference::new("svc").into()))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();
        reactor.run_once().await.unwrap();
        assert_eq!(skeleton.total_refs(), 2);

        input.send(Ok(Finalize::new("svc").into())).await.unwrap();
        reactor.run_once().await.unwrap();
        assert_eq!(skeleton.total_refs(), 1);

        input
            .send(Ok(ReferenceUse::new("svc").into()))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();

        // Dispose with one reference still out: it must be released.
        reactor.dispose(None);
        assert_eq!(skeleton.total_refs(), 0);
    }

    // An inbound invocation runs the service and sends a Return; the
    // same invocation id replayed does not run the service again.
    #[tokio::test]
    async fn invocation_exactly_once() {
        let registry = Registry::new();
        let svc = SlowEcho::new(Duration::ZERO);
        registry.publish("svc", Arc::clone(&svc) as Arc<dyn RemoteService>).unwrap();

        let (_chan, reactor, mut output, mut input) = new_reactor(Arc::clone(&registry));
        tokio::spawn(reactor.run());

        input
            .send(Ok(invocation(7, "svc", "echo", Value::Int(5)).into()))
            .await
            .unwrap();
        let first = output.next().await.unwrap();
        assert!(matches!(first, AnyMsg::Return(ref r)
            if r.id() == 7 && r.outcome() == &Ok(Value::Int(5))));

        // Replay after a (simulated) reconnect: cached outcome, no second
        // execution.
        input
            .send(Ok(invocation(7, "svc", "echo", Value::Int(5)).into()))
            .await
            .unwrap();
        let second = output.next().await.unwrap();
        assert!(matches!(second, AnyMsg::Return(ref r)
            if r.id() == 7 && r.outcome() == &Ok(Value::Int(5))));

        assert_eq!(svc.executed.load(Ordering::SeqCst), 1);
    }

    // Unknown target objects produce a NoSuchObject fault Return.
    #[tokio::test]
    async fn invocation_unknown_object() {
        let registry = Registry::new();
        let (_chan, reactor, mut output, mut input) = new_reactor(registry);
        tokio::spawn(reactor.run());

        input
            .send(Ok(invocation(1, "nobody", "echo", Value::Null).into()))
            .await
            .unwrap();
        let ret = output.next().await.unwrap();
        match ret {
            AnyMsg::Return(r) => match r.outcome() {
                Err(f) => assert_eq!(f.kind, kind::NO_SUCH_OBJECT),
                other => panic!("unexpected outcome {:?}", other),
            },
            other => panic!("unexpected message {:?}", other),
        }
    }

    // An Interruption aborts the running worker; the caller still gets a
    // sentinel Return.
    #[tokio::test]
    async fn interruption_cancels_worker() {
        let registry = Registry::new();
        let svc = SlowEcho::new(Duration::from_secs(60));
        registry.publish("svc", svc).unwrap();

        let (_chan, reactor, mut output, mut input) = new_reactor(Arc::clone(&registry));
        tokio::spawn(reactor.run());

        input
            .send(Ok(invocation(4, "svc", "echo", Value::Null).into()))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        input
            .send(Ok(Interruption::new(4).into()))
            .await
            .unwrap();

        let ret = tokio::time::timeout(Duration::from_secs(5), output.next())
            .await
            .expect("no sentinel Return arrived")
            .unwrap();
        match ret {
            AnyMsg::Return(r) => match r.outcome() {
                Err(f) => assert_eq!(f.kind, kind::INTERRUPTED),
                other => panic!("unexpected outcome {:?}", other),
            },
            other => panic!("unexpected message {:?}", other),
        }
    }

    // Authorization is consulted for non-loopback peers, and skipped for
    // loopback ones.
    #[tokio::test]
    async fn loopback_skips_authorization() {
        /// An authenticator that refuses every authorization.
        struct DenyAll;
        #[async_trait]
        impl crate::auth::Authenticator for DenyAll {
            async fn authenticate(
                &self,
                _remote: std::net::SocketAddr,
                _auth_id: &str,
                _passphrase: &str,
            ) -> bool {
                true
            }
            async fn authorize(
                &self,
                _auth_id: Option<&str>,
                _target: &ObjectId,
                _method: &str,
            ) -> bool {
                false
            }
        }

        let registry = Registry::new();
        registry.set_authenticator(Arc::new(DenyAll));
        registry.publish("svc", SlowEcho::new(Duration::ZERO)).unwrap();

        // Non-loopback: the invocation is refused.
        let (_chan, reactor, mut output, mut input) =
            new_reactor_with_peer(Arc::clone(&registry), test_peer(false));
        tokio::spawn(reactor.run());
        input
            .send(Ok(invocation(1, "svc", "echo", Value::Null).into()))
            .await
            .unwrap();
        let ret = output.next().await.unwrap();
        assert!(matches!(ret, AnyMsg::Return(ref r)
            if matches!(r.outcome(), Err(f) if f.kind == kind::AUTHORIZATION)));

        // Loopback: authorization is bypassed.
        let (_chan, reactor, mut output, mut input) =
            new_reactor_with_peer(Arc::clone(&registry), test_peer(true));
        tokio::spawn(reactor.run());
        input
            .send(Ok(invocation(1, "svc", "echo", Value::Int(3)).into()))
            .await
            .unwrap();
        let ret = output.next().await.unwrap();
        assert!(matches!(ret, AnyMsg::Return(ref r)
            if r.outcome() == &Ok(Value::Int(3))));
    }

    // An interface request is answered on the same correlation id.
    #[tokio::test]
    async fn interface_request_response() {
        let registry = Registry::new();
        registry.publish("svc", SlowEcho::new(Duration::ZERO)).unwrap();
        let (_chan, mut reactor, mut output, mut input) = new_reactor(registry);

        input
            .send(Ok(RemoteInterface::request(9, "svc".into()).into()))
            .await
            .unwrap();
        reactor.run_once().await.unwrap();

        let resp = output.next().await.unwrap();
        match resp {
            AnyMsg::RemoteInterface(m) => {
                assert_eq!(m.id(), 9);
                assert_eq!(m.interfaces().unwrap(), &["demo.Echo".to_owned()][..]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    // A fault-simulated handler disposes itself.
    #[tokio::test(start_paused = true)]
    async fn fault_simulation_disposes() {
        let config = RegistryConfig::builder()
            .fault_sim_max_life(Some(Duration::from_millis(200)))
            .build()
            .unwrap();
        let registry = Registry::with_config(config);
        let (chan, reactor, _output, _input) = new_reactor(registry);

        let handle = tokio::spawn(reactor.run());
        tokio::time::sleep(Duration::from_millis(250)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::ChannelClosed(_))));
        assert!(chan.is_closing());
    }

    // Bad frames from the peer kill the reactor with a codec error.
    #[tokio::test]
    async fn decode_failure_disposes() {
        let registry = Registry::new();
        let (chan, reactor, _output, mut input) = new_reactor(registry);
        let handle = tokio::spawn(reactor.run());

        input
            .send(Err(CodecError::Dec(rmi_msg::Error::Proto(
                "garbage frame".into(),
            ))))
            .await
            .unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Codec(_))));
        assert!(chan.is_closing());
    }
}
