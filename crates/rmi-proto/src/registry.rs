//! The process-wide registry: reference table, connection pool, and
//! lifecycle policy.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, trace, warn};

use rmi_msg::msg::{CodebaseUpdate, NewReference};
use rmi_msg::value::StubRef;
use rmi_msg::{ObjectId, RegistryId, REGISTRY_ID_LEN};

use crate::auth::{
    AcceptAll, Authenticator, BoxedIo, CodebaseResolver, Credentials, FaultObserver, PlainStreams,
    StreamLayer,
};
use crate::channel::{Channel, Handshake, UniqId};
use crate::config::RegistryConfig;
use crate::dgc;
use crate::rewrite::StubForwarder;
use crate::service::{RemoteService, REMOTE_MARKER};
use crate::skeleton::Skeleton;
use crate::stub::Stub;
use crate::util::err::Error;
use crate::Result;

/// Key identifying a routed (forwarded) stub target: origin host, origin
/// port, object id.
type ForwardKey = (String, u16, ObjectId);

/// Structural state of a registry, behind one lock.
struct RegistryInner {
    /// Every exposed object, by identifier.
    skeletons: HashMap<ObjectId, Arc<Skeleton>>,
    /// Exposed objects by allocation identity, so one object never gets
    /// two skeletons.
    by_identity: HashMap<usize, ObjectId>,
    /// Bound names, mapping to object identifiers.
    names: HashMap<String, ObjectId>,
    /// Interface names whose implementors are auto-published when found
    /// inside argument graphs.
    auto_remote: BTreeSet<String>,
    /// Open connections by peer registry identifier.
    channels: HashMap<RegistryId, Vec<Channel>>,
    /// Which peer registry a dialed address reached, for pool reuse.
    by_addr: HashMap<(String, u16), RegistryId>,
    /// Identifiers of already-published stub forwarders, by target.
    forwarders: HashMap<ForwardKey, ObjectId>,
    /// Per-address credentials we present when dialing or accepting.
    credentials: HashMap<IpAddr, Credentials>,
    /// Credentials used when no per-address entry matches.
    default_credentials: Credentials,
    /// Counter for auto-generated object identifiers.
    next_auto: u64,
}

/// A registry publishes local objects under string identifiers, pools
/// connections to other registries, and reaps objects nobody references.
///
/// Registries are created inside a tokio runtime (the garbage-collector
/// task is spawned at construction when one is running) and shared as
/// `Arc<Registry>`.
pub struct Registry {
    /// This registry's random identifier.
    id: RegistryId,
    /// The configuration this registry was built with.
    config: RegistryConfig,
    /// Decides who may connect and who may invoke.
    authenticator: RwLock<Arc<dyn Authenticator>>,
    /// Layers raw byte streams (TLS, compression) below the handshake.
    stream_layer: RwLock<Arc<dyn StreamLayer>>,
    /// Receives codebase hints from peers, if set.
    codebase_resolver: RwLock<Option<Arc<dyn CodebaseResolver>>>,
    /// Hears about faulted connection handlers.
    fault_observers: RwLock<Vec<Arc<dyn FaultObserver>>>,
    /// Codebase source URLs we announce to peers.
    codebase: Mutex<BTreeSet<String>>,
    /// The listener's bound address, once `listen` has run.
    listener_addr: Mutex<Option<SocketAddr>>,
    /// Structural state.
    inner: Mutex<RegistryInner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registry({:?})", self.id)
    }
}

impl Registry {
    /// Create a registry with the default configuration.
    pub fn new() -> Arc<Registry> {
        Registry::with_config(RegistryConfig::default())
    }

    /// Create a registry with an explicit configuration.
    pub fn with_config(config: RegistryConfig) -> Arc<Registry> {
        let mut id_bytes = [0_u8; REGISTRY_ID_LEN];
        rand::rng().fill(&mut id_bytes[..]);
        let registry = Arc::new(Registry {
            id: RegistryId::from_bytes(id_bytes),
            config,
            authenticator: RwLock::new(Arc::new(AcceptAll)),
            stream_layer: RwLock::new(Arc::new(PlainStreams)),
            codebase_resolver: RwLock::new(None),
            fault_observers: RwLock::new(Vec::new()),
            codebase: Mutex::new(BTreeSet::new()),
            listener_addr: Mutex::new(None),
            inner: Mutex::new(RegistryInner {
                skeletons: HashMap::new(),
                by_identity: HashMap::new(),
                names: HashMap::new(),
                auto_remote: BTreeSet::new(),
                channels: HashMap::new(),
                by_addr: HashMap::new(),
                forwarders: HashMap::new(),
                credentials: HashMap::new(),
                default_credentials: Credentials::default(),
                next_auto: 0,
            }),
        });
        // The reaper is the safety net under the per-skeleton removal
        // timers.  Outside a runtime (plain unit tests), nothing to spawn
        // onto; timers are armed lazily there.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(dgc::run_reaper(Arc::downgrade(&registry)));
        }
        registry
    }

    /// Return this registry's identifier.
    pub fn id(&self) -> RegistryId {
        self.id
    }

    /// Return this registry's configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Replace the authenticator.
    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) {
        *self.authenticator.write().expect("lock poisoned") = authenticator;
    }

    /// Return the current authenticator.
    pub(crate) fn authenticator(&self) -> Arc<dyn Authenticator> {
        Arc::clone(&self.authenticator.read().expect("lock poisoned"))
    }

    /// Replace the stream layer used below the handshake.
    pub fn set_stream_layer(&self, layer: Arc<dyn StreamLayer>) {
        *self.stream_layer.write().expect("lock poisoned") = layer;
    }

    /// Return the current stream layer.
    fn stream_layer(&self) -> Arc<dyn StreamLayer> {
        Arc::clone(&self.stream_layer.read().expect("lock poisoned"))
    }

    /// Set the codebase resolver that receives peers' codebase hints.
    pub fn set_codebase_resolver(&self, resolver: Arc<dyn CodebaseResolver>) {
        *self.codebase_resolver.write().expect("lock poisoned") = Some(resolver);
    }

    /// Return the codebase resolver, if one is set.
    pub(crate) fn codebase_resolver(&self) -> Option<Arc<dyn CodebaseResolver>> {
        self.codebase_resolver
            .read()
            .expect("lock poisoned")
            .clone()
    }

    /// Subscribe an observer to handler faults.
    pub fn add_fault_observer(&self, observer: Arc<dyn FaultObserver>) {
        self.fault_observers
            .write()
            .expect("lock poisoned")
            .push(observer);
    }

    /// Tell every fault observer that a handler was disposed by `error`.
    ///
    /// A panicking observer is swallowed: one misbehaving observer must
    /// not cascade.
    pub(crate) fn notify_fault(&self, peer: SocketAddr, error: &Error) {
        let observers = self.fault_observers.read().expect("lock poisoned").clone();
        for observer in observers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.handler_faulted(peer, error);
            }));
            if outcome.is_err() {
                warn!("a fault observer panicked; ignoring it");
            }
        }
    }

    /// Set the credentials presented to peers at `ip`.
    pub fn set_credentials(&self, ip: IpAddr, credentials: Credentials) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.credentials.insert(ip, credentials);
    }

    /// Set the credentials presented when no per-address entry matches.
    pub fn set_default_credentials(&self, credentials: Credentials) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.default_credentials = credentials;
    }

    /// Return the credentials to present to a peer at `ip`.
    pub(crate) fn credentials_for(&self, ip: IpAddr) -> Credentials {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .credentials
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| inner.default_credentials.clone())
    }

    /// Announce `url` as part of our codebase.
    pub fn add_codebase(&self, url: impl Into<String>) {
        self.codebase.lock().expect("lock poisoned").insert(url.into());
    }

    // ------------------------------------------------------------------
    // Reference table

    /// Export `interface` for automatic referencing: unpublished service
    /// objects implementing it are auto-published when they appear inside
    /// argument graphs.
    ///
    /// Exporting the marker interface is rejected: every service
    /// implements it, so exporting it would make everything auto-remote.
    pub fn expose_interface(&self, interface: &str) -> Result<()> {
        if interface == REMOTE_MARKER {
            return Err(Error::IllegalArgument(format!(
                "cannot export the marker interface {}",
                REMOTE_MARKER
            )));
        }
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.auto_remote.insert(interface.to_owned());
        Ok(())
    }

    /// Publish `object` under `name`.
    ///
    /// One object has at most one skeleton, however many names it is
    /// bound under; publishing the same object twice binds another name
    /// to the same identifier.
    pub fn publish(&self, name: &str, object: Arc<dyn RemoteService>) -> Result<ObjectId> {
        if name.is_empty() {
            return Err(Error::IllegalArgument("empty name".into()));
        }
        if name.starts_with(&self.config.auto_id_prefix) {
            return Err(Error::IllegalArgument(format!(
                "names starting with {:?} are reserved",
                self.config.auto_id_prefix
            )));
        }
        let identity = identity_key(&object);
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(existing) = inner.names.get(name) {
            let same = inner
                .by_identity
                .get(&identity)
                .is_some_and(|oid| oid == existing);
            if !same {
                return Err(Error::IllegalArgument(format!(
                    "name {:?} is already bound",
                    name
                )));
            }
        }
        let object_id = match inner.by_identity.get(&identity).cloned() {
            Some(oid) => oid,
            None => {
                let object_id: ObjectId = name.into();
                let skeleton = Skeleton::new(
                    object_id.clone(),
                    object,
                    self.config.invocation_cache_capacity,
                );
                inner.skeletons.insert(object_id.clone(), skeleton);
                inner.by_identity.insert(identity, object_id.clone());
                object_id
            }
        };
        if let Some(skeleton) = inner.skeletons.get(&object_id) {
            skeleton.bind_name(name);
        }
        inner.names.insert(name.to_owned(), object_id.clone());
        trace!("published {:?} as {}", name, object_id);
        Ok(object_id)
    }

    /// Publish `object` under an auto-generated identifier, with no name
    /// bound.
    ///
    /// An unnamed, unreferenced object is collected by the reaper once
    /// its lease runs out.
    pub fn publish_anonymous(&self, object: Arc<dyn RemoteService>) -> ObjectId {
        let identity = identity_key(&object);
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(oid) = inner.by_identity.get(&identity) {
            return oid.clone();
        }
        let object_id = next_auto_id(&mut inner, &self.config);
        let skeleton = Skeleton::new(
            object_id.clone(),
            object,
            self.config.invocation_cache_capacity,
        );
        inner.skeletons.insert(object_id.clone(), skeleton);
        inner.by_identity.insert(identity, object_id.clone());
        object_id
    }

    /// Unbind `name`.  The object stays published while other names or
    /// remote references keep it alive.
    pub fn unbind(self: &Arc<Self>, name: &str) -> Result<()> {
        let (skeleton, became_unreferenced) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(object_id) = inner.names.remove(name) else {
                return Err(Error::NoSuchObject(name.into()));
            };
            let Some(skeleton) = inner.skeletons.get(&object_id).cloned() else {
                return Err(Error::NoSuchObject(object_id));
            };
            let became = skeleton.unbind_name(name);
            (skeleton, became)
        };
        if became_unreferenced {
            self.schedule_removal(skeleton.id());
        }
        Ok(())
    }

    /// Remove an object from the registry immediately.
    ///
    /// Idempotent; does not run the object's `unreferenced` hook (that is
    /// reserved for collection).
    pub fn unpublish(&self, object_id: &ObjectId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        remove_entry(&mut inner, object_id);
    }

    /// Return true if `object_id` (or a name) resolves here.
    pub fn is_published(&self, object_id: &ObjectId) -> bool {
        self.lookup(object_id).is_some()
    }

    /// Look up a skeleton by object identifier or bound name.
    pub(crate) fn lookup(&self, object_id: &ObjectId) -> Option<Arc<Skeleton>> {
        let inner = self.inner.lock().expect("lock poisoned");
        resolve(&inner, object_id)
    }

    /// Return the local object behind `object_id`, if any.
    pub(crate) fn local_service(&self, object_id: &ObjectId) -> Option<Arc<dyn RemoteService>> {
        self.lookup(object_id).map(|s| s.object())
    }

    /// Return the remote interfaces of `object_id`, if it resolves.
    pub(crate) fn interfaces_of(&self, object_id: &ObjectId) -> Option<Vec<String>> {
        self.lookup(object_id).map(|s| s.interfaces())
    }

    /// Build (or reuse) a descriptor for a local service object found in
    /// an outgoing argument graph.
    pub(crate) fn descriptor_for(
        self: &Arc<Self>,
        object: &Arc<dyn RemoteService>,
    ) -> Result<StubRef> {
        let interfaces = object.interfaces();
        let identity = identity_key(object);
        let object_id = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            match inner.by_identity.get(&identity).cloned() {
                Some(oid) => oid,
                None => {
                    if !self.config.automatic_referencing {
                        return Err(Error::NotSerializable(
                            "unpublished service (automatic referencing is disabled)".into(),
                        ));
                    }
                    if !interfaces.iter().any(|i| inner.auto_remote.contains(i)) {
                        return Err(Error::NotSerializable(format!(
                            "unpublished service with no exported interface ({})",
                            interfaces.join("+")
                        )));
                    }
                    let object_id = next_auto_id(&mut inner, &self.config);
                    let skeleton = Skeleton::new(
                        object_id.clone(),
                        Arc::clone(object),
                        self.config.invocation_cache_capacity,
                    );
                    inner.skeletons.insert(object_id.clone(), skeleton);
                    inner.by_identity.insert(identity, object_id.clone());
                    trace!("auto-published {}", object_id);
                    object_id
                }
            }
        };
        Ok(self.build_descriptor(object_id, interfaces))
    }

    /// Publish (or reuse) a forwarder routing to a non-shareable stub,
    /// and return its descriptor.
    pub(crate) fn publish_forwarder(self: &Arc<Self>, stub: &Stub) -> Result<StubRef> {
        let target = stub.descriptor();
        let key: ForwardKey = (
            target.host.clone(),
            target.port,
            target.object_id.clone(),
        );
        let interfaces = target.interfaces.clone();
        let object_id = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            match inner.forwarders.get(&key).cloned() {
                Some(oid) => oid,
                None => {
                    let object_id = next_auto_id(&mut inner, &self.config);
                    let forwarder: Arc<dyn RemoteService> =
                        Arc::new(StubForwarder::new(stub.clone()));
                    let identity = identity_key(&forwarder);
                    let skeleton = Skeleton::new(
                        object_id.clone(),
                        forwarder,
                        self.config.invocation_cache_capacity,
                    );
                    inner.skeletons.insert(object_id.clone(), skeleton);
                    inner.by_identity.insert(identity, object_id.clone());
                    inner.forwarders.insert(key, object_id.clone());
                    trace!("published forwarder {}", object_id);
                    object_id
                }
            }
        };
        Ok(self.build_descriptor(object_id, interfaces))
    }

    /// Build a descriptor pointing at a local object.
    fn build_descriptor(&self, object_id: ObjectId, interfaces: Vec<String>) -> StubRef {
        StubRef {
            object_id,
            registry_id: self.id,
            host: self.advertised_host(),
            port: self.listener_port(),
            interfaces,
        }
    }

    /// Note that `handler` took a reference to `object_id`.
    ///
    /// Returns false if the object does not resolve here.
    pub(crate) fn add_ref(&self, object_id: &ObjectId, handler: UniqId) -> bool {
        match self.lookup(object_id) {
            Some(skeleton) => {
                skeleton.add_ref(handler);
                true
            }
            None => false,
        }
    }

    /// Note that `handler` dropped a reference to `object_id`; returns
    /// the handler's remaining count.
    pub(crate) fn remove_ref(self: &Arc<Self>, object_id: &ObjectId, handler: UniqId) -> u64 {
        let Some(skeleton) = self.lookup(object_id) else {
            return 0;
        };
        let (remaining, became_unreferenced) = skeleton.remove_ref(handler);
        if became_unreferenced {
            self.schedule_removal(skeleton.id());
        }
        remaining
    }

    /// Release every reference `handler` held on `object_id`.
    pub(crate) fn remove_all_refs(self: &Arc<Self>, object_id: &ObjectId, handler: UniqId) {
        let Some(skeleton) = self.lookup(object_id) else {
            return;
        };
        if skeleton.remove_all_refs(handler) {
            self.schedule_removal(skeleton.id());
        }
    }

    /// Refresh the last-use time of `object_id`.
    pub(crate) fn touch(&self, object_id: &ObjectId) {
        if let Some(skeleton) = self.lookup(object_id) {
            skeleton.touch();
        }
    }

    /// Arm the grace-period removal timer for `object_id`.
    ///
    /// The timer only fires if the object is still unreferenced, and only
    /// if nothing revived it in between (the generation check).
    pub(crate) fn schedule_removal(self: &Arc<Self>, object_id: &ObjectId) {
        let Some(skeleton) = self.lookup(object_id) else {
            return;
        };
        let generation = skeleton.generation();
        let latency = self.config.latency;
        let registry = Arc::downgrade(self);
        let object_id = object_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(latency).await;
                if let Some(registry) = registry.upgrade() {
                    registry.collect(&object_id, Some(generation));
                }
            });
        }
    }

    /// Collect an unreferenced object: unpublish it and run its
    /// `unreferenced` hook.
    ///
    /// Idempotent, and a no-op if the object was revived (or if
    /// `expected_generation` no longer matches).  Both the per-skeleton
    /// timer and the periodic reaper funnel through here.
    pub(crate) fn collect(&self, object_id: &ObjectId, expected_generation: Option<u64>) {
        let skeleton = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(skeleton) = resolve(&inner, object_id) else {
                return;
            };
            if let Some(generation) = expected_generation {
                if skeleton.generation() != generation {
                    return;
                }
            }
            if !skeleton.is_unreferenced() {
                return;
            }
            remove_entry(&mut inner, skeleton.id());
            skeleton
        };
        debug!("collected unreferenced object {}", skeleton.id());
        skeleton.object().unreferenced();
    }

    /// One pass of the periodic reaper: collect every skeleton that has
    /// been unreferenced for longer than the lease, and say how long to
    /// sleep before the next pass.
    pub(crate) fn sweep(&self) -> Duration {
        let lease = self.config.lease;
        let now = Instant::now();
        let mut expired: Vec<ObjectId> = Vec::new();
        let mut next_deadline: Option<Instant> = None;
        {
            let inner = self.inner.lock().expect("lock poisoned");
            for (object_id, skeleton) in &inner.skeletons {
                if let Some(last_use) = skeleton.unreferenced_last_use() {
                    let deadline = last_use + lease;
                    if deadline <= now {
                        expired.push(object_id.clone());
                    } else {
                        next_deadline = Some(match next_deadline {
                            Some(d) if d < deadline => d,
                            _ => deadline,
                        });
                    }
                }
            }
        }
        for object_id in expired {
            self.collect(&object_id, None);
        }
        next_deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(lease)
            .min(lease)
    }

    // ------------------------------------------------------------------
    // Connections

    /// Start accepting connections on `addr` (for example
    /// `"127.0.0.1:0"`).  Returns the bound address.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?;
        *self.listener_addr.lock().expect("lock poisoned") = Some(local);
        debug!("{:?}: listening on {}", self, local);

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        tokio::spawn(async move {
                            if let Err(e) = registry.accept_connection(stream, peer_addr).await {
                                debug!("inbound handshake with {} failed: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        debug!("accept failed: {}", e);
                    }
                }
            }
        });
        Ok(local)
    }

    /// Return the listener's port, or 0 when no listener is running.
    pub fn listener_port(&self) -> u16 {
        self.listener_addr
            .lock()
            .expect("lock poisoned")
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// The host name we put into descriptors for our own objects.
    fn advertised_host(&self) -> String {
        match *self.listener_addr.lock().expect("lock poisoned") {
            Some(addr) if !addr.ip().is_unspecified() => addr.ip().to_string(),
            _ => "127.0.0.1".to_owned(),
        }
    }

    /// Handshake one accepted connection and launch its reactor.
    async fn accept_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let local_ip = stream
            .local_addr()
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?
            .ip();
        let io: BoxedIo = Box::new(stream.compat());
        let io = self.stream_layer().wrap_inbound(io, peer_addr).await?;
        let negotiated = Handshake::new(io, peer_addr, local_ip, Arc::clone(&self))
            .perform()
            .await?;
        let (channel, reactor) = negotiated.finish(Arc::clone(&self));
        self.register_channel(&channel, None);
        self.send_codebase(&channel).await;
        tokio::spawn(reactor.run());
        Ok(())
    }

    /// Dial `host:port`, handshake, and launch the reactor.
    pub(crate) async fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<Channel> {
        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?;
        let local_ip = stream
            .local_addr()
            .map_err(|e| Error::HandshakeIoErr(Arc::new(e)))?
            .ip();
        let io: BoxedIo = Box::new(stream.compat());
        let io = self.stream_layer().wrap_outbound(io, peer_addr).await?;
        let negotiated = Handshake::new(io, peer_addr, local_ip, Arc::clone(self))
            .perform()
            .await?;
        let (channel, reactor) = negotiated.finish(Arc::clone(self));
        self.register_channel(&channel, Some((host.to_owned(), port)));
        self.send_codebase(&channel).await;
        tokio::spawn(reactor.run());
        Ok(channel)
    }

    /// Announce our codebase to a fresh connection, when configured to.
    async fn send_codebase(&self, channel: &Channel) {
        if !self.config.code_downloading {
            return;
        }
        let urls = self.codebase.lock().expect("lock poisoned").clone();
        if urls.is_empty() {
            return;
        }
        let _ = channel
            .send_msg(CodebaseUpdate::new(urls).into())
            .await;
    }

    /// Return a usable connection to the given peer, reusing a pooled
    /// sibling unless multi-connection mode asks for fresh ones.
    pub(crate) async fn channel_for(
        self: &Arc<Self>,
        registry_id: Option<RegistryId>,
        host: &str,
        port: u16,
    ) -> Result<Channel> {
        if !self.config.multi_connection {
            let known = registry_id.or_else(|| {
                let inner = self.inner.lock().expect("lock poisoned");
                inner.by_addr.get(&(host.to_owned(), port)).copied()
            });
            if let Some(rid) = known {
                if let Some(channel) = self.pooled_channel(&rid) {
                    return Ok(channel);
                }
            }
        }
        self.connect(host, port).await
    }

    /// Return a usable pooled connection to `registry_id`, if any.
    fn pooled_channel(&self, registry_id: &RegistryId) -> Option<Channel> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .channels
            .get(registry_id)
            .and_then(|list| list.iter().find(|c| !c.is_closing()).cloned())
    }

    /// Remember an open connection in the pool.
    fn register_channel(&self, channel: &Channel, dialed: Option<(String, u16)>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let list = inner
            .channels
            .entry(channel.peer_registry_id())
            .or_default();
        list.retain(|c| !c.is_closing());
        list.push(channel.clone());
        if let Some(key) = dialed {
            inner.by_addr.insert(key, channel.peer_registry_id());
        }
    }

    /// Forget a disposed connection.
    pub(crate) fn channel_closed(&self, registry_id: RegistryId, unique_id: UniqId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(list) = inner.channels.get_mut(&registry_id) {
            list.retain(|c| c.unique_id() != unique_id && !c.is_closing());
            if list.is_empty() {
                inner.channels.remove(&registry_id);
            }
        }
    }

    /// Connections to `registry_id` currently in the pool.  Tests use
    /// this to fault handlers on purpose.
    #[cfg(test)]
    pub(crate) fn channels_to(&self, registry_id: &RegistryId) -> Vec<Channel> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .channels
            .get(registry_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Obtain a stub for the object published as `name` by the registry
    /// at `host:port`.
    ///
    /// The reference announcement goes onto the connection's FIFO queue
    /// before this returns, so it is observed before any invocation made
    /// through the stub.
    pub async fn get_stub(self: &Arc<Self>, host: &str, port: u16, name: &str) -> Result<Stub> {
        let channel = self.channel_for(None, host, port).await?;
        channel
            .send_msg(NewReference::new(name).into())
            .await?;
        let target = StubRef {
            object_id: name.into(),
            registry_id: channel.peer_registry_id(),
            host: host.to_owned(),
            port,
            interfaces: Vec::new(),
        };
        Ok(Stub::from_descriptor_bound(self, target, Some(channel)))
    }
}

/// Return the allocation identity of a service object.
fn identity_key(object: &Arc<dyn RemoteService>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Allocate the next auto-generated object identifier.
fn next_auto_id(inner: &mut RegistryInner, config: &RegistryConfig) -> ObjectId {
    let n = inner.next_auto;
    inner.next_auto += 1;
    format!("{}{}", config.auto_id_prefix, n).into()
}

/// Resolve an identifier or bound name to a skeleton.
fn resolve(inner: &RegistryInner, object_id: &ObjectId) -> Option<Arc<Skeleton>> {
    inner.skeletons.get(object_id).cloned().or_else(|| {
        inner
            .names
            .get(object_id.as_str())
            .and_then(|oid| inner.skeletons.get(oid))
            .cloned()
    })
}

/// Remove every trace of `object_id` from the maps.  Idempotent.
fn remove_entry(inner: &mut RegistryInner, object_id: &ObjectId) {
    let Some(skeleton) = inner.skeletons.remove(object_id) else {
        return;
    };
    inner.by_identity.remove(&skeleton.identity());
    inner.names.retain(|_, oid| oid != object_id);
    inner.forwarders.retain(|_, oid| oid != object_id);
}
