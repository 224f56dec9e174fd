//! Client-side invocation state for a remote object.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use rmi_msg::msg::{Finalize, Interruption, Invocation, NewReference, ReferenceUse, RemoteInterface, Return};
use rmi_msg::value::{StubRef, Value};

use crate::channel::Channel;
use crate::registry::Registry;
use crate::rewrite::{self, Arg};
use crate::service::{BUILTIN_HASH_CODE, BUILTIN_TO_STRING};
use crate::util::err::{internal, ChannelClosed, Error, RemoteError};
use crate::Result;

/// How many times a stub tries to (re)establish a connection for one
/// invocation before giving up.
const RECONNECT_ATTEMPTS: usize = 3;

/// Frame text separating remote frames from the local call site in a
/// surfaced fault.
const REMOTE_MARKER_FRAME: &str = "=== Remote Method Invocation ===";

/// Per-invocation options, standing in for the method annotations of the
/// host environment.
///
/// A stub-generation front-end fills these from interface metadata; code
/// using `Stub` directly passes them by hand.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Declared parameter types, in order.
    pub param_types: Vec<String>,
    /// Declared return type, when the method declares one.  Drives the
    /// zero value used under fault suppression.
    pub return_type: Option<String>,
    /// When set, successful results are cached locally for this long, and
    /// unexpired cache hits skip the network entirely.
    pub cache_ttl: Option<Duration>,
    /// When true and the method declares no return type, the invocation
    /// is fire-and-forget: the stub does not await the Return.
    pub asynchronous: bool,
    /// Per-method override of the registry's fault-suppression setting.
    pub suppress_faults: Option<bool>,
}

/// Client-side core for one remote object.
///
/// All the interesting state lives here; [`Stub`] is a cheap cloneable
/// handle around it.  Dropping the last handle enqueues the Finalize that
/// tells the owner we no longer reference the object.
pub(crate) struct StubCore {
    /// Descriptor of the target object: id, owner registry, origin
    /// address, interfaces.
    target: StubRef,
    /// The registry this stub belongs to.
    registry: Weak<Registry>,
    /// The connection currently carrying our invocations.  Replaced on
    /// reconnection.
    channel: futures::lock::Mutex<Option<Channel>>,
    /// Next invocation id.  Monotonically increasing, scoped to this stub.
    next_id: AtomicU64,
    /// The remote identity hash, once obtained.
    cached_hash: OnceLock<i64>,
    /// Cached results of methods invoked with a ttl, keyed by method name.
    method_cache: Mutex<HashMap<String, (Arg, Instant)>>,
}

/// A transparent client-side proxy handle for a remote object.
///
/// Invocations forward across the owning connection; comparisons and
/// hashing are answered locally from the target descriptor, without any
/// network traffic.
#[derive(Clone)]
pub struct Stub {
    /// The shared invocation core.
    core: Arc<StubCore>,
}

impl std::fmt::Debug for Stub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stub({}@{}:{})",
            self.core.target.object_id, self.core.target.host, self.core.target.port
        )
    }
}

/// Two stubs are equal exactly when they point at the same object on the
/// same origin.  No network traffic is involved.
impl PartialEq for Stub {
    fn eq(&self, other: &Self) -> bool {
        let a = &self.core.target;
        let b = &other.core.target;
        a.object_id == b.object_id && a.host == b.host && a.port == b.port
    }
}
impl Eq for Stub {}

impl Hash for Stub {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let t = &self.core.target;
        t.object_id.hash(state);
        t.host.hash(state);
        t.port.hash(state);
    }
}

/// Sends an Interruption for an in-flight invocation if the caller's
/// future is dropped while it waits for the Return.
struct InterruptGuard {
    /// The connection the invocation went out on.
    channel: Channel,
    /// The invocation to interrupt.
    id: u64,
    /// Set once the invocation completed; disarms the guard.
    armed: bool,
}

impl InterruptGuard {
    /// Arm a guard for invocation `id` on `channel`.
    fn new(channel: Channel, id: u64) -> Self {
        InterruptGuard {
            channel,
            id,
            armed: true,
        }
    }
    /// Disarm: the invocation completed normally.
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.armed {
            trace!("invocation {} abandoned by caller; interrupting", self.id);
            let _ = self
                .channel
                .send_control(Interruption::new(self.id).into());
        }
    }
}

impl Stub {
    /// Build a stub from a descriptor, optionally bound to the connection
    /// that delivered it.
    ///
    /// When `channel` is None the stub connects to its origin on first
    /// use.
    pub(crate) fn from_descriptor_bound(
        registry: &Arc<Registry>,
        target: StubRef,
        channel: Option<Channel>,
    ) -> Stub {
        Stub {
            core: Arc::new(StubCore {
                target,
                registry: Arc::downgrade(registry),
                channel: futures::lock::Mutex::new(channel),
                next_id: AtomicU64::new(0),
                cached_hash: OnceLock::new(),
                method_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Return the descriptor of the target object.
    pub fn descriptor(&self) -> &StubRef {
        &self.core.target
    }

    /// Return the identifier of the target object.
    pub fn object_id(&self) -> &rmi_msg::ObjectId {
        &self.core.target.object_id
    }

    /// Invoke `method` with `args` and default options.
    pub async fn invoke(&self, method: &str, args: Vec<Arg>) -> Result<Arg> {
        self.invoke_with(method, args, CallOptions::default()).await
    }

    /// Invoke `method` with `args` and explicit options.
    pub async fn invoke_with(&self, method: &str, args: Vec<Arg>, opts: CallOptions) -> Result<Arg> {
        let registry = self
            .core
            .registry
            .upgrade()
            .ok_or_else(|| internal!("registry was dropped while a stub was alive"))?;

        // An unexpired cached result skips the network, but keeps the
        // remote object's lease fresh.
        if opts.cache_ttl.is_some() {
            if let Some(hit) = self.core.cached_method(method) {
                if let Some(chan) = self.core.bound_channel() {
                    let _ = chan
                        .send_control(ReferenceUse::new(self.core.target.object_id.clone()).into());
                }
                return Ok(hit);
            }
        }

        let params = rewrite::rewrite_args(&registry, &args)?;
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let asynchronous = opts.asynchronous && opts.return_type.is_none();
        let invocation = Invocation::new(
            id,
            self.core.target.object_id.clone(),
            method,
            opts.param_types.clone(),
            params,
            asynchronous,
        );

        let config = registry.config().clone();
        let deadline = Instant::now() + config.latency;

        let outcome = 'retry: {
            for attempt in 1..=RECONNECT_ATTEMPTS {
                let chan = match self.core.ensure_channel(&registry).await {
                    Ok(chan) => chan,
                    Err(e) => {
                        debug!("stub could not reach {}: {}", self.core.target.host, e);
                        if attempt == RECONNECT_ATTEMPTS || Instant::now() >= deadline {
                            break 'retry Err(e);
                        }
                        continue;
                    }
                };

                // Re-sending the SAME invocation id is safe: the peer's
                // invocation cache deduplicates.
                let rx = match chan.call(invocation.clone()).await {
                    Ok(rx) => rx,
                    Err(Error::ChannelClosed(_)) => {
                        self.core.clear_channel(&chan).await;
                        continue;
                    }
                    Err(e) => break 'retry Err(e),
                };

                if asynchronous {
                    return Ok(Arg::null());
                }

                let guard = InterruptGuard::new(chan.clone(), id);
                match rx.await {
                    Ok(Ok(ret)) => {
                        guard.defuse();
                        break 'retry Ok((chan, ret));
                    }
                    Ok(Err(Error::ChannelClosed(_))) | Err(_) => {
                        // Disposed mid-flight; reconnect and replay.
                        guard.defuse();
                        self.core.clear_channel(&chan).await;
                    }
                    Ok(Err(e)) => {
                        guard.defuse();
                        break 'retry Err(e);
                    }
                }

                if Instant::now() >= deadline {
                    break;
                }
            }
            Err(Error::ChannelClosed(ChannelClosed))
        };

        let suppress = opts.suppress_faults.unwrap_or(config.suppress_faults);
        match outcome {
            Ok((chan, ret)) => {
                self.handle_return(&registry, &chan, ret, method, &opts).await
            }
            // Transport-level failures become the surfaced remote error
            // (or a zero value, under suppression).
            Err(
                e @ (Error::ChannelClosed(_)
                | Error::ChanIoErr(_)
                | Error::HandshakeIoErr(_)
                | Error::Codec(_)),
            ) => {
                if suppress {
                    Ok(zero_result(&opts))
                } else {
                    Err(remote_error(&config, &e.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Process a Return: hydrate the result graph, or interleave and
    /// surface the fault.
    async fn handle_return(
        &self,
        registry: &Arc<Registry>,
        chan: &Channel,
        ret: Return,
        method: &str,
        opts: &CallOptions,
    ) -> Result<Arg> {
        let (_return_type, outcome) = ret.into_outcome();
        match outcome {
            Ok(value) => {
                let mut new_refs = Vec::new();
                let arg = rewrite::hydrate_value(registry, chan, value, &mut new_refs);
                for object_id in new_refs {
                    chan.send_msg(NewReference::new(object_id).into()).await?;
                }
                if let Some(ttl) = opts.cache_ttl {
                    self.core.store_cached(method, arg.clone(), ttl);
                }
                Ok(arg)
            }
            Err(mut fault) => {
                // Interleave: remote frames, then the marker, then where
                // this call came from.
                fault.frames.push(REMOTE_MARKER_FRAME.to_owned());
                fault
                    .frames
                    .push(format!("{}.{}", self.core.target.object_id, method));
                Err(Error::Fault(fault))
            }
        }
    }

    /// Return the remote identity hash, fetching it at most once.
    ///
    /// The first call makes a remote invocation; later calls answer from
    /// the cached integer without any network traffic.
    pub async fn remote_hash(&self) -> Result<i64> {
        if let Some(h) = self.core.cached_hash.get() {
            return Ok(*h);
        }
        let out = self
            .invoke_with(
                BUILTIN_HASH_CODE,
                Vec::new(),
                CallOptions {
                    return_type: Some("i64".into()),
                    ..Default::default()
                },
            )
            .await?;
        match out {
            Arg::Value(Value::Int(h)) => {
                let _ = self.core.cached_hash.set(h);
                Ok(h)
            }
            other => Err(internal!("hash built-in returned {:?}", other)),
        }
    }

    /// Return the remote object's textual rendering, via a remote call.
    pub async fn remote_string(&self) -> Result<String> {
        let out = self
            .invoke_with(
                BUILTIN_TO_STRING,
                Vec::new(),
                CallOptions {
                    return_type: Some("str".into()),
                    ..Default::default()
                },
            )
            .await?;
        match out {
            Arg::Value(Value::Str(s)) => Ok(s),
            other => Err(internal!("to_string built-in returned {:?}", other)),
        }
    }

    /// Ask the remote registry for the target's interface names.
    ///
    /// If the descriptor already carried them, they are returned without
    /// network traffic.
    pub async fn remote_interfaces(&self) -> Result<Vec<String>> {
        if !self.core.target.interfaces.is_empty() {
            return Ok(self.core.target.interfaces.clone());
        }
        let registry = self
            .core
            .registry
            .upgrade()
            .ok_or_else(|| internal!("registry was dropped while a stub was alive"))?;
        let chan = self.core.ensure_channel(&registry).await?;
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RemoteInterface::request(id, self.core.target.object_id.clone());
        let rx = chan.request_interfaces(request).await?;
        rx.await
            .map_err(|_| Error::ChannelClosed(ChannelClosed))?
    }
}

impl StubCore {
    /// Return the bound connection, if there is a usable one.
    fn bound_channel(&self) -> Option<Channel> {
        self.channel
            .try_lock()
            .and_then(|guard| guard.clone())
            .filter(|c| !c.is_closing())
    }

    /// Return a usable connection to the target, dialing or adopting a
    /// sibling from the registry's pool if the bound one is gone.
    ///
    /// Every fresh binding announces our reference to the target before
    /// anything else can travel on the connection.
    async fn ensure_channel(&self, registry: &Arc<Registry>) -> Result<Channel> {
        let mut guard = self.channel.lock().await;
        if let Some(chan) = guard.as_ref() {
            if !chan.is_closing() {
                return Ok(chan.clone());
            }
        }
        let chan = registry
            .channel_for(
                Some(self.target.registry_id),
                &self.target.host,
                self.target.port,
            )
            .await?;
        chan.send_msg(NewReference::new(self.target.object_id.clone()).into())
            .await?;
        *guard = Some(chan.clone());
        Ok(chan)
    }

    /// Forget the bound connection if it is still `dead`.
    async fn clear_channel(&self, dead: &Channel) {
        let mut guard = self.channel.lock().await;
        if let Some(chan) = guard.as_ref() {
            if chan.unique_id() == dead.unique_id() {
                *guard = None;
            }
        }
    }

    /// Return the unexpired cached result for `method`, if any.
    fn cached_method(&self, method: &str) -> Option<Arg> {
        let cache = self.method_cache.lock().expect("method cache poisoned");
        cache
            .get(method)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(arg, _)| arg.clone())
    }

    /// Record `result` for `method`, expiring after `ttl`.
    fn store_cached(&self, method: &str, result: Arg, ttl: Duration) {
        let mut cache = self.method_cache.lock().expect("method cache poisoned");
        cache.insert(method.to_owned(), (result, Instant::now() + ttl));
    }
}

impl Drop for StubCore {
    fn drop(&mut self) {
        // The client side of the distributed GC handshake: tell the owner
        // we no longer reference the object.  Best-effort; a lost Finalize
        // is repaired by the owner's lease reaper.
        if let Some(Some(chan)) = self.channel.try_lock().map(|guard| guard.clone()) {
            let _ = chan.send_control(Finalize::new(self.target.object_id.clone()).into());
        }
    }
}

/// Build the error surfaced for a connection-level failure, applying the
/// configured replacement kind name.
fn remote_error(config: &crate::RegistryConfig, detail: &str) -> Error {
    let mut err = RemoteError::new(detail);
    if let Some(kind) = &config.remote_error_kind {
        err.kind = kind.clone();
    }
    Error::Remote(err)
}

/// The zero value for a suppressed failed invocation.
fn zero_result(opts: &CallOptions) -> Arg {
    Arg::Value(Value::zero_for(opts.return_type.as_deref().unwrap_or("")))
}
