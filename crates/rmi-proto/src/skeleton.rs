//! Server-side record for one exposed object.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use lru::LruCache;
use tracing::trace;

use rmi_msg::value::{kind, Fault, Value};
use rmi_msg::{ObjectId, RegistryId};

use crate::channel::UniqId;
use crate::registry::Registry;
use crate::rewrite::{self, Arg};
use crate::service::{MethodCall, RemoteService, BUILTIN_HASH_CODE, BUILTIN_TO_STRING};
use crate::util::err::Error;

/// The outcome of one invocation, as recorded in the invocation cache.
pub(crate) type Outcome = Result<Value, Fault>;

/// Key of the invocation cache: which registry sent the invocation, and
/// the invocation's id within that registry's stub.
type CacheKey = (RegistryId, u64);

/// An entry in the invocation cache.
///
/// An invocation that is still executing leaves a `Running` entry behind,
/// so that a replay of the same id while the first execution is in flight
/// waits for that execution instead of starting a second one.  This is
/// what makes re-sending an invocation after a connection fault safe even
/// when the fault hit mid-call.
#[derive(Clone)]
enum CacheEnt {
    /// The invocation is executing; wait here for its outcome.
    Running(Shared<oneshot::Receiver<Outcome>>),
    /// The invocation finished with this outcome.
    Done(Outcome),
}

/// Mutable state of a skeleton, serialized behind one lock.
struct SkeletonState {
    /// Names this object is bound under.
    names: HashSet<String>,
    /// Outstanding references per connection handler.
    refs: HashMap<UniqId, u64>,
    /// Sum of all per-handler counts.
    total: u64,
    /// Last time this object was invoked, referenced, or used remotely.
    last_use: Instant,
    /// Bounded cache of invocation outcomes, for at-most-once delivery.
    cache: LruCache<CacheKey, CacheEnt>,
    /// Bumped whenever the object gains a name or a reference; a
    /// scheduled removal only fires if the generation it captured is
    /// still current.
    generation: u64,
}

/// Server-side record for one exposed object: its identity, its names,
/// the reference counts that keep it alive, and its invocation cache.
pub(crate) struct Skeleton {
    /// Identifier of this object within the local registry.
    id: ObjectId,
    /// The exposed object.  This is a strong reference: publication keeps
    /// the object alive.
    object: Arc<dyn RemoteService>,
    /// The object's remote interfaces, computed once at creation.
    interfaces: Vec<String>,
    /// All other state, behind the skeleton's lock.
    state: Mutex<SkeletonState>,
}

impl Skeleton {
    /// Create a new skeleton for `object` with the identifier `id`.
    pub(crate) fn new(id: ObjectId, object: Arc<dyn RemoteService>, cache_capacity: usize) -> Arc<Self> {
        let interfaces = object.interfaces();
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("max(1) was zero!?");
        Arc::new(Skeleton {
            id,
            object,
            interfaces,
            state: Mutex::new(SkeletonState {
                names: HashSet::new(),
                refs: HashMap::new(),
                total: 0,
                last_use: Instant::now(),
                cache: LruCache::new(capacity),
                generation: 0,
            }),
        })
    }

    /// Return this skeleton's object identifier.
    pub(crate) fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Return the exposed object.
    pub(crate) fn object(&self) -> Arc<dyn RemoteService> {
        Arc::clone(&self.object)
    }

    /// Return the object's remote interfaces.
    pub(crate) fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }

    /// Return an identity key for the exposed object.
    ///
    /// Identity, not equality: two published objects are the same object
    /// exactly when their allocations are.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.object) as *const () as usize
    }

    /// Run one invocation against the exposed object, or replay its
    /// recorded outcome.
    ///
    /// Consults the invocation cache first: a hit returns the recorded
    /// outcome without executing anything, and an in-flight entry is
    /// awaited rather than re-executed.
    pub(crate) async fn invoke(
        &self,
        registry: &Arc<Registry>,
        caller: RegistryId,
        invocation_id: u64,
        method: &str,
        param_types: Vec<String>,
        args: Vec<Arg>,
    ) -> Outcome {
        let key = (caller, invocation_id);

        /// What the cache told us to do.
        enum Plan {
            /// Replay this finished outcome.
            Replay(Outcome),
            /// Wait for the execution that is already running.
            Wait(Shared<oneshot::Receiver<Outcome>>),
            /// Execute, then complete this sender.
            Execute(oneshot::Sender<Outcome>),
        }

        let plan = {
            let mut state = self.state.lock().expect("skeleton lock poisoned");
            state.last_use = Instant::now();
            match state.cache.get(&key) {
                Some(CacheEnt::Done(outcome)) => {
                    trace!("{}: invocation cache hit for {}", self.id, invocation_id);
                    Plan::Replay(outcome.clone())
                }
                Some(CacheEnt::Running(shared)) => Plan::Wait(shared.clone()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.cache.put(key, CacheEnt::Running(rx.shared()));
                    Plan::Execute(tx)
                }
            }
        };

        match plan {
            Plan::Replay(outcome) => outcome,
            Plan::Wait(shared) => match shared.await {
                Ok(outcome) => outcome,
                // The execution we were waiting for went away without an
                // outcome: it was interrupted.
                Err(_canceled) => Err(Fault::new(kind::INTERRUPTED, "invocation interrupted")),
            },
            Plan::Execute(tx) => {
                let outcome = self.execute(registry, method, param_types, args).await;
                let mut state = self.state.lock().expect("skeleton lock poisoned");
                state.last_use = Instant::now();
                state.cache.put(key, CacheEnt::Done(outcome.clone()));
                let _ = tx.send(outcome.clone());
                outcome
            }
        }
    }

    /// Actually run one invocation, with no caching involved.
    async fn execute(
        &self,
        registry: &Arc<Registry>,
        method: &str,
        param_types: Vec<String>,
        args: Vec<Arg>,
    ) -> Outcome {
        // The two built-ins are answered here so that every exposed object
        // supports them, whatever its dispatcher knows about.
        if method == BUILTIN_HASH_CODE && args.is_empty() {
            return Ok(Value::Int(self.identity() as i64));
        }
        if method == BUILTIN_TO_STRING && args.is_empty() {
            let rendered = self.object.remote_display().unwrap_or_else(|| {
                format!("{}@{:x}", self.interfaces.join("+"), self.identity())
            });
            return Ok(Value::Str(rendered));
        }

        let call = MethodCall::new(method, param_types, args);
        let result = self.object.dispatch(call).await?;

        // A return value that cannot be rewritten is replaced by the same
        // error the sender would have seen locally.
        match rewrite::rewrite_arg(registry, &result) {
            Ok(value) => Ok(value),
            Err(Error::NotSerializable(what)) => {
                Err(Fault::new(kind::NOT_SERIALIZABLE, what))
            }
            Err(other) => Err(Fault::new("RemoteError", other.to_string())),
        }
    }

    /// Note that `handler` took one more reference to this object.
    pub(crate) fn add_ref(&self, handler: UniqId) {
        let mut state = self.state.lock().expect("skeleton lock poisoned");
        *state.refs.entry(handler).or_insert(0) += 1;
        state.total += 1;
        state.generation += 1;
        state.last_use = Instant::now();
    }

    /// Note that `handler` dropped one reference to this object.
    ///
    /// Returns the handler's remaining count and true if the object just
    /// became unreferenced.  Counters never go below zero.
    pub(crate) fn remove_ref(&self, handler: UniqId) -> (u64, bool) {
        let mut state = self.state.lock().expect("skeleton lock poisoned");
        let decremented = match state.refs.get_mut(&handler) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Some(*count)
            }
            _ => None,
        };
        let remaining = match decremented {
            Some(count) => {
                state.total -= 1;
                count
            }
            None => {
                trace!("{}: removeRef without matching addRef", self.id);
                0
            }
        };
        if remaining == 0 {
            state.refs.remove(&handler);
        }
        (remaining, state.total == 0 && state.names.is_empty())
    }

    /// Release every reference `handler` held, as part of its disposal.
    ///
    /// Returns true if the object just became unreferenced.
    pub(crate) fn remove_all_refs(&self, handler: UniqId) -> bool {
        let mut state = self.state.lock().expect("skeleton lock poisoned");
        if let Some(count) = state.refs.remove(&handler) {
            state.total = state.total.saturating_sub(count);
        }
        state.total == 0 && state.names.is_empty()
    }

    /// Bind `name` to this object.
    pub(crate) fn bind_name(&self, name: &str) {
        let mut state = self.state.lock().expect("skeleton lock poisoned");
        state.names.insert(name.to_owned());
        state.generation += 1;
    }

    /// Unbind `name` from this object.
    ///
    /// Returns true if the object just became unreferenced.
    pub(crate) fn unbind_name(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("skeleton lock poisoned");
        state.names.remove(name);
        state.total == 0 && state.names.is_empty()
    }

    /// Return the names this object is bound under.
    pub(crate) fn names(&self) -> Vec<String> {
        let state = self.state.lock().expect("skeleton lock poisoned");
        state.names.iter().cloned().collect()
    }

    /// Refresh the last-use time.
    pub(crate) fn touch(&self) {
        let mut state = self.state.lock().expect("skeleton lock poisoned");
        state.last_use = Instant::now();
    }

    /// Return the current generation, for removal scheduling.
    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().expect("skeleton lock poisoned").generation
    }

    /// Return true if no names are bound and no references are held.
    pub(crate) fn is_unreferenced(&self) -> bool {
        let state = self.state.lock().expect("skeleton lock poisoned");
        state.total == 0 && state.names.is_empty()
    }

    /// If this object is unreferenced, return its last-use time.
    ///
    /// The lease reaper collects objects whose last use is older than the
    /// lease.
    pub(crate) fn unreferenced_last_use(&self) -> Option<Instant> {
        let state = self.state.lock().expect("skeleton lock poisoned");
        (state.total == 0 && state.names.is_empty()).then_some(state.last_use)
    }

    /// Return the aggregate reference count.
    pub(crate) fn total_refs(&self) -> u64 {
        self.state.lock().expect("skeleton lock poisoned").total
    }

    /// Return the number of entries in the invocation cache.
    #[cfg(test)]
    pub(crate) fn invocation_cache_len(&self) -> usize {
        self.state.lock().expect("skeleton lock poisoned").cache.len()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::service::RemoteService;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A service that counts how many times it actually executed.
    struct Counter {
        /// Number of dispatches that have run.
        executed: AtomicUsize,
    }

    #[async_trait]
    impl RemoteService for Counter {
        fn interfaces(&self) -> Vec<String> {
            vec!["demo.Counter".into()]
        }
        async fn dispatch(&self, call: MethodCall) -> Result<Arg, Fault> {
            match call.method.as_str() {
                "next" => {
                    let n = self.executed.fetch_add(1, Ordering::SeqCst);
                    Ok(Arg::from(n as i64))
                }
                _ => Err(call.no_such_method()),
            }
        }
    }

    fn caller() -> RegistryId {
        RegistryId::from_bytes([7; rmi_msg::REGISTRY_ID_LEN])
    }

    fn new_skeleton() -> (Arc<Registry>, Arc<Skeleton>) {
        let registry = Registry::new();
        let skel = Skeleton::new(
            "###0".into(),
            Arc::new(Counter {
                executed: AtomicUsize::new(0),
            }),
            4,
        );
        (registry, skel)
    }

    #[tokio::test]
    async fn cache_replays_not_reexecutes() {
        let (registry, skel) = new_skeleton();

        let first = skel
            .invoke(&registry, caller(), 1, "next", vec![], vec![])
            .await;
        assert_eq!(first, Ok(Value::Int(0)));

        // Same invocation id: the recorded outcome comes back, and the
        // object does not run again.
        let replay = skel
            .invoke(&registry, caller(), 1, "next", vec![], vec![])
            .await;
        assert_eq!(replay, Ok(Value::Int(0)));

        // A new id executes.
        let second = skel
            .invoke(&registry, caller(), 2, "next", vec![], vec![])
            .await;
        assert_eq!(second, Ok(Value::Int(1)));
        assert_eq!(skel.invocation_cache_len(), 2);
    }

    #[tokio::test]
    async fn cache_is_bounded() {
        let (registry, skel) = new_skeleton();
        for id in 0..10 {
            let _ = skel
                .invoke(&registry, caller(), id, "next", vec![], vec![])
                .await;
        }
        // Capacity was 4; eviction is size-based only.
        assert_eq!(skel.invocation_cache_len(), 4);
    }

    #[tokio::test]
    async fn faults_are_cached_too() {
        let (registry, skel) = new_skeleton();
        let out = skel
            .invoke(&registry, caller(), 5, "no_such", vec![], vec![])
            .await;
        assert!(matches!(&out, Err(f) if f.kind == kind::NO_SUCH_METHOD));
        let replay = skel
            .invoke(&registry, caller(), 5, "no_such", vec![], vec![])
            .await;
        assert_eq!(out, replay);
    }

    #[tokio::test]
    async fn builtins() {
        let (registry, skel) = new_skeleton();
        let hash = skel
            .invoke(&registry, caller(), 1, BUILTIN_HASH_CODE, vec![], vec![])
            .await
            .unwrap();
        assert_eq!(hash, Value::Int(skel.identity() as i64));

        let rendered = skel
            .invoke(&registry, caller(), 2, BUILTIN_TO_STRING, vec![], vec![])
            .await
            .unwrap();
        match rendered {
            Value::Str(s) => assert!(s.starts_with("demo.Counter@")),
            other => panic!("unexpected rendering {:?}", other),
        }
    }

    #[test]
    fn refcounts_clamp_and_aggregate() {
        let (_registry, skel) = new_skeleton();
        let h1 = UniqId::new();
        let h2 = UniqId::new();

        skel.add_ref(h1);
        skel.add_ref(h1);
        skel.add_ref(h2);
        assert_eq!(skel.total_refs(), 3);
        assert!(!skel.is_unreferenced());

        assert_eq!(skel.remove_ref(h1), (1, false));
        assert_eq!(skel.remove_ref(h2), (0, false));
        assert_eq!(skel.remove_ref(h1), (0, true));

        // Defensive clamp: going below zero changes nothing.
        assert_eq!(skel.remove_ref(h1), (0, true));
        assert_eq!(skel.total_refs(), 0);
    }

    #[test]
    fn remove_all_refs_releases_everything() {
        let (_registry, skel) = new_skeleton();
        let h1 = UniqId::new();
        skel.add_ref(h1);
        skel.add_ref(h1);
        skel.bind_name("svc");
        assert!(!skel.remove_all_refs(h1)); // still named
        assert_eq!(skel.total_refs(), 0);
        assert!(skel.unbind_name("svc"));
        assert!(skel.is_unreferenced());
    }

    #[test]
    fn generation_tracks_revival() {
        let (_registry, skel) = new_skeleton();
        let gen0 = skel.generation();
        skel.add_ref(UniqId::new());
        assert!(skel.generation() > gen0);
    }
}
