//! The dispatch seam between the runtime and user service objects.
//!
//! There is no reflection here: an object becomes remotely invocable by
//! implementing [`RemoteService`], a single generic dispatcher taking a
//! method name and argument values.  Stub-generation front-ends are
//! expected to hide this seam behind typed traits; the runtime itself
//! only ever speaks [`MethodCall`].

use async_trait::async_trait;

use rmi_msg::value::Fault;

use crate::rewrite::Arg;

/// Name of the marker interface implied by [`RemoteService`] itself.
///
/// Every exposed object implements it, so exporting it as an auto-remote
/// interface would make *everything* auto-remote; the registry rejects
/// that.
pub const REMOTE_MARKER: &str = "rmi.Remote";

/// Method name used on the wire for the textual-rendering built-in.
pub const BUILTIN_TO_STRING: &str = "to_string";

/// Method name used on the wire for the identity-hash built-in.
pub const BUILTIN_HASH_CODE: &str = "hash_code";

/// One decoded invocation, as handed to a service's dispatcher.
#[derive(Debug)]
#[non_exhaustive]
pub struct MethodCall {
    /// Name of the method to run.
    pub method: String,
    /// Declared parameter types, in order.
    pub param_types: Vec<String>,
    /// The arguments, in order, with proxy descriptors already re-hydrated
    /// into live stubs or local references.
    pub args: Vec<Arg>,
}

impl MethodCall {
    /// Construct a new MethodCall.
    pub fn new(method: impl Into<String>, param_types: Vec<String>, args: Vec<Arg>) -> Self {
        MethodCall {
            method: method.into(),
            param_types,
            args,
        }
    }

    /// Return a `NoSuchMethod` fault naming this call's method.
    ///
    /// Dispatchers return this from their fallthrough arm.
    pub fn no_such_method(&self) -> Fault {
        Fault::new(rmi_msg::value::kind::NO_SUCH_METHOD, self.method.clone())
    }
}

/// An object that can be exposed through a registry.
///
/// Implementations dispatch on the method name and return either a result
/// graph or a [`Fault`].  The runtime calls [`dispatch`](Self::dispatch)
/// from short-lived worker tasks, so implementations may block on their
/// own I/O freely; a cooperative interruption from the caller cancels the
/// worker at its next await point.
#[async_trait]
pub trait RemoteService: Send + Sync + 'static {
    /// Return the names of the remote interfaces this object exposes.
    ///
    /// These names drive the auto-remote rules: an unpublished object
    /// reached inside an argument graph is auto-published exactly when one
    /// of its interfaces has been exported on the local registry.
    fn interfaces(&self) -> Vec<String>;

    /// Run one method and return its outcome.
    async fn dispatch(&self, call: MethodCall) -> Result<Arg, Fault>;

    /// Textual rendering used for the `to_string` built-in.
    ///
    /// Return None to accept the default rendering (interface names plus
    /// the identity hash).
    fn remote_display(&self) -> Option<String> {
        None
    }

    /// Called at most once when this object stops being referenced: every
    /// name unbound, every remote reference released, and the grace period
    /// expired.
    fn unreferenced(&self) {}
}
