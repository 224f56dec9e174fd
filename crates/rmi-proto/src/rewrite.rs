//! Deep rewriting of argument graphs.
//!
//! On the way out, remote-capable objects inside an argument graph are
//! replaced by proxy descriptors, publishing them into the local registry
//! on the fly; on the way in, descriptors are re-hydrated into live stubs,
//! or collapsed into direct local references when they point back at the
//! receiving registry.  Doing this once, centrally, is what makes remote
//! references transparent across nested graphs.

use std::sync::Arc;

use async_trait::async_trait;

use rmi_msg::value::{Fault, StructValue, Value};
use rmi_msg::ObjectId;

use crate::channel::Channel;
use crate::registry::Registry;
use crate::service::{MethodCall, RemoteService};
use crate::stub::{CallOptions, Stub};
use crate::util::err::Error;
use crate::Result;

/// One node of a user-level argument graph.
///
/// An `Arg` is what services and stubs traffic in: plain data, live
/// stubs, or local service objects.  The rewrite below translates between
/// this and the wire-form [`Value`] tree.
#[derive(Clone)]
#[non_exhaustive]
pub enum Arg {
    /// Plain data, already in wire form.
    Value(Value),
    /// A live stub for a remote object.
    Stub(Stub),
    /// A local remote-capable object.
    Service(Arc<dyn RemoteService>),
    /// An ordered sequence, rewritten element-wise.
    List(Vec<Arg>),
    /// A named aggregate, rewritten field by field.
    Struct {
        /// Name of the aggregate's type.
        type_name: String,
        /// The fields, in declaration order.
        fields: Vec<(String, Arg)>,
    },
}

impl Arg {
    /// Return the null argument.
    pub fn null() -> Arg {
        Arg::Value(Value::Null)
    }
    /// Return the inner plain value, if this argument is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            _ => None,
        }
    }
    /// Return the inner integer, if this argument is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Value(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }
    /// Return the inner string, if this argument is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Value(Value::Str(s)) => Some(s),
            _ => None,
        }
    }
    /// Return the inner stub, if this argument is one.
    pub fn as_stub(&self) -> Option<&Stub> {
        match self {
            Arg::Stub(s) => Some(s),
            _ => None,
        }
    }
    /// Return the inner service object, if this argument is one.
    pub fn as_service(&self) -> Option<&Arc<dyn RemoteService>> {
        match self {
            Arg::Service(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Arg::Stub(s) => f.debug_tuple("Stub").field(s).finish(),
            Arg::Service(s) => write!(f, "Service({})", s.interfaces().join("+")),
            Arg::List(items) => f.debug_tuple("List").field(items).finish(),
            Arg::Struct { type_name, fields } => f
                .debug_struct("Struct")
                .field("type_name", type_name)
                .field("fields", fields)
                .finish(),
        }
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Arg {
        Arg::Value(v)
    }
}
impl From<i64> for Arg {
    fn from(v: i64) -> Arg {
        Arg::Value(Value::Int(v))
    }
}
impl From<bool> for Arg {
    fn from(v: bool) -> Arg {
        Arg::Value(Value::Bool(v))
    }
}
impl From<f64> for Arg {
    fn from(v: f64) -> Arg {
        Arg::Value(Value::Float(v))
    }
}
impl From<&str> for Arg {
    fn from(v: &str) -> Arg {
        Arg::Value(Value::Str(v.into()))
    }
}
impl From<String> for Arg {
    fn from(v: String) -> Arg {
        Arg::Value(Value::Str(v))
    }
}

/// Rewrite a slice of outgoing arguments into wire form.
pub(crate) fn rewrite_args(registry: &Arc<Registry>, args: &[Arg]) -> Result<Vec<Value>> {
    args.iter().map(|a| rewrite_arg(registry, a)).collect()
}

/// Rewrite one outgoing argument into wire form.
///
/// The source graph is never mutated: aggregates are rebuilt node by
/// node, which is the shallow-clone rule for serializable objects.
pub(crate) fn rewrite_arg(registry: &Arc<Registry>, arg: &Arg) -> Result<Value> {
    Ok(match arg {
        // Plain data passes through.  (A descriptor inside plain data is
        // already in wire form, so it passes through as well.)
        Arg::Value(v) => v.clone(),
        Arg::Stub(stub) => {
            let target = stub.descriptor();
            if target.shareable() {
                // The origin has a listener: the receiver can connect to
                // it directly.
                Value::Remote(target.clone())
            } else {
                // The origin accepts no connections, so requests must be
                // routed through us: publish a forwarder locally and send
                // a descriptor for it.
                Value::Remote(registry.publish_forwarder(stub)?)
            }
        }
        Arg::Service(svc) => Value::Remote(registry.descriptor_for(svc)?),
        Arg::List(items) => Value::List(
            items
                .iter()
                .map(|item| rewrite_arg(registry, item))
                .collect::<Result<Vec<_>>>()?,
        ),
        Arg::Struct { type_name, fields } => Value::Struct(StructValue {
            type_name: type_name.clone(),
            fields: fields
                .iter()
                .map(|(name, value)| Ok((name.clone(), rewrite_arg(registry, value)?)))
                .collect::<Result<Vec<_>>>()?,
        }),
    })
}

/// Re-hydrate one inbound value into an argument graph.
///
/// Descriptors that point back at the receiving registry collapse into
/// the local object itself; every other descriptor becomes a live stub.
/// A stub whose origin is the delivering connection's peer is bound to
/// that connection, and its object id is appended to `new_refs` so the
/// caller can emit a NewReference ahead of any use of the stub.  Stubs
/// for third-party origins connect to the origin on first use.
pub(crate) fn hydrate_value(
    registry: &Arc<Registry>,
    channel: &Channel,
    value: Value,
    new_refs: &mut Vec<ObjectId>,
) -> Arg {
    match value {
        Value::Remote(target) => {
            if target.registry_id == registry.id() {
                if let Some(local) = registry.local_service(&target.object_id) {
                    // Loopback collapse: this is our own object.
                    return Arg::Service(local);
                }
            }
            if target.registry_id == channel.peer_registry_id() {
                new_refs.push(target.object_id.clone());
                Arg::Stub(Stub::from_descriptor_bound(
                    registry,
                    target,
                    Some(channel.clone()),
                ))
            } else {
                Arg::Stub(Stub::from_descriptor_bound(registry, target, None))
            }
        }
        Value::List(items) => Arg::List(
            items
                .into_iter()
                .map(|item| hydrate_value(registry, channel, item, new_refs))
                .collect(),
        ),
        Value::Struct(StructValue { type_name, fields }) => Arg::Struct {
            type_name,
            fields: fields
                .into_iter()
                .map(|(name, value)| (name, hydrate_value(registry, channel, value, new_refs)))
                .collect(),
        },
        other => Arg::Value(other),
    }
}

/// A service that routes invocations through a non-shareable stub.
///
/// Published in place of a stub whose origin cannot accept connections;
/// remote callers invoke us, and we forward over the stub's own
/// connection.
pub(crate) struct StubForwarder {
    /// The stub invocations are forwarded through.
    stub: Stub,
}

impl StubForwarder {
    /// Make a new forwarder around `stub`.
    pub(crate) fn new(stub: Stub) -> Self {
        StubForwarder { stub }
    }
}

#[async_trait]
impl RemoteService for StubForwarder {
    fn interfaces(&self) -> Vec<String> {
        self.stub.descriptor().interfaces.clone()
    }

    async fn dispatch(&self, call: MethodCall) -> std::result::Result<Arg, Fault> {
        let MethodCall {
            method,
            param_types,
            args,
            ..
        } = call;
        let opts = CallOptions {
            param_types,
            ..Default::default()
        };
        self.stub
            .invoke_with(&method, args, opts)
            .await
            .map_err(|e| match e {
                Error::Fault(fault) => fault,
                other => Fault::new("RemoteError", other.to_string()),
            })
    }
}
