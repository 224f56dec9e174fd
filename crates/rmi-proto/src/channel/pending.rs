//! Types and code to map invocation IDs to waiting callers.

use std::collections::HashMap;

use futures::channel::oneshot;
use tracing::trace;

use rmi_msg::msg::Return;

use crate::util::err::{ChannelClosed, Error};
use crate::Result;

/// The type of a oneshot channel used to deliver an invocation outcome to
/// its waiting caller.
pub(crate) type ReturnSender = oneshot::Sender<Result<Return>>;

/// The type of a oneshot channel used to deliver an interface list to a
/// waiting introspection request.
pub(crate) type InterfacesSender = oneshot::Sender<Result<Vec<String>>>;

/// A map from correlation ID to waiting caller.
///
/// Every id put into this table is removed by either a matching response
/// or by disposal of the handler; disposal completes every remaining
/// waiter with a [`ChannelClosed`] error so callers unblock.
pub(crate) struct PendingTable {
    /// Invocations whose Return has not arrived yet.
    calls: HashMap<u64, ReturnSender>,
    /// Interface requests whose response has not arrived yet.
    interfaces: HashMap<u64, InterfacesSender>,
}

impl PendingTable {
    /// Make a new empty PendingTable.
    pub(crate) fn new() -> Self {
        PendingTable {
            calls: HashMap::new(),
            interfaces: HashMap::new(),
        }
    }

    /// Register a waiter for the invocation `id`.
    ///
    /// Must be called before the Invocation frame is written, so that a
    /// fast response cannot race the table.
    pub(crate) fn insert_call(&mut self, id: u64, tx: ReturnSender) {
        if let Some(old) = self.calls.insert(id, tx) {
            // Ids are per-stub monotonic, so a collision means a caller
            // bug; unblock the old waiter rather than leaking it.
            let _ = old.send(Err(crate::util::err::internal!(
                "duplicate pending invocation id {}",
                id
            )));
        }
    }

    /// Deliver `outcome` to the waiter for invocation `id`, if any.
    pub(crate) fn complete_call(&mut self, id: u64, outcome: Result<Return>) {
        match self.calls.remove(&id) {
            // The receiver may have given up; that's fine.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => trace!("Return for unknown invocation id {}", id),
        }
    }

    /// Register a waiter for the interface request `id`.
    pub(crate) fn insert_interfaces(&mut self, id: u64, tx: InterfacesSender) {
        if let Some(old) = self.interfaces.insert(id, tx) {
            let _ = old.send(Err(crate::util::err::internal!(
                "duplicate pending interface request id {}",
                id
            )));
        }
    }

    /// Deliver `outcome` to the waiter for interface request `id`, if any.
    pub(crate) fn complete_interfaces(&mut self, id: u64, outcome: Result<Vec<String>>) {
        match self.interfaces.remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => trace!("interface response for unknown request id {}", id),
        }
    }

    /// Return the number of outstanding entries, of both kinds.
    pub(crate) fn len(&self) -> usize {
        self.calls.len() + self.interfaces.len()
    }

    /// Complete every outstanding waiter with a disposal error.
    pub(crate) fn drain_on_disposal(&mut self) {
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(Error::ChannelClosed(ChannelClosed)));
        }
        for (_, tx) in self.interfaces.drain() {
            let _ = tx.send(Err(Error::ChannelClosed(ChannelClosed)));
        }
    }
}
