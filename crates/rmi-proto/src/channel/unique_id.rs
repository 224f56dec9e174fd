//! Helper for unique identifiers for connection handlers.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter for allocating unique-ish identifiers for handlers.
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Unique identifier for a connection handler.
///
/// These identifiers are unique per process.  Skeletons key their
/// per-handler reference counts on them, and the logs use them to tell
/// connections apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqId(usize);

impl UniqId {
    /// Construct a new UniqId.
    pub(crate) fn new() -> Self {
        // Relaxed ordering is fine; we don't care about how this
        // is instantiated with respect to other handlers.
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(id != usize::MAX, "Exhausted the handler ID namespace");
        UniqId(id)
    }
}

impl Display for UniqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn {}", self.0)
    }
}
