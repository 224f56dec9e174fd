//! The distributed garbage collector's periodic reaper task.
//!
//! Per-skeleton removal timers do the precise work; this task is the
//! safety net that collects objects whose Finalize notices were lost
//! (a crashed peer, a dropped frame).  At worst an unreferenced object
//! survives until the scan after its lease runs out.

use std::sync::Weak;

use tracing::trace;

use crate::registry::Registry;

/// Run the reaper until its registry goes away.
///
/// Each pass collects every skeleton that has no names, no references,
/// and a last use older than the lease; the registry tells us when the
/// next collection could possibly be due, and we sleep until then (capped
/// at one lease interval).
pub(crate) async fn run_reaper(registry: Weak<Registry>) {
    loop {
        let sleep_for = match registry.upgrade() {
            Some(registry) => registry.sweep(),
            None => break,
        };
        trace!("reaper sleeping for {:?}", sleep_for);
        tokio::time::sleep(sleep_for).await;
    }
    trace!("registry went away; reaper exiting");
}
