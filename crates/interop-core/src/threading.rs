//! Threading/runtime helpers.
//!
//! The teacher toolkit keeps a lazily-initialized global tokio runtime behind a cache and a
//! family of macros for crossing the sync/async boundary. Every caller in this workspace is
//! already async (stages are tokio tasks top to bottom), so we only need the piece of that
//! toolkit that still earns its keep: picking a sane default worker count for the runtime the
//! binary builds by hand.

use std::thread::available_parallelism;

/// Default worker thread count for a manually-built runtime (the CLI binary builds one
/// explicitly rather than relying on `#[tokio::main]`, so it can size it from the host).
pub fn default_worker_count() -> usize {
    let cpus = num_cpus::get();
    let parallelism = available_parallelism().map(|n| n.get()).unwrap_or(0);
    parallelism.max(cpus).max(1)
}
