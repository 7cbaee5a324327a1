//! The incremental-build engine of the keystone bundler.
//!
//! Work is modelled as [`Request`]s: hashable, memoizable units whose results
//! are cached against an invalidation graph. The [`RequestTracker`] runs
//! requests, deduplicates concurrent identical runs, records which external
//! state (files, globs, environment variables, build options, config keys)
//! each result depends on, and persists the graph between processes in
//! chunks so unchanged regions are never rewritten.

pub use keystone_core::cancellation::BuildAbortedError;
pub use keystone_core::cancellation::CancellationToken;
pub use request_tracker::*;
pub use watch::*;

pub mod request_tracker;

mod watch;
