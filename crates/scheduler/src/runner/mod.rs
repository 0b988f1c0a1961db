//! Work scheduler runner -- queues, drain pass, and submission API.
//!
//! Split into focused submodules:
//! - `core`: WorkScheduler struct, constructor, weights, stats and shutdown
//! - `submission`: the public submit/execute/schedule family
//! - `drain`: the weighted round-robin pass run once per tick
//! - `execution`: single-task execution, completion bookkeeping, run loop
//! - `timers`: delayed and repeating tasks waiting for their due time
//! - `deadlines`: caller-side timeouts fired from a watcher thread

mod core;
mod deadlines;
mod drain;
mod execution;
mod submission;
mod timers;

pub use self::core::WorkScheduler;
