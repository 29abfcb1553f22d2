//! Polling engine.
//!
//! - `executor`: polls one group's credentials in order and commits once
//! - `dispatch`: runs many groups at once behind a bounded worker pool
//! - `in_flight`: at-most-one poll per group, shared by every entry point

pub mod dispatch;
pub mod executor;
pub mod in_flight;

#[cfg(test)]
pub(crate) mod fakes;

pub use dispatch::{dispatch_groups, DispatchReport, DEFAULT_MAX_WORKERS};
pub use executor::{GroupPoller, PollError, PollRun, SkipReason};
