//! Retry planning.
//!
//! - `failure` parses raw runner output into `TestFailureContext`s
//! - `progression` diffs failing sets across attempts
//! - `planner` decides whether to retry and builds the `RetryDirective`

pub mod failure;
pub mod planner;
pub mod progression;

pub use failure::{FailureExtractor, FailureMatch, FailureMatcher, FailureType, TestFailureContext};
pub use planner::{ErrorClass, RetryDirective, RetryPlanner, RetryPolicy};
pub use progression::{AttemptRecord, ProgressionTracker, TestProgression};
