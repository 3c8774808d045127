//! throng: a staged virtual-user HTTP load generator.
//!
//! The [`loadtest`] module holds the engine (stage scheduler, virtual users,
//! metrics, thresholds, request executor). The [`scenarios`] module ships the
//! built-in auth and transaction workloads used by the `throng` binary.

pub mod loadtest;
pub mod scenarios;
