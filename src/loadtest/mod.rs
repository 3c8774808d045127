//! Load testing engine for HTTP services.
//!
//! Provides typed TOML configuration, a timeout-enforcing request executor,
//! error classification, HdrHistogram-based metrics, a piecewise-linear stage
//! scheduler and k6-style threshold evaluation.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod scenario;
pub mod scheduler;
pub mod threshold;
pub mod vu;
