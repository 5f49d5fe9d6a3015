//! Per-iteration trace recording for loop executors.
//!
//! When tracing is enabled via [`NetworkConfig::trace_enabled`](crate::config::NetworkConfig),
//! every loop executor records an [`IterationTrace`] for each iteration of
//! its most recent run.

use serde::{Deserialize, Serialize};

/// One executed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationTrace {
    /// Zero-based iteration index.
    pub iteration: i64,
    /// Number of events the body submission waited on.
    pub dependencies: usize,
    /// Continue condition observed after the iteration.
    pub continue_condition: bool,
}
