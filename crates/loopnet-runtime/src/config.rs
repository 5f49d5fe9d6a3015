//! Runtime configuration.
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! file only needs to mention what it changes.

use serde::{Deserialize, Serialize};

/// Which device queue model the engine submits work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueKind {
    /// Tasks run on the submitting thread before `enqueue` returns.
    Immediate,
    /// Tasks run in submission order on a dedicated worker thread.
    InOrder,
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Immediate
    }
}

/// Options for [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueKind,
}

/// Options for [`Network`](crate::network::Network) and the loop executors
/// it owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Whether loop executors record an [`IterationTrace`](crate::trace::IterationTrace)
    /// per iteration.
    pub trace_enabled: bool,
}

/// Options for [`Program::compile`](crate::program::Program::compile).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Maximum nesting of loop bodies. Default: 16.
    pub max_loop_depth: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { max_loop_depth: 16 }
    }
}

/// All runtime options, as read from a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    pub network: NetworkConfig,
    pub compile: CompileOptions,
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.engine.queue, QueueKind::Immediate);
        assert!(!config.network.trace_enabled);
        assert_eq!(config.compile.max_loop_depth, 16);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json(r#"{"engine":{"queue":"InOrder"}}"#).unwrap();
        assert_eq!(config.engine.queue, QueueKind::InOrder);
        assert_eq!(config.compile.max_loop_depth, 16);

        let empty = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(empty, RuntimeConfig::default());
    }

    #[test]
    fn serde_roundtrip() {
        let config = RuntimeConfig {
            engine: EngineConfig {
                queue: QueueKind::InOrder,
            },
            network: NetworkConfig {
                trace_enabled: true,
            },
            compile: CompileOptions { max_loop_depth: 3 },
        };
        let json = serde_json::to_string(&config).unwrap();
        let back = RuntimeConfig::from_json(&json).unwrap();
        assert_eq!(back, config);
    }
}
