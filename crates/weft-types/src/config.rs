//! Engine configuration types.
//!
//! `EngineConfig` represents an optional `weft.toml` that tunes iteration caps,
//! output size limits, and logging. All fields have sensible defaults.

use serde::{Deserialize, Serialize};

/// Iteration cap for `loop` steps that do not set `maxIterations`.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 100;

/// Largest serialized step output kept in a run context (1 MB).
pub const DEFAULT_MAX_STEP_OUTPUT_BYTES: usize = 1_048_576;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Iteration cap for `loop` steps that do not set `maxIterations`.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Largest serialized step output kept in the context; larger outputs are
    /// replaced with a truncation marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,

    /// Logging and trace export settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_max_loop_iterations() -> u32 {
    DEFAULT_MAX_LOOP_ITERATIONS
}

fn default_max_step_output_bytes() -> usize {
    DEFAULT_MAX_STEP_OUTPUT_BYTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            max_step_output_bytes: default_max_step_output_bytes(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Tracing subscriber settings used by hosts embedding the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Export spans to stdout through OpenTelemetry.
    #[serde(default)]
    pub otel: bool,
    /// Emit JSON log lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// `EnvFilter` directive; `RUST_LOG` wins when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}
