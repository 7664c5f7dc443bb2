//! Logging utilities with structured JSON output support.
//!
//! Supports both human-readable and JSON log formats for log aggregation.

use crate::distributed::TopologyDescriptor;
use tracing::Span;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable format (default)
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize logging with the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Initialize logging with the specified format.
///
/// Set `RUST_LOG` environment variable to control log level. Calling this
/// twice in one process is harmless: the second subscriber is ignored.
pub fn init_logging_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .flatten_event(true)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
    };
    // A subscriber installed earlier in the process keeps priority
    installed.ok();
}

/// Initialize logging based on `MESH_LOG_FORMAT` ("json", "compact", or pretty).
pub fn init_logging_from_env() {
    let format = std::env::var("MESH_LOG_FORMAT")
        .map(|s| LogFormat::from_name(&s))
        .unwrap_or(LogFormat::Pretty);

    init_logging_with_format(format);
}

/// Span tagging every event of a worker with its mesh coordinate.
///
/// Enter it once after the topology is built:
/// `let _guard = rank_span(&topology).entered();`
pub fn rank_span(topology: &TopologyDescriptor) -> Span {
    let coord = topology.coordinate();
    tracing::info_span!(
        "rank",
        rank = topology.rank(),
        pp = coord.pipeline,
        dp = coord.data,
        tp = coord.tensor,
    )
}
