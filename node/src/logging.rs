//! # Structured Logging
//!
//! Installs the `tracing` subscriber: pretty or JSON lines, filtered by
//! `RUST_LOG` when set and by the node's default directive otherwise.
//!
//! Output goes to stderr. The `buy` and `bulletin-key` commands print their
//! results on stdout, which stays clean for piping.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive used when `RUST_LOG` is unset and `--verbose` is off.
pub const DEFAULT_DIRECTIVE: &str = "pod_node=info,pod_protocol=info,pod_contracts=info";

/// Directive for `--verbose`.
pub const VERBOSE_DIRECTIVE: &str = "pod_node=debug,pod_protocol=debug,pod_contracts=debug,tower_http=debug";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored output.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Accepts "json" or "pretty" (case-insensitive). Anything else is `Pretty`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber. Call once, early in `main()`.
///
/// `RUST_LOG` overrides `default_directive` when set:
///
/// ```text
/// RUST_LOG=pod_protocol=trace,tower_http=debug pod-node seller
/// ```
pub fn init_logging(default_directive: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_file(false)
                        .with_line_number(false),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(true),
                )
                .init();
        }
    }

    tracing::debug!(?format, "logging initialized");
}
