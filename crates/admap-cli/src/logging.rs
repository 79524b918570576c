//! `tracing` subscriber setup. `RUST_LOG` wins over `-v` when set.

use std::io;

use clap::ValueEnum;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const WORKSPACE_TARGETS: &[&str] = &[
    "admap",
    "admap_core",
    "admap_storage",
    "admap_adapters",
    "admap_sync",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human readable.
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Directives used when `RUST_LOG` is unset: workspace crates at the verbosity level, the rest at
/// warn.
pub fn default_directives(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    std::iter::once("warn".to_string())
        .chain(WORKSPACE_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn init(verbosity: u8, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr).with_current_span(true))
            .init(),
        LogFormat::Compact => registry.with(fmt::layer().compact().with_writer(io::stderr)).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_writer(io::stderr)).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_only_workspace_targets() {
        assert_eq!(
            default_directives(0),
            "warn,admap=info,admap_core=info,admap_storage=info,admap_adapters=info,admap_sync=info"
        );
        assert!(default_directives(1).contains("admap_sync=debug"));
        assert!(default_directives(7).starts_with("warn,admap=trace"));
    }

    #[test]
    fn directives_parse_as_a_filter() {
        assert!(EnvFilter::try_new(default_directives(2)).is_ok());
    }
}
