//! Logging bootstrap for the fieldgate binary.
//!
//! Everything is written to stderr so `check` can keep stdout for its
//! report. Filtering is directive-based: the coarse `--log.level` expands
//! into a per-crate directive set that keeps the OPC UA and MongoDB stacks
//! one notch quieter than the agent itself, `--log.filter` replaces that
//! expansion with raw directives, and `RUST_LOG` wins over both.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Coarse verbosity of the agent's own logging.
    #[arg(
        long = "log.level",
        value_enum,
        default_value = "info",
        ignore_case = true,
        global = true
    )]
    pub level: LogLevel,

    /// Raw filter directives in tracing-subscriber syntax, e.g.
    /// "fieldgate=debug,opcua=warn". Replaces the --log.level expansion.
    #[arg(long = "log.filter", global = true)]
    pub filter: Option<String>,

    /// Force one JSON object per line. Without it, JSON is used whenever
    /// stderr is not an interactive terminal.
    #[arg(long = "log.json", env = "FIELDGATE_LOG_JSON", global = true)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Directive expansion per coarse level. The dependency stacks log heavily
/// at their own info/debug levels, which would drown the agent's output.
fn expand(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Off => "off",
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info,opcua=warn,mongodb=warn",
        LogLevel::Debug => "debug,opcua=info,mongodb=info",
        LogLevel::Trace => "trace,opcua=debug,mongodb=debug",
    }
}

/// Initializes the global subscriber. Panics if called twice.
pub fn init_logging(args: &LogArgs) {
    let directives = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| args.filter.clone())
        .unwrap_or_else(|| expand(args.level).to_string());
    let filter = EnvFilter::builder().parse_lossy(&directives);

    let interactive = atty::is(atty::Stream::Stderr);
    if args.json || !interactive {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .init();
    } else {
        let no_color = matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1");
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(!no_color)
            .with_target(false)
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .init();
    }
}
