use ow_core::config::LogFormat;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the process-wide `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies (e.g. "info",
/// "ow_agents=debug,warn"). Safe to call more than once: later calls are
/// no-ops, which keeps tests that each initialise logging happy.
pub fn init_logging(service_name: &str, format: LogFormat, default_level: &str) {
    let filter = build_filter(default_level);

    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, format = ?format, "logging initialised");
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
