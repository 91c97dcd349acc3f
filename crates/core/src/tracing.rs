//! Log output for binaries embedding the reconnection queue.
//!
//! Controlled by environment variables:
//!
//! - `RECONNECT_LOG_FORMAT=json` switches from pretty to JSON lines;
//! - `RECONNECT_LOG_TO_STDERR` writes to stderr instead of stdout;
//! - `RECONNECT_DISABLE_LOGS` installs nothing at all.
//!
//! `RUST_LOG` directives are honoured on top of the configured level.

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("RECONNECT_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let to_stderr = std::env::var("RECONNECT_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("RECONNECT_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
        Ok(())
    }
}

#[cfg(not(feature = "trace"))]
pub mod tracer {
    use tracing::level_filters::LevelFilter;

    /// Logging is compiled out without the `trace` feature.
    pub fn init_tracer(_level: Option<LevelFilter>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub use tracer::init_tracer;
