//! Logging setup using tracing.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
pub fn init(level: &str, compact: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let output = if compact {
        fmt::layer().compact().with_target(false).without_time().boxed()
    } else {
        fmt::layer().with_target(false).with_thread_ids(true).boxed()
    };

    tracing_subscriber::registry().with(filter).with(output).try_init()?;
    Ok(())
}
