/*!
 * Logging and tracing initialization
 */

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ParallaxError, Result};

/// Initialize structured logging for a checker process.
///
/// Honors `RUST_LOG` when set; otherwise defaults to `parallax=<level>`.
/// Embedding daemons that install their own subscriber should skip this
/// and let the crate's `tracing` events flow into it.
pub fn init_logging(default_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("parallax={default_level}")))
        .map_err(|e| ParallaxError::Config(format!("failed to create log filter: {e}")))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| ParallaxError::Config(format!("failed to init logging: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_enough_for_tests() {
        // A second init fails because a global subscriber is already set;
        // the error must surface as Config rather than a panic.
        let first = init_logging("debug");
        let second = init_logging("debug");
        assert!(first.is_ok() || second.is_err());
    }
}
