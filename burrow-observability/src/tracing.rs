use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Log output options
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// One JSON object per line instead of the human-readable format
    pub json: bool,
    /// Filter directives; `RUST_LOG` wins when set, then this, then `info`
    pub filter: Option<String>,
    pub with_target: bool,
}

impl LoggingConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(self.filter.as_deref().unwrap_or("info"))
        })
    }
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), anyhow::Error> {
    let env_filter = config.env_filter();

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target);
        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(config.with_target);
        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    tracing::debug!(json = config.json, "Logging initialized");
    Ok(())
}

/// Compact logging at `info` unless `RUST_LOG` says otherwise.
/// Does nothing when a subscriber is already installed.
pub fn init_minimal_logging() {
    let _ = init_logging(&LoggingConfig::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_quietly() {
        init_minimal_logging();
        init_minimal_logging();
        assert!(init_logging(&LoggingConfig {
            json: true,
            ..LoggingConfig::default()
        })
        .is_err());
    }
}
