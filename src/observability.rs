//! Tracing subscriber setup

use std::{io::IsTerminal, sync::OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "mirador=info,tower_http=info";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Errors emitted when configuring the tracing subscriber
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A previous call already installed the subscriber
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    /// Another subscriber was installed outside this module
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber: `EnvFilter` plus a fmt layer
///
/// `RUST_LOG` takes precedence over `default_filter`.
///
/// # Errors
///
/// Returns [`InitError::AlreadyInitialised`] on a second call
pub fn init_tracing(default_filter: &str) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|()| InitError::AlreadyInitialised)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    Registry::default().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_rejected() {
        // Another test may have won the race; either way the next call fails.
        let _ = init_tracing(DEFAULT_FILTER);
        assert!(matches!(
            init_tracing(DEFAULT_FILTER),
            Err(InitError::AlreadyInitialised)
        ));
    }
}
