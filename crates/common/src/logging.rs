//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup the tracing subscriber for the application
///
/// `RUST_LOG` takes precedence; `default_level` applies otherwise.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_reported() {
        // Guaranteed-invalid directive; must surface as a config error,
        // not a panic inside the subscriber
        let result = setup_logging("server=notalevel");
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(result, Err(crate::Error::Config(_))));
        }
    }
}
