//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level resolution order:
//! 1. explicit `level` argument
//! 2. `KILN_LOG` environment variable (e.g. "info", "debug")
//! 3. default `info`

use tracing_subscriber::fmt;

/// Initialise the global logging subscriber.
///
/// Idempotent: if a subscriber is already installed, this is a no-op.
pub fn init_logging(level: Option<tracing::Level>) {
    let level = level
        .or_else(|| {
            std::env::var("KILN_LOG")
                .ok()
                .and_then(|s| parse_level_str(&s))
        })
        .unwrap_or(tracing::Level::INFO);

    let _ = fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_strings_parse_case_insensitively() {
        assert_eq!(parse_level_str("DEBUG"), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level_str(" warn "), Some(tracing::Level::WARN));
        assert_eq!(parse_level_str("verbose"), None);
    }

    #[test]
    fn repeated_initialisation_is_a_no_op() {
        init_logging(Some(tracing::Level::ERROR));
        init_logging(None);
    }
}
