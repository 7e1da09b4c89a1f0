//! Logging setup for hosts that embed the engine.

/// Filter used when the host passes nothing usable.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install `env_logger` with `filter` (`"debug"`,
/// `"warn,terracotta_core=debug"`, ...). Later calls are no-ops.
///
/// Returns false if a logger was already installed.
pub fn init_logger(filter: Option<&str>) -> bool {
    let filter = filter
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER);

    env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_logger(Some("debug"));
        assert!(!init_logger(None));
        assert!(!init_logger(Some("  ")));
    }
}
