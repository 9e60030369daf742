use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `CHATFLOW_LOG=chatflow_engine=debug`.
pub const LOG_FILTER_ENV: &str = "CHATFLOW_LOG";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs the global fmt subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_can_run_twice() {
        init();
        init();
    }
}
