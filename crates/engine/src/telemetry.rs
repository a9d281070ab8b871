use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Returns false if a global subscriber was already installed, which makes
/// it safe to call from every test and every binary entry point.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused_quietly() {
        init_tracing("tracker_engine=debug");
        assert!(!init_tracing("info"));
    }
}
