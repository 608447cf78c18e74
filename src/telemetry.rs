//! Structured logging setup. `RUST_LOG` overrides the default filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber with human-readable output.
/// Safe to call once per process; later calls are ignored.
pub fn init() {
    init_with("weft=info,weft_router=info,weft_store=info,weft_rules=info", false);
}

/// Install the global subscriber; `json` switches to line-delimited JSON
/// for log shippers.
pub fn init_with(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    }
}
