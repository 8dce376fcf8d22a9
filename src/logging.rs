//! Tracing setup for the binary.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "REPEAT_PREDICTOR_LOG";

/// Default filter when `REPEAT_PREDICTOR_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "repeat_predictor=info";

/// Initialize logging to stderr.
///
/// Reads `REPEAT_PREDICTOR_LOG` for per-module levels, e.g.
/// `REPEAT_PREDICTOR_LOG=repeat_predictor::trainer=debug,repeat_predictor=info`.
/// `verbose` raises the fallback to debug. Only the first call has any effect.
pub fn init_tracing(verbose: bool) {
    INIT.call_once(|| {
        let fallback = if verbose {
            "repeat_predictor=debug"
        } else {
            DEFAULT_FILTER
        };
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    });
}
