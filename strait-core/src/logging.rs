//! Logging setup.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber.
///
/// With `verbose` set, per-connection errors are logged at `debug`;
/// otherwise only listener lifecycle and warnings are emitted. `RUST_LOG`
/// still takes precedence for fine-grained control.
pub fn init_logging(verbose: bool) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(verbose);
    });

    result
}

fn init_logging_inner(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("strait_core={}", level)
                .parse()
                .map_err(|e| Error::config_with_source("invalid log directive", e))?,
        )
        .add_directive(
            format!("strait_bin={}", level)
                .parse()
                .map_err(|e| Error::config_with_source("invalid log directive", e))?,
        )
        .add_directive(
            "hyper=warn"
                .parse()
                .map_err(|e| Error::config_with_source("invalid log directive", e))?,
        )
        .add_directive(
            "russh=warn"
                .parse()
                .map_err(|e| Error::config_with_source("invalid log directive", e))?,
        );

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();

    // try_init so embedding (and tests) with an existing subscriber is fine.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();

    Ok(())
}
