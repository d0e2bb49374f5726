//! Provide tracing, tailored to this program.
//!
//! The daemon calls [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Everything else includes `use crate::tracing::prelude::*` for
//! the `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()` macros.
//!
//! Protocol diagnostics (the client's `debug` and `msg` events) are logged
//! here as well as being delivered on the event channel, so a headless
//! daemon still records why a coordinator connection keeps failing.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init();
        } else {
            use_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout();
    }
}

// Filter according to RUST_LOG, overriding the default level (ERROR) to INFO.
// `RUST_LOG=getwork_miner::getwork=trace` shows every request and response.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Timestamps in local time to the nearest second. The default timer is UTC
// with sub-second precision, which is noise for a long-running miner.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
