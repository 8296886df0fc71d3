//! Scrape, store and cluster the first lines of early-modern manuscript verse.
//!
//! Records come from the Folger Shakespeare Library's
//! [Union First Line Index](https://firstlines.folger.edu/). They are persisted in SQLite by
//! [`db`], and variant witnesses of the same poem are grouped by [`cluster`].

use tracing_subscriber::EnvFilter;

pub mod cluster;
pub mod db;
pub mod folger;

/// Install a global `tracing` subscriber.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Calling this more than once is
/// harmless; only the first call installs a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
