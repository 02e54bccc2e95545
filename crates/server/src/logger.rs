//! Logger initialization for the server

use logforth::{append::Stderr, filter::EnvFilter};
use std::{str::FromStr, sync::Once};

static INIT: Once = Once::new();

/// Initialize the logger.
/// The log_filter should be a string like "info" or "lynkr_llm=debug,lynkr_agent=debug".
pub fn init(log_filter: &str) {
    let log_filter = log_filter.to_owned();

    INIT.call_once(move || {
        logforth::builder()
            .dispatch(move |d| {
                let filter = EnvFilter::from_str(&log_filter)
                    .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter should be valid"));

                d.filter(filter).append(Stderr::default())
            })
            .apply();
    });
}
