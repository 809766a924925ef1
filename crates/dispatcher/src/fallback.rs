//! Fallback diagnostics channel
//!
//! Destination state notices are written straight to stderr, bypassing the
//! pipeline, so a failing destination can never feed records back into the
//! queue. Only the pipeline's own events go here, never dropped records.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use tracing::warn;

use crate::health::DestinationState;

/// Direct stderr writer for internal diagnostic events
#[derive(Debug)]
pub struct Diagnostics {
    events: AtomicU64,
    echo: AtomicBool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Diagnostics {
    pub fn new(echo: bool) -> Self {
        Self {
            events: AtomicU64::new(0),
            echo: AtomicBool::new(echo),
        }
    }

    /// Disable or re-enable the stderr echo; events are still counted
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::Relaxed);
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Report a destination state change
    pub fn state_changed(
        &self,
        destination: &str,
        from: DestinationState,
        to: DestinationState,
        detail: &str,
    ) {
        self.events.fetch_add(1, Ordering::Relaxed);
        warn!(
            destination,
            from = %from,
            to = %to,
            detail,
            "Destination state changed"
        );

        if self.echo.load(Ordering::Relaxed) {
            let line = format!(
                "{} logpipe: destination '{destination}' {from} -> {to}: {detail}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
            );
            // nowhere left to report a failing stderr
            let _ = std::io::stderr().lock().write_all(line.as_bytes());
        }
    }
}
