use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Per-packet diagnostics that are only worth seeing while debugging.
///
/// Enabled by `debug = true` in the config or `PROXVOICE_DEBUG`; messages go
/// to the `proxvoice::debug` target at `info`.
#[derive(Debug, Default)]
pub struct DebugLogger {
    enabled: AtomicBool,
}

impl DebugLogger {
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn log(&self, message: fmt::Arguments<'_>) {
        if self.is_enabled() {
            info!(target: "proxvoice::debug", "{message}");
        }
    }
}
