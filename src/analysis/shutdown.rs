use crate::analysis::error::{BamError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation for long explorations and repairs.
/// Clones share the same flag, so a watchdog thread can hold one and request the shutdown.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Return `Err(BamError::Interrupted)` once a shutdown was requested
    pub fn check(&self) -> Result<()> {
        if self.is_requested() {
            Err(BamError::Interrupted)
        } else {
            Ok(())
        }
    }
}
