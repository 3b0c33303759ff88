use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::store::error::Error::Cancelled;
use crate::store::error::*;

/// Cooperative cancellation flag shared between the caller and every
/// blocking operation. Each network read, file write, lock wait, and
/// extractor yield re-checks the token on a bounded interval.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Errors with `Cancelled` once the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
