use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative cancellation handle, checked at node boundaries by all
/// long-running operations.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `Err(Error::Cancelled)` once `cancel` has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Wraps the user progress callback and clamps reports to be monotone
/// non-decreasing in `[0, 1]`.
#[derive(Clone)]
pub(crate) struct ProgressSink {
    callback: Option<ProgressCallback>,
    last: Arc<Mutex<f64>>,
}

impl ProgressSink {
    pub(crate) fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            last: Arc::new(Mutex::new(0.0)),
        }
    }

    pub(crate) fn report(&self, value: f64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let value = value.clamp(0.0, 1.0);
        let mut last = self.last.lock().expect("progress lock poisoned");
        if value > *last {
            *last = value;
            callback(value);
        }
    }
}
