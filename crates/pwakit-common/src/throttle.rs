//! Opt-in throttling for high-frequency events (scroll, resize, wheel).
//!
//! Callers wrap their own handler in a [`Throttle`]; nothing global is
//! patched. The first event of a window is kept and delivered once the
//! window closes; every other event inside the window is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::trace;

/// One frame at 60 Hz.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// A throttled callback.
pub struct Throttle<T> {
    interval: Duration,
    pending: Arc<AtomicBool>,
    callback: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Throttle<T> {
    /// Create a throttle that fires `callback` at most once per `interval`.
    pub fn new<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            interval,
            pending: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(callback),
        }
    }

    /// Create a throttle running at [`FRAME_INTERVAL`].
    pub fn per_frame<F>(callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::new(FRAME_INTERVAL, callback)
    }

    /// Offer an event. Returns `true` if it was scheduled, `false` if dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn call(&self, value: T) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Throttled event dropped");
            return false;
        }

        let pending = Arc::clone(&self.pending);
        let callback = Arc::clone(&self.callback);
        let interval = self.interval;

        tokio::spawn(async move {
            sleep(interval).await;
            callback(value);
            pending.store(false, Ordering::Release);
        });
        true
    }

    /// Whether an event is waiting for its window to close.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// The throttle window.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<T> fmt::Debug for Throttle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("interval", &self.interval)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}
