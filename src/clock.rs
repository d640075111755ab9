use std::sync::atomic::{AtomicU64, Ordering};

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    fn now_epoch_millis(&self) -> u64 {
        self.now_epoch_seconds().saturating_mul(1000)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_epoch_seconds(&self) -> u64 {
        (**self).now_epoch_seconds()
    }

    fn now_epoch_millis(&self) -> u64 {
        (**self).now_epoch_millis()
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_secs()
    }

    fn now_epoch_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_millis() as u64
    }
}

/// Settable clock for deterministic window and day-rollover tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicU64,
}

impl ManualClock {
    pub fn new(start_epoch_seconds: u64) -> Self {
        Self {
            seconds: AtomicU64::new(start_epoch_seconds),
        }
    }

    pub fn set(&self, epoch_seconds: u64) {
        self.seconds.store(epoch_seconds, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: u64) {
        self.seconds.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }
}
