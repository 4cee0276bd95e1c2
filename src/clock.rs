use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Injectable time source. Every time-dependent component takes one so tests
/// can drive TTL windows and circuit cooldowns deterministically.
pub trait Clock: Send + Sync {
    fn now_epoch_ms(&self) -> u64;

    fn now_epoch_secs(&self) -> u64 {
        self.now_epoch_ms() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Deterministic clocks for tests.
pub mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::Clock;

    /// Fixed clock advanced explicitly by tests.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now_ms: AtomicU64,
    }

    impl ManualClock {
        pub fn at(now_ms: u64) -> Self {
            Self {
                now_ms: AtomicU64::new(now_ms),
            }
        }

        pub fn advance_ms(&self, delta: u64) {
            self.now_ms.fetch_add(delta, Ordering::SeqCst);
        }

        pub fn set_ms(&self, now_ms: u64) {
            self.now_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_epoch_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }
}
