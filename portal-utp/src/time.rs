use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Injectable clock. State machines never read wall time themselves; the
/// wire timestamps use the microsecond counter, scheduling uses `Instant`.
pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;

    /// Monotonic-ish microsecond counter used for uTP header timestamps.
    /// Only differences matter, and the wire truncates to 32 bits.
    fn now_micros(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_micros(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u32)
            .unwrap_or(0)
    }
}

/// A manual clock for deterministic transport tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    micros: RwLock<u32>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, micros: u32) -> Self {
        Self {
            instant: RwLock::new(instant),
            micros: RwLock::new(micros),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        let mut micros = self.micros.write().unwrap();
        *micros = micros.wrapping_add(duration.as_micros() as u32);
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_micros(&self) -> u32 {
        *self.micros.read().unwrap()
    }
}
