//! LEDBAT-style delay-based congestion control.
//!
//! The window grows while the measured one-way delay sits below the 100 ms
//! target and shrinks when it rises above, scaled by the fraction of the
//! window the ACK covered. Timeouts halve the window and zero the in-flight
//! budget so the retransmit path restarts cleanly.

use crate::PAYLOAD_SIZE;
use crate::rtt::RttEstimator;
use std::time::{Duration, Instant};

/// Target one-way delay (LEDBAT), microseconds.
pub const TARGET_DELAY_MICROS: u32 = 100_000;
/// Window gain applied per ACK.
pub const GAIN: f64 = 3000.0;
/// Floor for the congestion window.
pub const MIN_WINDOW: usize = 3 * PAYLOAD_SIZE;
/// Ceiling for the congestion window.
pub const MAX_WINDOW: usize = 1024 * 1024;
/// Consecutive timeouts after which the socket gives up and resets.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Number of base-delay history slots; each covers `BASE_DELAY_SLOT`, so the
/// minimum is taken over a sliding window slightly over one minute.
const BASE_DELAY_SLOTS: usize = 13;
const BASE_DELAY_SLOT: Duration = Duration::from_secs(5);
/// Smoothing factor for the current-delay EWMA.
const CURRENT_DELAY_ALPHA: f64 = 0.25;

/// Outcome of feeding an ACK to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// The window opened (or data left flight); the writer may send more.
    pub write_ready: bool,
}

#[derive(Debug, Clone)]
pub struct Ledbat {
    rtt: RttEstimator,
    /// Per-slot minima of the one-way delay samples, sliding minute window.
    base_delay_slots: [Option<u32>; BASE_DELAY_SLOTS],
    slot_index: usize,
    slot_started: Instant,
    current_delay: f64,
    max_window: usize,
    cur_window: usize,
    consecutive_timeouts: u32,
}

impl Ledbat {
    pub fn new(now: Instant) -> Self {
        Self {
            rtt: RttEstimator::new(),
            base_delay_slots: [None; BASE_DELAY_SLOTS],
            slot_index: 0,
            slot_started: now,
            current_delay: 0.0,
            max_window: MIN_WINDOW,
            cur_window: 0,
            consecutive_timeouts: 0,
        }
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    pub fn cur_window(&self) -> usize {
        self.cur_window
    }

    /// Whether one more packet of `len` payload bytes fits the window.
    pub fn can_send(&self, len: usize) -> bool {
        self.cur_window + len <= self.max_window
    }

    pub fn on_packet_sent(&mut self, len: usize) {
        self.cur_window += len;
    }

    /// Removes bytes for a packet that was acked (or abandoned) from the
    /// in-flight accounting.
    pub fn on_bytes_freed(&mut self, len: usize) {
        self.cur_window = self.cur_window.saturating_sub(len);
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn srtt(&self) -> Duration {
        self.rtt.srtt()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Feeds an ACK covering `acked_bytes`, with the peer-echoed one-way
    /// delay and an optional RTT sample (None for retransmitted packets,
    /// per Karn's rule).
    pub fn on_ack(
        &mut self,
        acked_bytes: usize,
        delay_sample_micros: u32,
        rtt_sample: Option<Duration>,
        now: Instant,
    ) -> AckOutcome {
        self.consecutive_timeouts = 0;
        self.on_bytes_freed(acked_bytes);
        self.sample_delay(delay_sample_micros, now);
        if let Some(sample) = rtt_sample {
            self.rtt.update(sample);
        }

        let queuing_delay = self.queuing_delay_micros();
        let off_target =
            (TARGET_DELAY_MICROS as f64 - queuing_delay) / TARGET_DELAY_MICROS as f64;
        let window_factor = if self.max_window == 0 {
            0.0
        } else {
            acked_bytes as f64 / self.max_window as f64
        };
        let adjustment = GAIN * off_target * window_factor * PAYLOAD_SIZE as f64;
        let next = self.max_window as f64 + adjustment;
        self.max_window = (next as i64).clamp(MIN_WINDOW as i64, MAX_WINDOW as i64) as usize;

        AckOutcome {
            write_ready: self.cur_window + PAYLOAD_SIZE <= self.max_window,
        }
    }

    /// A retransmission timeout fired. Returns `true` when the failure
    /// budget is exhausted and the socket must reset.
    pub fn on_timeout(&mut self) -> bool {
        self.consecutive_timeouts += 1;
        self.max_window = (self.max_window / 2).max(MIN_WINDOW);
        self.cur_window = 0;
        self.rtt.on_timeout();
        self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS
    }

    fn sample_delay(&mut self, delay_micros: u32, now: Instant) {
        // Rotate the minute window forward, clearing slots we skipped over.
        let mut elapsed = now.saturating_duration_since(self.slot_started);
        while elapsed >= BASE_DELAY_SLOT {
            self.slot_index = (self.slot_index + 1) % BASE_DELAY_SLOTS;
            self.base_delay_slots[self.slot_index] = None;
            self.slot_started += BASE_DELAY_SLOT;
            elapsed = now.saturating_duration_since(self.slot_started);
        }
        let slot = &mut self.base_delay_slots[self.slot_index];
        *slot = Some(slot.map_or(delay_micros, |min| min.min(delay_micros)));

        let alpha = CURRENT_DELAY_ALPHA;
        self.current_delay = self.current_delay * (1.0 - alpha) + delay_micros as f64 * alpha;
    }

    fn base_delay_micros(&self) -> Option<u32> {
        self.base_delay_slots.iter().flatten().copied().min()
    }

    /// Current delay above the observed base; the LEDBAT queuing estimate.
    pub fn queuing_delay_micros(&self) -> f64 {
        match self.base_delay_micros() {
            Some(base) => (self.current_delay - base as f64).max(0.0),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_grows_below_target() {
        let now = Instant::now();
        let mut cc = Ledbat::new(now);
        cc.on_packet_sent(PAYLOAD_SIZE);
        let before = cc.max_window();
        cc.on_ack(PAYLOAD_SIZE, 1_000, Some(Duration::from_millis(50)), now);
        assert!(cc.max_window() > before);
        assert_eq!(cc.cur_window(), 0);
    }

    #[test]
    fn window_shrinks_above_target() {
        let now = Instant::now();
        let mut cc = Ledbat::new(now);
        // Grow first so there is room to shrink.
        for _ in 0..40 {
            cc.on_packet_sent(PAYLOAD_SIZE);
            cc.on_ack(PAYLOAD_SIZE, 1_000, None, now);
        }
        let grown = cc.max_window();
        assert!(grown > MIN_WINDOW);
        // Base delay stays at 1ms; a 500ms sample means heavy queuing.
        for _ in 0..20 {
            cc.on_packet_sent(PAYLOAD_SIZE);
            cc.on_ack(PAYLOAD_SIZE, 500_000, None, now);
        }
        assert!(cc.max_window() < grown);
    }

    #[test]
    fn window_respects_bounds() {
        let now = Instant::now();
        let mut cc = Ledbat::new(now);
        for _ in 0..10_000 {
            cc.on_packet_sent(PAYLOAD_SIZE);
            cc.on_ack(PAYLOAD_SIZE, 0, None, now);
        }
        assert!(cc.max_window() <= MAX_WINDOW);
        for _ in 0..100 {
            cc.on_timeout();
        }
        assert!(cc.max_window() >= MIN_WINDOW);
    }

    #[test]
    fn timeout_halves_and_counts() {
        let now = Instant::now();
        let mut cc = Ledbat::new(now);
        for _ in 0..40 {
            cc.on_packet_sent(PAYLOAD_SIZE);
            cc.on_ack(PAYLOAD_SIZE, 1_000, None, now);
        }
        let grown = cc.max_window();
        cc.on_packet_sent(PAYLOAD_SIZE);
        assert!(!cc.on_timeout());
        assert_eq!(cc.cur_window(), 0);
        assert!(cc.max_window() <= grown / 2 + 1);
        assert!(!cc.on_timeout());
        // Third consecutive timeout exhausts the budget.
        assert!(cc.on_timeout());
    }

    #[test]
    fn base_delay_window_slides() {
        let start = Instant::now();
        let mut cc = Ledbat::new(start);
        cc.sample_delay(10, start);
        assert_eq!(cc.base_delay_micros(), Some(10));
        // After the full window has rotated, the old minimum is forgotten.
        let later = start + Duration::from_secs(70);
        cc.sample_delay(500, later);
        assert_eq!(cc.base_delay_micros(), Some(500));
    }
}
