use crate::clock::{Clock, MonotonicClock};
use crate::net_metering::{PowerSource, ReferenceSource};
use crate::stability_detector::ReferenceCounters;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Most recent device samples, written by the poller task and read synchronously
/// by the metering ticks. Samples older than `max_age_ms` read as unavailable.
pub struct LatestReadings<C: Clock = MonotonicClock> {
    clock: C,
    max_age_ms: u64,

    // Atomic storage for power (f64 bits) and when it was taken
    power_bits: AtomicU64,
    power_at_ms: AtomicU64,
    has_power: AtomicBool,

    counters: Mutex<Option<(ReferenceCounters, u64)>>,
}

impl<C: Clock> LatestReadings<C> {
    pub fn new(clock: C, max_age_ms: u64) -> Self {
        Self {
            clock,
            max_age_ms,
            power_bits: AtomicU64::new(0.0f64.to_bits()),
            power_at_ms: AtomicU64::new(0),
            has_power: AtomicBool::new(false),
            counters: Mutex::new(None),
        }
    }

    /// Records a power sample. Non-finite values are dropped.
    pub fn update_power(&self, power_w: f64) {
        if !power_w.is_finite() {
            return;
        }
        self.power_bits.store(power_w.to_bits(), Ordering::Relaxed);
        self.power_at_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
        self.has_power.store(true, Ordering::Release);
    }

    /// Records a counter pair. Non-finite or negative values are dropped.
    pub fn update_counters(&self, counters: ReferenceCounters) {
        let valid = |v: f64| v.is_finite() && v >= 0.0;
        if !valid(counters.total_import_wh) || !valid(counters.total_export_wh) {
            return;
        }
        let now_ms = self.clock.now_ms();
        let mut slot = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some((counters, now_ms));
    }

    fn is_fresh(&self, taken_at_ms: u64) -> bool {
        self.clock.now_ms().saturating_sub(taken_at_ms) <= self.max_age_ms
    }
}

impl<C: Clock> PowerSource for LatestReadings<C> {
    fn read_power(&self) -> Option<f64> {
        if !self.has_power.load(Ordering::Acquire) {
            return None;
        }
        let taken_at_ms = self.power_at_ms.load(Ordering::Relaxed);
        self.is_fresh(taken_at_ms)
            .then(|| f64::from_bits(self.power_bits.load(Ordering::Relaxed)))
    }
}

impl<C: Clock> ReferenceSource for LatestReadings<C> {
    fn read_reference_counters(&self) -> Option<ReferenceCounters> {
        let slot = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let (counters, taken_at_ms) = (*slot)?;
        self.is_fresh(taken_at_ms).then_some(counters)
    }
}
