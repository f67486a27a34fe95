use serde::{Deserialize, Serialize};

/// Cumulative device energy counters in Wh
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCounters {
    pub total_import_wh: f64,
    pub total_export_wh: f64,
}

impl ReferenceCounters {
    pub fn new(total_import_wh: f64, total_export_wh: f64) -> Self {
        Self {
            total_import_wh,
            total_export_wh,
        }
    }

    /// Net change from `earlier` to `self`, import minus export
    pub fn net_delta_since(&self, earlier: &ReferenceCounters) -> f64 {
        (self.total_import_wh - earlier.total_import_wh)
            - (self.total_export_wh - earlier.total_export_wh)
    }
}

/// Bookkeeping that only exists once the counters have been read at least once
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeState {
    /// Counters at the start of the current window
    pub baseline: ReferenceCounters,
    pub last_seen: ReferenceCounters,
    pub changed_since_last_correction: bool,
    pub last_change_ms: u64,
}

/// What a single reference observation did to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First successful read, baseline taken
    BaselineEstablished,
    Changed,
    Unchanged,
}

/// Flags when the reference counters have moved and then stayed put for the
/// debounce interval, so a correction never reads a half-updated pair.
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    debounce_ms: u64,
    state: Option<ChangeState>,
}

impl StabilityDetector {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            debounce_ms,
            state: None,
        }
    }

    /// Feeds one reference read. An absent read leaves everything untouched.
    pub fn observe(
        &mut self,
        counters: Option<ReferenceCounters>,
        now_ms: u64,
    ) -> Option<Observation> {
        let counters = counters?;

        let Some(state) = self.state.as_mut() else {
            self.state = Some(ChangeState {
                baseline: counters,
                last_seen: counters,
                changed_since_last_correction: false,
                last_change_ms: now_ms,
            });
            return Some(Observation::BaselineEstablished);
        };

        if counters != state.last_seen {
            state.changed_since_last_correction = true;
            state.last_change_ms = now_ms;
            state.last_seen = counters;
            Some(Observation::Changed)
        } else {
            Some(Observation::Unchanged)
        }
    }

    /// True once a change has been seen and nothing moved for the debounce interval
    pub fn is_settled(&self, now_ms: u64) -> bool {
        self.state.as_ref().is_some_and(|state| {
            state.changed_since_last_correction
                && now_ms.saturating_sub(state.last_change_ms) >= self.debounce_ms
        })
    }

    /// Starts a new window at `counters` and clears the change flag
    pub fn rebase(&mut self, counters: ReferenceCounters) {
        if let Some(state) = self.state.as_mut() {
            state.baseline = counters;
            state.changed_since_last_correction = false;
        }
    }

    pub fn baseline(&self) -> Option<ReferenceCounters> {
        self.state.map(|state| state.baseline)
    }

    pub fn state(&self) -> Option<&ChangeState> {
        self.state.as_ref()
    }
}
