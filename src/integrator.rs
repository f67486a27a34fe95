use serde::{Deserialize, Serialize};

/// Milliseconds per hour, converts W·ms into Wh
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Energy integrated since the last successful correction, split by flow direction.
/// Both fields stay non-negative between resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationWindow {
    pub imported_wh: f64,
    pub exported_wh: f64,
}

impl IntegrationWindow {
    /// Net integrated energy, import minus export
    pub fn net_wh(&self) -> f64 {
        self.imported_wh - self.exported_wh
    }

    pub fn is_empty(&self) -> bool {
        self.imported_wh == 0.0 && self.exported_wh == 0.0
    }
}

/// Converts total active power samples into energy over real elapsed time
#[derive(Debug, Clone, Default)]
pub struct Integrator {
    window: IntegrationWindow,
    last_tick_ms: Option<u64>,
}

impl Integrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrates one power sample taken at `now_ms`.
    ///
    /// Returns the signed energy added to the window, or `None` when the tick was
    /// discarded: power unavailable, first tick (anchor only), or a clock that did
    /// not move forward.
    pub fn tick(&mut self, power_w: Option<f64>, now_ms: u64) -> Option<f64> {
        let power_w = power_w?;

        let Some(last_ms) = self.last_tick_ms else {
            // First tick only sets the anchor, otherwise startup gap gets integrated
            self.last_tick_ms = Some(now_ms);
            return None;
        };

        if now_ms <= last_ms {
            return None;
        }
        let elapsed_ms = (now_ms - last_ms) as f64;
        self.last_tick_ms = Some(now_ms);

        let energy_wh = power_w * elapsed_ms / MS_PER_HOUR;
        if energy_wh >= 0.0 {
            self.window.imported_wh += energy_wh;
        } else {
            self.window.exported_wh += energy_wh.abs();
        }
        Some(energy_wh)
    }

    /// Moves the elapsed-time anchor to `now_ms` without integrating anything
    pub fn reanchor(&mut self, now_ms: u64) {
        self.last_tick_ms = Some(now_ms);
    }

    /// Returns the current window and starts a new empty one
    pub fn take_window(&mut self) -> IntegrationWindow {
        std::mem::take(&mut self.window)
    }

    pub fn window(&self) -> IntegrationWindow {
        self.window
    }

    pub fn last_tick_ms(&self) -> Option<u64> {
        self.last_tick_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_first_tick_only_anchors() {
        let mut integrator = Integrator::new();
        assert_eq!(integrator.tick(Some(1000.0), 50_000), None);
        assert!(integrator.window().is_empty());
        assert_eq!(integrator.last_tick_ms(), Some(50_000));
    }

    #[test]
    fn test_one_hour_at_one_kilowatt() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(1000.0), 0);
        let added = integrator.tick(Some(1000.0), 3_600_000);

        assert_eq!(added, Some(1000.0));
        assert_eq!(integrator.window().imported_wh, 1000.0);
        assert_eq!(integrator.window().exported_wh, 0.0);
    }

    #[test]
    fn test_negative_power_goes_to_export() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(0.0), 0);
        integrator.tick(Some(-720.0), 5_000);

        assert_close(integrator.window().exported_wh, 1.0);
        assert_eq!(integrator.window().imported_wh, 0.0);
    }

    #[test]
    fn test_absent_power_mutates_nothing() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(100.0), 1_000);
        assert_eq!(integrator.tick(None, 2_000), None);

        assert!(integrator.window().is_empty());
        assert_eq!(integrator.last_tick_ms(), Some(1_000));
    }

    #[test]
    fn test_absent_first_sample_does_not_anchor() {
        let mut integrator = Integrator::new();
        assert_eq!(integrator.tick(None, 1_000), None);
        assert_eq!(integrator.last_tick_ms(), None);
    }

    #[test]
    fn test_stalled_or_backwards_clock_is_discarded() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(500.0), 10_000);
        assert_eq!(integrator.tick(Some(500.0), 10_000), None);
        assert_eq!(integrator.tick(Some(500.0), 9_000), None);

        assert!(integrator.window().is_empty());
        assert_eq!(integrator.last_tick_ms(), Some(10_000));
    }

    #[test]
    fn test_window_net_matches_signed_sum() {
        let samples = [
            (250.0, 500u64),
            (-1200.0, 480),
            (3000.0, 520),
            (-15.5, 1000),
            (0.0, 500),
            (845.25, 2500),
        ];
        let mut integrator = Integrator::new();
        let mut now = 0u64;
        integrator.tick(Some(0.0), now);

        let mut expected = 0.0;
        for (power, dt) in samples {
            now += dt;
            integrator.tick(Some(power), now);
            expected += power * dt as f64 / MS_PER_HOUR;
        }

        assert_close(integrator.window().net_wh(), expected);
        assert!(integrator.window().imported_wh >= 0.0);
        assert!(integrator.window().exported_wh >= 0.0);
    }

    #[test]
    fn test_opposite_samples_balance() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(0.0), 0);
        integrator.tick(Some(2000.0), 500);
        integrator.tick(Some(-2000.0), 1000);

        let window = integrator.window();
        assert_eq!(window.imported_wh, window.exported_wh);
        assert_eq!(window.net_wh(), 0.0);
    }

    #[test]
    fn test_take_window_resets() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(100.0), 0);
        integrator.tick(Some(100.0), 36_000);

        let taken = integrator.take_window();
        assert_close(taken.imported_wh, 1.0);
        assert!(integrator.window().is_empty());
    }

    #[test]
    fn test_reanchor_excludes_elapsed_time() {
        let mut integrator = Integrator::new();
        integrator.tick(Some(3600.0), 0);
        integrator.reanchor(10_000);
        integrator.tick(Some(3600.0), 11_000);

        assert_close(integrator.window().imported_wh, 1.0);
    }
}
