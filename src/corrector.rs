//! Drift correction of the integrated window against the device counters.
//!
//! The window keeps the import/export split learned from instantaneous total power.
//! A single ratio derived from the net counter change rescales both sides, so the
//! magnitude follows the device while the split stays phase-balanced.

use crate::error::ParamsError;
use crate::integrator::IntegrationWindow;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tunables for debounce and scale factor bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeteringParams {
    pub debounce_ms: u64,
    pub min_scale: f64,
    pub max_scale: f64,
    /// Below this net integrated energy (Wh) the window is treated as zero
    pub epsilon_wh: f64,
    /// Raw ratios at or below this are treated as degenerate
    pub min_ratio: f64,
}

impl Default for MeteringParams {
    fn default() -> Self {
        Self {
            debounce_ms: 5000,
            min_scale: 0.1,
            max_scale: 10.0,
            epsilon_wh: 0.001,
            min_ratio: 0.001,
        }
    }
}

impl MeteringParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        let (min_scale, max_scale) = (self.min_scale, self.max_scale);
        let bounds_ok = min_scale.is_finite()
            && max_scale.is_finite()
            && min_scale > 0.0
            && min_scale <= max_scale;
        if !bounds_ok {
            return Err(ParamsError::ScaleBounds {
                min_scale,
                max_scale,
            });
        }
        for (name, value) in [("epsilon_wh", self.epsilon_wh), ("min_ratio", self.min_ratio)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ParamsError::Threshold { name, value });
            }
        }
        Ok(())
    }
}

/// Output quantities, in Wh. Both only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetMeteredEnergy {
    pub imported_wh: f64,
    pub exported_wh: f64,
}

impl NetMeteredEnergy {
    pub fn new(imported_wh: f64, exported_wh: f64) -> Self {
        Self {
            imported_wh,
            exported_wh,
        }
    }

    pub fn net_wh(&self) -> f64 {
        self.imported_wh - self.exported_wh
    }

    /// Folds a correction into the totals. Correction amounts are never negative.
    pub fn apply(&mut self, correction: &Correction) {
        self.imported_wh += correction.imported_wh.max(0.0);
        self.exported_wh += correction.exported_wh.max(0.0);
    }
}

/// Result of reconciling one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub window: IntegrationWindow,
    pub ref_delta_wh: f64,
    /// Ratio before clamping, `None` when the window was too small to divide by
    pub raw_scale: Option<f64>,
    pub scale: f64,
    pub imported_wh: f64,
    pub exported_wh: f64,
}

/// Picks the scale factor for a window with net integrated energy `int_delta`
/// against a net reference change of `ref_delta`. Always inside the clamp bounds
/// when `params` validate; never panics when they don't.
pub fn scale_factor(
    ref_delta: f64,
    int_delta: f64,
    params: &MeteringParams,
) -> (Option<f64>, f64) {
    let (raw, k) = if int_delta.abs() > params.epsilon_wh {
        let ratio = ref_delta / int_delta;
        if ratio.is_finite() && ratio > params.min_ratio {
            (Some(ratio), ratio)
        } else {
            warn!(
                ratio,
                ref_delta, int_delta, "degenerate scale factor, falling back to 1.0"
            );
            (Some(ratio), 1.0)
        }
    } else {
        (None, 1.0)
    };
    (raw, k.max(params.min_scale).min(params.max_scale))
}

/// Rescales `window` so its net energy matches `ref_delta` as closely as the bounds allow
pub fn correct(
    window: IntegrationWindow,
    ref_delta: f64,
    params: &MeteringParams,
) -> Correction {
    let (raw_scale, scale) = scale_factor(ref_delta, window.net_wh(), params);
    Correction {
        window,
        ref_delta_wh: ref_delta,
        raw_scale,
        scale,
        imported_wh: window.imported_wh * scale,
        exported_wh: window.exported_wh * scale,
    }
}
