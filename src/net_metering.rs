use crate::accumulator_store::AccumulatorStore;
use crate::clock::Clock;
use crate::corrector::{self, Correction, MeteringParams, NetMeteredEnergy};
use crate::error::{LoadError, MeteringError, ParamsError};
use crate::integrator::{IntegrationWindow, Integrator};
use crate::stability_detector::{Observation, ReferenceCounters, StabilityDetector};
use tracing::{debug, info};

/// Latest instantaneous total active power in W, positive on import
pub trait PowerSource {
    fn read_power(&self) -> Option<f64>;
}

/// Latest cumulative device import/export counters
pub trait ReferenceSource {
    fn read_reference_counters(&self) -> Option<ReferenceCounters>;
}

impl<T: PowerSource + ?Sized> PowerSource for std::sync::Arc<T> {
    fn read_power(&self) -> Option<f64> {
        (**self).read_power()
    }
}

impl<T: ReferenceSource + ?Sized> ReferenceSource for std::sync::Arc<T> {
    fn read_reference_counters(&self) -> Option<ReferenceCounters> {
        (**self).read_reference_counters()
    }
}

/// What a slow tick ended up doing
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlowTickOutcome {
    ReferenceUnavailable,
    BaselineEstablished,
    /// Counters not yet changed, or still inside the debounce interval
    Waiting,
    Corrected(Correction),
}

/// All mutable metering state, owned by whoever drives the ticks
#[derive(Debug, Clone)]
pub struct NetMeteringState {
    params: MeteringParams,
    integrator: Integrator,
    detector: StabilityDetector,
    energy: NetMeteredEnergy,
}

impl NetMeteringState {
    /// Starts metering from totals previously loaded from storage
    pub fn new(energy: NetMeteredEnergy, params: MeteringParams) -> Result<Self, ParamsError> {
        params.validate()?;
        Ok(Self {
            params,
            integrator: Integrator::new(),
            detector: StabilityDetector::new(params.debounce_ms),
            energy,
        })
    }

    /// Loads the persisted totals and starts metering from them
    pub fn load(
        store: &mut impl AccumulatorStore,
        params: MeteringParams,
    ) -> Result<Self, LoadError> {
        params.validate()?;
        let energy = store.load()?;
        info!(
            imported_wh = energy.imported_wh,
            exported_wh = energy.exported_wh,
            "loaded net metered energy"
        );
        Ok(Self::new(energy, params)?)
    }

    /// Integrates the current power sample into the open window
    pub fn on_fast_tick(&mut self, power: &impl PowerSource, clock: &impl Clock) {
        let sample = power.read_power();
        if sample.is_none() {
            debug!("power sample unavailable, skipping integration");
        }
        self.integrator.tick(sample, clock.now_ms());
    }

    /// Reads the reference counters, updates change tracking and corrects the
    /// window once the counters have settled.
    ///
    /// A failed store still leaves the correction applied in memory; the error
    /// carries the correction so the caller can report it.
    pub fn on_slow_tick(
        &mut self,
        reference: &impl ReferenceSource,
        clock: &impl Clock,
        store: &mut impl AccumulatorStore,
    ) -> Result<SlowTickOutcome, MeteringError> {
        let now_ms = clock.now_ms();
        let Some(counters) = reference.read_reference_counters() else {
            debug!("reference counters unavailable");
            return Ok(SlowTickOutcome::ReferenceUnavailable);
        };

        match self.detector.observe(Some(counters), now_ms) {
            Some(Observation::BaselineEstablished) => {
                info!(
                    total_import_wh = counters.total_import_wh,
                    total_export_wh = counters.total_export_wh,
                    "reference baseline established"
                );
                return Ok(SlowTickOutcome::BaselineEstablished);
            }
            Some(Observation::Changed) => debug!(
                total_import_wh = counters.total_import_wh,
                total_export_wh = counters.total_export_wh,
                "reference counters changed"
            ),
            _ => {}
        }

        if !self.detector.is_settled(now_ms) {
            return Ok(SlowTickOutcome::Waiting);
        }
        let Some(baseline) = self.detector.baseline() else {
            return Ok(SlowTickOutcome::Waiting);
        };

        let ref_delta = counters.net_delta_since(&baseline);
        let correction =
            corrector::correct(self.integrator.take_window(), ref_delta, &self.params);
        self.energy.apply(&correction);
        self.detector.rebase(counters);
        self.integrator.reanchor(clock.now_ms());

        info!(
            scale = correction.scale,
            raw_scale = correction.raw_scale,
            ref_delta_wh = ref_delta,
            window_import_wh = correction.window.imported_wh,
            window_export_wh = correction.window.exported_wh,
            imported_wh = self.energy.imported_wh,
            exported_wh = self.energy.exported_wh,
            "window corrected"
        );

        store
            .store(&self.energy)
            .map_err(|source| MeteringError::Persist { correction, source })?;
        Ok(SlowTickOutcome::Corrected(correction))
    }

    pub fn energy(&self) -> NetMeteredEnergy {
        self.energy
    }

    pub fn window(&self) -> IntegrationWindow {
        self.integrator.window()
    }

    pub fn baseline(&self) -> Option<ReferenceCounters> {
        self.detector.baseline()
    }
}
