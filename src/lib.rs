//! Shelly Net Metering Library
//!
//! Computes phase-balanced net import/export energy for a multi-phase Shelly Pro 3EM.
//! Total active power is integrated at a fast rate and the integrated window is
//! periodically rescaled against the device's own energy counters.

pub mod accumulator_store;
pub mod clock;
pub mod config;
pub mod corrector;
pub mod error;
pub mod home_assistant;
pub mod integrator;
pub mod latest_readings;
pub mod metering_service;
pub mod net_metering;
pub mod shelly_reader;
pub mod stability_detector;

// Re-export commonly used types for easier access
pub use accumulator_store::{AccumulatorStore, JsonFileStore, MemoryStore};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Config;
pub use corrector::{Correction, MeteringParams, NetMeteredEnergy};
pub use error::{LoadError, MeteringError, ParamsError, StoreError};
pub use integrator::IntegrationWindow;
pub use latest_readings::LatestReadings;
pub use metering_service::{run_from_config, MeteringService};
pub use net_metering::{NetMeteringState, PowerSource, ReferenceSource, SlowTickOutcome};
pub use stability_detector::ReferenceCounters;
