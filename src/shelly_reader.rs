use crate::latest_readings::LatestReadings;
use crate::stability_detector::ReferenceCounters;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

// Registers are documented at: https://shelly-api-docs.shelly.cloud/gen2/ComponentsAndServices/EM/#modbus-registers
// and https://shelly-api-docs.shelly.cloud/gen2/ComponentsAndServices/EMData/#modbus-registers
/// EM total active power, float32 W
const TOTAL_ACTIVE_POWER_REG: u16 = 1013;
/// EMData total active energy then total active returned energy, float32 Wh each
const TOTAL_ENERGY_REG: u16 = 1162;

/// Pause after this many failed polls in a row before trying again
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_PAUSE: Duration = Duration::from_secs(30);

/// Polls a Shelly Pro 3EM over Modbus TCP and keeps `LatestReadings` current
pub struct ShellyReader {
    target_address: SocketAddr,
    poll_period: Duration,
    readings: Arc<LatestReadings>,
    connection: Option<client::Context>,
}

impl ShellyReader {
    pub fn new(
        target_address: SocketAddr,
        poll_period: Duration,
        readings: Arc<LatestReadings>,
    ) -> Self {
        Self {
            target_address,
            poll_period,
            readings,
            connection: None,
        }
    }

    /// Spawns the poll loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = self;
            reader.run().await;
        })
    }

    async fn run(&mut self) {
        info!(address = %self.target_address, "starting Shelly reader");

        let mut read_interval = interval(self.poll_period);
        read_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        loop {
            read_interval.tick().await;

            match self.poll().await {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        errors = consecutive_errors,
                        max = MAX_CONSECUTIVE_ERRORS,
                        "Shelly read error: {e}"
                    );
                    // Reset connection on error to force reconnect
                    self.connection = None;

                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!(
                            pause_secs = ERROR_PAUSE.as_secs(),
                            "too many consecutive Shelly read errors, pausing"
                        );
                        sleep(ERROR_PAUSE).await;
                        consecutive_errors = 0;
                    }
                }
            }
        }
    }

    /// Reads power and counters once. Power is published even if the counters fail.
    async fn poll(&mut self) -> anyhow::Result<()> {
        if self.connection.is_none() {
            self.connection = self.connect_with_retry().await;
        }
        let Some(connection) = self.connection.as_mut() else {
            anyhow::bail!("No connection available");
        };

        let power = read_total_power(connection).await?;
        self.readings.update_power(power);

        let counters = read_energy_counters(connection).await?;
        self.readings.update_counters(counters);

        debug!(
            power_w = power,
            total_import_wh = counters.total_import_wh,
            total_export_wh = counters.total_export_wh,
            "Shelly poll"
        );
        Ok(())
    }

    /// Connects to Shelly device with retry logic
    async fn connect_with_retry(&mut self) -> Option<client::Context> {
        const MAX_RETRIES: u32 = 3;

        for attempt in 1..=MAX_RETRIES {
            debug!(
                address = %self.target_address,
                attempt, "connecting to Shelly Pro 3EM"
            );

            match tcp::connect(self.target_address).await {
                Ok(connection) => {
                    info!(address = %self.target_address, "connected to Shelly Pro 3EM");
                    return Some(connection);
                }
                Err(e) => {
                    warn!(attempt, "connection attempt failed: {e}");
                    if attempt < MAX_RETRIES {
                        sleep(Duration::from_secs(1 << (attempt - 1))).await; // Exponential backoff
                    }
                }
            }
        }

        None
    }
}

/// Reads a run of float32 registers
async fn read_floats<const N: usize>(
    connection: &mut client::Context,
    start: u16,
) -> anyhow::Result<[f32; N]> {
    // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
    let registers = connection
        .read_input_registers(start, (N * 2) as u16)
        .await
        .map_err(|e| anyhow::anyhow!("IO error reading {start}: {e:?}"))?
        .map_err(|e| anyhow::anyhow!("Modbus exception reading {start}: {e:?}"))?;

    if registers.len() < N * 2 {
        anyhow::bail!(
            "short read at {start}: expected {} registers, got {}",
            N * 2,
            registers.len()
        );
    }

    let mut values = [0.0f32; N];
    for (value, pair) in values.iter_mut().zip(registers.chunks_exact(2)) {
        *value = merge_u16_f32(pair[0], pair[1]);
    }
    Ok(values)
}

async fn read_total_power(connection: &mut client::Context) -> anyhow::Result<f64> {
    let [power] = read_floats::<1>(connection, TOTAL_ACTIVE_POWER_REG).await?;
    Ok(power as f64)
}

async fn read_energy_counters(
    connection: &mut client::Context,
) -> anyhow::Result<ReferenceCounters> {
    let [import_wh, export_wh] = read_floats::<2>(connection, TOTAL_ENERGY_REG).await?;
    Ok(ReferenceCounters::new(import_wh as f64, export_wh as f64))
}

/// Converts two u16 values into a f32 (low word first)
fn merge_u16_f32(low: u16, high: u16) -> f32 {
    let combined: u32 = (low as u32) | ((high as u32) << 16);
    f32::from_bits(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(value: f32) -> (u16, u16) {
        let bits = value.to_bits();
        ((bits & 0xFFFF) as u16, (bits >> 16) as u16)
    }

    #[test]
    fn test_merge_u16_f32() {
        let (low, high) = split(123.456);
        assert_eq!(merge_u16_f32(low, high), 123.456);
    }

    #[test]
    fn test_merge_u16_f32_negative() {
        let (low, high) = split(-4567.5);
        assert_eq!(merge_u16_f32(low, high), -4567.5);
    }

    #[test]
    fn test_merge_u16_f32_energy_counter() {
        // Counters are large; float32 keeps ~7 significant digits
        let (low, high) = split(1_234_567.0);
        assert_eq!(merge_u16_f32(low, high), 1_234_567.0);
    }
}
