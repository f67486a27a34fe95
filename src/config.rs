use crate::corrector::MeteringParams;
use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_FAST_TICK_MS: u64 = 500;
const DEFAULT_SLOW_TICK_MS: u64 = 5000;
const DEFAULT_STATE_FILE: &str = "net_metering_state.json";
const DEFAULT_HA_IMPORT_ENTITY: &str = "sensor.net_energy_import";
const DEFAULT_HA_EXPORT_ENTITY: &str = "sensor.net_energy_export";
const DEFAULT_HA_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    pub import_entity: String,
    pub export_entity: String,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Service configuration, read from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub shelly_address: SocketAddr,
    pub fast_tick: Duration,
    pub slow_tick: Duration,
    /// Cached device samples older than this read as unavailable
    pub sample_max_age: Duration,
    pub params: MeteringParams,
    pub state_file: PathBuf,
    pub home_assistant: Option<HomeAssistantConfig>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests don't touch the process env
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let shelly_modbus = get("SHELLY_MODBUS")
            .context("Required to add Shelly modbus connection info (SHELLY_MODBUS env var)")?;
        let shelly_address: SocketAddr = shelly_modbus
            .trim()
            .parse()
            .with_context(|| format!("Invalid SHELLY_MODBUS address format: {shelly_modbus}"))?;

        let defaults = MeteringParams::default();
        let fast_tick_ms = parse_or(&get, "FAST_TICK_MS", DEFAULT_FAST_TICK_MS)?;
        let slow_tick_ms = parse_or(&get, "SLOW_TICK_MS", DEFAULT_SLOW_TICK_MS)?;
        let sample_max_age_ms =
            parse_or(&get, "SAMPLE_MAX_AGE_MS", fast_tick_ms.saturating_mul(3))?;
        let params = MeteringParams {
            debounce_ms: parse_or(&get, "DEBOUNCE_MS", defaults.debounce_ms)?,
            min_scale: parse_or(&get, "SCALE_MIN", defaults.min_scale)?,
            max_scale: parse_or(&get, "SCALE_MAX", defaults.max_scale)?,
            ..defaults
        };

        anyhow::ensure!(fast_tick_ms > 0, "FAST_TICK_MS must be positive");
        anyhow::ensure!(slow_tick_ms > 0, "SLOW_TICK_MS must be positive");
        params.validate().context("Invalid SCALE_MIN/SCALE_MAX")?;

        let state_file = get("STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));

        let ha_timeout_ms = parse_or(&get, "HA_TIMEOUT_MS", DEFAULT_HA_TIMEOUT_MS)?;
        anyhow::ensure!(ha_timeout_ms > 0, "HA_TIMEOUT_MS must be positive");

        let home_assistant = match get("HA_URL") {
            Some(url) if parse_bool_safe(get("HA_PUBLISH").or(Some("true".into()))) => {
                Some(HomeAssistantConfig {
                    url,
                    token: get("HA_TOKEN").unwrap_or_default(),
                    import_entity: get("HA_IMPORT_ENTITY")
                        .unwrap_or_else(|| DEFAULT_HA_IMPORT_ENTITY.to_string()),
                    export_entity: get("HA_EXPORT_ENTITY")
                        .unwrap_or_else(|| DEFAULT_HA_EXPORT_ENTITY.to_string()),
                    timeout: Duration::from_millis(ha_timeout_ms),
                })
            }
            _ => None,
        };

        Ok(Self {
            shelly_address,
            fast_tick: Duration::from_millis(fast_tick_ms),
            slow_tick: Duration::from_millis(slow_tick_ms),
            sample_max_age: Duration::from_millis(sample_max_age_ms),
            params,
            state_file,
            home_assistant,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
