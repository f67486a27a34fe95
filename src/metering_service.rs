use crate::accumulator_store::{AccumulatorStore, JsonFileStore};
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::corrector::NetMeteredEnergy;
use crate::error::MeteringError;
use crate::home_assistant::HomeAssistantPublisher;
use crate::latest_readings::LatestReadings;
use crate::net_metering::{NetMeteringState, PowerSource, ReferenceSource, SlowTickOutcome};
use crate::shelly_reader::ShellyReader;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Drives both metering ticks from a single task, so the state is never shared
pub struct MeteringService<S, R, C = MonotonicClock> {
    state: NetMeteringState,
    readings: Arc<R>,
    clock: C,
    store: S,
    fast_tick: Duration,
    slow_tick: Duration,
    publisher: Option<HomeAssistantPublisher>,
    updates: Option<watch::Sender<NetMeteredEnergy>>,
    // Set while the in-memory totals are ahead of the store
    unpersisted: bool,
}

impl<S, R, C> MeteringService<S, R, C>
where
    S: AccumulatorStore,
    R: PowerSource + ReferenceSource,
    C: Clock,
{
    pub fn new(
        state: NetMeteringState,
        readings: Arc<R>,
        clock: C,
        store: S,
        fast_tick: Duration,
        slow_tick: Duration,
    ) -> Self {
        Self {
            state,
            readings,
            clock,
            store,
            fast_tick,
            slow_tick,
            publisher: None,
            updates: None,
            unpersisted: false,
        }
    }

    pub fn with_publisher(mut self, publisher: HomeAssistantPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn energy(&self) -> NetMeteredEnergy {
        self.state.energy()
    }

    /// Ticks until `shutdown` resolves, then flushes unpersisted totals.
    /// Returns the final totals.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> NetMeteredEnergy {
        info!(
            fast_tick_ms = self.fast_tick.as_millis() as u64,
            slow_tick_ms = self.slow_tick.as_millis() as u64,
            "starting net metering"
        );
        let publisher_task = self.publisher.take().map(|publisher| {
            let (tx, rx) = watch::channel(self.state.energy());
            self.updates = Some(tx);
            publisher.spawn(rx)
        });

        let mut fast = interval(self.fast_tick);
        fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut slow = interval(self.slow_tick);
        slow.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = slow.tick() => self.handle_slow_tick(),
                _ = fast.tick() => self.state.on_fast_tick(self.readings.as_ref(), &self.clock),
            }
        }

        self.flush();
        // Closing the channel lets the publisher send the final totals and stop
        self.updates = None;
        if let Some(task) = publisher_task {
            if let Err(e) = task.await {
                warn!("Home Assistant publisher ended abnormally: {e}");
            }
        }
        self.state.energy()
    }

    fn handle_slow_tick(&mut self) {
        match self
            .state
            .on_slow_tick(self.readings.as_ref(), &self.clock, &mut self.store)
        {
            Ok(SlowTickOutcome::Corrected(_)) => {
                self.unpersisted = false;
                self.publish();
            }
            Ok(_) => {}
            Err(MeteringError::Persist { correction, source }) => {
                warn!(
                    scale = correction.scale,
                    "failed to persist net metered energy, will retry: {source}"
                );
                self.unpersisted = true;
                self.publish();
            }
        }
    }

    fn flush(&mut self) {
        if !self.unpersisted {
            return;
        }
        match self.store.store(&self.state.energy()) {
            Ok(()) => {
                info!("flushed net metered energy on shutdown");
                self.unpersisted = false;
            }
            Err(e) => warn!("failed to flush net metered energy on shutdown: {e}"),
        }
    }

    /// Hands the totals to the publisher task, so HTTP latency never delays a tick
    fn publish(&self) {
        if let Some(updates) = &self.updates {
            updates.send_replace(self.state.energy());
        }
    }
}

/// Wires the Shelly reader, the state file and Home Assistant together and runs
/// until `shutdown` resolves.
pub async fn run_from_config(
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<NetMeteredEnergy> {
    let mut store = JsonFileStore::new(&config.state_file);
    let state = NetMeteringState::load(&mut store, config.params)?;

    let clock = MonotonicClock::new();
    let readings = Arc::new(LatestReadings::new(
        clock,
        config.sample_max_age.as_millis() as u64,
    ));
    let reader = ShellyReader::new(config.shelly_address, config.fast_tick, readings.clone())
        .spawn();

    let mut service = MeteringService::new(
        state,
        readings,
        clock,
        store,
        config.fast_tick,
        config.slow_tick,
    );
    if let Some(ha) = &config.home_assistant {
        info!(url = %ha.url, "publishing to Home Assistant");
        service = service.with_publisher(HomeAssistantPublisher::new(
            ha.url.clone(),
            ha.token.clone(),
            ha.import_entity.clone(),
            ha.export_entity.clone(),
            ha.timeout,
        )?);
    }

    let energy = service.run(shutdown).await;
    reader.abort();
    Ok(energy)
}
