use crate::corrector::NetMeteredEnergy;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Home Assistant REST client that publishes the net metered totals as energy sensors
#[derive(Debug, Clone)]
pub struct HomeAssistantPublisher {
    endpoint_url: String,
    auth_token: String,
    import_entity: String,
    export_entity: String,
    client: reqwest::Client,
}

impl HomeAssistantPublisher {
    pub fn new(
        endpoint_url: impl Into<String>,
        auth_token: impl Into<String>,
        import_entity: impl Into<String>,
        export_entity: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
            import_entity: import_entity.into(),
            export_entity: export_entity.into(),
            client,
        })
    }

    /// Publishes totals from `updates` one at a time, always the latest value.
    /// Values superseded while a publish is in flight are skipped, so Home
    /// Assistant never sees the totals go backwards. Ends once the sender is
    /// dropped and the last value is out.
    pub fn spawn(self, updates: watch::Receiver<NetMeteredEnergy>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(updates).await;
        })
    }

    async fn run(&self, mut updates: watch::Receiver<NetMeteredEnergy>) {
        info!(url = %self.endpoint_url, "starting Home Assistant publisher");
        loop {
            let energy = *updates.borrow_and_update();
            match self.publish(&energy).await {
                Ok(()) => debug!(
                    imported_wh = energy.imported_wh,
                    exported_wh = energy.exported_wh,
                    "published net metered energy"
                ),
                Err(e) => warn!("failed to publish net metered energy to Home Assistant: {e}"),
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
    }

    /// Publishes both totals. Stops at the first failed request.
    pub async fn publish(&self, energy: &NetMeteredEnergy) -> Result<(), anyhow::Error> {
        self.write_state(&self.import_entity, energy.imported_wh, "Net Energy Import")
            .await?;
        self.write_state(&self.export_entity, energy.exported_wh, "Net Energy Export")
            .await?;
        Ok(())
    }

    async fn write_state(
        &self,
        entity_id: &str,
        value_wh: f64,
        friendly_name: &str,
    ) -> Result<HASensor, anyhow::Error> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        let body = HAStateUpdate {
            state: format!("{:.3}", value_wh),
            attributes: HAEnergyAttributes {
                unit_of_measurement: "Wh".to_string(),
                device_class: "energy".to_string(),
                state_class: "total_increasing".to_string(),
                friendly_name: friendly_name.to_string(),
            },
        };
        let result = self
            .client
            .post(format!("{}/api/states/{}", self.endpoint_url, entity_id))
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HAStateUpdate {
    pub state: String,
    pub attributes: HAEnergyAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HAEnergyAttributes {
    pub unit_of_measurement: String,
    pub device_class: String,
    pub state_class: String,
    pub friendly_name: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub last_changed: String,
    #[serde(default)]
    pub last_updated: String,
}
