//! MQTT state publishing and Home Assistant discovery

use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, EventLoop, MqttOptions, QoS};
use serde_json::{json, Value};

use crate::meter::DeviceIdentity;
use crate::um25c::Sample;

const DEFAULT_PREFIX: &str = "/myhome";
const DISCOVERY_PREFIX: &str = "homeassistant";

#[derive(Debug, thiserror::Error)]
pub(crate) enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    /// one topic per field, value as a bare number
    Plain,
    /// main fields in one JSON object under `all`, every field under `sample`
    Json,
}

impl OutputFormat {
    /// selected formats, both when none was asked for
    pub(crate) fn select(json: bool, plain: bool) -> Vec<OutputFormat> {
        let mut formats = Vec::new();
        if json {
            formats.push(OutputFormat::Json);
        }
        if plain {
            formats.push(OutputFormat::Plain);
        }
        if formats.is_empty() {
            formats = vec![OutputFormat::Json, OutputFormat::Plain];
        }
        formats
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MqttSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) client_id: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
}

/// a published field and how Home Assistant should show it
struct Field {
    id: &'static str,
    name: &'static str,
    unit: &'static str,
    device_class: &'static str,
    value: fn(&Sample) -> Value,
}

fn power(sample: &Sample) -> Value {
    json!(sample.power_w)
}

fn energy(sample: &Sample) -> Value {
    json!(sample.energy_mwh())
}

fn voltage(sample: &Sample) -> Value {
    json!(sample.voltage_v)
}

fn current(sample: &Sample) -> Value {
    json!(sample.current_a)
}

const FIELDS: &[Field] = &[
    Field {
        id: "power",
        name: "Power",
        unit: "W",
        device_class: "power",
        value: power,
    },
    Field {
        id: "energy",
        name: "Energy (group1)",
        unit: "mWh",
        device_class: "energy",
        value: energy,
    },
    Field {
        id: "voltage",
        name: "Voltage",
        unit: "V",
        device_class: "voltage",
        value: voltage,
    },
    Field {
        id: "current",
        name: "Current",
        unit: "A",
        device_class: "current",
        value: current,
    },
];

fn default_state_root(identity: &DeviceIdentity) -> String {
    format!(
        "{}/state/{}-{}",
        DEFAULT_PREFIX, identity.device_type, identity.serial
    )
}

fn discovery_topic(identity: &DeviceIdentity, field: &Field) -> String {
    format!(
        "{}/sensor/{}_{}/config",
        DISCOVERY_PREFIX, identity.serial, field.id
    )
}

fn discovery_payload(identity: &DeviceIdentity, field: &Field) -> Value {
    json!({
        "state_topic": format!("{}/{}", default_state_root(identity), field.id),
        "device": {
            "identifiers": [identity.serial],
            "manufacturer": "Unknown",
            "name": format!("{} {}", identity.device_type, identity.serial),
            "model": identity.device_type,
        },
        "unique_id": format!("{}_{}", identity.serial, field.id),
        "object_id": format!("{}_{}", identity.device_type, field.id),
        "name": field.name,
        "unit_of_measurement": field.unit,
        "device_class": field.device_class,
        "state_class": "measurement",
        "force_update": true,
    })
}

fn json_state(sample: &Sample) -> Value {
    let state = FIELDS
        .iter()
        .map(|field| (field.id.to_string(), (field.value)(sample)))
        .collect();
    Value::Object(state)
}

fn plain_value(field: &Field, sample: &Sample) -> String {
    (field.value)(sample).to_string()
}

pub(crate) struct Publisher {
    client: AsyncClient,
    identity: DeviceIdentity,
    state_root: String,
    formats: Vec<OutputFormat>,
}

impl Publisher {
    /// Creates the client and spawns the task driving its event loop.
    pub(crate) fn connect(
        settings: &MqttSettings,
        identity: DeviceIdentity,
        topic_prefix: Option<String>,
        formats: Vec<OutputFormat>,
    ) -> Self {
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &settings.username {
            options.set_credentials(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(options, 32);
        tokio::spawn(drive(eventloop));
        log::info!("MQTT client for {}:{}", settings.host, settings.port);

        Self::with_client(client, identity, topic_prefix, formats)
    }

    pub(crate) fn with_client(
        client: AsyncClient,
        identity: DeviceIdentity,
        topic_prefix: Option<String>,
        formats: Vec<OutputFormat>,
    ) -> Self {
        let state_root = topic_prefix.unwrap_or_else(|| default_state_root(&identity));
        Publisher {
            client,
            identity,
            state_root,
            formats,
        }
    }

    /// publishes retained discovery configs for every field
    pub(crate) async fn publish_discovery(&self) -> Result<(), PublishError> {
        for field in FIELDS {
            let topic = discovery_topic(&self.identity, field);
            let payload = serde_json::to_vec(&discovery_payload(&self.identity, field))?;
            self.client
                .publish(topic.as_str(), QoS::AtLeastOnce, true, payload)
                .await?;
            log::debug!("published discovery config to {}", topic);
        }
        log::info!("published Home Assistant config for {}", self.identity.serial);
        return Ok(());
    }

    /// topic and payload of every state message for `sample`
    fn state_messages(&self, sample: &Sample) -> Result<Vec<(String, Vec<u8>)>, PublishError> {
        let mut messages = Vec::new();
        for format in &self.formats {
            match format {
                OutputFormat::Plain => {
                    for field in FIELDS {
                        messages.push((
                            format!("{}/{}", self.state_root, field.id),
                            plain_value(field, sample).into_bytes(),
                        ));
                    }
                }
                OutputFormat::Json => {
                    messages.push((
                        format!("{}/all", self.state_root),
                        serde_json::to_vec(&json_state(sample))?,
                    ));
                    messages.push((
                        format!("{}/sample", self.state_root),
                        serde_json::to_vec(sample)?,
                    ));
                }
            }
        }
        return Ok(messages);
    }

    /// Queues the state messages for `sample` without waiting.
    ///
    /// A full request queue (broker unreachable) is an error, not a stall.
    pub(crate) fn publish_sample(&self, sample: &Sample) -> Result<(), PublishError> {
        for (topic, payload) in self.state_messages(sample)? {
            self.client
                .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        }
        return Ok(());
    }
}

async fn drive(mut eventloop: EventLoop) {
    loop {
        if let Err(err) = eventloop.poll().await {
            log::warn!("MQTT connection error: {}; retrying", err);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
