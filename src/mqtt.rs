//! Forwarding of published events to an MQTT broker.

use crate::publish::Event;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, MqttOptions};
use std::time::Duration;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

#[derive(clap::Parser, Clone)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Also publish every event to the MQTT broker at this host.
    #[arg(long)]
    mqtt_host: Option<String>,

    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Topic prefix. Events are published to `<prefix>/<event name>`.
    ///
    /// Defaults to `aircompressor/<index>`.
    #[arg(long)]
    mqtt_topic: Option<String>,
}

impl Args {
    /// Connect to the broker, if one was given. Must be called within a tokio runtime.
    pub fn to_forwarder(&self, index: u8) -> Option<MqttForwarder> {
        let host = self.mqtt_host.as_deref()?;
        let topic = self.mqtt_topic.clone().unwrap_or_else(|| default_topic(index));
        Some(MqttForwarder::connect(host, self.mqtt_port, topic))
    }
}

pub fn default_topic(index: u8) -> String {
    format!("aircompressor/{index}")
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not serialize the event to JSON")]
    Serialize(#[source] serde_json::Error),
    #[error("could not queue a publish to the MQTT broker")]
    Publish(#[source] rumqttc::v5::ClientError),
    #[error("could not disconnect from the MQTT broker")]
    Disconnect(#[source] rumqttc::v5::ClientError),
}

pub struct MqttForwarder {
    client: AsyncClient,
    topic: String,
    #[allow(unused)] // exists for its drop handler
    event_loop: AbortOnDropHandle<()>,
}

impl MqttForwarder {
    pub fn connect(host: &str, port: u16, topic: String) -> Self {
        let client_id = format!("aircompressor-tools-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(10));
        let (client, mut event_loop) = AsyncClient::new(options, 100);
        let event_loop = AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => trace!(message = "mqtt", ?event),
                    Err(e) => {
                        warn!(
                            message = "mqtt connection failed, retrying",
                            error = (&e as &dyn std::error::Error)
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));
        Self { client, topic, event_loop }
    }

    pub fn topic_for(&self, event: &Event) -> String {
        format!("{}/{}", self.topic, event.name())
    }

    /// Queue the event for publishing. Does not wait for the broker.
    pub fn forward(&self, event: &Event) -> Result<(), Error> {
        let payload = event.payload().map_err(Error::Serialize)?;
        let payload = serde_json::to_vec(&payload).map_err(Error::Serialize)?;
        let topic = self.topic_for(event);
        debug!(message = "forwarding", %topic);
        self.client.try_publish(topic, QoS::AtMostOnce, false, payload).map_err(Error::Publish)
    }

    pub async fn disconnect(self) -> Result<(), Error> {
        self.client.disconnect().await.map_err(Error::Disconnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::EventKind;

    #[tokio::test]
    async fn topics_are_named_after_events() {
        let forwarder = MqttForwarder::connect("localhost", 1883, default_topic(2));
        let event = Event { at: jiff::Timestamp::UNIX_EPOCH, kind: EventKind::Fault("x".into()) };
        assert_eq!(forwarder.topic_for(&event), "aircompressor/2/fault");
        forwarder.forward(&event).unwrap();
    }
}
