//! MQTT delivery of rendered owner notifications
//!
//! Each message is published as JSON to `<topic_prefix>/<owner>/notifications`
//! with QoS 1. Downstream mail/SMS gateways subscribe per owner.

use crate::domain::notification::OutboundMessage;
use crate::domain::types::OwnerId;
use crate::infra::config::Config;
use crate::services::notifier::NotificationTransport;
use anyhow::Context;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct MqttTransport {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttTransport {
    /// Connect to the configured broker. Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Self {
        let client_id = format!("petgate-notify-{}", std::process::id());
        let mut mqttoptions =
            MqttOptions::new(client_id, config.notify_mqtt_host(), config.notify_mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) =
            (config.notify_username(), config.notify_password())
        {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_notify_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_notify_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_notify_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        info!(
            host = %config.notify_mqtt_host(),
            port = config.notify_mqtt_port(),
            prefix = %config.notify_topic_prefix(),
            "mqtt_notify_initialized"
        );
        Self { client, topic_prefix: config.notify_topic_prefix().to_string() }
    }

    pub fn topic_for(&self, owner: OwnerId) -> String {
        notification_topic(&self.topic_prefix, owner)
    }
}

fn notification_topic(prefix: &str, owner: OwnerId) -> String {
    format!("{}/{}/notifications", prefix.trim_end_matches('/'), owner)
}

#[async_trait]
impl NotificationTransport for MqttTransport {
    async fn deliver(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message).context("encode notification")?;
        let topic = self.topic_for(message.owner);
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("publish to {topic}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_topic() {
        assert_eq!(notification_topic("petgate", OwnerId(42)), "petgate/42/notifications");
        assert_eq!(notification_topic("home/", OwnerId(7)), "home/7/notifications");
    }
}
