//! MQTT transport: subscribe to the channel topic and hand every publish to
//! the ingress router.
//!
//! The subscription is re-issued on every ConnAck, so a broker restart or a
//! network drop recovers without operator action. Between reconnects the
//! loop waits with exponential backoff, capped at `MAX_BACKOFF`.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;

use meshpage_core::config::MqttConfig;
use meshpage_services::{IngressRouter, IngressVerdict};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(120);
const REQUEST_CAPACITY: usize = 64;

pub struct MqttIngress {
    options: MqttOptions,
    topic: String,
    router: IngressRouter,
    shutdown: broadcast::Receiver<()>,
}

impl MqttIngress {
    pub fn new(
        config: &MqttConfig,
        channel: &str,
        router: IngressRouter,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            options: options(config),
            topic: config.subscribe_topic(channel),
            router,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let mut backoff = INITIAL_BACKOFF;

        tracing::info!(
            broker = %self.options.broker_address().0,
            port = self.options.broker_address().1,
            topic = %self.topic,
            "mqtt ingress starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("mqtt ingress shutting down");
                    let _ = client.try_disconnect();
                    return Ok(());
                }

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            tracing::warn!(code = ?ack.code, "broker refused connection");
                            continue;
                        }
                        backoff = INITIAL_BACKOFF;
                        tracing::info!(topic = %self.topic, "connected to broker, subscribing");
                        if let Err(e) = client.try_subscribe(self.topic.as_str(), QoS::AtMostOnce) {
                            tracing::error!(error = %e, "failed to queue subscription");
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        tracing::info!(topic = %self.topic, "subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let verdict = self.router.ingest(&publish.payload);
                        if verdict == IngressVerdict::Closed {
                            tracing::error!("packet workers gone, mqtt ingress exiting");
                            return Ok(());
                        }
                        tracing::trace!(topic = %publish.topic, ?verdict, "publish handled");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, retry_in = ?backoff, "mqtt connection error");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = self.shutdown.recv() => {
                                tracing::info!("mqtt ingress shutting down");
                                return Ok(());
                            }
                        }
                        backoff = next_backoff(backoff);
                    }
                }
            }
        }
    }
}

fn options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));
    options.set_clean_session(true);
    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }
    options
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}
