use crate::config::MqttConfig;
use crate::error::{AppError, Result};
use crate::topics;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type QoS = mqtt5::mqttbytes::QoS;
pub type V5Publish = mqtt5::mqttbytes::v5::Publish;

pub fn build_options(cfg: &MqttConfig) -> Result<MqttOptions> {
    let client_id = if cfg.client_id.is_empty() {
        format!("house-relay-{}", Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if let Some(tls) = &cfg.tls {
        let ca = std::fs::read(&tls.ca_file)?;
        opts.set_transport(Transport::tls(ca, None, None));
    } else if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    Ok(opts)
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

/// What the dispatch loop cares about from the event loop.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected,
    Message(V5Publish),
}

pub async fn next_event(eventloop: &mut EventLoop) -> Result<BrokerEvent> {
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => {
                return Ok(BrokerEvent::Message(p))
            }
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_))) => {
                return Ok(BrokerEvent::Connected)
            }
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

/// (Re-)issue the relay's subscriptions. Called on every ConnAck since a
/// clean-start session forgets them across reconnects.
pub fn subscribe_all(client: &AsyncClient) -> Result<()> {
    for filter in topics::SUBSCRIPTIONS {
        client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| AppError::Mqtt(format!("subscribe {filter}: {e}")))?;
        debug!(filter, "subscription requested");
    }
    Ok(())
}

/// Outbound side of the broker, as seen by the relay.
pub trait BrokerPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

impl BrokerPublisher for AsyncClient {
    // try_publish never waits: the dispatch loop is also the one polling the
    // event loop, so an awaited publish on a full queue would never finish.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| AppError::Mqtt(format!("publish {topic}: {e}")))
    }
}
