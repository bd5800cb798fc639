use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, Verdict};
use crate::aggregate::{HourlyAggregator, SealedBucket};
use crate::config::{Config, ForwardMode, RepublishConfig};
use crate::error::{AppError, Result};
use crate::model::{payload_text, ClientMetadata, EnergySample, HourKey, Series, UpstreamRecord};
use crate::mqtt::BrokerPublisher;
use crate::repositories::ConnectedRepository;
use crate::topics::{self, ClientAction, RelayTopic};
use crate::upstream::{spawn_delivery, DeliveryOutcome, UpstreamSink};

pub const AUTHENTICATED: &str = "authenticated";

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    pub forward: ForwardMode,
    pub default_email: String,
    pub republish: RepublishConfig,
}

impl From<&Config> for RelayOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            forward: cfg.upstream.forward,
            default_email: cfg.upstream.default_email.clone(),
            republish: cfg.relay.republish.clone(),
        }
    }
}

/// Per-client state that is not persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientSession {
    pub email: Option<String>,
}

/// What a single message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Authenticated { client_id: String, newly_admitted: bool },
    Kicked { client_id: String },
    KickSuppressed { client_id: String },
    Readmitted { client_id: String },
    Ingested { client_id: String, sealed: Option<SealedBucket> },
    MetadataUpdated { client_id: String, name: String },
    Disconnected { name: String, removed: bool },
    EmailUpdated { client_id: String },
    Ignored,
}

/// Broker-facing dispatcher. Owns the aggregator and per-client sessions and
/// handles one message at a time; network work (kicks, upstream delivery) is
/// spawned after local state has been updated.
pub struct Relay {
    admission: AdmissionController,
    registry: Arc<ConnectedRepository>,
    aggregator: HourlyAggregator,
    sessions: HashMap<String, ClientSession>,
    sink: Arc<dyn UpstreamSink>,
    publisher: Arc<dyn BrokerPublisher>,
    options: RelayOptions,
}

impl Relay {
    pub fn new(
        admission: AdmissionController,
        registry: Arc<ConnectedRepository>,
        sink: Arc<dyn UpstreamSink>,
        publisher: Arc<dyn BrokerPublisher>,
        options: RelayOptions,
    ) -> Self {
        Self {
            admission,
            registry,
            aggregator: HourlyAggregator::new(),
            sessions: HashMap::new(),
            sink,
            publisher,
            options,
        }
    }

    /// Handle one broker message. Must be called from inside a Tokio runtime:
    /// kicks and upstream deliveries are started with `tokio::spawn`.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<Outcome> {
        debug!(topic, bytes = payload.len(), "message received");

        match topics::parse(topic) {
            RelayTopic::InitialRequest => self.on_initial_request(payload),
            RelayTopic::Client { client_id, action } => {
                match self.admission.check(client_id)? {
                    Verdict::Allowed => {}
                    Verdict::Kicked => {
                        return Ok(Outcome::Kicked {
                            client_id: client_id.to_string(),
                        })
                    }
                    Verdict::Suppressed => {
                        debug!(client_id, "kick suppressed by cooldown");
                        return Ok(Outcome::KickSuppressed {
                            client_id: client_id.to_string(),
                        });
                    }
                }
                self.dispatch(client_id, action, payload)
            }
            RelayTopic::Other => {
                debug!(topic, "ignoring message on unhandled topic");
                Ok(Outcome::Ignored)
            }
        }
    }

    fn dispatch(
        &mut self,
        client_id: &str,
        action: ClientAction,
        payload: &[u8],
    ) -> Result<Outcome> {
        match action {
            ClientAction::AddWhitelist => {
                self.admission.admit(client_id)?;
                Ok(Outcome::Readmitted {
                    client_id: client_id.to_string(),
                })
            }
            ClientAction::EnergyData => self.on_energy_data(client_id, payload),
            ClientAction::Metadata => {
                let meta = ClientMetadata::from_payload(payload)?;
                self.registry.upsert(client_id, &meta.name, &meta.timestamp)?;
                Ok(Outcome::MetadataUpdated {
                    client_id: client_id.to_string(),
                    name: meta.name,
                })
            }
            ClientAction::Disconnect => {
                let name = payload_text(payload)?;
                let removed = self.registry.remove_by_name(name)?;
                Ok(Outcome::Disconnected {
                    name: name.to_string(),
                    removed,
                })
            }
            ClientAction::Email => {
                let email = payload_text(payload)?;
                if email.is_empty() {
                    return Err(AppError::MalformedPayload("empty email".to_string()));
                }
                self.sessions.entry(client_id.to_string()).or_default().email =
                    Some(email.to_string());
                info!(client_id, email, "client email updated");
                Ok(Outcome::EmailUpdated {
                    client_id: client_id.to_string(),
                })
            }
            ClientAction::Unknown(action) => {
                debug!(client_id, action = %action, "ignoring unknown client action");
                Ok(Outcome::Ignored)
            }
        }
    }

    fn on_initial_request(&mut self, payload: &[u8]) -> Result<Outcome> {
        let client_id = payload_text(payload)?;
        let newly_admitted = self.admission.admit(client_id)?;

        let challenge = topics::challenge_topic(client_id);
        match self.publisher.publish(&challenge, AUTHENTICATED.as_bytes().to_vec()) {
            Ok(()) => info!(client_id, "client authenticated"),
            Err(e) => warn!(client_id, error = %e, "could not acknowledge authentication"),
        }

        Ok(Outcome::Authenticated {
            client_id: client_id.to_string(),
            newly_admitted,
        })
    }

    fn on_energy_data(&mut self, client_id: &str, payload: &[u8]) -> Result<Outcome> {
        let sample = EnergySample::from_payload(client_id, payload)?;
        let sealed = self.aggregator.ingest(&sample);

        if self.options.forward.raw() {
            self.forward(client_id, &sample.hour, sample.production, sample.consumption);
        }
        if let Some(topic) = &self.options.republish.raw_topic {
            self.republish(&topics::render(topic, client_id), payload.to_vec());
        }

        if let Some(bucket) = &sealed {
            self.emit_sealed(bucket);
        }

        debug!(client_id, hour = %sample.hour, "energy sample ingested");
        Ok(Outcome::Ingested {
            client_id: client_id.to_string(),
            sealed,
        })
    }

    fn emit_sealed(&self, bucket: &SealedBucket) -> Vec<JoinHandle<DeliveryOutcome>> {
        info!(
            client_id = %bucket.client_id,
            hour = %bucket.hour,
            production = bucket.production,
            consumption = bucket.consumption,
            samples = bucket.samples,
            "hourly average ready"
        );

        if let Some(topic) = &self.options.republish.hourly_topic {
            match serde_json::to_vec(bucket) {
                Ok(body) => self.republish(&topics::render(topic, &bucket.client_id), body),
                Err(e) => warn!(error = %e, "could not encode hourly summary"),
            }
        }

        if !self.options.forward.hourly() {
            return Vec::new();
        }
        self.forward(
            &bucket.client_id,
            &bucket.hour,
            bucket.production,
            bucket.consumption,
        )
    }

    fn forward(
        &self,
        client_id: &str,
        hour: &HourKey,
        production: f64,
        consumption: f64,
    ) -> Vec<JoinHandle<DeliveryOutcome>> {
        let email = self.email_for(client_id);
        vec![
            spawn_delivery(
                self.sink.clone(),
                Series::Production,
                UpstreamRecord::new(email, hour, production),
            ),
            spawn_delivery(
                self.sink.clone(),
                Series::Consumption,
                UpstreamRecord::new(email, hour, consumption),
            ),
        ]
    }

    fn republish(&self, topic: &str, payload: Vec<u8>) {
        if let Err(e) = self.publisher.publish(topic, payload) {
            warn!(topic, error = %e, "republish failed");
        }
    }

    /// Seal every open bucket and hand the averages upstream. The returned
    /// handles complete when each delivery has been attempted. Needs a Tokio
    /// runtime, like `handle_message`.
    pub fn flush(&mut self) -> Vec<JoinHandle<DeliveryOutcome>> {
        let sealed = self.aggregator.drain();
        info!(buckets = sealed.len(), "flushing open hour buckets");
        sealed.iter().flat_map(|b| self.emit_sealed(b)).collect()
    }

    /// The session email, or the configured default.
    pub fn email_for(&self, client_id: &str) -> &str {
        self.sessions
            .get(client_id)
            .and_then(|s| s.email.as_deref())
            .unwrap_or(&self.options.default_email)
    }

    pub fn session(&self, client_id: &str) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    pub fn aggregator(&self) -> &HourlyAggregator {
        &self.aggregator
    }
}
