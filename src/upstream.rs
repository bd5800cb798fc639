use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::UpstreamConfig;
use crate::error::Result;
use crate::model::{Series, UpstreamRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The sink answered with a non-2xx status.
    Rejected(u16),
    /// The request never produced a response.
    Failed(String),
}

#[async_trait]
pub trait UpstreamSink: Send + Sync {
    async fn send(&self, series: Series, record: &UpstreamRecord) -> DeliveryOutcome;
}

/// Posts records to the production and consumption endpoints. One request
/// per record, no retry.
pub struct HttpForwarder {
    client: Client,
    production_url: String,
    consumption_url: String,
}

impl HttpForwarder {
    pub fn new(cfg: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            production_url: cfg.production_url.clone(),
            consumption_url: cfg.consumption_url.clone(),
        })
    }

    fn url(&self, series: Series) -> &str {
        match series {
            Series::Production => &self.production_url,
            Series::Consumption => &self.consumption_url,
        }
    }
}

#[async_trait]
impl UpstreamSink for HttpForwarder {
    async fn send(&self, series: Series, record: &UpstreamRecord) -> DeliveryOutcome {
        match self.client.post(self.url(series)).json(record).send().await {
            Ok(resp) if resp.status().is_success() => DeliveryOutcome::Delivered,
            Ok(resp) => DeliveryOutcome::Rejected(resp.status().as_u16()),
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }
}

/// Send one record in the background and log how it went.
pub fn spawn_delivery(
    sink: Arc<dyn UpstreamSink>,
    series: Series,
    record: UpstreamRecord,
) -> JoinHandle<DeliveryOutcome> {
    tokio::spawn(async move {
        let outcome = sink.send(series, &record).await;
        match &outcome {
            DeliveryOutcome::Delivered => info!(
                series = %series,
                user_email = %record.user_email,
                date = %record.date,
                hour = %record.hour,
                value = record.value,
                "upstream record delivered"
            ),
            DeliveryOutcome::Rejected(status) => warn!(
                series = %series,
                status,
                date = %record.date,
                hour = %record.hour,
                "upstream sink rejected record; dropping"
            ),
            DeliveryOutcome::Failed(reason) => error!(
                series = %series,
                error = %reason,
                date = %record.date,
                hour = %record.hour,
                "upstream delivery failed; dropping"
            ),
        }
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardMode;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn config(base: &str) -> UpstreamConfig {
        UpstreamConfig {
            production_url: format!("{base}/add_production"),
            consumption_url: format!("{base}/add_consumption"),
            timeout_secs: 2,
            default_email: String::new(),
            forward: ForwardMode::Hourly,
        }
    }

    fn record() -> UpstreamRecord {
        UpstreamRecord::new("owner@example.com", &"2025-01-01 08".parse().unwrap(), 6.0)
    }

    #[tokio::test]
    async fn test_posts_json_to_series_endpoint() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/add_production")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "user_email": "owner@example.com",
                "date": "2025-01-01",
                "hour": "08",
                "value": 6.0
            })))
            .with_status(200)
            .create_async()
            .await;

        let fwd = HttpForwarder::new(&config(&server.url())).unwrap();
        let outcome = fwd.send(Series::Production, &record()).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/add_consumption")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let fwd: Arc<dyn UpstreamSink> =
            Arc::new(HttpForwarder::new(&config(&server.url())).unwrap());
        let outcome = spawn_delivery(fwd, Series::Consumption, record())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Rejected(503));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_sink_fails() {
        // Nothing listens on the discard port.
        let fwd = HttpForwarder::new(&config("http://127.0.0.1:9")).unwrap();
        let outcome = fwd.send(Series::Production, &record()).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
    }
}
