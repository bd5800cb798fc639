use crate::model::{EnergySample, HourKey};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Running sums for one client within one hour.
#[derive(Debug, Clone, PartialEq)]
pub struct HourBucket {
    pub client_id: String,
    pub hour: HourKey,
    pub production_sum: f64,
    pub consumption_sum: f64,
    pub count: u32,
}

impl HourBucket {
    fn open(client_id: &str, hour: HourKey) -> Self {
        Self {
            client_id: client_id.to_string(),
            hour,
            production_sum: 0.0,
            consumption_sum: 0.0,
            count: 0,
        }
    }

    fn add(&mut self, sample: &EnergySample) {
        self.production_sum += sample.production;
        self.consumption_sum += sample.consumption;
        self.count += 1;
    }

    /// `None` for a bucket that never saw a sample.
    pub fn seal(self) -> Option<SealedBucket> {
        if self.count == 0 {
            return None;
        }
        let n = f64::from(self.count);
        Some(SealedBucket {
            client_id: self.client_id,
            hour: self.hour,
            production: self.production_sum / n,
            consumption: self.consumption_sum / n,
            samples: self.count,
        })
    }
}

/// Hourly averages for one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SealedBucket {
    pub client_id: String,
    #[serde(serialize_with = "hour_as_text")]
    pub hour: HourKey,
    pub production: f64,
    pub consumption: f64,
    pub samples: u32,
}

fn hour_as_text<S>(hour: &HourKey, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.collect_str(hour)
}

/// Reduces each client's samples to one averaged record per hour.
///
/// A client has at most one open bucket. A sample whose hour differs from the
/// open bucket seals it, whether that hour is later or earlier, so samples
/// sent out of order can produce the same hour twice. Nothing is sealed on a
/// timer: the last open hour is only emitted by a following sample or by
/// [`HourlyAggregator::drain`].
#[derive(Debug, Default)]
pub struct HourlyAggregator {
    open: HashMap<String, HourBucket>,
}

impl HourlyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, sample: &EnergySample) -> Option<SealedBucket> {
        let mut sealed = None;

        if let Some(current) = self.open.get(&sample.client_id) {
            if current.hour != sample.hour {
                sealed = self
                    .open
                    .remove(&sample.client_id)
                    .and_then(HourBucket::seal);
                if let Some(s) = &sealed {
                    debug!(
                        client_id = %s.client_id,
                        hour = %s.hour,
                        samples = s.samples,
                        "hour bucket sealed"
                    );
                }
            }
        }

        self.open
            .entry(sample.client_id.clone())
            .or_insert_with(|| HourBucket::open(&sample.client_id, sample.hour))
            .add(sample);

        sealed
    }

    pub fn open_bucket(&self, client_id: &str) -> Option<&HourBucket> {
        self.open.get(client_id)
    }

    /// Seal every open bucket, leaving the aggregator empty.
    pub fn drain(&mut self) -> Vec<SealedBucket> {
        let mut sealed: Vec<SealedBucket> = self
            .open
            .drain()
            .filter_map(|(_, bucket)| bucket.seal())
            .collect();
        sealed.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        sealed
    }
}
