use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::json_file::{timestamp_value, JsonFile};
use crate::error::{AppError, Result};
use crate::model::text_or_number;

pub const CONNECTED_FILE: &str = "connected.json";

/// Every field reads leniently: entries written by other tools (numeric
/// timestamps, missing fields) load instead of failing the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedClient {
    #[serde(default, deserialize_with = "text_or_number")]
    pub id: String,
    /// As reported by the client in its metadata announcement.
    #[serde(default, deserialize_with = "text_or_number")]
    pub timestamp: String,
    /// Relay clock at the last announcement.
    #[serde(
        default,
        deserialize_with = "optional_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub seen_at: Option<DateTime<Utc>>,
}

fn optional_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(timestamp_value(value.as_ref()))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectedDocument {
    #[serde(default)]
    clients: BTreeMap<String, ConnectedClient>,
}

/// Connected clients keyed by display name.
///
/// Entries are written under the client's announced name and removed by the
/// name carried in the disconnect payload, not by identifier.
pub struct ConnectedRepository {
    file: Mutex<JsonFile>,
}

impl ConnectedRepository {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let file = JsonFile::new(dir.join(CONNECTED_FILE));
        let doc: ConnectedDocument = file.load()?;
        info!(
            path = %file.path().display(),
            clients = doc.clients.len(),
            "connected-client registry opened"
        );
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn upsert(&self, client_id: &str, display_name: &str, timestamp: &str) -> Result<()> {
        let file = self.lock()?;
        let mut doc: ConnectedDocument = file.load()?;
        doc.clients.insert(
            display_name.to_string(),
            ConnectedClient {
                id: client_id.to_string(),
                timestamp: timestamp.to_string(),
                seen_at: Some(Utc::now()),
            },
        );
        file.store(&doc)?;
        info!(client_id, name = display_name, "connected client updated");
        Ok(())
    }

    /// Returns `false`, leaving the file untouched, when no entry has that name.
    pub fn remove_by_name(&self, display_name: &str) -> Result<bool> {
        let file = self.lock()?;
        let mut doc: ConnectedDocument = file.load()?;
        if doc.clients.remove(display_name).is_none() {
            debug!(name = display_name, "disconnect for unknown client name");
            return Ok(false);
        }
        file.store(&doc)?;
        info!(name = display_name, "client disconnected and removed");
        Ok(true)
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, ConnectedClient>> {
        let file = self.lock()?;
        let doc: ConnectedDocument = file.load()?;
        Ok(doc.clients)
    }

    /// Drop entries last announced more than `max_age` before `now`.
    /// Entries without `seen_at` are never evicted.
    pub fn evict_stale(&self, now: DateTime<Utc>, max_age: Duration) -> Result<Vec<String>> {
        let file = self.lock()?;
        let mut doc: ConnectedDocument = file.load()?;
        let stale: Vec<String> = doc
            .clients
            .iter()
            .filter(|(_, c)| matches!(c.seen_at, Some(seen) if now - seen > max_age))
            .map(|(name, _)| name.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }
        for name in &stale {
            doc.clients.remove(name);
        }
        file.store(&doc)?;
        Ok(stale)
    }

    fn lock(&self) -> Result<MutexGuard<'_, JsonFile>> {
        self.file
            .lock()
            .map_err(|_| AppError::Store("connected-client lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_upsert_overwrites_by_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ConnectedRepository::open(dir.path()).unwrap();

        reg.upsert("H1", "House 1", "t0").unwrap();
        reg.upsert("H1", "House 1", "t1").unwrap();

        let snap = reg.snapshot().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["House 1"].id, "H1");
        assert_eq!(snap["House 1"].timestamp, "t1");
        assert!(snap["House 1"].seen_at.is_some());
    }

    #[test]
    fn test_remove_unknown_name_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ConnectedRepository::open(dir.path()).unwrap();
        reg.upsert("H1", "House 1", "t0").unwrap();
        let before = reg.snapshot().unwrap();

        assert!(!reg.remove_by_name("H1").unwrap());
        assert!(!reg.remove_by_name("Nobody").unwrap());
        assert_eq!(reg.snapshot().unwrap(), before);

        assert!(reg.remove_by_name("House 1").unwrap());
        assert!(reg.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_numeric_timestamps_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONNECTED_FILE);
        std::fs::write(
            &path,
            r#"{"clients":{"House 1":{"id":"H1","timestamp":1735718400},"House 2":{"id":"H2","seen_at":"soon"}}}"#,
        )
        .unwrap();

        let reg = ConnectedRepository::open(dir.path()).unwrap();
        let snap = reg.snapshot().unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["House 1"].timestamp, "1735718400");
        assert_eq!(snap["House 2"].timestamp, "");
        assert_eq!(snap["House 2"].seen_at, None);
        assert!(path.exists());

        reg.upsert("H3", "House 3", "t").unwrap();
        assert_eq!(reg.snapshot().unwrap().len(), 3);
    }

    #[test]
    fn test_corrupt_registry_starts_empty_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONNECTED_FILE), "{\"clients\": {").unwrap();

        let reg = ConnectedRepository::open(dir.path()).unwrap();
        assert!(reg.snapshot().unwrap().is_empty());
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("connected.json.corrupt-")
            })
            .count();
        assert_eq!(backups, 1);

        reg.upsert("H1", "House 1", "t0").unwrap();
        assert_eq!(reg.snapshot().unwrap()["House 1"].id, "H1");
    }

    #[test]
    fn test_evict_stale_keeps_fresh_and_legacy_entries() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        std::fs::write(
            dir.path().join(CONNECTED_FILE),
            serde_json::json!({
                "clients": {
                    "old": {"id": "H1", "timestamp": "x", "seen_at": (now - Duration::minutes(30)).to_rfc3339()},
                    "fresh": {"id": "H2", "timestamp": "y", "seen_at": (now - Duration::seconds(5)).to_rfc3339()},
                    "legacy": {"id": "H3", "timestamp": "z"}
                }
            })
            .to_string(),
        )
        .unwrap();
        let reg = ConnectedRepository::open(dir.path()).unwrap();

        let evicted = reg.evict_stale(now, Duration::minutes(10)).unwrap();
        assert_eq!(evicted, vec!["old".to_string()]);

        let names: Vec<_> = reg.snapshot().unwrap().into_keys().collect();
        assert_eq!(names, vec!["fresh".to_string(), "legacy".to_string()]);
    }
}
