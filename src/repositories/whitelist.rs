use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::json_file::{timestamp_value, JsonFile};
use crate::error::{AppError, Result};

pub const WHITELIST_FILE: &str = "whitelist.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistEntry {
    /// `None` when the stored entry has no readable `added` field.
    pub added: Option<DateTime<Utc>>,
}

impl WhitelistEntry {
    fn from_value(value: &Value) -> Self {
        Self {
            added: timestamp_value(value.get("added")),
        }
    }
}

/// Entries stay raw JSON so hand-edited ones survive rewrites untouched.
/// Any present, non-null entry admits its identifier.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WhitelistDocument {
    #[serde(default)]
    users: BTreeMap<String, Value>,
}

impl WhitelistDocument {
    fn admits(&self, client_id: &str) -> bool {
        self.users.get(client_id).is_some_and(|e| !e.is_null())
    }
}

/// Durable set of admitted client identifiers.
///
/// Every call re-reads `whitelist.json` under the store lock, so entries an
/// operator deletes from the file stop being admitted right away.
pub struct WhitelistRepository {
    file: Mutex<JsonFile>,
}

impl WhitelistRepository {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let file = JsonFile::new(dir.join(WHITELIST_FILE));
        // Surface corruption at startup rather than on the first message.
        let doc: WhitelistDocument = file.load()?;
        info!(
            path = %file.path().display(),
            users = doc.users.len(),
            "whitelist store opened"
        );
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn is_admitted(&self, client_id: &str) -> Result<bool> {
        let file = self.lock()?;
        let doc: WhitelistDocument = file.load()?;
        Ok(doc.admits(client_id))
    }

    /// Returns `true` when `client_id` was not admitted before this call.
    pub fn admit(&self, client_id: &str) -> Result<bool> {
        let file = self.lock()?;
        let mut doc: WhitelistDocument = file.load()?;
        if doc.admits(client_id) {
            debug!(client_id, "already whitelisted");
            return Ok(false);
        }
        let added = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        doc.users
            .insert(client_id.to_string(), json!({ "added": added }));
        file.store(&doc)?;
        info!(client_id, "client added to whitelist");
        Ok(true)
    }

    pub fn admitted_at(&self, client_id: &str) -> Result<Option<DateTime<Utc>>> {
        let file = self.lock()?;
        let doc: WhitelistDocument = file.load()?;
        Ok(doc
            .users
            .get(client_id)
            .and_then(|e| WhitelistEntry::from_value(e).added))
    }

    pub fn entries(&self) -> Result<BTreeMap<String, WhitelistEntry>> {
        let file = self.lock()?;
        let doc: WhitelistDocument = file.load()?;
        Ok(doc
            .users
            .iter()
            .filter(|(_, e)| !e.is_null())
            .map(|(id, e)| (id.clone(), WhitelistEntry::from_value(e)))
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, JsonFile>> {
        self.file
            .lock()
            .map_err(|_| AppError::Store("whitelist lock poisoned".to_string()))
    }
}
