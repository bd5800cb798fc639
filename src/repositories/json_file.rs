use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::error;

/// A JSON snapshot on disk. Writers go through a sibling temp file and a
/// rename so a crash mid-write never leaves a truncated document.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file or a JSON `null` yields the default.
    /// Bytes that are not JSON at all are moved aside to
    /// `<name>.corrupt-<unix secs>` and also yield the default. Valid JSON
    /// with the wrong layout is a `Store` error and stays where it is.
    pub fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };

        let value: Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(parse_err) => {
                let backup = self.quarantine()?;
                error!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %parse_err,
                    "store document is corrupt; starting from an empty store"
                );
                return Ok(T::default());
            }
        };
        if value.is_null() {
            return Ok(T::default());
        }

        serde_json::from_value(value).map_err(|e| {
            AppError::Store(format!(
                "{} does not have the expected layout: {e}",
                self.path.display()
            ))
        })
    }

    pub fn store<T>(&self, doc: &T) -> Result<()>
    where
        T: Serialize,
    {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let body = serde_json::to_vec_pretty(doc)?;
        let tmp = self.sibling("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let backup = self.sibling(&format!("corrupt-{}", chrono::Utc::now().timestamp()));
        fs::rename(&self.path, &backup).map_err(|e| {
            AppError::Store(format!(
                "cannot move corrupt {} aside: {e}",
                self.path.display()
            ))
        })?;
        Ok(backup)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

/// RFC 3339 text inside a stored entry, if it is there and parses.
pub(crate) fn timestamp_value(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
