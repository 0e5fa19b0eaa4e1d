use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::events::now_utc_iso;

const DEFAULT_MAX_ENTRIES: usize = 256;

/// Builds the read-through key for an uploaded asset: content identity,
/// role, and session. Two sessions never share an entry.
pub fn upload_cache_key(content_digest: &str, role: &str, session_id: &str) -> String {
    format!("{content_digest}:{role}:{session_id}")
}

/// Read-through store of already-uploaded reference assets, backed by a
/// JSON file. Strictly an optimization: a miss re-uploads, a hit skips
/// the upload, and entries are read-only once written.
#[derive(Debug, Clone)]
pub struct UploadCache {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
    max_entries: usize,
}

impl UploadCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Uploaded URL for the key, when present.
    pub fn get_url(&mut self, key: &str) -> Option<String> {
        let payload = self.ensure_loaded();
        payload
            .get(key)
            .and_then(Value::as_object)
            .and_then(|entry| entry.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn record_upload(&mut self, key: &str, url: &str, role: &str) -> anyhow::Result<()> {
        let payload = self.ensure_loaded();
        if payload.contains_key(key) {
            return Ok(());
        }
        payload.insert(
            key.to_string(),
            json!({
                "url": url,
                "role": role,
                "uploaded_at": now_utc_iso(),
            }),
        );
        self.dirty_keys.push(key.to_string());
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        // Bounded: evicting an entry only costs a re-upload later.
        while on_disk.len() > self.max_entries {
            let victim = on_disk
                .keys()
                .find(|key| !self.dirty_keys.contains(key))
                .or_else(|| on_disk.keys().next())
                .cloned();
            let Some(victim) = victim else {
                break;
            };
            on_disk.remove(&victim);
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        if self.payload.is_none() {
            self.payload = Some(read_json_object(&self.path).unwrap_or_default());
        }
        self.payload.as_mut().expect("cache payload initialized")
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
