//! JSON file history store
//!
//! Layout: `<base>/<platform_kind>/<group|private>/<conversation_id>.json`,
//! each file a pretty-printed JSON array of entries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::{ConversationKey, HistoryEntry, HistoryStore, trim_to};

pub struct JsonFileHistoryStore {
    base_dir: PathBuf,
    max_entries: usize,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFileHistoryStore {
    pub fn new(base_dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_entries: max_entries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, key: &ConversationKey) -> PathBuf {
        self.base_dir
            .join(sanitize_component(&key.platform_kind))
            .join(key.scope.as_str())
            .join(format!("{}.json", sanitize_component(&key.conversation_id)))
    }

    async fn load(&self, path: &Path) -> Vec<HistoryEntry> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to read history file");
                return Vec::new();
            }
        };
        if content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(serde_json::Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match serde_json::from_value::<HistoryEntry>(item) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "Skipping malformed history entry");
                        None
                    }
                })
                .collect(),
            Ok(_) => {
                tracing::warn!(path = %path.display(), "History file is not a JSON array");
                Vec::new()
            }
            Err(err) => {
                let preview: String = content.chars().take(100).collect();
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    preview = %preview,
                    "Failed to decode history file"
                );
                Vec::new()
            }
        }
    }
}

/// Keep ids usable as a single path component.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn append(&self, key: &ConversationKey, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }

        let mut entries = self.load(&path).await;
        entries.push(entry);
        trim_to(&mut entries, self.max_entries);

        let content = serde_json::to_string_pretty(&entries)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("writing history file {}", path.display()))?;
        Ok(())
    }

    async fn read_all(&self, key: &ConversationKey) -> Result<Vec<HistoryEntry>> {
        Ok(self.load(&self.path_for(key)).await)
    }

    async fn clear(&self, key: &ConversationKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(conversation = %key, "History cleared");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing history file {}", path.display())),
        }
    }
}
