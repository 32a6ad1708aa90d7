//! JSON-file backed implementation of [`KeyValueStorage`].
//!
//! Each scope maps to one file holding a flat string-to-string object. The
//! file is loaded lazily on first access and written through on every
//! mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::services::{KeyValueStorage, StorageScope};

struct ScopeFile {
    path: PathBuf,
    entries: Mutex<Option<HashMap<String, String>>>,
}

impl ScopeFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Mutex::new(None),
        }
    }

    async fn load(&self) -> HashMap<String, String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(
                        "Ignoring corrupt storage file {}: {error}",
                        self.path.display()
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    async fn save(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, content).await?;
        debug!("Persisted {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

pub struct JsonFileStorage {
    application: ScopeFile,
    workspace: ScopeFile,
}

impl JsonFileStorage {
    pub fn new(application_path: impl AsRef<Path>, workspace_path: impl AsRef<Path>) -> Self {
        Self {
            application: ScopeFile::new(application_path.as_ref().to_path_buf()),
            workspace: ScopeFile::new(workspace_path.as_ref().to_path_buf()),
        }
    }

    fn scope_file(&self, scope: StorageScope) -> &ScopeFile {
        match scope {
            StorageScope::Application => &self.application,
            StorageScope::Workspace => &self.workspace,
        }
    }
}

#[async_trait]
impl KeyValueStorage for JsonFileStorage {
    async fn get(&self, scope: StorageScope, key: &str) -> Result<Option<String>> {
        let file = self.scope_file(scope);
        let mut guard = file.entries.lock().await;
        if guard.is_none() {
            *guard = Some(file.load().await);
        }
        Ok(guard
            .as_ref()
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn store(&self, scope: StorageScope, key: &str, value: String) -> Result<()> {
        let file = self.scope_file(scope);
        let mut guard = file.entries.lock().await;
        if guard.is_none() {
            *guard = Some(file.load().await);
        }
        let entries = guard.get_or_insert_with(HashMap::new);
        entries.insert(key.to_string(), value);
        file.save(entries).await
    }

    async fn remove(&self, scope: StorageScope, key: &str) -> Result<()> {
        let file = self.scope_file(scope);
        let mut guard = file.entries.lock().await;
        if guard.is_none() {
            *guard = Some(file.load().await);
        }
        let entries = guard.get_or_insert_with(HashMap::new);
        if entries.remove(key).is_some() {
            file.save(entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> JsonFileStorage {
        JsonFileStorage::new(
            dir.path().join("application.json"),
            dir.path().join("workspace.json"),
        )
    }

    #[tokio::test]
    async fn values_round_trip_through_the_file() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        storage
            .store(StorageScope::Application, "key", "value".to_string())
            .await
            .unwrap();

        // A fresh instance re-reads from disk.
        let reopened = JsonFileStorage::new(
            dir.path().join("application.json"),
            dir.path().join("workspace.json"),
        );
        let value = reopened
            .get(StorageScope::Application, "key")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("value"));
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        storage
            .store(StorageScope::Workspace, "key", "workspace".to_string())
            .await
            .unwrap();

        assert!(storage
            .get(StorageScope::Application, "key")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("application.json"), "not json")
            .await
            .unwrap();

        let storage = storage(&dir);
        assert!(storage
            .get(StorageScope::Application, "anything")
            .await
            .unwrap()
            .is_none());

        // Storing over the corrupt file recovers it.
        storage
            .store(StorageScope::Application, "key", "value".to_string())
            .await
            .unwrap();
        assert_eq!(
            storage
                .get(StorageScope::Application, "key")
                .await
                .unwrap()
                .as_deref(),
            Some("value")
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);

        storage.remove(StorageScope::Application, "absent").await.unwrap();
        storage
            .store(StorageScope::Application, "key", "value".to_string())
            .await
            .unwrap();
        storage.remove(StorageScope::Application, "key").await.unwrap();
        assert!(storage
            .get(StorageScope::Application, "key")
            .await
            .unwrap()
            .is_none());
    }
}
