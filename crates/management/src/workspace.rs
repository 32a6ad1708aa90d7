//! Extensions that live inside the workspace itself rather than under any
//! target's install directory.
//!
//! Only locations are persisted; manifests are re-read from disk on every
//! load so a stale record can never describe an extension that changed
//! underneath it. Entries whose location left the workspace or disappeared
//! are dropped on load; entries that are merely invalid (e.g. a missing
//! entry point) are kept, flagged, watched, and revalidated when their files
//! change.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ManagementError, Result};
use crate::models::{
    ExtensionIdentifier, ExtensionManifest, ExtensionSource, InstalledExtension,
    ResourceExtension,
};
use crate::services::{FileChange, FileSystem, KeyValueStorage, StorageScope};

pub const WORKSPACE_EXTENSIONS_STORAGE_KEY: &str = "workspaceExtensions.locations";

const REVALIDATION_DEBOUNCE: Duration = Duration::from_secs(1);
const VALIDATED_CHANNEL_CAPACITY: usize = 16;

/// Shape of the open workspace. A single-folder workspace persists entries
/// as paths relative to its root so the record survives the folder moving;
/// a multi-root workspace has no single anchor and stores absolute URLs.
#[derive(Debug, Clone)]
pub enum WorkspaceLayout {
    Folder(Url),
    MultiRoot(Vec<Url>),
}

impl WorkspaceLayout {
    fn contains(&self, location: &Url) -> bool {
        match self {
            WorkspaceLayout::Folder(root) => relative_path(root, location).is_some(),
            WorkspaceLayout::MultiRoot(roots) => {
                roots.iter().any(|root| relative_path(root, location).is_some())
            }
        }
    }
}

pub struct WorkspaceExtensionStore {
    fs: Arc<dyn FileSystem>,
    storage: Arc<dyn KeyValueStorage>,
    layout: WorkspaceLayout,
    extensions: Mutex<Vec<InstalledExtension>>,
    watched: Mutex<Vec<Url>>,
    validated: broadcast::Sender<Vec<InstalledExtension>>,
}

impl WorkspaceExtensionStore {
    /// Load the persisted record, drop what no longer belongs, and start the
    /// revalidation task for whatever is invalid.
    pub async fn create(
        fs: Arc<dyn FileSystem>,
        storage: Arc<dyn KeyValueStorage>,
        layout: WorkspaceLayout,
    ) -> Result<Arc<Self>> {
        let (validated, _) = broadcast::channel(VALIDATED_CHANNEL_CAPACITY);
        let store = Arc::new(Self {
            fs,
            storage,
            layout,
            extensions: Mutex::new(Vec::new()),
            watched: Mutex::new(Vec::new()),
            validated,
        });
        store.initialize().await?;

        let task_store = Arc::clone(&store);
        let mut changes = store.fs.subscribe();
        tokio::spawn(async move {
            loop {
                let first = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let mut batch = vec![first];
                let window = tokio::time::sleep(REVALIDATION_DEBOUNCE);
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        _ = &mut window => break,
                        next = changes.recv() => match next {
                            Ok(change) => batch.push(change),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
                if let Err(error) = task_store.revalidate(&batch).await {
                    warn!("Workspace extension revalidation failed: {error}");
                }
            }
        });

        Ok(store)
    }

    pub async fn get_installed(&self, include_invalid: bool) -> Vec<InstalledExtension> {
        let extensions = self.extensions.lock().await;
        if include_invalid {
            extensions.clone()
        } else {
            extensions.iter().filter(|e| e.is_valid).cloned().collect()
        }
    }

    /// Extensions that were invalid and became valid after their files
    /// changed.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<InstalledExtension>> {
        self.validated.subscribe()
    }

    /// Record an extension living at a workspace location. The manifest is
    /// re-read from disk; the caller's copy is never trusted.
    pub async fn install(&self, extension: &ResourceExtension) -> Result<InstalledExtension> {
        if !self.layout.contains(&extension.location) {
            return Err(ManagementError::InvalidLocation(extension.location.clone()));
        }
        let scanned = self.scan(&extension.location).await?;
        {
            let mut extensions = self.extensions.lock().await;
            extensions.retain(|e| !e.identifier.same(&scanned.identifier));
            extensions.push(scanned.clone());
        }
        self.persist().await?;
        self.rebuild_watchers().await;
        info!("Installed workspace extension {}", scanned.identifier.id);
        Ok(scanned)
    }

    pub async fn uninstall(&self, identifier: &ExtensionIdentifier) -> Result<()> {
        let removed = {
            let mut extensions = self.extensions.lock().await;
            let before = extensions.len();
            extensions.retain(|e| !e.identifier.same(identifier));
            before != extensions.len()
        };
        if removed {
            self.persist().await?;
            self.rebuild_watchers().await;
            info!("Uninstalled workspace extension {}", identifier.id);
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<()> {
        let locations = self.load_locations().await?;
        let mut kept = Vec::new();
        let mut dropped = false;
        for location in locations {
            if !self.layout.contains(&location) {
                info!("Dropping workspace extension at {location}: outside the workspace");
                dropped = true;
                continue;
            }
            match self.scan(&location).await {
                Ok(extension) => kept.push(extension),
                Err(error) => {
                    info!("Dropping workspace extension at {location}: {error}");
                    dropped = true;
                }
            }
        }
        *self.extensions.lock().await = kept;
        if dropped {
            self.persist().await?;
        }
        self.rebuild_watchers().await;
        Ok(())
    }

    /// Read and validate the extension at `location`. A missing entry point
    /// flags the record invalid but does not reject it.
    async fn scan(&self, location: &Url) -> Result<InstalledExtension> {
        let manifest_location = join_location(location, "manifest.json")?;
        let content = self.fs.read_to_string(&manifest_location).await?;
        let manifest: ExtensionManifest =
            serde_json::from_str(&content).map_err(|error| ManagementError::InvalidManifest {
                location: location.clone(),
                reason: error.to_string(),
            })?;

        let mut is_valid = true;
        let mut validations = Vec::new();
        if let Some(main) = &manifest.main {
            let main_location = join_location(location, main)?;
            if !self.fs.exists(&main_location).await {
                is_valid = false;
                validations.push(format!("Entry point '{main}' does not exist"));
            }
        }

        Ok(InstalledExtension {
            identifier: ExtensionIdentifier::new(manifest.id()),
            manifest,
            location: location.clone(),
            target: None,
            is_builtin: false,
            is_application_scoped: false,
            is_machine_scoped: false,
            is_workspace_scoped: true,
            private: false,
            source: ExtensionSource::Resource,
            is_valid,
            validations,
            installed_at: Utc::now(),
        })
    }

    async fn revalidate(&self, changes: &[FileChange]) -> Result<()> {
        let affected: Vec<InstalledExtension> = {
            let extensions = self.extensions.lock().await;
            extensions
                .iter()
                .filter(|e| !e.is_valid && changes.iter().any(|c| c.affects(&e.location)))
                .cloned()
                .collect()
        };
        if affected.is_empty() {
            return Ok(());
        }
        debug!("Revalidating {} workspace extension(s)", affected.len());

        let mut became_valid = Vec::new();
        for extension in affected {
            match self.scan(&extension.location).await {
                Ok(scanned) if scanned.is_valid => became_valid.push(scanned),
                Ok(_) => {}
                Err(error) => {
                    debug!("Extension at {} still unreadable: {error}", extension.location);
                }
            }
        }
        if became_valid.is_empty() {
            return Ok(());
        }

        {
            let mut extensions = self.extensions.lock().await;
            for valid in &became_valid {
                if let Some(entry) = extensions
                    .iter_mut()
                    .find(|e| e.identifier.same(&valid.identifier))
                {
                    *entry = valid.clone();
                }
            }
        }
        // Persist before notifying so listeners never observe state that is
        // not yet on disk.
        self.persist().await?;
        self.rebuild_watchers().await;
        let _ = self.validated.send(became_valid);
        Ok(())
    }

    async fn load_locations(&self) -> Result<Vec<Url>> {
        let raw = self
            .storage
            .get(StorageScope::Workspace, WORKSPACE_EXTENSIONS_STORAGE_KEY)
            .await?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(error) => {
                warn!("Ignoring corrupt workspace extension record: {error}");
                return Ok(Vec::new());
            }
        };
        let Value::Array(entries) = value else {
            warn!("Ignoring workspace extension record: expected an array");
            return Ok(Vec::new());
        };

        let mut locations = Vec::new();
        for entry in entries {
            let Value::String(entry) = entry else {
                warn!("Skipping non-string workspace extension entry");
                continue;
            };
            match (&self.layout, Url::parse(&entry)) {
                (WorkspaceLayout::Folder(root), Err(_)) => {
                    match join_location(root, &entry) {
                        Ok(location) => locations.push(location),
                        Err(_) => warn!("Skipping unresolvable workspace entry '{entry}'"),
                    }
                }
                (WorkspaceLayout::Folder(_), Ok(location)) => locations.push(location),
                (WorkspaceLayout::MultiRoot(_), Ok(location)) => locations.push(location),
                (WorkspaceLayout::MultiRoot(_), Err(_)) => {
                    warn!("Skipping relative entry '{entry}' in a multi-root workspace");
                }
            }
        }
        Ok(locations)
    }

    async fn persist(&self) -> Result<()> {
        let entries: Vec<String> = {
            let extensions = self.extensions.lock().await;
            extensions
                .iter()
                .map(|e| match &self.layout {
                    WorkspaceLayout::Folder(root) => relative_path(root, &e.location)
                        .unwrap_or_else(|| e.location.as_str().to_string()),
                    WorkspaceLayout::MultiRoot(_) => e.location.as_str().to_string(),
                })
                .collect()
        };
        self.storage
            .store(
                StorageScope::Workspace,
                WORKSPACE_EXTENSIONS_STORAGE_KEY,
                serde_json::to_string(&entries)?,
            )
            .await
    }

    /// Watch only what is invalid; valid entries have nothing to wait for.
    async fn rebuild_watchers(&self) {
        let mut watched = self.watched.lock().await;
        for location in watched.drain(..) {
            if let Err(error) = self.fs.unwatch(&location) {
                warn!("Failed to unwatch {location}: {error}");
            }
        }
        let extensions = self.extensions.lock().await;
        for extension in extensions.iter().filter(|e| !e.is_valid) {
            match self.fs.watch(&extension.location) {
                Ok(()) => watched.push(extension.location.clone()),
                Err(error) => warn!("Failed to watch {}: {error}", extension.location),
            }
        }
    }
}

fn join_location(base: &Url, segment: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        segment.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|_| ManagementError::InvalidLocation(base.clone()))
}

fn relative_path(root: &Url, location: &Url) -> Option<String> {
    let prefix = format!("{}/", root.as_str().trim_end_matches('/'));
    location.as_str().strip_prefix(&prefix).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{MemoryStorage, MockFileSystem};

    fn root() -> Url {
        Url::parse("file:///workspace").unwrap()
    }

    fn location(name: &str) -> Url {
        Url::parse(&format!("file:///workspace/{name}")).unwrap()
    }

    fn manifest_json(publisher: &str, name: &str, main: Option<&str>) -> String {
        match main {
            Some(main) => format!(
                r#"{{ "name": "{name}", "publisher": "{publisher}", "version": "1.0.0", "main": "{main}" }}"#
            ),
            None => format!(
                r#"{{ "name": "{name}", "publisher": "{publisher}", "version": "1.0.0" }}"#
            ),
        }
    }

    fn add_extension(fs: &MockFileSystem, name: &str, main: Option<&str>, main_exists: bool) {
        let location = location(name);
        fs.add_file(
            &join_location(&location, "manifest.json").unwrap(),
            &manifest_json("pub", name, main),
        );
        if let (Some(main), true) = (main, main_exists) {
            fs.mark_existing(&join_location(&location, main).unwrap());
        }
    }

    async fn store_over(
        fs: Arc<MockFileSystem>,
        storage: Arc<MemoryStorage>,
    ) -> Arc<WorkspaceExtensionStore> {
        WorkspaceExtensionStore::create(fs, storage, WorkspaceLayout::Folder(root()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn install_rescans_the_manifest_from_disk() {
        let fs = MockFileSystem::new();
        add_extension(&fs, "ext-a", None, false);
        let store = store_over(fs, Arc::new(MemoryStorage::new())).await;

        // The caller's manifest claims a different identity; disk wins.
        let claimed = ResourceExtension {
            identifier: ExtensionIdentifier::new("claimed.identity"),
            location: location("ext-a"),
            manifest: serde_json::from_str(&manifest_json("claimed", "identity", None)).unwrap(),
        };
        let installed = store.install(&claimed).await.unwrap();
        assert_eq!(installed.identifier.id, "pub.ext-a");
        assert!(installed.is_workspace_scoped);
        assert!(installed.is_valid);
    }

    #[tokio::test]
    async fn install_outside_the_workspace_is_rejected() {
        let fs = MockFileSystem::new();
        let store = store_over(fs, Arc::new(MemoryStorage::new())).await;

        let outside = ResourceExtension {
            identifier: ExtensionIdentifier::new("pub.ext"),
            location: Url::parse("file:///elsewhere/ext").unwrap(),
            manifest: serde_json::from_str(&manifest_json("pub", "ext", None)).unwrap(),
        };
        let err = store.install(&outside).await.unwrap_err();
        assert!(matches!(err, ManagementError::InvalidLocation(_)));
    }

    #[tokio::test]
    async fn deleted_extensions_are_dropped_on_load() {
        let fs = MockFileSystem::new();
        add_extension(&fs, "ext-b", None, false);
        let storage = Arc::new(MemoryStorage::new());
        storage.seed(
            StorageScope::Workspace,
            WORKSPACE_EXTENSIONS_STORAGE_KEY,
            r#"["ext-a", "ext-b"]"#,
        );

        let store = store_over(fs, storage.clone()).await;
        let installed = store.get_installed(true).await;
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].identifier.id, "pub.ext-b");
        assert_eq!(store.get_installed(false).await.len(), 1);

        // The self-healed record is persisted immediately.
        let raw = storage
            .get(StorageScope::Workspace, WORKSPACE_EXTENSIONS_STORAGE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, r#"["ext-b"]"#);
    }

    #[tokio::test]
    async fn missing_entry_point_flags_invalid_but_keeps_the_record() {
        let fs = MockFileSystem::new();
        add_extension(&fs, "ext-a", Some("main.js"), false);
        let storage = Arc::new(MemoryStorage::new());
        storage.seed(
            StorageScope::Workspace,
            WORKSPACE_EXTENSIONS_STORAGE_KEY,
            r#"["ext-a"]"#,
        );

        let store = store_over(fs.clone(), storage).await;
        assert!(store.get_installed(false).await.is_empty());
        let all = store.get_installed(true).await;
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_valid);
        assert!(all[0].validations[0].contains("main.js"));

        // Only the invalid entry is watched.
        assert_eq!(fs.watched.lock().unwrap().as_slice(), &[location("ext-a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_extensions_revalidate_when_their_files_change() {
        let fs = MockFileSystem::new();
        add_extension(&fs, "ext-a", Some("main.js"), false);
        let storage = Arc::new(MemoryStorage::new());
        storage.seed(
            StorageScope::Workspace,
            WORKSPACE_EXTENSIONS_STORAGE_KEY,
            r#"["ext-a"]"#,
        );

        let store = store_over(fs.clone(), storage).await;
        let mut validated = store.subscribe();

        let main = join_location(&location("ext-a"), "main.js").unwrap();
        fs.mark_existing(&main);
        fs.emit_change(&main);

        let became_valid = tokio::time::timeout(Duration::from_secs(10), validated.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(became_valid.len(), 1);
        assert!(became_valid[0].is_valid);
        assert_eq!(store.get_installed(false).await.len(), 1);
        // Nothing invalid remains, so nothing stays watched.
        assert!(fs.watched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uninstall_persists_the_removal() {
        let fs = MockFileSystem::new();
        add_extension(&fs, "ext-a", None, false);
        let storage = Arc::new(MemoryStorage::new());
        let store = store_over(fs, storage.clone()).await;

        let claimed = ResourceExtension {
            identifier: ExtensionIdentifier::new("pub.ext-a"),
            location: location("ext-a"),
            manifest: serde_json::from_str(&manifest_json("pub", "ext-a", None)).unwrap(),
        };
        store.install(&claimed).await.unwrap();
        store
            .uninstall(&ExtensionIdentifier::new("PUB.EXT-A"))
            .await
            .unwrap();

        assert!(store.get_installed(true).await.is_empty());
        let raw = storage
            .get(StorageScope::Workspace, WORKSPACE_EXTENSIONS_STORAGE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, "[]");
    }

    #[tokio::test]
    async fn corrupt_records_are_tolerated() {
        let fs = MockFileSystem::new();
        let storage = Arc::new(MemoryStorage::new());
        storage.seed(
            StorageScope::Workspace,
            WORKSPACE_EXTENSIONS_STORAGE_KEY,
            r#"{"not": "an array"}"#,
        );
        let store = store_over(fs, storage).await;
        assert!(store.get_installed(true).await.is_empty());
    }

    #[tokio::test]
    async fn multi_root_workspaces_reject_relative_entries() {
        let fs = MockFileSystem::new();
        add_extension(&fs, "ext-a", None, false);
        let storage = Arc::new(MemoryStorage::new());
        storage.seed(
            StorageScope::Workspace,
            WORKSPACE_EXTENSIONS_STORAGE_KEY,
            r#"["ext-a", "file:///workspace/ext-a"]"#,
        );

        let store = WorkspaceExtensionStore::create(
            fs,
            storage,
            WorkspaceLayout::MultiRoot(vec![root()]),
        )
        .await
        .unwrap();
        let installed = store.get_installed(true).await;
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].location, location("ext-a"));
    }
}
