//! Interfaces of the collaborators this subsystem consumes: the extension
//! catalog, the per-target management capability, the prompt host, persisted
//! key-value storage, and the file system.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use notify::Watcher;
use tokio::sync::broadcast;
use tracing::warn;
use url::Url;

use crate::error::{ManagementError, Result};
use crate::events::TargetEvent;
use crate::models::{
    ExtensionIdentifier, ExtensionManifest, ExtensionType, GalleryExtension, InstallOptions,
    InstalledExtension, UninstallExtensionInfo,
};

/// Read access to the remote extension catalog.
#[async_trait]
pub trait GalleryClient: Send + Sync {
    /// Fetch gallery metadata for a batch of identifiers. Unknown ids are
    /// simply absent from the result.
    async fn get_extensions(
        &self,
        identifiers: &[ExtensionIdentifier],
    ) -> Result<Vec<GalleryExtension>>;

    /// Fetch the full manifest for a gallery extension. `None` means the
    /// listing exists but the manifest could not be supplied.
    async fn get_manifest(
        &self,
        extension: &GalleryExtension,
    ) -> Result<Option<ExtensionManifest>>;
}

/// The opaque single-target install capability. The orchestrator routes to
/// these; it never duplicates their internal bookkeeping.
#[async_trait]
pub trait TargetManagementService: Send + Sync {
    async fn install_from_gallery(
        &self,
        extension: &GalleryExtension,
        options: &InstallOptions,
    ) -> Result<InstalledExtension>;

    async fn install(&self, archive: &Url, options: &InstallOptions) -> Result<InstalledExtension>;

    async fn install_from_location(
        &self,
        location: &Url,
        profile_location: Option<&Url>,
    ) -> Result<InstalledExtension>;

    async fn uninstall_extensions(&self, extensions: &[UninstallExtensionInfo]) -> Result<()>;

    async fn get_installed(
        &self,
        kind: Option<ExtensionType>,
        profile_location: Option<&Url>,
    ) -> Result<Vec<InstalledExtension>>;

    async fn can_install(&self, extension: &GalleryExtension) -> Result<bool>;

    async fn get_manifest(&self, archive: &Url) -> Result<ExtensionManifest>;

    /// Events the target emits on its own (e.g. profile changes). The default
    /// is a stream that never produces anything.
    fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        broadcast::channel(1).1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSeverity {
    Info,
    Warning,
}

/// A modal message with buttons. Dismissing it yields `None`.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub severity: PromptSeverity,
    pub message: String,
    pub detail: Option<String>,
    pub buttons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceTrustChoice {
    ContinueWithTrust,
    ContinueWithoutTrust,
    Manage,
}

#[derive(Debug, Clone)]
pub struct WorkspaceTrustRequest {
    pub message: String,
    /// Omitted for workspace-scoped installs, which always require trust.
    pub allow_continue_without_trust: bool,
}

#[async_trait]
pub trait PromptHost: Send + Sync {
    /// Returns the index of the chosen button, or `None` when dismissed.
    async fn prompt(&self, request: PromptRequest) -> Result<Option<usize>>;

    async fn request_workspace_trust(
        &self,
        request: WorkspaceTrustRequest,
    ) -> Result<Option<WorkspaceTrustChoice>>;

    /// Open a link in the host's external browser / documentation surface.
    async fn open_external(&self, link: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageScope {
    Application,
    Workspace,
}

/// Persisted string key-value storage, scoped to the application profile or
/// the current workspace.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, scope: StorageScope, key: &str) -> Result<Option<String>>;
    async fn store(&self, scope: StorageScope, key: &str, value: String) -> Result<()>;
    async fn remove(&self, scope: StorageScope, key: &str) -> Result<()>;
}

/// A change notification for a watched location.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub location: Url,
}

impl FileChange {
    /// Whether this change affects the given location (same resource, a
    /// descendant, or an ancestor).
    pub fn affects(&self, location: &Url) -> bool {
        let changed = self.location.as_str().trim_end_matches('/');
        let target = location.as_str().trim_end_matches('/');
        changed == target
            || changed.starts_with(&format!("{target}/"))
            || target.starts_with(&format!("{changed}/"))
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, location: &Url) -> bool;
    async fn read_to_string(&self, location: &Url) -> Result<String>;
    fn watch(&self, location: &Url) -> Result<()>;
    fn unwatch(&self, location: &Url) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<FileChange>;
}

const FILE_CHANGE_CHANNEL_CAPACITY: usize = 256;

/// `FileSystem` over the local disk, with change notifications from a
/// recursive watcher. Only `file://` locations are meaningful.
pub struct LocalFileSystem {
    watcher: StdMutex<notify::RecommendedWatcher>,
    changes: broadcast::Sender<FileChange>,
}

impl LocalFileSystem {
    pub fn new() -> Result<Self> {
        let (changes, _) = broadcast::channel(FILE_CHANGE_CHANNEL_CAPACITY);
        let sender = changes.clone();
        let watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    for path in event.paths {
                        if let Ok(location) = Url::from_file_path(&path) {
                            let _ = sender.send(FileChange { location });
                        }
                    }
                }
                Err(error) => warn!("File watcher error: {error}"),
            },
        )
        .map_err(|e| ManagementError::IoError(std::io::Error::other(e)))?;
        Ok(Self {
            watcher: StdMutex::new(watcher),
            changes,
        })
    }

    fn file_path(location: &Url) -> Result<std::path::PathBuf> {
        location
            .to_file_path()
            .map_err(|_| ManagementError::InvalidLocation(location.clone()))
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, location: &Url) -> bool {
        match location.to_file_path() {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read_to_string(&self, location: &Url) -> Result<String> {
        let path = Self::file_path(location)?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    fn watch(&self, location: &Url) -> Result<()> {
        let path = Self::file_path(location)?;
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        watcher
            .watch(&path, notify::RecursiveMode::Recursive)
            .map_err(|e| ManagementError::IoError(std::io::Error::other(e)))
    }

    fn unwatch(&self, location: &Url) -> Result<()> {
        let path = Self::file_path(location)?;
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        // Unwatching something never watched is not an error worth surfacing.
        if let Err(error) = watcher.unwatch(&path) {
            warn!("Failed to unwatch {}: {error}", location);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FileChange> {
        self.changes.subscribe()
    }
}
