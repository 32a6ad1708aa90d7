//! Trifold Management - multi-target extension management
//!
//! This crate orchestrates extension installs, uninstalls and updates across
//! the execution targets a session may have: the local machine, a remote
//! host, and the browser. It owns the cross-cutting concerns the per-target
//! services cannot: publisher trust, workspace trust, extension packs and
//! dependencies, language pack fan-out, and extensions that live inside the
//! workspace itself.
//!
//! # Features
//!
//! - **Target routing**: manifests decide which targets an extension lands on
//! - **Publisher trust**: one consolidated prompt per batch, persisted choices
//! - **Workspace extensions**: location-persisted, self-healing on load
//! - **Settled batches**: every extension x target pairing resolves on its own
//! - **One event stream**: per-target events fan in, tagged by origin
//!
//! # Example
//!
/// ```rust,no_run
/// use std::sync::Arc;
/// use trifold_management::{
///     ExtensionManagementService, FileSystem, GalleryClient, JsonFileStorage,
///     KeyValueStorage, LocalFileSystem, PackAndDependencyResolver, PromptHost,
///     PublisherTrustGate, PublisherTrustStore, Result, Target, TargetManagementService,
///     TargetRegistry, TrustConfig, WorkspaceExtensionStore, WorkspaceLayout,
///     WorkspaceTrustInterlock,
/// };
///
/// # async fn example(
/// #     gallery: Arc<dyn GalleryClient>,
/// #     prompts: Arc<dyn PromptHost>,
/// #     local: Arc<dyn TargetManagementService>,
/// # ) -> Result<()> {
/// let storage: Arc<dyn KeyValueStorage> =
///     Arc::new(JsonFileStorage::new("application.json", "workspace.json"));
/// let trust = Arc::new(PublisherTrustStore::new(storage.clone(), TrustConfig::default()));
///
/// let mut registry = TargetRegistry::new();
/// registry.register(Target::Local, "local", local);
///
/// let gate = PublisherTrustGate::new(
///     trust.clone(),
///     PackAndDependencyResolver::new(gallery.clone()),
///     prompts.clone(),
/// );
/// let interlock = WorkspaceTrustInterlock::new(prompts, gallery.clone());
///
/// let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new()?);
/// let root = url::Url::parse("file:///workspace").unwrap();
/// let workspace =
///     WorkspaceExtensionStore::create(fs, storage, WorkspaceLayout::Folder(root)).await?;
///
/// let service =
///     ExtensionManagementService::new(registry, gallery, trust, gate, interlock, workspace);
/// let installed = service.get_installed(None, None).await?;
/// println!("{} extension(s) installed", installed.len());
/// # Ok(())
/// # }
/// ```
pub mod error;
pub mod events;
pub mod gate;
pub mod interlock;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod services;
pub mod storage;
pub mod targets;
pub mod trust;
pub mod workspace;

// Re-export commonly used types
pub use error::{ManagementError, Result};
pub use events::{
    DidInstallExtensionEvent, DidUninstallExtensionEvent, EventBus, InstallExtensionEvent,
    ManagementEvent, TargetEvent, UninstallExtensionEvent,
};
pub use gate::{PublisherTrustGate, TrustCandidate};
pub use interlock::WorkspaceTrustInterlock;
pub use models::{
    CanInstall, ExtensionIdentifier, ExtensionKind, ExtensionManifest, ExtensionType,
    GalleryExtension, InstallExtensionInfo, InstallExtensionResult, InstallOperation,
    InstallOptions, InstallSource, InstalledExtension, ResourceExtension, SupportLevel,
    UninstallExtensionInfo, UninstallOptions,
};
pub use orchestrator::ExtensionManagementService;
pub use resolver::PackAndDependencyResolver;
pub use services::{
    FileChange, FileSystem, GalleryClient, KeyValueStorage, LocalFileSystem, PromptHost,
    PromptRequest, PromptSeverity, StorageScope, TargetManagementService, WorkspaceTrustChoice,
    WorkspaceTrustRequest,
};
pub use storage::JsonFileStorage;
pub use targets::{RegisteredTarget, Target, TargetRegistry, REMOTE_SCHEME};
pub use trust::{PublisherTrustEntry, PublisherTrustStore, TrustConfig};
pub use workspace::{WorkspaceExtensionStore, WorkspaceLayout};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
