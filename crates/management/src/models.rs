use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::ManagementError;
use crate::targets::Target;

/// Identity of an extension: `publisher.name`, compared case-insensitively.
/// The uuid, when both sides carry one, is the authoritative tiebreaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionIdentifier {
    pub id: String,
    pub uuid: Option<Uuid>,
}

impl ExtensionIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uuid: None,
        }
    }

    pub fn with_uuid(id: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            id: id.into(),
            uuid: Some(uuid),
        }
    }

    /// Whether two identifiers refer to the same extension.
    ///
    /// Deliberately not a `PartialEq` impl: the uuid tiebreaker makes the
    /// relation non-transitive, so it must not feed `HashMap` keys. Callers
    /// that need map keys use [`ExtensionIdentifier::key`].
    pub fn same(&self, other: &ExtensionIdentifier) -> bool {
        if let (Some(a), Some(b)) = (&self.uuid, &other.uuid) {
            return a == b;
        }
        self.id.eq_ignore_ascii_case(&other.id)
    }

    /// Lowercased id, the canonical map key.
    pub fn key(&self) -> String {
        self.id.to_lowercase()
    }

    /// The publisher segment of the id, lowercased.
    pub fn publisher(&self) -> String {
        self.id
            .split('.')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    Ui,
    Workspace,
    Web,
}

/// Degree of support an extension declares for a restricted capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportLevel {
    #[default]
    Supported,
    Limited,
    Unsupported,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSupport {
    #[serde(default)]
    pub supported: SupportLevel,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestCapabilities {
    #[serde(default)]
    pub untrusted_workspaces: Option<WorkspaceSupport>,
    #[serde(default)]
    pub virtual_workspaces: Option<WorkspaceSupport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub publisher: String,
    pub version: Version,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Relative path of the entry point, when the extension has one.
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub extension_kind: Vec<ExtensionKind>,
    #[serde(default)]
    pub extension_dependencies: Vec<String>,
    #[serde(default)]
    pub extension_pack: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub capabilities: ManifestCapabilities,
}

impl ExtensionManifest {
    pub fn id(&self) -> String {
        format!("{}.{}", self.publisher, self.name)
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Language packs must be present on every process that needs their
    /// localized strings, so they get special routing.
    pub fn is_language_pack(&self) -> bool {
        self.categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case("language packs"))
    }

    /// Declared kinds, or the conventional default when none are declared:
    /// an extension with an entry point runs where the workspace is, one
    /// without can run anywhere.
    pub fn effective_kinds(&self) -> Vec<ExtensionKind> {
        if !self.extension_kind.is_empty() {
            return self.extension_kind.clone();
        }
        if self.main.is_some() {
            vec![ExtensionKind::Workspace]
        } else {
            vec![ExtensionKind::Ui, ExtensionKind::Workspace, ExtensionKind::Web]
        }
    }

    pub fn prefers_execute_on_ui(&self) -> bool {
        self.effective_kinds().first() == Some(&ExtensionKind::Ui)
    }

    pub fn can_execute_on_workspace(&self) -> bool {
        self.effective_kinds().contains(&ExtensionKind::Workspace)
    }

    pub fn can_execute_on_web(&self) -> bool {
        self.effective_kinds().contains(&ExtensionKind::Web)
    }

    pub fn untrusted_workspace_support(&self) -> SupportLevel {
        self.capabilities
            .untrusted_workspaces
            .as_ref()
            .map(|s| s.supported)
            .unwrap_or_default()
    }

    pub fn virtual_workspace_support(&self) -> (SupportLevel, Option<&str>) {
        match &self.capabilities.virtual_workspaces {
            Some(support) => (support.supported, support.description.as_deref()),
            None => (SupportLevel::Supported, None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionType {
    System,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionSource {
    Gallery,
    Resource,
}

/// An installed extension as reported by a target or the workspace store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledExtension {
    pub identifier: ExtensionIdentifier,
    pub manifest: ExtensionManifest,
    pub location: Url,
    /// Owning target; `None` for workspace-scoped records.
    pub target: Option<Target>,
    pub is_builtin: bool,
    pub is_application_scoped: bool,
    pub is_machine_scoped: bool,
    pub is_workspace_scoped: bool,
    pub private: bool,
    pub source: ExtensionSource,
    pub is_valid: bool,
    pub validations: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledExtension {
    pub fn display_name(&self) -> &str {
        self.manifest.display_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherDomain {
    pub link: String,
    pub verified: bool,
}

/// A not-yet-installed candidate from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryExtension {
    pub identifier: ExtensionIdentifier,
    pub name: String,
    pub publisher: String,
    pub publisher_display_name: String,
    pub version: Version,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub publisher_domain: Option<PublisherDomain>,
    /// Privately distributed; exempt from the gallery publisher-trust model.
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub extension_pack: Vec<String>,
    #[serde(default)]
    pub details_link: Option<String>,
}

impl GalleryExtension {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_publisher_verified(&self) -> bool {
        self.publisher_domain
            .as_ref()
            .map(|d| d.verified)
            .unwrap_or(false)
    }
}

/// An extension available at a resource location (e.g. a folder inside the
/// workspace) rather than through the catalog.
#[derive(Debug, Clone)]
pub struct ResourceExtension {
    pub identifier: ExtensionIdentifier,
    pub location: Url,
    pub manifest: ExtensionManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallSource {
    #[default]
    Gallery,
    SettingsSync,
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub source: InstallSource,
    /// Reserved for trusted internal flows (e.g. settings sync restoring a
    /// profile); skips the publisher trust gate.
    pub skip_publisher_trust: bool,
    pub donot_include_pack_and_dependencies: bool,
    pub is_machine_scoped: bool,
    pub is_application_scoped: bool,
    pub is_workspace_scoped: bool,
    pub profile_location: Option<Url>,
    /// Explicit targets to install on; validated against the manifest.
    pub install_only_on: Vec<Target>,
}

#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    pub profile_location: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct InstallExtensionInfo {
    pub extension: GalleryExtension,
    pub options: InstallOptions,
}

#[derive(Debug, Clone)]
pub struct UninstallExtensionInfo {
    pub extension: InstalledExtension,
    pub options: UninstallOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOperation {
    Install,
    Update,
}

#[derive(Debug, Clone)]
pub enum InstallResultSource {
    Gallery(Box<GalleryExtension>),
    Location(Url),
}

/// One settled entry of a batch install: one logical (extension x target)
/// pairing, succeeded or failed.
#[derive(Debug, Clone)]
pub struct InstallExtensionResult {
    pub identifier: ExtensionIdentifier,
    pub source: InstallResultSource,
    pub operation: InstallOperation,
    pub target: Option<Target>,
    pub workspace_scoped: bool,
    pub local: Option<InstalledExtension>,
    pub error: Option<Arc<ManagementError>>,
}

/// Answer to "can this candidate be installed in the current configuration".
#[derive(Debug, Clone)]
pub enum CanInstall {
    Installable,
    Incompatible(String),
}

impl CanInstall {
    pub fn is_installable(&self) -> bool {
        matches!(self, CanInstall::Installable)
    }
}
