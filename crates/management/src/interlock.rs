//! Pre-install checks that sit between the trust gate and dispatch: the
//! workspace trust handshake, and the degraded-functionality warnings for
//! web-only configurations.

use std::sync::Arc;

use tracing::debug;

use crate::error::{ManagementError, Result};
use crate::models::{
    ExtensionIdentifier, ExtensionManifest, GalleryExtension, SupportLevel,
};
use crate::services::{
    GalleryClient, PromptHost, PromptRequest, PromptSeverity, WorkspaceTrustChoice,
    WorkspaceTrustRequest,
};
use crate::targets::{Target, TargetRegistry};

const WORKSPACE_TRUST_MANAGE_LINK: &str = "trifold://settings/workspace-trust";

pub struct WorkspaceTrustInterlock {
    prompts: Arc<dyn PromptHost>,
    gallery: Arc<dyn GalleryClient>,
}

impl WorkspaceTrustInterlock {
    pub fn new(prompts: Arc<dyn PromptHost>, gallery: Arc<dyn GalleryClient>) -> Self {
        Self { prompts, gallery }
    }

    /// Ask for workspace trust when the extension cannot run untrusted, or
    /// unconditionally for workspace-scoped installs. The host resolves the
    /// request immediately when the workspace is already trusted.
    pub async fn check_for_workspace_trust(
        &self,
        manifest: &ExtensionManifest,
        require_trust: bool,
    ) -> Result<()> {
        let needs_trust = require_trust
            || manifest.untrusted_workspace_support() == SupportLevel::Unsupported;
        if !needs_trust {
            return Ok(());
        }

        let request = WorkspaceTrustRequest {
            message: format!(
                "Installing '{}' requires a trusted workspace.",
                manifest.display_name()
            ),
            allow_continue_without_trust: !require_trust,
        };
        match self.prompts.request_workspace_trust(request).await? {
            Some(WorkspaceTrustChoice::ContinueWithTrust)
            | Some(WorkspaceTrustChoice::ContinueWithoutTrust) => Ok(()),
            Some(WorkspaceTrustChoice::Manage) => {
                self.prompts.open_external(WORKSPACE_TRUST_MANAGE_LINK).await?;
                Err(ManagementError::Cancelled)
            }
            None => Err(ManagementError::Cancelled),
        }
    }

    /// In a web-only configuration an extension pack may contain members
    /// that cannot run at all. A pack with no runnable member is rejected;
    /// a partially runnable one warns and lets the user decide.
    pub async fn check_web_compatibility(
        &self,
        registry: &TargetRegistry,
        extension: &GalleryExtension,
        manifest: &ExtensionManifest,
    ) -> Result<()> {
        if !registry.is_web_only() {
            return Ok(());
        }

        if !manifest.extension_pack.is_empty() {
            let web = registry
                .get(Target::Web)
                .ok_or_else(|| ManagementError::TargetNotConfigured("web".to_string()))?;
            let identifiers: Vec<ExtensionIdentifier> = manifest
                .extension_pack
                .iter()
                .map(ExtensionIdentifier::new)
                .collect();
            let members = self.gallery.get_extensions(&identifiers).await?;

            let mut incompatible = Vec::new();
            for member in &members {
                if !web.service.can_install(member).await? {
                    incompatible.push(member.display_name().to_string());
                }
            }
            debug!(
                "Web compatibility for pack {}: {}/{} members incompatible",
                extension.identifier.id,
                incompatible.len(),
                members.len()
            );

            if !members.is_empty() && incompatible.len() == members.len() {
                return Err(ManagementError::Unsupported {
                    extension: extension.display_name().to_string(),
                    target: Some("web".to_string()),
                });
            }
            if !incompatible.is_empty() {
                return self
                    .confirm_limited(
                        extension,
                        format!(
                            "Some extensions in '{}' cannot be installed here: {}.",
                            extension.display_name(),
                            incompatible.join(", ")
                        ),
                    )
                    .await;
            }
        }

        // Limited support warns no matter how the pack fared.
        if manifest.virtual_workspace_support().0 == SupportLevel::Limited {
            return self
                .confirm_limited(
                    extension,
                    format!(
                        "'{}' has limited functionality in this environment.",
                        extension.display_name()
                    ),
                )
                .await;
        }
        Ok(())
    }

    async fn confirm_limited(
        &self,
        extension: &GalleryExtension,
        message: String,
    ) -> Result<()> {
        let request = PromptRequest {
            severity: PromptSeverity::Info,
            message,
            detail: None,
            buttons: vec!["Install Anyway".to_string(), "Show Extensions".to_string()],
        };
        match self.prompts.prompt(request).await? {
            Some(0) => Ok(()),
            Some(_) => {
                if let Some(link) = &extension.details_link {
                    self.prompts.open_external(link).await?;
                }
                Err(ManagementError::Cancelled)
            }
            None => Err(ManagementError::Cancelled),
        }
    }
}
