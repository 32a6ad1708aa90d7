use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ManagementError, Result};
use crate::models::{ExtensionKind, ExtensionManifest};
use crate::services::TargetManagementService;

/// URL scheme routed to the remote target.
pub const REMOTE_SCHEME: &str = "trifold-remote";

/// The execution environments an extension can be installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Local,
    Remote,
    Web,
}

impl Target {
    pub fn default_label(&self) -> &'static str {
        match self {
            Target::Local => "local",
            Target::Remote => "remote",
            Target::Web => "web",
        }
    }
}

/// A configured target together with its management capability.
pub struct RegisteredTarget {
    pub target: Target,
    pub label: String,
    pub service: Arc<dyn TargetManagementService>,
}

/// The set of targets present for this session, fixed at startup.
#[derive(Default)]
pub struct TargetRegistry {
    targets: Vec<RegisteredTarget>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        target: Target,
        label: impl Into<String>,
        service: Arc<dyn TargetManagementService>,
    ) {
        self.targets.retain(|t| t.target != target);
        self.targets.push(RegisteredTarget {
            target,
            label: label.into(),
            service,
        });
    }

    pub fn get(&self, target: Target) -> Option<&RegisteredTarget> {
        self.targets.iter().find(|t| t.target == target)
    }

    pub fn is_configured(&self, target: Target) -> bool {
        self.get(target).is_some()
    }

    pub fn targets(&self) -> &[RegisteredTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Whether the only configured target is the web target.
    pub fn is_web_only(&self) -> bool {
        self.targets.len() == 1 && self.is_configured(Target::Web)
    }

    /// The label to surface in an `Unsupported` error: only meaningful when
    /// a single target exists and the remediation is obvious.
    fn sole_target_label(&self) -> Option<String> {
        if self.targets.len() == 1 {
            Some(self.targets[0].label.clone())
        } else {
            None
        }
    }

    /// The ordered targets eligible to host the given manifest.
    ///
    /// Language packs go to both local and remote (never web); otherwise the
    /// declared kinds map onto targets and local, accepting anything, is
    /// appended as a fallback.
    pub fn eligible_targets(&self, manifest: &ExtensionManifest) -> Result<Vec<Target>> {
        let unsupported = || ManagementError::Unsupported {
            extension: manifest.display_name().to_string(),
            target: self.sole_target_label(),
        };

        if manifest.is_language_pack() {
            let targets: Vec<Target> = [Target::Local, Target::Remote]
                .into_iter()
                .filter(|t| self.is_configured(*t))
                .collect();
            if targets.is_empty() {
                return Err(unsupported());
            }
            return Ok(targets);
        }

        if self.targets.len() == 1 && self.is_configured(Target::Local) {
            return Ok(vec![Target::Local]);
        }

        let mut targets = Vec::new();
        for kind in manifest.effective_kinds() {
            let candidate = match kind {
                ExtensionKind::Ui => Target::Local,
                ExtensionKind::Workspace => Target::Remote,
                ExtensionKind::Web => Target::Web,
            };
            if self.is_configured(candidate) && !targets.contains(&candidate) {
                targets.push(candidate);
            }
        }
        if self.is_configured(Target::Local) && !targets.contains(&Target::Local) {
            targets.push(Target::Local);
        }

        if targets.is_empty() {
            return Err(unsupported());
        }
        Ok(targets)
    }

    /// Targets an archive install should land on: a language pack spans local
    /// and remote, an UI-preferring extension goes local, anything else goes
    /// remote when a remote exists.
    pub fn archive_targets(&self, manifest: &ExtensionManifest) -> Vec<Target> {
        let local = self.is_configured(Target::Local);
        let remote = self.is_configured(Target::Remote);
        if local && remote {
            if manifest.is_language_pack() {
                return vec![Target::Local, Target::Remote];
            }
            if manifest.prefers_execute_on_ui() {
                return vec![Target::Local];
            }
            return vec![Target::Remote];
        }
        if local {
            return vec![Target::Local];
        }
        if remote {
            return vec![Target::Remote];
        }
        Vec::new()
    }

    /// Route a location to a target purely by its URL scheme.
    pub fn target_for_location(&self, location: &Url) -> Result<&RegisteredTarget> {
        let target = match location.scheme() {
            "file" => Target::Local,
            REMOTE_SCHEME => Target::Remote,
            _ => Target::Web,
        };
        self.get(target)
            .ok_or_else(|| ManagementError::TargetNotConfigured(target.default_label().to_string()))
    }
}
