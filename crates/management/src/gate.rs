//! The publisher trust gate: one consolidated prompt per batch, covering the
//! extensions being installed and every foreign publisher their packs and
//! dependencies reach. Declining aborts the whole batch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ManagementError, Result};
use crate::models::{ExtensionManifest, GalleryExtension};
use crate::resolver::PackAndDependencyResolver;
use crate::services::{PromptHost, PromptRequest, PromptSeverity};
use crate::trust::{PublisherTrustEntry, PublisherTrustStore};

const PUBLISHER_TRUST_LEARN_MORE_LINK: &str = "https://trifold.dev/docs/publisher-trust";

/// One extension awaiting the gate.
pub struct TrustCandidate<'a> {
    pub extension: &'a GalleryExtension,
    pub manifest: &'a ExtensionManifest,
    /// Whether the candidate's packs and dependencies will be installed too
    /// and must be covered by the same prompt.
    pub check_pack_and_dependencies: bool,
}

pub struct PublisherTrustGate {
    trust: Arc<PublisherTrustStore>,
    resolver: PackAndDependencyResolver,
    prompts: Arc<dyn PromptHost>,
}

impl PublisherTrustGate {
    pub fn new(
        trust: Arc<PublisherTrustStore>,
        resolver: PackAndDependencyResolver,
        prompts: Arc<dyn PromptHost>,
    ) -> Self {
        Self {
            trust,
            resolver,
            prompts,
        }
    }

    /// Prompt once for every untrusted publisher the batch touches. Returns
    /// `Ok(())` when the install may proceed; a declined or dismissed prompt
    /// is a cancellation, never a failure.
    pub async fn request_publisher_trust(
        &self,
        candidates: &[TrustCandidate<'_>],
    ) -> Result<()> {
        let mut untrusted: Vec<&TrustCandidate<'_>> = Vec::new();
        for candidate in candidates {
            if !self.trust.is_trusted(candidate.extension).await? {
                untrusted.push(candidate);
            }
        }
        if untrusted.is_empty() {
            return Ok(());
        }

        let roots: Vec<(&GalleryExtension, &ExtensionManifest)> = untrusted
            .iter()
            .filter(|c| c.check_pack_and_dependencies)
            .map(|c| (c.extension, c.manifest))
            .collect();
        let transitive = self
            .resolver
            .other_untrusted_publishers(&self.trust, &roots)
            .await?;

        debug!(
            "Requesting trust for {} extension(s), {} transitive publisher(s)",
            untrusted.len(),
            transitive.len()
        );

        let request = build_prompt(&untrusted, &transitive);
        match self.prompts.prompt(request).await? {
            Some(0) => {
                let mut entries: HashMap<String, PublisherTrustEntry> = HashMap::new();
                for candidate in &untrusted {
                    let extension = candidate.extension;
                    entries.insert(
                        extension.publisher.to_lowercase(),
                        PublisherTrustEntry {
                            publisher: extension.publisher.clone(),
                            publisher_display_name: extension.publisher_display_name.clone(),
                        },
                    );
                }
                for extension in &transitive {
                    entries.insert(
                        extension.publisher.to_lowercase(),
                        PublisherTrustEntry {
                            publisher: extension.publisher.clone(),
                            publisher_display_name: extension.publisher_display_name.clone(),
                        },
                    );
                }
                self.trust.trust(entries.into_values().collect()).await?;
                Ok(())
            }
            Some(_) => {
                self.prompts
                    .open_external(PUBLISHER_TRUST_LEARN_MORE_LINK)
                    .await?;
                Err(ManagementError::Cancelled)
            }
            None => Err(ManagementError::Cancelled),
        }
    }
}

fn build_prompt(
    untrusted: &[&TrustCandidate<'_>],
    transitive: &[GalleryExtension],
) -> PromptRequest {
    let message = if untrusted.len() == 1 {
        format!(
            "Do you trust the publisher \"{}\" of the '{}' extension?",
            untrusted[0].extension.publisher_display_name,
            untrusted[0].extension.display_name()
        )
    } else {
        "Do you trust the publishers of the following extensions?".to_string()
    };

    let mut lines: Vec<String> = untrusted
        .iter()
        .map(|candidate| {
            let extension = candidate.extension;
            let verification = if extension.is_publisher_verified() {
                ""
            } else {
                " (unverified)"
            };
            format!(
                "{} from {}{}",
                extension.display_name(),
                extension.publisher_display_name,
                verification
            )
        })
        .collect();
    if !transitive.is_empty() {
        let publishers: Vec<&str> = transitive
            .iter()
            .map(|e| e.publisher_display_name.as_str())
            .collect();
        lines.push(format!(
            "Installing also brings extensions from: {}",
            publishers.join(", ")
        ));
    }

    let trust_button = if untrusted.len() == 1 && transitive.is_empty() {
        "Trust Publisher & Install"
    } else {
        "Trust Publishers & Install"
    };

    PromptRequest {
        severity: PromptSeverity::Warning,
        message,
        detail: Some(lines.join("\n")),
        buttons: vec![trust_button.to_string(), "Learn More".to_string()],
    }
}
