//! Persisted record of publishers the user has chosen to trust.
//!
//! Keys are lowercased publisher names; the stored entry keeps the original
//! display name for prompts. Private extensions bypass the trust model
//! entirely, and configuration can pre-trust publishers or allowlist single
//! extensions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::GalleryExtension;
use crate::services::{KeyValueStorage, StorageScope};

pub const TRUSTED_PUBLISHERS_STORAGE_KEY: &str = "extensions.trustedPublishers";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublisherTrustEntry {
    pub publisher: String,
    #[serde(rename = "publisherDisplayName")]
    pub publisher_display_name: String,
}

/// Trust decisions supplied by configuration rather than the user.
#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
    /// Publishers trusted out of the box, matched by name or display name.
    pub default_trusted_publishers: Vec<String>,
    /// Individual extension ids exempted from the publisher check.
    pub allowed_extensions: Vec<String>,
}

pub struct PublisherTrustStore {
    storage: Arc<dyn KeyValueStorage>,
    config: TrustConfig,
}

impl PublisherTrustStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, config: TrustConfig) -> Self {
        Self { storage, config }
    }

    /// Whether installing this extension needs no publisher trust prompt.
    pub async fn is_trusted(&self, extension: &GalleryExtension) -> Result<bool> {
        if extension.private {
            return Ok(true);
        }
        let publisher = extension.publisher.to_lowercase();
        let display_name = extension.publisher_display_name.to_lowercase();
        if self
            .config
            .default_trusted_publishers
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&publisher) || p.eq_ignore_ascii_case(&display_name))
        {
            return Ok(true);
        }
        if self
            .config
            .allowed_extensions
            .iter()
            .any(|id| id.eq_ignore_ascii_case(&extension.identifier.id))
        {
            return Ok(true);
        }
        Ok(self.load().await?.contains_key(&publisher))
    }

    pub async fn is_publisher_trusted(&self, publisher: &str) -> Result<bool> {
        let publisher = publisher.to_lowercase();
        if self
            .config
            .default_trusted_publishers
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&publisher))
        {
            return Ok(true);
        }
        Ok(self.load().await?.contains_key(&publisher))
    }

    pub async fn trusted_publishers(&self) -> Result<Vec<PublisherTrustEntry>> {
        Ok(self.load().await?.into_values().collect())
    }

    /// Record trust for the given publishers. Already-trusted entries are
    /// left untouched.
    pub async fn trust(&self, entries: Vec<PublisherTrustEntry>) -> Result<()> {
        let mut trusted = self.load().await?;
        let mut changed = false;
        for entry in entries {
            let key = entry.publisher.to_lowercase();
            if !trusted.contains_key(&key) {
                info!("Trusting publisher {}", entry.publisher_display_name);
                trusted.insert(key, entry);
                changed = true;
            }
        }
        if changed {
            self.save(&trusted).await?;
        }
        Ok(())
    }

    pub async fn untrust(&self, publishers: &[&str]) -> Result<()> {
        let mut trusted = self.load().await?;
        let mut changed = false;
        for publisher in publishers {
            if trusted.remove(&publisher.to_lowercase()).is_some() {
                info!("Untrusting publisher {publisher}");
                changed = true;
            }
        }
        if changed {
            self.save(&trusted).await?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<BTreeMap<String, PublisherTrustEntry>> {
        let raw = self
            .storage
            .get(StorageScope::Application, TRUSTED_PUBLISHERS_STORAGE_KEY)
            .await?;
        let Some(raw) = raw else {
            return Ok(BTreeMap::new());
        };
        match serde_json::from_str::<Value>(&raw) {
            // An earlier format stored a bare array of publisher names. Those
            // entries carry no display name, so the record is reset instead
            // of migrated.
            Ok(Value::Array(_)) => {
                info!("Resetting legacy trusted publisher record");
                self.storage
                    .remove(StorageScope::Application, TRUSTED_PUBLISHERS_STORAGE_KEY)
                    .await?;
                Ok(BTreeMap::new())
            }
            Ok(Value::Object(map)) => {
                let mut trusted = BTreeMap::new();
                for (key, value) in map {
                    match serde_json::from_value::<PublisherTrustEntry>(value) {
                        Ok(entry) => {
                            trusted.insert(key.to_lowercase(), entry);
                        }
                        Err(error) => {
                            warn!("Skipping malformed trust entry for {key}: {error}");
                        }
                    }
                }
                Ok(trusted)
            }
            _ => {
                warn!("Ignoring unreadable trusted publisher record");
                Ok(BTreeMap::new())
            }
        }
    }

    async fn save(&self, trusted: &BTreeMap<String, PublisherTrustEntry>) -> Result<()> {
        self.storage
            .store(
                StorageScope::Application,
                TRUSTED_PUBLISHERS_STORAGE_KEY,
                serde_json::to_string(trusted)?,
            )
            .await
    }
}
