//! Walks extension packs and dependency lists through the catalog to find
//! every publisher an install would transitively pull in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::models::{ExtensionIdentifier, ExtensionManifest, GalleryExtension};
use crate::services::GalleryClient;
use crate::trust::PublisherTrustStore;

pub struct PackAndDependencyResolver {
    gallery: Arc<dyn GalleryClient>,
}

impl PackAndDependencyResolver {
    pub fn new(gallery: Arc<dyn GalleryClient>) -> Self {
        Self { gallery }
    }

    /// Publishers other than the installing extensions' own that the packs
    /// and dependencies of `roots` reach, excluding publishers already
    /// trusted and private extensions. The result holds one representative
    /// extension per publisher.
    pub async fn other_untrusted_publishers(
        &self,
        trust: &PublisherTrustStore,
        roots: &[(&GalleryExtension, &ExtensionManifest)],
    ) -> Result<Vec<GalleryExtension>> {
        let root_publishers: HashSet<String> = roots
            .iter()
            .map(|(extension, _)| extension.publisher.to_lowercase())
            .collect();

        let mut visited: HashSet<String> = roots
            .iter()
            .map(|(extension, _)| extension.identifier.key())
            .collect();
        let mut queue: Vec<String> = Vec::new();
        for (_, manifest) in roots {
            for id in manifest
                .extension_pack
                .iter()
                .chain(manifest.extension_dependencies.iter())
            {
                let key = id.to_lowercase();
                if !visited.contains(&key) {
                    visited.insert(key.clone());
                    queue.push(key);
                }
            }
        }

        let mut by_publisher: HashMap<String, GalleryExtension> = HashMap::new();
        while !queue.is_empty() {
            let identifiers: Vec<ExtensionIdentifier> = queue
                .drain(..)
                .map(ExtensionIdentifier::new)
                .collect();
            debug!("Resolving {} pack/dependency entries", identifiers.len());
            let extensions = self.gallery.get_extensions(&identifiers).await?;
            for extension in extensions {
                for id in extension
                    .extension_pack
                    .iter()
                    .chain(extension.dependencies.iter())
                {
                    let key = id.to_lowercase();
                    if !visited.contains(&key) {
                        visited.insert(key.clone());
                        queue.push(key);
                    }
                }

                if extension.private {
                    continue;
                }
                let publisher = extension.publisher.to_lowercase();
                if root_publishers.contains(&publisher)
                    || by_publisher.contains_key(&publisher)
                    || trust.is_trusted(&extension).await?
                {
                    continue;
                }
                by_publisher.insert(publisher, extension);
            }
        }

        let mut publishers: Vec<GalleryExtension> = by_publisher.into_values().collect();
        publishers.sort_by(|a, b| a.publisher_display_name.cmp(&b.publisher_display_name));
        Ok(publishers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{test_gallery_extension, test_manifest, MockGalleryClient};
    use crate::trust::{PublisherTrustEntry, TrustConfig};

    fn trust_store() -> PublisherTrustStore {
        PublisherTrustStore::new(
            Arc::new(crate::services::tests::MemoryStorage::new()),
            TrustConfig::default(),
        )
    }

    #[tokio::test]
    async fn same_publisher_members_are_not_reported() {
        let gallery = Arc::new(MockGalleryClient::new());
        gallery.add(
            test_gallery_extension("acme", "member"),
            test_manifest("acme", "member"),
        );

        let resolver = PackAndDependencyResolver::new(gallery);
        let trust = trust_store();

        let root = test_gallery_extension("acme", "pack");
        let mut manifest = test_manifest("acme", "pack");
        manifest.extension_pack = vec!["acme.member".to_string()];

        let publishers = resolver
            .other_untrusted_publishers(&trust, &[(&root, &manifest)])
            .await
            .unwrap();
        assert!(publishers.is_empty());
    }

    #[tokio::test]
    async fn transitive_dependencies_surface_foreign_publishers_once() {
        let gallery = Arc::new(MockGalleryClient::new());
        let mut direct = test_gallery_extension("other", "direct");
        direct.dependencies = vec!["other.transitive".to_string(), "third.tool".to_string()];
        gallery.add(direct, test_manifest("other", "direct"));
        gallery.add(
            test_gallery_extension("other", "transitive"),
            test_manifest("other", "transitive"),
        );
        gallery.add(
            test_gallery_extension("third", "tool"),
            test_manifest("third", "tool"),
        );

        let resolver = PackAndDependencyResolver::new(gallery);
        let trust = trust_store();

        let root = test_gallery_extension("acme", "pack");
        let mut manifest = test_manifest("acme", "pack");
        manifest.extension_pack = vec!["other.direct".to_string()];

        let publishers = resolver
            .other_untrusted_publishers(&trust, &[(&root, &manifest)])
            .await
            .unwrap();
        let names: Vec<&str> = publishers.iter().map(|p| p.publisher.as_str()).collect();
        assert_eq!(names, vec!["other", "third"]);
    }

    #[tokio::test]
    async fn trusted_and_private_publishers_are_filtered() {
        let gallery = Arc::new(MockGalleryClient::new());
        gallery.add(
            test_gallery_extension("trusted", "lib"),
            test_manifest("trusted", "lib"),
        );
        let mut private = test_gallery_extension("internal", "lib");
        private.private = true;
        gallery.add(private, test_manifest("internal", "lib"));

        let resolver = PackAndDependencyResolver::new(gallery);
        let trust = trust_store();
        trust
            .trust(vec![PublisherTrustEntry {
                publisher: "trusted".to_string(),
                publisher_display_name: "Trusted".to_string(),
            }])
            .await
            .unwrap();

        let root = test_gallery_extension("acme", "pack");
        let mut manifest = test_manifest("acme", "pack");
        manifest.extension_dependencies =
            vec!["trusted.lib".to_string(), "internal.lib".to_string()];

        let publishers = resolver
            .other_untrusted_publishers(&trust, &[(&root, &manifest)])
            .await
            .unwrap();
        assert!(publishers.is_empty());
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let gallery = Arc::new(MockGalleryClient::new());
        let mut a = test_gallery_extension("other", "a");
        a.dependencies = vec!["other.b".to_string()];
        let mut b = test_gallery_extension("other", "b");
        b.dependencies = vec!["other.a".to_string()];
        gallery.add(a, test_manifest("other", "a"));
        gallery.add(b, test_manifest("other", "b"));

        let resolver = PackAndDependencyResolver::new(gallery);
        let trust = trust_store();

        let root = test_gallery_extension("acme", "pack");
        let mut manifest = test_manifest("acme", "pack");
        manifest.extension_dependencies = vec!["other.a".to_string()];

        let publishers = resolver
            .other_untrusted_publishers(&trust, &[(&root, &manifest)])
            .await
            .unwrap();
        assert_eq!(publishers.len(), 1);
    }
}
