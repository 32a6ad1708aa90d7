//! The multi-target install/uninstall orchestrator.
//!
//! Every operation resolves which targets participate, runs the trust gate
//! and workspace checks up front, then fans dispatch out to the per-target
//! services concurrently. Batches settle: one entry per extension and
//! target, each carrying its own success or error, and the lifecycle events
//! mirror those entries exactly.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ManagementError, Result};
use crate::events::{
    DidInstallExtensionEvent, DidUninstallExtensionEvent, EventBus, InstallExtensionEvent,
    ManagementEvent, UninstallExtensionEvent,
};
use crate::gate::{PublisherTrustGate, TrustCandidate};
use crate::interlock::WorkspaceTrustInterlock;
use crate::models::{
    CanInstall, ExtensionManifest, ExtensionType, GalleryExtension, InstallExtensionInfo,
    InstallExtensionResult, InstallOperation, InstallOptions, InstallResultSource, InstallSource,
    InstalledExtension, ResourceExtension, UninstallExtensionInfo, UninstallOptions,
};
use crate::services::GalleryClient;
use crate::targets::{Target, TargetRegistry};
use crate::trust::{PublisherTrustEntry, PublisherTrustStore};
use crate::workspace::WorkspaceExtensionStore;

pub struct ExtensionManagementService {
    registry: TargetRegistry,
    gallery: Arc<dyn GalleryClient>,
    trust: Arc<PublisherTrustStore>,
    gate: PublisherTrustGate,
    interlock: WorkspaceTrustInterlock,
    workspace: Arc<WorkspaceExtensionStore>,
    events: EventBus,
}

impl ExtensionManagementService {
    pub fn new(
        registry: TargetRegistry,
        gallery: Arc<dyn GalleryClient>,
        trust: Arc<PublisherTrustStore>,
        gate: PublisherTrustGate,
        interlock: WorkspaceTrustInterlock,
        workspace: Arc<WorkspaceExtensionStore>,
    ) -> Self {
        let events = EventBus::new();
        for registered in registry.targets() {
            events.forward_target(registered.target, registered.service.subscribe());
        }
        Self {
            registry,
            gallery,
            trust,
            gate,
            interlock,
            workspace,
            events,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ManagementEvent> {
        self.events.subscribe()
    }

    /// Install a gallery extension on the first eligible target (or the
    /// explicitly requested ones; language packs cover every eligible
    /// target). Returns the first installed record.
    pub async fn install(
        &self,
        extension: &GalleryExtension,
        options: InstallOptions,
    ) -> Result<InstalledExtension> {
        debug!("Installing {} from the gallery", extension.identifier.id);
        let manifest = self
            .gallery
            .get_manifest(extension)
            .await?
            .ok_or_else(|| {
                ManagementError::ManifestUnavailable(extension.display_name().to_string())
            })?;

        let synced = options.source == InstallSource::SettingsSync;
        if !synced && !options.skip_publisher_trust {
            self.gate
                .request_publisher_trust(&[TrustCandidate {
                    extension,
                    manifest: &manifest,
                    check_pack_and_dependencies: !options.donot_include_pack_and_dependencies,
                }])
                .await?;
        }
        if !synced {
            self.interlock
                .check_for_workspace_trust(&manifest, false)
                .await?;
            if !options.donot_include_pack_and_dependencies {
                self.interlock
                    .check_web_compatibility(&self.registry, extension, &manifest)
                    .await?;
            }
        }

        let targets = self.resolve_targets(extension, &manifest, &options).await?;
        self.dispatch_gallery_install(extension, &options, &targets, InstallOperation::Install)
            .await
    }

    /// Install a batch. The publisher trust gate runs once over the whole
    /// batch; a decline aborts everything. Everything past the gate settles
    /// per entry.
    pub async fn install_gallery_extensions(
        &self,
        infos: Vec<InstallExtensionInfo>,
    ) -> Result<Vec<InstallExtensionResult>> {
        debug!("Installing {} gallery extension(s)", infos.len());
        let mut manifests: Vec<Option<ExtensionManifest>> = Vec::with_capacity(infos.len());
        for info in &infos {
            manifests.push(self.gallery.get_manifest(&info.extension).await?);
        }

        let mut candidates = Vec::new();
        for (info, manifest) in infos.iter().zip(&manifests) {
            let synced = info.options.source == InstallSource::SettingsSync;
            if let Some(manifest) = manifest {
                if !synced && !info.options.skip_publisher_trust {
                    candidates.push(TrustCandidate {
                        extension: &info.extension,
                        manifest,
                        check_pack_and_dependencies: !info
                            .options
                            .donot_include_pack_and_dependencies,
                    });
                }
            }
        }
        self.gate.request_publisher_trust(&candidates).await?;

        let mut settled: Vec<InstallExtensionResult> = Vec::new();
        let mut dispatches: Vec<(usize, Target)> = Vec::new();
        for (index, (info, manifest)) in infos.iter().zip(&manifests).enumerate() {
            let failed = |error: ManagementError| InstallExtensionResult {
                identifier: info.extension.identifier.clone(),
                source: InstallResultSource::Gallery(Box::new(info.extension.clone())),
                operation: InstallOperation::Install,
                target: None,
                workspace_scoped: false,
                local: None,
                error: Some(Arc::new(error)),
            };
            let Some(manifest) = manifest else {
                settled.push(failed(ManagementError::ManifestUnavailable(
                    info.extension.display_name().to_string(),
                )));
                continue;
            };
            if info.options.source != InstallSource::SettingsSync {
                if let Err(error) = self
                    .interlock
                    .check_for_workspace_trust(manifest, false)
                    .await
                {
                    settled.push(failed(error));
                    continue;
                }
                if !info.options.donot_include_pack_and_dependencies {
                    if let Err(error) = self
                        .interlock
                        .check_web_compatibility(&self.registry, &info.extension, manifest)
                        .await
                    {
                        settled.push(failed(error));
                        continue;
                    }
                }
            }
            match self
                .resolve_targets(&info.extension, manifest, &info.options)
                .await
            {
                Ok(targets) => {
                    for target in targets {
                        dispatches.push((index, target));
                    }
                }
                Err(error) => settled.push(failed(error)),
            }
        }

        let mut futures = Vec::new();
        for (index, target) in &dispatches {
            let info = &infos[*index];
            let Some(registered) = self.registry.get(*target) else {
                continue;
            };
            self.events
                .emit(ManagementEvent::InstallExtension(InstallExtensionEvent {
                    identifier: info.extension.identifier.clone(),
                    target: Some(*target),
                    workspace_scoped: false,
                }));
            let service = Arc::clone(&registered.service);
            futures.push(async move {
                service
                    .install_from_gallery(&info.extension, &info.options)
                    .await
            });
        }
        let results = join_all(futures).await;

        let mut events = Vec::new();
        for ((index, target), result) in dispatches.iter().zip(results) {
            let info = &infos[*index];
            let (local, error) = match result {
                Ok(local) => (Some(local), None),
                Err(error) => {
                    warn!(
                        "Failed to install {} on {}: {error}",
                        info.extension.identifier.id,
                        target.default_label()
                    );
                    (None, Some(Arc::new(error)))
                }
            };
            events.push(DidInstallExtensionEvent {
                identifier: info.extension.identifier.clone(),
                operation: InstallOperation::Install,
                target: Some(*target),
                workspace_scoped: false,
                local: local.clone(),
                error: error.clone(),
            });
            settled.push(InstallExtensionResult {
                identifier: info.extension.identifier.clone(),
                source: InstallResultSource::Gallery(Box::new(info.extension.clone())),
                operation: InstallOperation::Install,
                target: Some(*target),
                workspace_scoped: false,
                local,
                error,
            });
        }
        if !events.is_empty() {
            self.events.emit(ManagementEvent::DidInstallExtensions(events));
        }

        Ok(settled)
    }

    /// Install from a packaged archive. The archive's manifest decides the
    /// targets; an empty set is unsupported.
    pub async fn install_from_archive(
        &self,
        archive: &Url,
        options: InstallOptions,
    ) -> Result<InstalledExtension> {
        let manifest = self.get_manifest(archive).await?;
        let targets = self.registry.archive_targets(&manifest);
        if targets.is_empty() {
            return Err(ManagementError::Unsupported {
                extension: manifest.display_name().to_string(),
                target: None,
            });
        }
        self.interlock
            .check_for_workspace_trust(&manifest, false)
            .await?;

        let identifier = crate::models::ExtensionIdentifier::new(manifest.id());
        let mut services = Vec::new();
        for target in &targets {
            let Some(registered) = self.registry.get(*target) else {
                continue;
            };
            self.events
                .emit(ManagementEvent::InstallExtension(InstallExtensionEvent {
                    identifier: identifier.clone(),
                    target: Some(*target),
                    workspace_scoped: false,
                }));
            services.push((*target, Arc::clone(&registered.service)));
        }
        let results = join_all(services.iter().map(|(_, service)| {
            let service = Arc::clone(service);
            let options = &options;
            async move { service.install(archive, options).await }
        }))
        .await;

        self.settle_single_install(&identifier, InstallOperation::Install, &services, results)
    }

    /// Read the manifest out of an archive, routed by the archive's scheme.
    pub async fn get_manifest(&self, archive: &Url) -> Result<ExtensionManifest> {
        let registered = self.registry.target_for_location(archive)?;
        registered.service.get_manifest(archive).await
    }

    /// Install whatever extension lives at `location` on the target its
    /// scheme routes to. A missing target is a hard error.
    pub async fn install_from_location(
        &self,
        location: &Url,
        profile_location: Option<&Url>,
    ) -> Result<InstalledExtension> {
        let registered = self.registry.target_for_location(location)?;
        info!(
            "Installing extension from {location} on the {} target",
            registered.label
        );
        registered
            .service
            .install_from_location(location, profile_location)
            .await
    }

    /// Install a resource extension. Workspace-scoped installs always go
    /// through the workspace trust handshake and land in the workspace
    /// store; anything else routes by location.
    pub async fn install_resource_extension(
        &self,
        extension: &ResourceExtension,
        options: InstallOptions,
    ) -> Result<InstalledExtension> {
        if !options.is_workspace_scoped {
            return self
                .install_from_location(&extension.location, options.profile_location.as_ref())
                .await;
        }

        self.interlock
            .check_for_workspace_trust(&extension.manifest, true)
            .await?;

        self.events
            .emit(ManagementEvent::InstallExtension(InstallExtensionEvent {
                identifier: extension.identifier.clone(),
                target: None,
                workspace_scoped: true,
            }));
        match self.workspace.install(extension).await {
            Ok(installed) => {
                self.events.emit(ManagementEvent::DidInstallExtensions(vec![
                    DidInstallExtensionEvent {
                        identifier: installed.identifier.clone(),
                        operation: InstallOperation::Install,
                        target: None,
                        workspace_scoped: true,
                        local: Some(installed.clone()),
                        error: None,
                    },
                ]));
                Ok(installed)
            }
            Err(error) => {
                let error = Arc::new(error);
                self.events.emit(ManagementEvent::DidInstallExtensions(vec![
                    DidInstallExtensionEvent {
                        identifier: extension.identifier.clone(),
                        operation: InstallOperation::Install,
                        target: None,
                        workspace_scoped: true,
                        local: None,
                        error: Some(error.clone()),
                    },
                ]));
                Err(ManagementError::Multiple(vec![error.to_string()]))
            }
        }
    }

    /// Update an installed extension in place on the target(s) it occupies.
    pub async fn update_from_gallery(
        &self,
        extension: &GalleryExtension,
        installed: &InstalledExtension,
        mut options: InstallOptions,
    ) -> Result<InstalledExtension> {
        options.is_application_scoped = installed.is_application_scoped;
        let targets: Vec<Target> = if installed.manifest.is_language_pack() {
            self.registry
                .targets()
                .iter()
                .map(|r| r.target)
                .filter(|t| *t != Target::Web)
                .collect()
        } else {
            let target = match installed.target {
                Some(target) => target,
                None => self.registry.target_for_location(&installed.location)?.target,
            };
            vec![target]
        };
        self.dispatch_gallery_install(extension, &options, &targets, InstallOperation::Update)
            .await
    }

    pub async fn uninstall(
        &self,
        extension: InstalledExtension,
        options: UninstallOptions,
    ) -> Result<()> {
        self.uninstall_extensions(vec![UninstallExtensionInfo { extension, options }])
            .await
    }

    /// Uninstall a batch. Language packs are expanded to every target that
    /// holds a copy; removing an extension from the local target is refused
    /// while remote workspace extensions still depend on it.
    pub async fn uninstall_extensions(&self, infos: Vec<UninstallExtensionInfo>) -> Result<()> {
        let mut workspace_scoped = Vec::new();
        let mut targeted: Vec<(Target, UninstallExtensionInfo)> = Vec::new();
        for info in infos {
            if info.extension.is_workspace_scoped {
                workspace_scoped.push(info);
                continue;
            }
            let target = match info.extension.target {
                Some(target) => target,
                None => self.registry.target_for_location(&info.extension.location)?.target,
            };
            targeted.push((target, info));
        }

        let mut expanded = Vec::new();
        for (target, info) in &targeted {
            if !info.extension.manifest.is_language_pack() {
                continue;
            }
            for registered in self.registry.targets() {
                if registered.target == *target {
                    continue;
                }
                let installed = registered
                    .service
                    .get_installed(Some(ExtensionType::User), None)
                    .await?;
                let Some(copy) = installed
                    .into_iter()
                    .find(|e| !e.is_builtin && e.identifier.same(&info.extension.identifier))
                else {
                    continue;
                };
                let already_listed = targeted.iter().any(|(t, i)| {
                    *t == registered.target && i.extension.identifier.same(&copy.identifier)
                });
                if !already_listed {
                    debug!(
                        "Also uninstalling language pack {} from the {} target",
                        copy.identifier.id,
                        registered.label
                    );
                    expanded.push((
                        registered.target,
                        UninstallExtensionInfo {
                            extension: copy,
                            options: info.options.clone(),
                        },
                    ));
                }
            }
        }
        targeted.extend(expanded);

        // A dependents hit fails the local group only; everything else in
        // the batch still proceeds.
        let blocked = self.check_for_dependents(&targeted).await?;
        if let Some(error) = &blocked {
            warn!("Skipping local uninstalls: {error}");
            targeted.retain(|(target, _)| *target != Target::Local);
        }

        let mut errors: Vec<String> = Vec::new();
        for info in &workspace_scoped {
            self.events
                .emit(ManagementEvent::UninstallExtension(UninstallExtensionEvent {
                    identifier: info.extension.identifier.clone(),
                    target: None,
                    workspace_scoped: true,
                }));
            let error = self
                .workspace
                .uninstall(&info.extension.identifier)
                .await
                .err()
                .map(Arc::new);
            if let Some(error) = &error {
                errors.push(error.to_string());
            }
            self.events.emit(ManagementEvent::DidUninstallExtension(
                DidUninstallExtensionEvent {
                    identifier: info.extension.identifier.clone(),
                    target: None,
                    workspace_scoped: true,
                    error,
                },
            ));
        }

        let mut groups: Vec<(Target, Vec<UninstallExtensionInfo>)> = Vec::new();
        for (target, info) in targeted {
            match groups.iter_mut().find(|(t, _)| *t == target) {
                Some((_, group)) => group.push(info),
                None => groups.push((target, vec![info])),
            }
        }

        let mut futures = Vec::new();
        for (target, group) in &groups {
            let Some(registered) = self.registry.get(*target) else {
                errors.push(
                    ManagementError::TargetNotConfigured(target.default_label().to_string())
                        .to_string(),
                );
                continue;
            };
            for info in group {
                self.events
                    .emit(ManagementEvent::UninstallExtension(UninstallExtensionEvent {
                        identifier: info.extension.identifier.clone(),
                        target: Some(*target),
                        workspace_scoped: false,
                    }));
            }
            let service = Arc::clone(&registered.service);
            let target = *target;
            futures.push(async move { (target, service.uninstall_extensions(group).await) });
        }
        let results = join_all(futures).await;

        for ((target, group), (_, result)) in groups
            .iter()
            .filter(|(t, _)| self.registry.is_configured(*t))
            .zip(results)
        {
            let error = match result {
                Ok(()) => None,
                Err(error) => {
                    warn!(
                        "Failed to uninstall from the {} target: {error}",
                        target.default_label()
                    );
                    errors.push(error.to_string());
                    Some(Arc::new(error))
                }
            };
            for info in group {
                self.events.emit(ManagementEvent::DidUninstallExtension(
                    DidUninstallExtensionEvent {
                        identifier: info.extension.identifier.clone(),
                        target: Some(*target),
                        workspace_scoped: false,
                        error: error.clone(),
                    },
                ));
            }
        }

        match blocked {
            Some(error) if errors.is_empty() => Err(error),
            Some(error) => {
                errors.insert(0, error.to_string());
                Err(ManagementError::Multiple(errors))
            }
            None if errors.is_empty() => Ok(()),
            None => Err(ManagementError::Multiple(errors)),
        }
    }

    /// Everything installed anywhere: every target plus the workspace store
    /// (invalid workspace entries included, flagged as such).
    pub async fn get_installed(
        &self,
        kind: Option<ExtensionType>,
        profile_location: Option<&Url>,
    ) -> Result<Vec<InstalledExtension>> {
        let results = join_all(self.registry.targets().iter().map(|registered| {
            let service = Arc::clone(&registered.service);
            async move { service.get_installed(kind, profile_location).await }
        }))
        .await;
        let mut installed = Vec::new();
        for result in results {
            installed.extend(result?);
        }
        installed.extend(self.workspace.get_installed(true).await);
        Ok(installed)
    }

    /// Whether the current target configuration can host the extension at
    /// all. Each configured target's own service gets the final say.
    pub async fn can_install(&self, extension: &GalleryExtension) -> Result<CanInstall> {
        if let Some(local) = self.registry.get(Target::Local) {
            if local.service.can_install(extension).await? {
                return Ok(CanInstall::Installable);
            }
        }
        let Some(manifest) = self.gallery.get_manifest(extension).await? else {
            return Ok(CanInstall::Incompatible(
                ManagementError::ManifestUnavailable(extension.display_name().to_string())
                    .to_string(),
            ));
        };
        if let Some(remote) = self.registry.get(Target::Remote) {
            if manifest.can_execute_on_workspace() && remote.service.can_install(extension).await? {
                return Ok(CanInstall::Installable);
            }
        }
        if let Some(web) = self.registry.get(Target::Web) {
            if manifest.can_execute_on_web() && web.service.can_install(extension).await? {
                return Ok(CanInstall::Installable);
            }
        }
        Ok(CanInstall::Incompatible(format!(
            "Cannot install the '{}' extension in this configuration",
            extension.display_name()
        )))
    }

    pub async fn trusted_publishers(&self) -> Result<Vec<PublisherTrustEntry>> {
        self.trust.trusted_publishers().await
    }

    pub async fn trust_publishers(&self, entries: Vec<PublisherTrustEntry>) -> Result<()> {
        self.trust.trust(entries).await
    }

    pub async fn untrust_publishers(&self, publishers: &[&str]) -> Result<()> {
        self.trust.untrust(publishers).await
    }

    async fn resolve_targets(
        &self,
        extension: &GalleryExtension,
        manifest: &ExtensionManifest,
        options: &InstallOptions,
    ) -> Result<Vec<Target>> {
        let eligible = self.registry.eligible_targets(manifest)?;
        let mut targets = if options.install_only_on.is_empty() {
            if manifest.is_language_pack() {
                eligible
            } else {
                // One extension, one server: the first eligible target wins.
                eligible.into_iter().take(1).collect()
            }
        } else {
            for target in &options.install_only_on {
                let registered = self.registry.get(*target).ok_or_else(|| {
                    ManagementError::TargetNotConfigured(target.default_label().to_string())
                })?;
                if !eligible.contains(target) {
                    return Err(ManagementError::Unsupported {
                        extension: extension.display_name().to_string(),
                        target: Some(registered.label.clone()),
                    });
                }
            }
            options.install_only_on.clone()
        };
        // A synced extension lands on the local target too whenever it can.
        if options.source == InstallSource::SettingsSync && !targets.contains(&Target::Local) {
            if let Some(local) = self.registry.get(Target::Local) {
                if local.service.can_install(extension).await? {
                    targets.push(Target::Local);
                }
            }
        }
        Ok(targets)
    }

    async fn dispatch_gallery_install(
        &self,
        extension: &GalleryExtension,
        options: &InstallOptions,
        targets: &[Target],
        operation: InstallOperation,
    ) -> Result<InstalledExtension> {
        let mut services = Vec::new();
        for target in targets {
            let registered = self.registry.get(*target).ok_or_else(|| {
                ManagementError::TargetNotConfigured(target.default_label().to_string())
            })?;
            self.events
                .emit(ManagementEvent::InstallExtension(InstallExtensionEvent {
                    identifier: extension.identifier.clone(),
                    target: Some(*target),
                    workspace_scoped: false,
                }));
            services.push((*target, Arc::clone(&registered.service)));
        }

        let results = join_all(services.iter().map(|(_, service)| {
            let service = Arc::clone(service);
            async move { service.install_from_gallery(extension, options).await }
        }))
        .await;

        self.settle_single_install(&extension.identifier, operation, &services, results)
    }

    fn settle_single_install(
        &self,
        identifier: &crate::models::ExtensionIdentifier,
        operation: InstallOperation,
        services: &[(Target, Arc<dyn crate::services::TargetManagementService>)],
        results: Vec<Result<InstalledExtension>>,
    ) -> Result<InstalledExtension> {
        let mut events = Vec::new();
        let mut installed = None;
        let mut errors = Vec::new();
        for ((target, _), result) in services.iter().zip(results) {
            match result {
                Ok(local) => {
                    if installed.is_none() {
                        installed = Some(local.clone());
                    }
                    events.push(DidInstallExtensionEvent {
                        identifier: identifier.clone(),
                        operation,
                        target: Some(*target),
                        workspace_scoped: false,
                        local: Some(local),
                        error: None,
                    });
                }
                Err(error) => {
                    warn!(
                        "Failed to install {} on {}: {error}",
                        identifier.id,
                        target.default_label()
                    );
                    let error = Arc::new(error);
                    errors.push(error.to_string());
                    events.push(DidInstallExtensionEvent {
                        identifier: identifier.clone(),
                        operation,
                        target: Some(*target),
                        workspace_scoped: false,
                        local: None,
                        error: Some(error),
                    });
                }
            }
        }
        self.events.emit(ManagementEvent::DidInstallExtensions(events));

        installed.ok_or(ManagementError::Multiple(errors))
    }

    async fn check_for_dependents(
        &self,
        targeted: &[(Target, UninstallExtensionInfo)],
    ) -> Result<Option<ManagementError>> {
        let Some(remote) = self.registry.get(Target::Remote) else {
            return Ok(None);
        };
        let locals: Vec<&UninstallExtensionInfo> = targeted
            .iter()
            .filter(|(target, _)| *target == Target::Local)
            .map(|(_, info)| info)
            .collect();
        if locals.is_empty() {
            return Ok(None);
        }

        let remote_installed = remote
            .service
            .get_installed(Some(ExtensionType::User), None)
            .await?;
        for info in locals {
            let dependents: Vec<String> = remote_installed
                .iter()
                .filter(|e| {
                    !e.is_builtin
                        && !e.manifest.prefers_execute_on_ui()
                        && !targeted
                            .iter()
                            .any(|(_, i)| i.extension.identifier.same(&e.identifier))
                        && e.manifest
                            .extension_dependencies
                            .iter()
                            .any(|d| d.eq_ignore_ascii_case(&info.extension.identifier.id))
                })
                .map(|e| e.display_name().to_string())
                .collect();
            if !dependents.is_empty() {
                return Ok(Some(ManagementError::DependentsExist {
                    extension: info.extension.display_name().to_string(),
                    dependents: dependents.join(", "),
                }));
            }
        }
        Ok(None)
    }
}
