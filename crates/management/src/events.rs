//! Lifecycle events produced by the orchestrator.
//!
//! One outward-facing broadcast channel carries every event; per-target
//! streams are forwarded into it with the originating target tag, so
//! listeners never need to know how many targets exist.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::ManagementError;
use crate::models::{ExtensionIdentifier, InstallOperation, InstalledExtension};
use crate::targets::Target;

#[derive(Debug, Clone)]
pub struct InstallExtensionEvent {
    pub identifier: ExtensionIdentifier,
    pub target: Option<Target>,
    pub workspace_scoped: bool,
}

#[derive(Debug, Clone)]
pub struct DidInstallExtensionEvent {
    pub identifier: ExtensionIdentifier,
    pub operation: InstallOperation,
    pub target: Option<Target>,
    pub workspace_scoped: bool,
    pub local: Option<InstalledExtension>,
    pub error: Option<Arc<ManagementError>>,
}

#[derive(Debug, Clone)]
pub struct UninstallExtensionEvent {
    pub identifier: ExtensionIdentifier,
    pub target: Option<Target>,
    pub workspace_scoped: bool,
}

#[derive(Debug, Clone)]
pub struct DidUninstallExtensionEvent {
    pub identifier: ExtensionIdentifier,
    pub target: Option<Target>,
    pub workspace_scoped: bool,
    pub error: Option<Arc<ManagementError>>,
}

#[derive(Debug, Clone)]
pub enum ManagementEvent {
    /// Fired synchronously before an install is dispatched.
    InstallExtension(InstallExtensionEvent),
    /// One entry per extension x target, each independently settled.
    DidInstallExtensions(Vec<DidInstallExtensionEvent>),
    UninstallExtension(UninstallExtensionEvent),
    DidUninstallExtension(DidUninstallExtensionEvent),
    /// A target's active profile changed.
    DidChangeProfile(Target),
}

/// Events a single target's management service may emit on its own.
#[derive(Debug, Clone)]
pub enum TargetEvent {
    InstallExtension(InstallExtensionEvent),
    DidInstallExtensions(Vec<DidInstallExtensionEvent>),
    UninstallExtension(UninstallExtensionEvent),
    DidUninstallExtension(DidUninstallExtensionEvent),
    DidChangeProfile,
}

impl TargetEvent {
    /// Tag the event with the target it originated from.
    pub fn into_management(self, target: Target) -> ManagementEvent {
        match self {
            TargetEvent::InstallExtension(mut e) => {
                e.target = Some(target);
                ManagementEvent::InstallExtension(e)
            }
            TargetEvent::DidInstallExtensions(mut entries) => {
                for entry in &mut entries {
                    entry.target = Some(target);
                }
                ManagementEvent::DidInstallExtensions(entries)
            }
            TargetEvent::UninstallExtension(mut e) => {
                e.target = Some(target);
                ManagementEvent::UninstallExtension(e)
            }
            TargetEvent::DidUninstallExtension(mut e) => {
                e.target = Some(target);
                ManagementEvent::DidUninstallExtension(e)
            }
            TargetEvent::DidChangeProfile => ManagementEvent::DidChangeProfile(target),
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-in event channel. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ManagementEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagementEvent> {
        self.sender.subscribe()
    }

    /// Send ignoring the no-subscribers case.
    pub fn emit(&self, event: ManagementEvent) {
        let _ = self.sender.send(event);
    }

    /// Forward a target's event stream into this bus, tagging every event
    /// with the originating target.
    pub fn forward_target(&self, target: Target, mut source: broadcast::Receiver<TargetEvent>) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        let _ = sender.send(event.into_management(target));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
