//! # Resource Store
//!
//! In-memory declarative state for NVMe subsystems and controllers.
//!
//! The store is an explicit object shared by reference (`Arc<ResourceStore>`)
//! between the control service and the hot-plug orchestrator, so every test
//! can run against an isolated instance. It provides exact-match lookups by
//! canonical name and the naming helpers used to build those names.
//!
//! ## Naming
//!
//! ```text
//! resource id  "nvme-43"
//! name         "//storage.opiproject.org/volumes/nvme-43"
//! ```
//!
//! [`resource_id_from_name`] is the inverse (last path segment), so a
//! controller's subsystem reference resolves to the directory key used by
//! [`crate::controller_dir`].

use crate::constants::RESOURCE_NAME_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

// =============================================================================
// Naming Helpers
// =============================================================================

/// Builds the canonical resource name for a resource id.
#[must_use]
pub fn resource_id_to_volume_name(resource_id: &str) -> String {
    format!("{RESOURCE_NAME_PREFIX}{resource_id}")
}

/// Extracts the resource id (last path segment) from a resource name.
#[must_use]
pub fn resource_id_from_name(name: &str) -> &str {
    name.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(name)
}

/// Generates a system-assigned resource id.
#[must_use]
pub fn generate_resource_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

// =============================================================================
// Resource Types
// =============================================================================

/// An NVMe subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeSubsystem {
    /// Canonical resource name.
    pub name: String,
    /// NVMe qualified name.
    pub nqn: String,
}

/// PCIe endpoint requested for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PcieEndpoint {
    /// Physical function.
    pub physical_function: i32,
    /// Virtual function.
    #[serde(default)]
    pub virtual_function: i32,
}

/// Desired state of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NvmeControllerSpec {
    /// Name of the owning subsystem.
    #[serde(default)]
    pub subsystem_id: Option<String>,
    /// Requested PCIe endpoint.
    #[serde(default)]
    pub pcie_id: Option<PcieEndpoint>,
    /// Host-assigned controller id.
    #[serde(default)]
    pub nvme_controller_id: i32,
}

/// Observed state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NvmeControllerStatus {
    /// Controller is attached to the VM.
    pub active: bool,
}

/// An NVMe controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NvmeController {
    /// Canonical resource name.
    #[serde(default)]
    pub name: String,
    /// Desired state.
    pub spec: NvmeControllerSpec,
    /// Observed state.
    #[serde(default)]
    pub status: NvmeControllerStatus,
}

// =============================================================================
// Store
// =============================================================================

/// Subsystem and controller maps keyed by canonical name.
#[derive(Debug, Default)]
pub struct ResourceStore {
    subsystems: RwLock<HashMap<String, NvmeSubsystem>>,
    controllers: RwLock<HashMap<String, NvmeController>>,
}

impl ResourceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a subsystem by name.
    pub async fn subsystem(&self, name: &str) -> Option<NvmeSubsystem> {
        self.subsystems.read().await.get(name).cloned()
    }

    /// Inserts or replaces a subsystem. Returns the previous value.
    pub async fn insert_subsystem(&self, subsystem: NvmeSubsystem) -> Option<NvmeSubsystem> {
        self.subsystems
            .write()
            .await
            .insert(subsystem.name.clone(), subsystem)
    }

    /// Removes a subsystem.
    pub async fn remove_subsystem(&self, name: &str) -> Option<NvmeSubsystem> {
        self.subsystems.write().await.remove(name)
    }

    /// Looks up a controller by name.
    pub async fn controller(&self, name: &str) -> Option<NvmeController> {
        self.controllers.read().await.get(name).cloned()
    }

    /// Inserts or replaces a controller under `name`.
    pub async fn insert_controller(
        &self,
        name: impl Into<String>,
        controller: NvmeController,
    ) -> Option<NvmeController> {
        self.controllers
            .write()
            .await
            .insert(name.into(), controller)
    }

    /// Removes a controller.
    pub async fn remove_controller(&self, name: &str) -> Option<NvmeController> {
        self.controllers.write().await.remove(name)
    }

    /// Updates the `active` flag of a controller. Returns false if unknown.
    pub async fn set_controller_active(&self, name: &str, active: bool) -> bool {
        match self.controllers.write().await.get_mut(name) {
            Some(controller) => {
                controller.status.active = active;
                true
            }
            None => false,
        }
    }

    /// Returns all controllers sorted by name.
    pub async fn controllers(&self) -> Vec<NvmeController> {
        let mut controllers: Vec<_> = self.controllers.read().await.values().cloned().collect();
        controllers.sort_by(|a, b| a.name.cmp(&b.name));
        controllers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let name = resource_id_to_volume_name("subsystem0");
        assert_eq!(name, "//storage.opiproject.org/volumes/subsystem0");
        assert_eq!(resource_id_from_name(&name), "subsystem0");
    }

    #[test]
    fn test_resource_id_from_plain_id() {
        assert_eq!(resource_id_from_name("nvme-43"), "nvme-43");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_resource_id(), generate_resource_id());
    }

    #[tokio::test]
    async fn test_controller_active_flag() {
        let store = ResourceStore::new();
        let name = resource_id_to_volume_name("nvme-43");
        store
            .insert_controller(name.clone(), NvmeController::default())
            .await;

        assert!(store.set_controller_active(&name, true).await);
        assert!(store.controller(&name).await.unwrap().status.active);
        assert!(!store.set_controller_active("unknown", true).await);
    }

    #[tokio::test]
    async fn test_controllers_sorted_and_removable() {
        let store = ResourceStore::new();
        for id in ["b", "a"] {
            let name = resource_id_to_volume_name(id);
            let controller = NvmeController {
                name: name.clone(),
                ..NvmeController::default()
            };
            store.insert_controller(name, controller).await;
        }

        let names: Vec<_> = store.controllers().await.into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![resource_id_to_volume_name("a"), resource_id_to_volume_name("b")]
        );

        assert!(store.remove_controller(&names[0]).await.is_some());
        assert_eq!(store.controllers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_subsystem_replace_and_remove() {
        let store = ResourceStore::new();
        let subsystem = NvmeSubsystem {
            name: resource_id_to_volume_name("subsystem0"),
            nqn: "nqn.a".to_string(),
        };
        assert!(store.insert_subsystem(subsystem.clone()).await.is_none());

        let replaced = NvmeSubsystem {
            nqn: "nqn.b".to_string(),
            ..subsystem.clone()
        };
        assert_eq!(store.insert_subsystem(replaced).await, Some(subsystem));
        assert!(store.remove_subsystem(&resource_id_to_volume_name("subsystem0")).await.is_some());
        assert!(store.subsystem(&resource_id_to_volume_name("subsystem0")).await.is_none());
    }
}
