//! Managed resource registry.
//!
//! Every subordinate object an import creates carries the ownership label
//! [`IMPORT_LABEL`]. The label is both the relation and the lookup key:
//! a kind managed "one per import" is found by label alone, and finding
//! more than one is an inconsistency the import cannot recover from.
//!
//! Transient kinds (credential Secrets, ConfigMaps, conversion Jobs) also get
//! a controller `ownerReference` to the import, so garbage collection removes
//! them with the import even if cleanup never ran. DataVolumes and the target
//! VM outlive the import and get no owner reference.

use crate::error::ControllerError;
use crate::store::{ResourceStore, StoreError};
use crds::{IMPORT_LABEL, VirtualMachineImport};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix of every generated subordinate resource name
pub const GENERATE_NAME_PREFIX: &str = "vmimport-";

/// Kubernetes label values are limited to 63 characters
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Identity of the import that owns a subordinate resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl ImportRef {
    pub fn from_import(import: &VirtualMachineImport) -> Result<Self, ControllerError> {
        let name = import
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidSpec("VirtualMachineImport missing name".to_string()))?;
        Ok(Self {
            namespace: import.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name,
            uid: import.metadata.uid.clone(),
        })
    }

    /// Ownership label value: the import name, truncated to a valid label value
    pub fn label_value(&self) -> String {
        let truncated: String = self.name.chars().take(MAX_LABEL_VALUE_LEN).collect();
        truncated
            .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    /// Equality selector matching every resource labelled for this import
    pub fn label_selector(&self) -> String {
        format!("{}={}", IMPORT_LABEL, self.label_value())
    }

    fn owner_reference(&self) -> Option<OwnerReference> {
        let uid = self.uid.clone()?;
        Some(OwnerReference {
            api_version: VirtualMachineImport::api_version(&()).to_string(),
            kind: VirtualMachineImport::kind(&()).to_string(),
            name: self.name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

impl std::fmt::Display for ImportRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Find/create/delete of one resource kind on behalf of imports
pub struct ManagedResources<K> {
    store: Arc<dyn ResourceStore<K>>,
    owned: bool,
}

impl<K> Clone for ManagedResources<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            owned: self.owned,
        }
    }
}

impl<K> ManagedResources<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Registry for a transient kind, owned by the import
    pub fn owned(store: Arc<dyn ResourceStore<K>>) -> Self {
        Self { store, owned: true }
    }

    /// Registry for a kind that outlives the import
    pub fn unowned(store: Arc<dyn ResourceStore<K>>) -> Self {
        Self { store, owned: false }
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    /// Every resource of this kind labelled for the import
    pub async fn list_for(&self, import: &ImportRef) -> Result<Vec<K>, ControllerError> {
        Ok(self.store.list(&import.namespace, &import.label_selector()).await?)
    }

    /// The single resource of this kind labelled for the import.
    ///
    /// Returns `None` when there is none and a `ResourceConsistency` error
    /// when there are several.
    pub async fn find_for(&self, import: &ImportRef) -> Result<Option<K>, ControllerError> {
        let mut found = self.list_for(import).await?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(ControllerError::ResourceConsistency {
                kind: Self::kind(),
                import: import.to_string(),
                count,
            }),
        }
    }

    /// Create a resource for the import.
    ///
    /// Any name set by the caller is discarded in favour of a generated one.
    pub async fn create_for(&self, import: &ImportRef, mut object: K) -> Result<K, ControllerError> {
        let meta = object.meta_mut();
        meta.name = None;
        meta.generate_name = Some(GENERATE_NAME_PREFIX.to_string());
        self.stamp(import, &mut object);

        let created = self.store.create(&import.namespace, &object).await?;
        info!(
            "Created {} {} for import {}",
            Self::kind(),
            created.meta().name.as_deref().unwrap_or_default(),
            import
        );
        Ok(created)
    }

    /// Find the import's resource of this kind, creating it from `build` when absent
    pub async fn ensure_for(&self, import: &ImportRef, build: impl FnOnce() -> K) -> Result<K, ControllerError> {
        match self.find_for(import).await? {
            Some(existing) => Ok(existing),
            None => self.create_for(import, build()).await,
        }
    }

    /// Delete the import's resource of this kind. No-op when there is none.
    pub async fn delete_for(&self, import: &ImportRef) -> Result<(), ControllerError> {
        let Some(existing) = self.find_for(import).await? else {
            debug!("No {} to delete for import {}", Self::kind(), import);
            return Ok(());
        };
        let name = existing.meta().name.clone().unwrap_or_default();
        self.store.delete(&import.namespace, &name).await?;
        info!("Deleted {} {} for import {}", Self::kind(), name, import);
        Ok(())
    }

    /// Look up a resource by its deterministic name
    pub async fn find_named(&self, import: &ImportRef, name: &str) -> Result<Option<K>, ControllerError> {
        Ok(self.store.get(&import.namespace, name).await?)
    }

    /// Find a resource by the name set on `object`, creating it when absent.
    ///
    /// Used for kinds with deterministic names (one DataVolume per source
    /// disk). A concurrent create of the same name resolves to the existing object.
    /// An existing object not labelled for the import is never adopted.
    pub async fn ensure_named(&self, import: &ImportRef, mut object: K) -> Result<K, ControllerError> {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or_else(|| ControllerError::InvalidSpec(format!("{} without a name", Self::kind())))?;
        if let Some(existing) = self.store.get(&import.namespace, &name).await? {
            debug!("Reusing {} {} for import {}", Self::kind(), name, import);
            return self.owned_by(import, existing);
        }

        self.stamp(import, &mut object);
        match self.store.create(&import.namespace, &object).await {
            Ok(created) => {
                info!("Created {} {} for import {}", Self::kind(), name, import);
                Ok(created)
            }
            Err(StoreError::AlreadyExists { .. }) => {
                let existing = self
                    .store
                    .get(&import.namespace, &name)
                    .await?
                    .ok_or_else(|| ControllerError::MissingResource(format!("{} {}", Self::kind(), name)))?;
                self.owned_by(import, existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn owned_by(&self, import: &ImportRef, object: K) -> Result<K, ControllerError> {
        let label = object.meta().labels.as_ref().and_then(|l| l.get(IMPORT_LABEL));
        if label.map(String::as_str) == Some(import.label_value().as_str()) {
            return Ok(object);
        }
        Err(ControllerError::ForeignResource {
            kind: Self::kind(),
            name: object.meta().name.clone().unwrap_or_default(),
            import: import.to_string(),
        })
    }

    /// Delete a resource by name. No-op when it does not exist.
    pub async fn delete_named(&self, import: &ImportRef, name: &str) -> Result<(), ControllerError> {
        self.store.delete(&import.namespace, name).await?;
        info!("Deleted {} {} for import {}", Self::kind(), name, import);
        Ok(())
    }

    fn stamp(&self, import: &ImportRef, object: &mut K) {
        let meta = object.meta_mut();
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(IMPORT_LABEL.to_string(), import.label_value());
        if !self.owned {
            return;
        }
        if let Some(owner) = import.owner_reference() {
            let owners = meta.owner_references.get_or_insert_with(Vec::new);
            if !owners.iter().any(|o| o.uid == owner.uid) {
                owners.push(owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn import_ref(name: &str) -> ImportRef {
        ImportRef {
            namespace: "default".to_string(),
            name: name.to_string(),
            uid: Some("6f1c2a34-0000-4000-8000-000000000001".to_string()),
        }
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn registry() -> (MemoryStore<ConfigMap>, ManagedResources<ConfigMap>) {
        let store = MemoryStore::<ConfigMap>::new();
        let registry = ManagedResources::owned(Arc::new(store.clone()));
        (store, registry)
    }

    #[test]
    fn test_label_value_is_truncated_to_valid_value() {
        let long = format!("{}-{}", "a".repeat(62), "tail");
        let value = import_ref(&long).label_value();
        assert_eq!(value.len(), 62);
        assert!(value.chars().all(|c| c == 'a'));

        assert_eq!(import_ref("db01").label_value(), "db01");
    }

    #[tokio::test]
    async fn test_find_for_none_one_many() {
        let (store, registry) = registry();
        let import = import_ref("db01");
        assert!(registry.find_for(&import).await.unwrap().is_none());

        registry.create_for(&import, config_map("ignored")).await.unwrap();
        let found = registry.find_for(&import).await.unwrap().unwrap();
        assert!(found.metadata.name.unwrap().starts_with(GENERATE_NAME_PREFIX));

        let mut stray = config_map("stray");
        stray.metadata.labels = Some([(IMPORT_LABEL.to_string(), "db01".to_string())].into());
        store.insert("default", stray);

        let err = registry.find_for(&import).await.unwrap_err();
        assert!(matches!(err, ControllerError::ResourceConsistency { count: 2, .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_create_for_discards_name_and_stamps_ownership() {
        let (_store, registry) = registry();
        let long_name = "x".repeat(80);
        let import = import_ref(&long_name);

        let created = registry.create_for(&import, config_map("caller-name")).await.unwrap();

        let name = created.metadata.name.unwrap();
        assert_ne!(name, "caller-name");
        assert!(name.starts_with(GENERATE_NAME_PREFIX));
        assert_eq!(created.metadata.generate_name.as_deref(), Some(GENERATE_NAME_PREFIX));
        let labels = created.metadata.labels.unwrap();
        assert_eq!(labels[IMPORT_LABEL], "x".repeat(63));
        let owners = created.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "VirtualMachineImport");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[tokio::test]
    async fn test_unowned_registry_adds_no_owner_reference() {
        let store = MemoryStore::<ConfigMap>::new();
        let registry = ManagedResources::unowned(Arc::new(store));
        let created = registry.create_for(&import_ref("db01"), config_map("")).await.unwrap();
        assert!(created.metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn test_delete_for_is_noop_without_match() {
        let (store, registry) = registry();
        let import = import_ref("db01");
        registry.delete_for(&import).await.unwrap();

        registry.create_for(&import, config_map("")).await.unwrap();
        registry.create_for(&import_ref("other"), config_map("")).await.unwrap();
        registry.delete_for(&import).await.unwrap();

        let remaining = store.all("default");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.labels.as_ref().unwrap()[IMPORT_LABEL], "other");
    }

    #[tokio::test]
    async fn test_ensure_named_reuses_existing() {
        let (store, registry) = registry();
        let import = import_ref("db01");

        let first = registry.ensure_named(&import, config_map("db01-disk1")).await.unwrap();
        let second = registry.ensure_named(&import, config_map("db01-disk1")).await.unwrap();

        assert_eq!(first.metadata.uid, second.metadata.uid);
        assert_eq!(store.all("default").len(), 1);
        assert_eq!(registry.list_for(&import).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_named_refuses_resource_of_another_owner() {
        let (store, registry) = registry();
        store.insert("default", config_map("db01-disk1"));
        registry.ensure_named(&import_ref("other"), config_map("other-disk1")).await.unwrap();

        let err = registry.ensure_named(&import_ref("db01"), config_map("db01-disk1")).await.unwrap_err();
        assert!(matches!(err, ControllerError::ForeignResource { ref name, .. } if name == "db01-disk1"));
        assert!(err.is_permanent());
        assert_eq!(err.reason(), "ResourceConsistency");

        let err = registry.ensure_named(&import_ref("db01"), config_map("other-disk1")).await.unwrap_err();
        assert!(matches!(err, ControllerError::ForeignResource { .. }));
        assert_eq!(store.all("default").len(), 2);
    }
}
