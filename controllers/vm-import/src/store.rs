//! Declarative record store.
//!
//! The orchestrator reads and writes Kubernetes objects only through
//! [`ResourceStore`], so reconcile passes can run against the API server in
//! production and against the in-memory store in tests.
//!
//! Writers that need optimistic concurrency put `metadata.resourceVersion`
//! into their merge patch; a stale version surfaces as [`StoreError::Conflict`].

use crds::{DataVolume, ResourceMapping, Template, VirtualMachine, VirtualMachineImport};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a [`ResourceStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    
    /// resourceVersion mismatch
    #[error("Conflict updating {kind} {name}: {message}")]
    Conflict { kind: String, name: String, message: String },
    
    /// Server-side failure, worth retrying
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
    
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Namespaced object store with merge-patch updates
#[async_trait::async_trait]
pub trait ResourceStore<K: Send + Sync + 'static>: Send + Sync {
    /// Get an object by name, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    /// List objects matching an equality label selector (`k=v,k2=v2`)
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError>;

    /// Create an object. An empty name with `generateName` set gets a generated name.
    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError>;

    /// JSON merge patch of the object (status is ignored)
    async fn merge_patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError>;

    /// JSON merge patch of the status subresource
    async fn merge_patch_status(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Classify API errors by status code
fn classify(error: kube::Error, kind: &str, name: &str) -> StoreError {
    if let kube::Error::Api(response) = &error {
        match response.code {
            404 => {
                return StoreError::NotFound { kind: kind.to_string(), name: name.to_string() };
            }
            409 if response.reason == "AlreadyExists" => {
                return StoreError::AlreadyExists { kind: kind.to_string(), name: name.to_string() };
            }
            409 => {
                return StoreError::Conflict {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    message: response.message.clone(),
                };
            }
            code if code >= 500 => return StoreError::Unavailable(response.message.clone()),
            _ => {}
        }
    }
    StoreError::Kube(error)
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, &K::kind(&()), name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| classify(e, &K::kind(&()), label_selector))?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        let meta = object.meta();
        let name = meta.name.clone().or_else(|| meta.generate_name.clone()).unwrap_or_default();
        self.api(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| classify(e, &K::kind(&()), &name))
    }

    async fn merge_patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError> {
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, &K::kind(&()), name))
    }

    async fn merge_patch_status(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError> {
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, &K::kind(&()), name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.api(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(e, &K::kind(&()), name) {
                StoreError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// Every store a reconcile pass touches
#[derive(Clone)]
pub struct Stores {
    pub imports: Arc<dyn ResourceStore<VirtualMachineImport>>,
    pub resource_mappings: Arc<dyn ResourceStore<ResourceMapping>>,
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    pub config_maps: Arc<dyn ResourceStore<ConfigMap>>,
    pub jobs: Arc<dyn ResourceStore<Job>>,
    pub data_volumes: Arc<dyn ResourceStore<DataVolume>>,
    pub virtual_machines: Arc<dyn ResourceStore<VirtualMachine>>,
    pub templates: Arc<dyn ResourceStore<Template>>,
}

impl Stores {
    /// Stores backed by the Kubernetes API
    pub fn kube(client: Client) -> Self {
        Self {
            imports: Arc::new(KubeStore::new(client.clone())),
            resource_mappings: Arc::new(KubeStore::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
            config_maps: Arc::new(KubeStore::new(client.clone())),
            jobs: Arc::new(KubeStore::new(client.clone())),
            data_volumes: Arc::new(KubeStore::new(client.clone())),
            virtual_machines: Arc::new(KubeStore::new(client.clone())),
            templates: Arc::new(KubeStore::new(client)),
        }
    }
}

/// Add `metadata.resourceVersion` to a merge patch so a concurrent writer causes a conflict
pub fn with_resource_version(mut patch: Value, resource_version: Option<&str>) -> Value {
    if let (Some(version), Some(object)) = (resource_version, patch.as_object_mut()) {
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("resourceVersion".to_string(), Value::String(version.to_string()));
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_resource_version_merges_into_metadata() {
        let patch = with_resource_version(json!({"metadata": {"finalizers": ["a"]}}), Some("42"));
        assert_eq!(patch, json!({"metadata": {"finalizers": ["a"], "resourceVersion": "42"}}));

        let patch = with_resource_version(json!({"status": {"phase": "New"}}), Some("7"));
        assert_eq!(patch["metadata"]["resourceVersion"], "7");

        let patch = with_resource_version(json!({"status": {}}), None);
        assert!(patch.get("metadata").is_none());
    }
}
