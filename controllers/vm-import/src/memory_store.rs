//! In-memory [`ResourceStore`] for unit tests.
//!
//! Behaves like the API server where reconcile passes can observe it:
//! resourceVersion checks on merge patches, `generateName`, status subresource
//! separation, and finalizer-gated deletion.

use crate::store::{ResourceStore, StoreError};
use chrono::{SecondsFormat, Utc};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), Value>,
    next_version: u64,
    failing_deletes: BTreeSet<String>,
}

/// In-memory store; clones share state
pub struct MemoryStore<K> {
    state: Arc<Mutex<State>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            _kind: PhantomData,
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State { next_version: 1, ..Default::default() })),
            _kind: PhantomData,
        }
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    /// Insert an object as-is, stamping a resourceVersion (for test setup)
    pub fn insert(&self, namespace: &str, object: K) -> K {
        let mut state = self.state.lock().unwrap();
        let mut value = serde_json::to_value(&object).unwrap();
        let name = value["metadata"]["name"].as_str().unwrap().to_string();
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        stamp_version(&mut state, &mut value);
        state.objects.insert((namespace.to_string(), name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Every stored object in a namespace, ordered by name
    pub fn all(&self, namespace: &str) -> Vec<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    /// Make `delete` fail for the named object
    pub fn fail_deletes_for(&self, name: &str) {
        self.state.lock().unwrap().failing_deletes.insert(name.to_string());
    }
}

fn stamp_version(state: &mut State, value: &mut Value) {
    value["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
    state.next_version += 1;
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn labels_match(value: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, expected)) => value["metadata"]["labels"][key].as_str() == Some(expected),
            None => value["metadata"]["labels"].get(term).is_some(),
        })
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn apply_patch(&self, namespace: &str, name: &str, patch: &Value, status_only: bool) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let mut current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: Self::kind(), name: name.to_string() })?;

        let mut patch = patch.clone();
        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
            let actual = current["metadata"]["resourceVersion"].as_str().unwrap_or_default();
            if expected != actual {
                return Err(StoreError::Conflict {
                    kind: Self::kind(),
                    name: name.to_string(),
                    message: format!("resourceVersion {} is stale, current is {}", expected, actual),
                });
            }
        }

        if let Some(object) = patch.as_object_mut() {
            if status_only {
                object.retain(|key, _| key == "status");
            } else {
                object.remove("status");
                if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                    metadata.remove("resourceVersion");
                }
            }
        }
        merge(&mut current, &patch);
        stamp_version(&mut state, &mut current);

        let finalizers_empty = current["metadata"]["finalizers"].as_array().is_none_or(|f| f.is_empty());
        if current["metadata"]["deletionTimestamp"].is_string() && finalizers_empty {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, current.clone());
        }
        Ok(serde_json::from_value(current)?)
    }
}

#[async_trait::async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&(namespace.to_string(), name.to_string())) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((ns, _), value)| ns == namespace && labels_match(value, label_selector))
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .collect()
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut value = serde_json::to_value(object)?;

        let name = match value["metadata"]["name"].as_str() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let prefix = value["metadata"]["generateName"].as_str().unwrap_or_default().to_string();
                let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
                format!("{}{}", prefix, suffix)
            }
        };
        if name.is_empty() {
            return Err(StoreError::Unavailable("name or generateName is required".to_string()));
        }

        let key = (namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: Self::kind(), name });
        }

        value["metadata"]["name"] = Value::String(name);
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        value["metadata"]["uid"] = Value::String(uuid::Uuid::new_v4().to_string());
        if !value["metadata"]["creationTimestamp"].is_string() {
            value["metadata"]["creationTimestamp"] =
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        stamp_version(&mut state, &mut value);
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn merge_patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError> {
        self.apply_patch(namespace, name, patch, false)
    }

    async fn merge_patch_status(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError> {
        self.apply_patch(namespace, name, patch, true)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(name) {
            return Err(StoreError::Unavailable(format!("delete of {} refused", name)));
        }

        let key = (namespace.to_string(), name.to_string());
        let Some(value) = state.objects.get_mut(&key) else {
            return Ok(());
        };
        let has_finalizers = value["metadata"]["finalizers"].as_array().is_some_and(|f| !f.is_empty());
        if has_finalizers {
            value["metadata"]["deletionTimestamp"] =
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        } else {
            state.objects.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn config_map(name: &str, generate_name: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()).filter(|n| !n.is_empty()),
                generate_name: generate_name.map(str::to_string),
                labels: Some([("app".to_string(), "vm-import".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generate_name_and_label_selection() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create("ns", &config_map("", Some("vmimport-"))).await.unwrap();
        let name = created.metadata.name.unwrap();
        assert!(name.starts_with("vmimport-") && name.len() > "vmimport-".len());

        assert_eq!(store.list("ns", "app=vm-import").await.unwrap().len(), 1);
        assert!(store.list("ns", "app=other").await.unwrap().is_empty());
        assert!(store.list("other", "app=vm-import").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create("ns", &config_map("cm", None)).await.unwrap();
        let version = created.metadata.resource_version.unwrap();

        let patch = json!({"metadata": {"resourceVersion": version, "labels": {"x": "1"}}});
        store.merge_patch("ns", "cm", &patch).await.unwrap();

        let result = store.merge_patch("ns", "cm", &patch).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_finalizers_gate_deletion() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut cm = config_map("cm", None);
        cm.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        store.insert("ns", cm);

        store.delete("ns", "cm").await.unwrap();
        let held = store.get("ns", "cm").await.unwrap().unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        store
            .merge_patch("ns", "cm", &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(store.get("ns", "cm").await.unwrap().is_none());
    }
}
