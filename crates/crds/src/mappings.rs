//! Resource mapping rules
//!
//! Rules translating source-side identifiers (disks, storage domains or
//! datastores, networks) into target-side identifiers (storage classes,
//! networks). Rules are supplied inline on a `VirtualMachineImport` or
//! registered in a shared `ResourceMapping`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Complete set of mapping rules for one source platform
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mappings {
    /// Source network to target network rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_mappings: Vec<NetworkMappingRule>,
    
    /// Storage domain / datastore to storage class rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_mappings: Vec<StorageMappingRule>,
    
    /// Disk to storage class rules (take precedence over storage rules)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk_mappings: Vec<DiskMappingRule>,
}

/// Identifies a source-side object by id, name, or both
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SourceRef {
    /// True when this reference carries the given id
    pub fn matches_id(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id)
    }
    
    /// True when this reference carries the given name
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// Kind of target network a source network is attached to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Cluster default (pod) network, masquerade binding
    #[default]
    Pod,
    
    /// Named external network attachment, bridge binding
    #[serde(alias = "multus")]
    Attachment,
}

/// Named target network
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTarget {
    /// Network attachment definition name
    pub name: String,
    
    /// Namespace of the attachment definition (defaults to the import namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl NetworkTarget {
    /// Name as referenced from a KubeVirt multus network (`namespace/name`)
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMappingRule {
    /// Source network (matched by network id or network name)
    pub source: SourceRef,
    
    /// Target network, required for `attachment` rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NetworkTarget>,
    
    /// Target network kind
    #[serde(rename = "type", default)]
    pub network_type: NetworkType,
}

/// PVC volume mode for an imported disk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageTarget {
    /// Storage class used for the imported volume
    pub storage_class: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageMappingRule {
    /// Source storage domain (oVirt) or datastore (VMware)
    pub source: SourceRef,
    
    pub target: StorageTarget,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<VolumeMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskMappingRule {
    /// Source disk (matched by disk id first, then by disk name)
    pub source: SourceRef,
    
    pub target: StorageTarget,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<VolumeMode>,
}

impl Mappings {
    /// Returns true when no rule of any kind is present
    pub fn is_empty(&self) -> bool {
        self.network_mappings.is_empty()
            && self.storage_mappings.is_empty()
            && self.disk_mappings.is_empty()
    }
    
    /// Merges `overrides` on top of these rules.
    ///
    /// Override rules come first so first-match lookups prefer them; a base
    /// rule is dropped when an override rule names the same source.
    pub fn merged_with(&self, overrides: &Mappings) -> Mappings {
        Mappings {
            network_mappings: merge_rules(&self.network_mappings, &overrides.network_mappings, |r| &r.source),
            storage_mappings: merge_rules(&self.storage_mappings, &overrides.storage_mappings, |r| &r.source),
            disk_mappings: merge_rules(&self.disk_mappings, &overrides.disk_mappings, |r| &r.source),
        }
    }
}

fn merge_rules<T: Clone>(base: &[T], overrides: &[T], source: impl Fn(&T) -> &SourceRef) -> Vec<T> {
    let mut merged = overrides.to_vec();
    merged.extend(
        base.iter()
            .filter(|rule| !overrides.iter().any(|o| source(o) == source(rule)))
            .cloned(),
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_rule(name: &str, class: &str) -> DiskMappingRule {
        DiskMappingRule {
            source: SourceRef { id: None, name: Some(name.to_string()) },
            target: StorageTarget { storage_class: class.to_string() },
            volume_mode: None,
        }
    }

    #[test]
    fn test_merge_override_replaces_same_source() {
        let base = Mappings {
            disk_mappings: vec![disk_rule("disk-1", "slow"), disk_rule("disk-2", "slow")],
            ..Default::default()
        };
        let overrides = Mappings {
            disk_mappings: vec![disk_rule("disk-1", "fast")],
            ..Default::default()
        };

        let merged = base.merged_with(&overrides);

        assert_eq!(merged.disk_mappings.len(), 2);
        assert_eq!(merged.disk_mappings[0].target.storage_class, "fast");
        assert_eq!(merged.disk_mappings[1].source.name.as_deref(), Some("disk-2"));
    }

    #[test]
    fn test_network_type_accepts_multus_alias() {
        let rule: NetworkMappingRule = serde_json::from_value(serde_json::json!({
            "source": {"name": "ovirtmgmt"},
            "target": {"name": "br1", "namespace": "infra"},
            "type": "multus"
        }))
        .unwrap();
        assert_eq!(rule.network_type, NetworkType::Attachment);
        assert_eq!(rule.target.unwrap().qualified_name(), "infra/br1");
    }
}
