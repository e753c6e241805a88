//! CDI DataVolume
//!
//! The subset of `cdi.kubevirt.io/v1beta1` DataVolume used to copy source
//! disks: an imageio source for oVirt and a VDDK source for VMware.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::mappings::VolumeMode;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    namespaced,
    status = "DataVolumeStatus",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    pub source: DataVolumeSource,
    
    pub pvc: DataVolumePvc,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imageio: Option<ImageioSource>,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vddk: Option<VddkSource>,
}

/// oVirt imageio transfer of one disk
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageioSource {
    pub url: String,
    pub secret_ref: String,
    
    /// ConfigMap holding the engine CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
    
    pub disk_id: String,
}

/// VMware VDDK transfer of one disk
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VddkSource {
    pub url: String,
    pub secret_ref: String,
    pub uuid: String,
    pub backing_file: String,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumePvc {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    
    pub resources: PvcResources,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<VolumeMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PvcResources {
    pub requests: PvcRequests,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PvcRequests {
    /// Requested size as a Kubernetes quantity
    pub storage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// CDI phase (Pending, ImportScheduled, ImportInProgress, Succeeded, Failed, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    
    /// Copy progress, e.g. "45.00%"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

impl DataVolume {
    fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }
    
    /// Copy finished
    pub fn is_succeeded(&self) -> bool {
        self.phase() == Some("Succeeded")
    }
    
    /// Copy failed and CDI gave up
    pub fn is_failed(&self) -> bool {
        self.phase() == Some("Failed")
    }
}
