//! VirtualMachineImport CRD
//!
//! Requests the migration of one source VM (oVirt or VMware) into a KubeVirt
//! `VirtualMachine`. The controller is the only writer of the status.

use crate::conditions::Condition;
use crate::mappings::Mappings;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Ownership label stamped on every managed resource (value: import name, truncated)
pub const IMPORT_LABEL: &str = "vmimport.microscaler.io/vmimport";
/// Provenance label on the target VM (value: source platform)
pub const SOURCE_PLATFORM_LABEL: &str = "vmimport.microscaler.io/source-platform";
/// Provenance annotation on the target VM (value: source VM id)
pub const SOURCE_VM_ID_ANNOTATION: &str = "vmimport.microscaler.io/source-vm-id";
/// Blocks deletion until subordinate resources are cleaned up
pub const CLEANUP_FINALIZER: &str = "vmimport.microscaler.io/cleanup";
/// Present while the source VM was powered off by the import and may need restarting
pub const RESTORE_VM_STATE_FINALIZER: &str = "vmimport.microscaler.io/restore-vm-state";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vmimport.microscaler.io",
    version = "v1alpha1",
    kind = "VirtualMachineImport",
    namespaced,
    status = "VirtualMachineImportStatus",
    shortname = "vmimport",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".status.targetVmName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImportSpec {
    /// Secret holding the hypervisor API credentials
    pub provider_credentials_secret: ObjectReference,
    
    /// Shared ResourceMapping whose rules are merged under the inline ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_mapping: Option<ObjectReference>,
    
    /// Source platform and VM
    pub source: VirtualMachineImportSource,
    
    /// Name of the VM to create (defaults to the normalized source VM name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_vm_name: Option<String>,
    
    /// Start the target VM once the import succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_vm: Option<bool>,
    
    /// Power off a running source VM before its disks are copied
    #[serde(default = "default_cold_copy")]
    pub cold_copy: bool,
}

fn default_cold_copy() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    
    /// Namespace (defaults to the namespace of the VirtualMachineImport)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Exactly one of `ovirt` or `vmware` must be set
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImportSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovirt: Option<PlatformSource>,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmware: Option<PlatformSource>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourcePlatform {
    Ovirt,
    Vmware,
}

impl SourcePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::Ovirt => "ovirt",
            SourcePlatform::Vmware => "vmware",
        }
    }
}

impl VirtualMachineImportSource {
    /// Returns the selected platform, or `None` unless exactly one is set
    pub fn selected(&self) -> Option<(SourcePlatform, &PlatformSource)> {
        match (&self.ovirt, &self.vmware) {
            (Some(source), None) => Some((SourcePlatform::Ovirt, source)),
            (None, Some(source)) => Some((SourcePlatform::Vmware, source)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSource {
    /// Source VM, by id or by name (+ cluster)
    pub vm: SourceVmIdentity,
    
    /// Inline mapping rules (take precedence over the referenced ResourceMapping)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<Mappings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceVmIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    
    /// Cluster the named VM lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImportStatus {
    #[serde(default)]
    pub phase: ImportPhase,
    
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    
    /// Name of the created (or to-be-created) target VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_vm_name: Option<String>,
    
    /// DataVolumes created for the source disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volumes: Vec<DataVolumeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeItem {
    pub name: String,
}

/// Import lifecycle phase, declared in the order an import moves through them
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ImportPhase {
    #[default]
    New,
    Connecting,
    Validating,
    MappingResources,
    CreatingVolumes,
    PoweringOffSource,
    EnsuringGuestConversion,
    #[serde(rename = "CreatingTargetVM")]
    CreatingTargetVm,
    Succeeded,
    Failed,
    Deleting,
    CleaningUp,
    Deleted,
}

impl ImportPhase {
    /// Succeeded, Failed and Deleted imports are never advanced again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportPhase::Succeeded | ImportPhase::Failed | ImportPhase::Deleted)
    }
    
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPhase::New => "New",
            ImportPhase::Connecting => "Connecting",
            ImportPhase::Validating => "Validating",
            ImportPhase::MappingResources => "MappingResources",
            ImportPhase::CreatingVolumes => "CreatingVolumes",
            ImportPhase::PoweringOffSource => "PoweringOffSource",
            ImportPhase::EnsuringGuestConversion => "EnsuringGuestConversion",
            ImportPhase::CreatingTargetVm => "CreatingTargetVM",
            ImportPhase::Succeeded => "Succeeded",
            ImportPhase::Failed => "Failed",
            ImportPhase::Deleting => "Deleting",
            ImportPhase::CleaningUp => "CleaningUp",
            ImportPhase::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
