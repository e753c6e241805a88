//! ResourceMapping CRD
//!
//! Pre-registered mapping rules shared by many imports. A
//! `VirtualMachineImport` references one by name; its inline rules win.

use crate::mappings::Mappings;
use crate::virtual_machine_import::SourcePlatform;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "vmimport.microscaler.io",
    version = "v1alpha1",
    kind = "ResourceMapping",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMappingSpec {
    /// Rules applied to oVirt imports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovirt: Option<Mappings>,
    
    /// Rules applied to VMware imports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmware: Option<Mappings>,
}

impl ResourceMappingSpec {
    /// Rules registered for the given platform
    pub fn for_platform(&self, platform: SourcePlatform) -> Option<&Mappings> {
        match platform {
            SourcePlatform::Ovirt => self.ovirt.as_ref(),
            SourcePlatform::Vmware => self.vmware.as_ref(),
        }
    }
}
