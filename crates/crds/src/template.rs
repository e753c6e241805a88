//! OpenShift Template
//!
//! `template.openshift.io/v1` Template, read-only. KubeVirt common templates
//! carry a VirtualMachine object plus OS, flavor and workload labels. The
//! record keeps `objects` at top level, so it is declared by hand instead of
//! through `CustomResource`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub metadata: ObjectMeta,
    
    /// Raw objects produced when the template is processed
    #[serde(default)]
    pub objects: Vec<serde_json::Value>,
    
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateParameter {
    pub name: String,
    
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl k8s_openapi::Resource for Template {
    const API_VERSION: &'static str = "template.openshift.io/v1";
    const GROUP: &'static str = "template.openshift.io";
    const KIND: &'static str = "Template";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "templates";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl k8s_openapi::Metadata for Template {
    type Ty = ObjectMeta;
    
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
    
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
