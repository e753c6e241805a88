//! Template resolver.
//!
//! Finds the KubeVirt common template for a resolved OS and turns its
//! `VirtualMachine` object into the skeleton the mapper fills in.

use crate::error::ControllerError;
use crate::store::ResourceStore;
use crds::{FLAVOR_LABEL_PREFIX, OS_LABEL_PREFIX, Template, VirtualMachineSpec, WORKLOAD_LABEL_PREFIX};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Flavors searched, in order
const FLAVORS: &[&str] = &["small", "medium"];
/// Workloads searched within each flavor, in order
const WORKLOADS: &[&str] = &["server", "desktop"];

/// Label naming the template a VM was created from
pub const TEMPLATE_NAME_LABEL: &str = "vm.kubevirt.io/template";
pub const TEMPLATE_NAMESPACE_LABEL: &str = "vm.kubevirt.io/template.namespace";

/// Template parameter holding the VM name
const NAME_PARAMETER: &str = "NAME";

/// VM skeleton produced from a template
#[derive(Debug, Clone, Default)]
pub struct VmSkeleton {
    /// Labels for the target VM record
    pub labels: BTreeMap<String, String>,
    pub spec: VirtualMachineSpec,
}

/// Find the template for `os` in `namespace`.
///
/// Searches flavor `small` then `medium`, and within each the `server` then
/// `desktop` workload. The first combination with any match wins; among its
/// matches the newest one is chosen (the first listed on a tie).
pub async fn find_template(
    templates: &dyn ResourceStore<Template>,
    namespace: &str,
    os: &str,
) -> Result<Template, ControllerError> {
    for flavor in FLAVORS {
        for workload in WORKLOADS {
            let selector = format!(
                "{}{}=true,{}{}=true,{}{}=true",
                OS_LABEL_PREFIX, os, WORKLOAD_LABEL_PREFIX, workload, FLAVOR_LABEL_PREFIX, flavor
            );
            let candidates = templates.list(namespace, &selector).await?;
            debug!("{} template(s) match {}", candidates.len(), selector);
            if let Some(template) = newest(candidates) {
                info!(
                    "Using template {}/{} ({}, {}) for OS {}",
                    namespace,
                    template.metadata.name.as_deref().unwrap_or_default(),
                    flavor,
                    workload,
                    os
                );
                return Ok(template);
            }
        }
    }
    Err(ControllerError::TemplateNotFound(os.to_string()))
}

fn newest(candidates: Vec<Template>) -> Option<Template> {
    let mut best: Option<Template> = None;
    for candidate in candidates {
        let newer = match &best {
            None => true,
            Some(current) => candidate.metadata.creation_timestamp > current.metadata.creation_timestamp,
        };
        if newer {
            best = Some(candidate);
        }
    }
    best
}

/// Process a template into a VM skeleton named `vm_name`.
///
/// `${PARAM}` references are replaced with parameter values; `NAME` is always
/// the target VM name.
pub fn process_template(template: &Template, vm_name: &str) -> Result<VmSkeleton, ControllerError> {
    let template_name = template.metadata.name.clone().unwrap_or_default();
    let object = template
        .objects
        .iter()
        .find(|o| o.get("kind").and_then(Value::as_str) == Some("VirtualMachine"))
        .ok_or_else(|| {
            ControllerError::Mapping(format!("template {} has no VirtualMachine object", template_name))
        })?;

    let mut parameters: HashMap<&str, &str> = template
        .parameters
        .iter()
        .filter_map(|p| p.value.as_deref().map(|v| (p.name.as_str(), v)))
        .collect();
    parameters.insert(NAME_PARAMETER, vm_name);

    let mut object = object.clone();
    substitute(&mut object, &parameters);

    let spec: VirtualMachineSpec = serde_json::from_value(object.get("spec").cloned().unwrap_or(Value::Null))
        .map_err(|e| ControllerError::Mapping(format!("template {} VirtualMachine spec: {}", template_name, e)))?;
    let mut labels: BTreeMap<String, String> = object
        .pointer("/metadata/labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default();
    labels.insert(TEMPLATE_NAME_LABEL.to_string(), template_name);
    if let Some(namespace) = &template.metadata.namespace {
        labels.insert(TEMPLATE_NAMESPACE_LABEL.to_string(), namespace.clone());
    }

    Ok(VmSkeleton { labels, spec })
}

fn substitute(value: &mut Value, parameters: &HashMap<&str, &str>) {
    match value {
        Value::String(s) if s.contains("${") => {
            for (name, replacement) in parameters {
                *s = s.replace(&format!("${{{}}}", name), replacement);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, parameters)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, parameters)),
        _ => {}
    }
}
