//! VM Import CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the VM import controller, plus
//! the subset of KubeVirt, CDI and OpenShift Template records the controller
//! creates or reads.

pub mod cdi;
pub mod conditions;
pub mod kubevirt;
pub mod mappings;
pub mod resource_mapping;
pub mod template;
pub mod virtual_machine_import;

pub use cdi::*;
pub use conditions::*;
pub use kubevirt::*;
pub use mappings::*;
pub use resource_mapping::*;
pub use template::*;
pub use virtual_machine_import::*;
