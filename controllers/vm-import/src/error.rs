//! Controller-specific error types.
//!
//! Errors are split into permanent ones, which fail the import, and
//! transient ones, which are retried with backoff on a later pass.

use crate::store::StoreError;
use hypervisor_client::HypervisorError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the VM Import Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),
    
    /// Record store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    
    /// Source hypervisor error
    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),
    
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    
    /// Import request cannot be acted on as written
    #[error("Invalid import request: {0}")]
    InvalidSpec(String),
    
    /// A resource the import depends on does not exist (yet)
    #[error("Missing resource: {0}")]
    MissingResource(String),
    
    /// A source attribute has no target equivalent
    #[error("Mapping error: {0}")]
    Mapping(String),
    
    /// No OS identity could be resolved for the source VM
    #[error("OS not found: {0}")]
    OsNotFound(String),
    
    /// No template matches the resolved OS
    #[error("Template not found for OS {0}")]
    TemplateNotFound(String),
    
    /// More than one managed resource of a kind exists for one import
    #[error("Found {count} {kind} resources for import {import}, expected at most one")]
    ResourceConsistency { kind: String, import: String, count: usize },
    
    /// A resource with the import's deterministic name belongs to something else
    #[error("{kind} {name} exists but is not owned by import {import}")]
    ForeignResource { kind: String, name: String, import: String },
    
    /// A blocking validation check failed
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    
    /// CDI gave up copying a disk
    #[error("DataVolume failed: {0}")]
    DataVolumeFailed(String),
    
    /// Guest conversion job failed
    #[error("Guest conversion failed: {0}")]
    ConversionFailed(String),
    
    /// One or more subordinate resources could not be deleted
    #[error("Cleanup of import {import} failed: {}", .failures.join("; "))]
    Cleanup { import: String, failures: Vec<String> },
    
    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Permanent errors fail the import instead of being retried
    pub fn is_permanent(&self) -> bool {
        match self {
            ControllerError::InvalidSpec(_)
            | ControllerError::Mapping(_)
            | ControllerError::OsNotFound(_)
            | ControllerError::TemplateNotFound(_)
            | ControllerError::ResourceConsistency { .. }
            | ControllerError::ForeignResource { .. }
            | ControllerError::ValidationFailed(_)
            | ControllerError::DataVolumeFailed(_)
            | ControllerError::ConversionFailed(_) => true,
            ControllerError::Hypervisor(e) => matches!(
                e,
                HypervisorError::NotFound(_) | HypervisorError::Ambiguous { .. } | HypervisorError::InvalidRequest(_)
            ),
            _ => false,
        }
    }

    /// Optimistic concurrency conflict: refetch and run the pass again
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(StoreError::Conflict { .. }))
    }

    /// Short machine-readable reason for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Hypervisor(HypervisorError::NotFound(_)) => "SourceVMNotFound",
            ControllerError::Hypervisor(HypervisorError::Ambiguous { .. }) => "SourceVMAmbiguous",
            ControllerError::Hypervisor(e) if e.is_connectivity() => "ConnectionFailed",
            ControllerError::Hypervisor(_) => "SourceProviderError",
            ControllerError::InvalidSpec(_) => "InvalidSpec",
            ControllerError::MissingResource(_) => "MissingResource",
            ControllerError::Mapping(_) => "MappingFailed",
            ControllerError::OsNotFound(_) => "OSNotFound",
            ControllerError::TemplateNotFound(_) => "TemplateNotFound",
            ControllerError::ResourceConsistency { .. } | ControllerError::ForeignResource { .. } => {
                "ResourceConsistency"
            }
            ControllerError::ValidationFailed(_) => "ValidationFailed",
            ControllerError::DataVolumeFailed(_) => "DataVolumeCreationFailed",
            ControllerError::ConversionFailed(_) => "GuestConversionFailed",
            ControllerError::Cleanup { .. } => "CleanupFailed",
            _ => "ProcessingFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(ControllerError::Mapping("bus".to_string()).is_permanent());
        assert!(ControllerError::Hypervisor(HypervisorError::Ambiguous {
            name: "web".to_string(),
            ids: vec!["1".to_string(), "2".to_string()],
        })
        .is_permanent());
        assert!(!ControllerError::Hypervisor(HypervisorError::Authentication("401".to_string())).is_permanent());
        assert!(!ControllerError::MissingResource("secret".to_string()).is_permanent());
    }

    #[test]
    fn test_cleanup_error_lists_every_failure() {
        let err = ControllerError::Cleanup {
            import: "default/db01".to_string(),
            failures: vec!["Secret a: denied".to_string(), "ConfigMap b: denied".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Cleanup of import default/db01 failed: Secret a: denied; ConfigMap b: denied"
        );
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_conflict_detection() {
        let err = ControllerError::Store(StoreError::Conflict {
            kind: "VirtualMachineImport".to_string(),
            name: "db01".to_string(),
            message: "resourceVersion mismatch".to_string(),
        });
        assert!(err.is_conflict());
        assert!(!err.is_permanent());
    }
}
