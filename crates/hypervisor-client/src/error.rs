//! Hypervisor client errors

use thiserror::Error;

/// Errors that can occur when talking to a source hypervisor
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    
    /// Hypervisor API returned an unexpected status
    #[error("Hypervisor API error: {0}")]
    Api(String),
    
    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    
    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),
    
    /// VM (or a referenced cluster) not found
    #[error("Not found: {0}")]
    NotFound(String),
    
    /// A name lookup resolved to more than one VM
    #[error("VM name '{name}' is ambiguous, matching VMs: {}", .ids.join(", "))]
    Ambiguous { name: String, ids: Vec<String> },
    
    /// Response could be decoded but lacks required data
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    
    /// Invalid request (e.g., missing credential keys)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    
    /// Client used after `close()`
    #[error("Client is not connected")]
    NotConnected,
}

impl HypervisorError {
    /// Endpoint unreachable or credentials rejected: worth retrying later
    pub fn is_connectivity(&self) -> bool {
        match self {
            HypervisorError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            HypervisorError::Authentication(_) | HypervisorError::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_lists_every_match() {
        let err = HypervisorError::Ambiguous {
            name: "web".to_string(),
            ids: vec!["vm-1".to_string(), "vm-2".to_string()],
        };
        assert_eq!(err.to_string(), "VM name 'web' is ambiguous, matching VMs: vm-1, vm-2");
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_authentication_is_connectivity() {
        assert!(HypervisorError::Authentication("401".to_string()).is_connectivity());
        assert!(!HypervisorError::NotFound("vm".to_string()).is_connectivity());
    }
}
