//! Hypervisor client traits
//!
//! `HypervisorClientTrait` abstracts one open connection to a source
//! hypervisor; `HypervisorConnector` opens them. The controller depends only
//! on these traits so tests can substitute the in-memory mock.

use crate::error::HypervisorError;
use crate::models::*;
use crate::ovirt::OvirtClient;
use crate::vmware::VmwareClient;

/// Operations on one open hypervisor connection
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HypervisorClientTrait: Send + Sync {
    /// Platform this client talks to
    fn platform(&self) -> Platform;

    /// Verify the endpoint is reachable and the credentials are accepted
    async fn test_connection(&self) -> Result<(), HypervisorError>;

    /// Fetch a VM by id, or by name within an optional cluster.
    ///
    /// A name matching no VM is `NotFound`; a name matching several VMs is
    /// `Ambiguous` and lists every matching id.
    async fn fetch_vm(&self, selector: &VmSelector) -> Result<SourceVmSnapshot, HypervisorError>;

    /// Power the VM on. No-op when it is already up.
    async fn start_vm(&self, vm_id: &str) -> Result<(), HypervisorError>;

    /// Power the VM off. No-op when it is already down.
    async fn stop_vm(&self, vm_id: &str) -> Result<(), HypervisorError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self) -> Result<(), HypervisorError>;
}

/// Opens hypervisor connections
#[async_trait::async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(
        &self,
        platform: Platform,
        credentials: &Credentials,
    ) -> Result<Box<dyn HypervisorClientTrait>, HypervisorError>;
}

/// Connector backed by the platform REST clients
#[derive(Debug, Clone, Copy, Default)]
pub struct RestConnector;

#[async_trait::async_trait]
impl HypervisorConnector for RestConnector {
    async fn connect(
        &self,
        platform: Platform,
        credentials: &Credentials,
    ) -> Result<Box<dyn HypervisorClientTrait>, HypervisorError> {
        match platform {
            Platform::Ovirt => Ok(Box::new(OvirtClient::new(credentials)?)),
            Platform::Vmware => Ok(Box::new(VmwareClient::login(credentials).await?)),
        }
    }
}
