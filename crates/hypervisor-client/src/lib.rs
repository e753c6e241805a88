//! Hypervisor Client Facade
//!
//! Typed access to the source hypervisors a VM is imported from. Each
//! platform client resolves a VM by id or by name (and cluster), flattens
//! the platform's nested device model into one [`SourceVmSnapshot`], and
//! toggles the VM power state.
//!
//! # Example
//!
//! ```no_run
//! use hypervisor_client::{Credentials, HypervisorConnector, Platform, RestConnector, VmSelector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials {
//!     api_url: "https://engine.example.com/ovirt-engine/api".to_string(),
//!     username: "admin@internal".to_string(),
//!     password: "secret".to_string(),
//!     ca_cert: None,
//!     thumbprint: None,
//! };
//!
//! let client = RestConnector.connect(Platform::Ovirt, &credentials).await?;
//! let vm = client
//!     .fetch_vm(&VmSelector::Name { name: "db01".to_string(), cluster: Some("prod".to_string()) })
//!     .await?;
//! client.stop_vm(&vm.id).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod error;
pub mod models;
pub mod ovirt;
pub mod vmware;
#[path = "trait.rs"]
pub mod hypervisor_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use error::HypervisorError;
pub use hypervisor_trait::{HypervisorClientTrait, HypervisorConnector, RestConnector};
pub use models::*;
pub use ovirt::OvirtClient;
pub use vmware::VmwareClient;
#[cfg(feature = "test-util")]
pub use mock::{MockConnector, MockHypervisorClient};
