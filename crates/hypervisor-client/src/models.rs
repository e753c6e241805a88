//! Hypervisor client models
//!
//! Platform-neutral view of a source VM. Both platform clients flatten their
//! own wire format into these types so that callers never traverse
//! oVirt links or vSphere device maps themselves.

use crate::error::HypervisorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported source platforms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ovirt,
    Vmware,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Ovirt => f.write_str("ovirt"),
            Platform::Vmware => f.write_str("vmware"),
        }
    }
}

/// Secret keys holding the connection details
pub const KEY_API_URL: &str = "apiUrl";
pub const KEY_USERNAME: &str = "username";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_CA_CERT: &str = "caCert";
pub const KEY_THUMBPRINT: &str = "thumbprint";

/// Connection details for one hypervisor endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// API endpoint, e.g. `https://engine/ovirt-engine/api` or `https://vcenter`
    pub api_url: String,
    pub username: String,
    pub password: String,
    
    /// PEM bundle trusted for the endpoint (oVirt)
    pub ca_cert: Option<String>,
    
    /// SHA-1 certificate thumbprint of the endpoint (VMware)
    pub thumbprint: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ca_cert", &self.ca_cert.as_ref().map(|_| "<pem>"))
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}

impl Credentials {
    /// Build credentials from decoded secret data.
    ///
    /// `apiUrl`, `username` and `password` must be present and non-empty.
    /// `caCert` and `thumbprint` are optional; empty values count as absent.
    pub fn from_secret_data(data: &BTreeMap<String, String>) -> Result<Self, HypervisorError> {
        let required = |key: &str| -> Result<String, HypervisorError> {
            match data.get(key).map(|v| v.trim()) {
                Some(value) if !value.is_empty() => Ok(value.to_string()),
                _ => Err(HypervisorError::InvalidRequest(format!(
                    "credentials are missing required key '{}'",
                    key
                ))),
            }
        };
        let optional = |key: &str| {
            data.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            api_url: required(KEY_API_URL)?.trim_end_matches('/').to_string(),
            username: required(KEY_USERNAME)?,
            password: required(KEY_PASSWORD)?,
            ca_cert: optional(KEY_CA_CERT),
            thumbprint: optional(KEY_THUMBPRINT),
        })
    }
}

/// How a VM is looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmSelector {
    Id(String),
    Name {
        name: String,
        cluster: Option<String>,
    },
}

impl std::fmt::Display for VmSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmSelector::Id(id) => write!(f, "id={}", id),
            VmSelector::Name { name, cluster: Some(cluster) } => {
                write!(f, "name={} cluster={}", name, cluster)
            }
            VmSelector::Name { name, cluster: None } => write!(f, "name={}", name),
        }
    }
}

/// Source VM power state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Up,
    Down,
    /// Any transitional or unknown state, with the raw platform value
    Other(String),
}

/// CPU layout reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub total_vcpus: u32,
    pub cores_per_socket: u32,
}

/// One disk attached to the source VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceDisk {
    pub id: String,
    pub name: String,
    
    /// Platform-specific location of the disk data (vmdk path, image id)
    pub backing_location: String,
    
    /// Provisioned size in bytes, as reported by the platform
    pub capacity: String,
    
    /// Storage domain (oVirt) or datastore (VMware) id
    pub storage_id: Option<String>,
    pub storage_name: Option<String>,
    
    /// Backed by block storage (iSCSI, FC)
    pub block_backed: bool,
    
    /// Direct LUN / raw device mapping, cannot be copied as an image
    pub lun: bool,
    
    /// Platform disk interface (virtio, virtio_scsi, sata, SCSI, ...)
    pub interface: String,
    
    pub bootable: bool,
}

/// One network adapter of the source VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceNetworkAdapter {
    pub name: String,
    pub network_id: Option<String>,
    pub network_name: Option<String>,
    pub mac_address: Option<String>,
    
    /// Platform NIC model (virtio, e1000, VMXNET3, ...)
    pub interface_model: String,
}

/// Guest OS identity as reported by the platform and guest tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GuestOs {
    /// Guest-agent distribution, e.g. "Red Hat Enterprise Linux Server"
    pub distribution: Option<String>,
    
    /// Guest-agent version, e.g. "7.7"
    pub full_version: Option<String>,
    
    /// Platform OS type, e.g. "rhel_7x64" or "RHEL_7_64"
    pub os_type: Option<String>,
}

/// Normalized, read-only snapshot of a source VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceVmSnapshot {
    pub id: String,
    pub name: String,
    pub cluster: Option<String>,
    
    /// BIOS UUID (VMware, used by VDDK transfers)
    pub uuid: Option<String>,
    
    pub cpu: CpuTopology,
    pub memory_bytes: u64,
    pub disks: Vec<SourceDisk>,
    pub nics: Vec<SourceNetworkAdapter>,
    
    /// Firmware / chipset hint, e.g. "q35_ovmf", "efi", "bios"
    pub firmware: Option<String>,
    
    pub guest_os: GuestOs,
    pub power_state: PowerState,
    
    /// Offset of the VM's clock from UTC, e.g. "+02:00"
    pub utc_offset: Option<String>,
    
    pub has_snapshots: bool,
    pub usb_enabled: bool,
}
