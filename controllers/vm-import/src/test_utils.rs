//! Test utilities for unit testing the reconciler and providers
//!
//! Fixtures for one oVirt and one VMware source VM, import builders, and a
//! harness wiring in-memory stores and a mock hypervisor into a `Reconciler`.

use crate::config::ControllerConfig;
use crate::managed::ImportRef;
use crate::memory_store::MemoryStore;
use crate::provider::ProviderContext;
use crate::reconciler::Reconciler;
use crate::store::Stores;
use crds::*;
use hypervisor_client::{
    CpuTopology, GuestOs, MockConnector, MockHypervisorClient, PowerState, SourceDisk, SourceNetworkAdapter,
    SourceVmSnapshot,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_IMPORT_UID: &str = "6f1c2a34-0000-4000-8000-000000000001";
pub const TEST_CA_CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBtest\n-----END CERTIFICATE-----\n";

/// oVirt source VM: running RHEL 7.7 with one disk and one NIC
pub fn ovirt_vm() -> SourceVmSnapshot {
    SourceVmSnapshot {
        id: "vm-ovirt-1".to_string(),
        name: "DB01 (prod)".to_string(),
        cluster: Some("Default".to_string()),
        uuid: None,
        cpu: CpuTopology {
            total_vcpus: 4,
            cores_per_socket: 2,
        },
        memory_bytes: 4 << 30,
        disks: vec![SourceDisk {
            id: "disk-1".to_string(),
            name: "db01_Disk1".to_string(),
            backing_location: "img-1".to_string(),
            capacity: "10737418240".to_string(),
            storage_id: Some("sd-1".to_string()),
            storage_name: Some("data-nfs".to_string()),
            interface: "virtio_scsi".to_string(),
            bootable: true,
            ..Default::default()
        }],
        nics: vec![SourceNetworkAdapter {
            name: "nic1".to_string(),
            network_id: Some("net-1".to_string()),
            network_name: Some("ovirtmgmt".to_string()),
            mac_address: Some("56:6f:05:0f:00:01".to_string()),
            interface_model: "virtio".to_string(),
        }],
        firmware: Some("q35_ovmf".to_string()),
        guest_os: GuestOs {
            distribution: Some("Red Hat Enterprise Linux Server".to_string()),
            full_version: Some("7.7".to_string()),
            os_type: Some("rhel_7x64".to_string()),
        },
        power_state: PowerState::Up,
        utc_offset: Some("+02:00".to_string()),
        has_snapshots: false,
        usb_enabled: false,
    }
}

/// Rules mapping every network and disk of [`ovirt_vm`]
pub fn ovirt_mappings() -> Mappings {
    Mappings {
        network_mappings: vec![NetworkMappingRule {
            source: SourceRef {
                id: None,
                name: Some("ovirtmgmt".to_string()),
            },
            target: None,
            network_type: NetworkType::Pod,
        }],
        storage_mappings: vec![StorageMappingRule {
            source: SourceRef {
                id: Some("sd-1".to_string()),
                name: None,
            },
            target: StorageTarget {
                storage_class: "standard".to_string(),
            },
            volume_mode: None,
        }],
        disk_mappings: Vec::new(),
    }
}

/// VMware source VM: running RHEL 7 with one VMDK and one VMXNET3 adapter
pub fn vmware_vm() -> SourceVmSnapshot {
    SourceVmSnapshot {
        id: "vm-42".to_string(),
        name: "web01".to_string(),
        cluster: Some("domain-c8".to_string()),
        uuid: Some("42265ff4-8b4e-4b0b-9d86-0c9c4f2d7a11".to_string()),
        cpu: CpuTopology {
            total_vcpus: 2,
            cores_per_socket: 1,
        },
        memory_bytes: 2 << 30,
        disks: vec![SourceDisk {
            id: "2000".to_string(),
            name: "Hard disk 1".to_string(),
            backing_location: "[datastore1] web01/web01.vmdk".to_string(),
            capacity: "21474836480".to_string(),
            storage_id: Some("datastore-11".to_string()),
            storage_name: Some("datastore1".to_string()),
            interface: "SCSI".to_string(),
            bootable: true,
            ..Default::default()
        }],
        nics: vec![SourceNetworkAdapter {
            name: "Network adapter 1".to_string(),
            network_id: Some("network-13".to_string()),
            network_name: Some("VM Network".to_string()),
            mac_address: Some("00:50:56:a1:2b:3c".to_string()),
            interface_model: "VMXNET3".to_string(),
        }],
        firmware: Some("bios".to_string()),
        guest_os: GuestOs {
            distribution: None,
            full_version: None,
            os_type: Some("RHEL_7_64".to_string()),
        },
        power_state: PowerState::Up,
        utc_offset: None,
        has_snapshots: false,
        usb_enabled: false,
    }
}

/// Rules mapping every network of [`vmware_vm`]
pub fn vmware_mappings() -> Mappings {
    Mappings {
        network_mappings: vec![NetworkMappingRule {
            source: SourceRef {
                id: None,
                name: Some("VM Network".to_string()),
            },
            target: None,
            network_type: NetworkType::Pod,
        }],
        ..Default::default()
    }
}

pub fn ovirt_identity() -> SourceVmIdentity {
    SourceVmIdentity {
        id: Some(ovirt_vm().id),
        name: None,
        cluster: None,
    }
}

pub fn vmware_identity() -> SourceVmIdentity {
    SourceVmIdentity {
        id: Some(vmware_vm().id),
        name: None,
        cluster: None,
    }
}

pub fn test_import_ref(name: &str) -> ImportRef {
    ImportRef {
        namespace: TEST_NAMESPACE.to_string(),
        name: name.to_string(),
        uid: Some(TEST_IMPORT_UID.to_string()),
    }
}

/// Provider credentials secret for the mock engine
pub fn provider_secret(name: &str) -> Secret {
    let data = [
        ("apiUrl", "https://engine.example.com/ovirt-engine/api"),
        ("username", "admin@internal"),
        ("password", "s3cret"),
        ("caCert", TEST_CA_CERT),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
    .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Import request for `source`, reading credentials from secret `creds`
pub fn test_import(name: &str, source: VirtualMachineImportSource) -> VirtualMachineImport {
    let mut import = VirtualMachineImport::new(
        name,
        VirtualMachineImportSpec {
            provider_credentials_secret: crds::ObjectReference {
                name: "creds".to_string(),
                namespace: None,
            },
            resource_mapping: None,
            source,
            target_vm_name: None,
            start_vm: None,
            cold_copy: true,
        },
    );
    import.metadata.uid = Some(TEST_IMPORT_UID.to_string());
    import
}

pub fn ovirt_import(name: &str) -> VirtualMachineImport {
    test_import(
        name,
        VirtualMachineImportSource {
            ovirt: Some(PlatformSource {
                vm: ovirt_identity(),
                mappings: Some(ovirt_mappings()),
            }),
            vmware: None,
        },
    )
}

pub fn vmware_import(name: &str) -> VirtualMachineImport {
    test_import(
        name,
        VirtualMachineImportSource {
            ovirt: None,
            vmware: Some(PlatformSource {
                vm: vmware_identity(),
                mappings: Some(vmware_mappings()),
            }),
        },
    )
}

/// In-memory stores and a mock hypervisor shared by a test and the code under test
pub struct TestHarness {
    pub imports: MemoryStore<VirtualMachineImport>,
    pub resource_mappings: MemoryStore<ResourceMapping>,
    pub secrets: MemoryStore<Secret>,
    pub config_maps: MemoryStore<ConfigMap>,
    pub jobs: MemoryStore<Job>,
    pub data_volumes: MemoryStore<DataVolume>,
    pub virtual_machines: MemoryStore<VirtualMachine>,
    pub templates: MemoryStore<Template>,
    pub client: MockHypervisorClient,
    pub connector: MockConnector,
    pub config: ControllerConfig,
}

impl TestHarness {
    pub fn new(client: MockHypervisorClient) -> Self {
        Self {
            imports: MemoryStore::new(),
            resource_mappings: MemoryStore::new(),
            secrets: MemoryStore::new(),
            config_maps: MemoryStore::new(),
            jobs: MemoryStore::new(),
            data_volumes: MemoryStore::new(),
            virtual_machines: MemoryStore::new(),
            templates: MemoryStore::new(),
            connector: MockConnector::new(client.clone()),
            client,
            config: ControllerConfig::default(),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            imports: Arc::new(self.imports.clone()),
            resource_mappings: Arc::new(self.resource_mappings.clone()),
            secrets: Arc::new(self.secrets.clone()),
            config_maps: Arc::new(self.config_maps.clone()),
            jobs: Arc::new(self.jobs.clone()),
            data_volumes: Arc::new(self.data_volumes.clone()),
            virtual_machines: Arc::new(self.virtual_machines.clone()),
            templates: Arc::new(self.templates.clone()),
        }
    }

    pub fn context(&self) -> ProviderContext {
        ProviderContext {
            stores: self.stores(),
            connector: Arc::new(self.connector.clone()),
            config: Arc::new(self.config.clone()),
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.stores(), Arc::new(self.connector.clone()), self.config.clone())
    }

    /// Store the import and its provider secret
    pub fn submit(&self, import: VirtualMachineImport) -> VirtualMachineImport {
        self.secrets.insert(TEST_NAMESPACE, provider_secret("creds"));
        self.imports.insert(TEST_NAMESPACE, import)
    }

    /// Current stored state of an import, as the watcher would deliver it
    pub fn import(&self, name: &str) -> Option<VirtualMachineImport> {
        self.imports
            .all(TEST_NAMESPACE)
            .into_iter()
            .find(|i| i.metadata.name.as_deref() == Some(name))
    }
}
