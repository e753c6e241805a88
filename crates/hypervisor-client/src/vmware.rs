//! vSphere Automation REST API client
//!
//! Opens a session with `POST /api/session` and sends the returned token in
//! the `vmware-api-session-id` header. VM details come from
//! `/api/vcenter/vm/{vm}`, whose disks and NICs are maps keyed by device key.

use crate::common::{build_http_client, check_status, decode_json};
use crate::error::HypervisorError;
use crate::hypervisor_trait::HypervisorClientTrait;
use crate::models::*;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SESSION_HEADER: &str = "vmware-api-session-id";

/// vCenter client holding one API session
pub struct VmwareClient {
    client: Client,
    base_url: String,
    session: Mutex<Option<String>>,
}

impl VmwareClient {
    /// Log in and open an API session
    pub async fn login(credentials: &Credentials) -> Result<Self, HypervisorError> {
        let client = build_http_client(credentials)?;
        let base_url = credentials.api_url.trim_end_matches('/').to_string();

        let url = format!("{}/api/session", base_url);
        debug!("POST {}", url);
        let response = client
            .post(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await?;
        let token: String = decode_json(response, "vCenter login").await?;

        info!("Opened vCenter session at {}", base_url);
        Ok(Self {
            client,
            base_url,
            session: Mutex::new(Some(token)),
        })
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, HypervisorError> {
        let session = self.session.lock().await;
        let token = session.as_ref().ok_or(HypervisorError::NotConnected)?;
        Ok(builder
            .header(SESSION_HEADER, token.as_str())
            .header("Accept", "application/json"))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T, HypervisorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.authorized(self.client.get(&url)).await?.send().await?;
        decode_json(response, what).await
    }

    async fn find_vm_id(&self, selector: &VmSelector) -> Result<String, HypervisorError> {
        let (name, cluster) = match selector {
            VmSelector::Id(id) => return Ok(id.clone()),
            VmSelector::Name { name, cluster } => (name, cluster),
        };

        let mut path = format!("/api/vcenter/vm?names={}", urlencoding::encode(name));
        if let Some(cluster) = cluster {
            let clusters: Vec<ClusterSummary> = self
                .get_json(
                    &format!("/api/vcenter/cluster?names={}", urlencoding::encode(cluster)),
                    "cluster lookup",
                )
                .await?;
            let cluster_id = clusters
                .into_iter()
                .next()
                .map(|c| c.cluster)
                .ok_or_else(|| HypervisorError::NotFound(format!("cluster {}", cluster)))?;
            path.push_str(&format!("&clusters={}", urlencoding::encode(&cluster_id)));
        }

        let vms: Vec<VmSummary> = self.get_json(&path, &format!("VM {}", selector)).await?;
        let mut ids: Vec<String> = vms.into_iter().filter(|vm| &vm.name == name).map(|vm| vm.vm).collect();
        match ids.len() {
            0 => Err(HypervisorError::NotFound(format!("VM {}", selector))),
            1 => Ok(ids.remove(0)),
            _ => Err(HypervisorError::Ambiguous { name: name.clone(), ids }),
        }
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, HypervisorError> {
        let info: PowerInfo = self
            .get_json(&format!("/api/vcenter/vm/{}/power", vm_id), &format!("VM {} power", vm_id))
            .await?;
        Ok(power_state(&info.state))
    }

    async fn power_action(&self, vm_id: &str, action: &str) -> Result<(), HypervisorError> {
        let url = format!("{}/api/vcenter/vm/{}/power?action={}", self.base_url, vm_id, action);
        debug!("POST {}", url);
        let response = self.authorized(self.client.post(&url)).await?.send().await?;
        check_status(response, &format!("{} VM {}", action, vm_id)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl HypervisorClientTrait for VmwareClient {
    fn platform(&self) -> Platform {
        Platform::Vmware
    }

    async fn test_connection(&self) -> Result<(), HypervisorError> {
        let url = format!("{}/api/session", self.base_url);
        let response = self.authorized(self.client.get(&url)).await?.send().await?;
        check_status(response, "vCenter session").await?;
        Ok(())
    }

    async fn fetch_vm(&self, selector: &VmSelector) -> Result<SourceVmSnapshot, HypervisorError> {
        let vm_id = self.find_vm_id(selector).await?;
        let info: VmInfo = self
            .get_json(&format!("/api/vcenter/vm/{}", vm_id), &format!("VM id {}", vm_id))
            .await?;

        // Tools not running answers 503; the OS is then resolved from the configured type only
        let identity = match self
            .get_json::<GuestIdentity>(&format!("/api/vcenter/vm/{}/guest/identity", vm_id), "guest identity")
            .await
        {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!("No guest identity for VM {}: {}", vm_id, e);
                None
            }
        };

        let networks: Vec<NetworkSummary> = self.get_json("/api/vcenter/network", "networks").await?;
        let datastores: Vec<DatastoreSummary> = self.get_json("/api/vcenter/datastore", "datastores").await?;

        let cluster = match selector {
            VmSelector::Name { cluster, .. } => cluster.clone(),
            VmSelector::Id(_) => None,
        };
        Ok(snapshot_from(vm_id, cluster, info, identity, &networks, &datastores))
    }

    async fn start_vm(&self, vm_id: &str) -> Result<(), HypervisorError> {
        if self.power_state(vm_id).await? == PowerState::Up {
            debug!("VM {} already powered on", vm_id);
            return Ok(());
        }
        info!("Starting vSphere VM {}", vm_id);
        self.power_action(vm_id, "start").await
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<(), HypervisorError> {
        if self.power_state(vm_id).await? == PowerState::Down {
            debug!("VM {} already powered off", vm_id);
            return Ok(());
        }
        info!("Stopping vSphere VM {}", vm_id);
        self.power_action(vm_id, "stop").await
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        let Some(token) = self.session.lock().await.take() else {
            return Ok(());
        };

        let url = format!("{}/api/session", self.base_url);
        let response = self.client.delete(&url).header(SESSION_HEADER, token).send().await?;
        if let Err(e) = check_status(response, "vCenter logout").await {
            // An expired session is already gone
            warn!("vCenter logout failed: {}", e);
        }
        Ok(())
    }
}

fn power_state(state: &str) -> PowerState {
    match state {
        "POWERED_ON" => PowerState::Up,
        "POWERED_OFF" => PowerState::Down,
        other => PowerState::Other(other.to_string()),
    }
}

/// Datastore name of a `[datastore] folder/disk.vmdk` path
fn datastore_of(vmdk_file: &str) -> Option<&str> {
    let rest = vmdk_file.strip_prefix('[')?;
    rest.split_once(']').map(|(name, _)| name.trim())
}

/// Device entries ordered by numeric key ("2000" < "16000"); non-numeric keys last
fn by_device_key<V>(devices: BTreeMap<String, V>) -> Vec<(String, V)> {
    let mut entries: Vec<(String, V)> = devices.into_iter().collect();
    entries.sort_by_key(|(key, _)| key.parse::<u64>().unwrap_or(u64::MAX));
    entries
}

fn snapshot_from(
    vm_id: String,
    cluster: Option<String>,
    info: VmInfo,
    identity: Option<GuestIdentity>,
    networks: &[NetworkSummary],
    datastores: &[DatastoreSummary],
) -> SourceVmSnapshot {
    let network_names: HashMap<&str, &str> = networks.iter().map(|n| (n.network.as_str(), n.name.as_str())).collect();

    let mut disks: Vec<SourceDisk> = by_device_key(info.disks)
        .into_iter()
        .map(|(key, disk)| {
            let backing = disk.backing.unwrap_or_default();
            let vmdk_file = backing.vmdk_file.unwrap_or_default();
            let datastore = datastore_of(&vmdk_file)
                .and_then(|name| datastores.iter().find(|d| d.name == name));

            SourceDisk {
                name: disk.label.unwrap_or_else(|| key.clone()),
                capacity: disk.capacity.map(|c| c.to_string()).unwrap_or_default(),
                storage_id: datastore.map(|d| d.datastore.clone()),
                storage_name: datastore.map(|d| d.name.clone()),
                block_backed: false,
                lun: backing.backing_type == "HOST_DEVICE",
                interface: disk.disk_type.unwrap_or_default(),
                bootable: false,
                backing_location: vmdk_file,
                id: key,
            }
        })
        .collect();
    // The REST API does not expose the boot order; take the lowest device key
    if let Some(first) = disks.first_mut() {
        first.bootable = true;
    }

    let nics = by_device_key(info.nics)
        .into_iter()
        .map(|(key, nic)| {
            let backing = nic.backing.unwrap_or_default();
            let network_name = backing
                .network_name
                .or_else(|| {
                    backing
                        .network
                        .as_deref()
                        .and_then(|id| network_names.get(id))
                        .map(|name| name.to_string())
                });
            SourceNetworkAdapter {
                name: nic.label.unwrap_or(key),
                network_id: backing.network,
                network_name,
                mac_address: nic.mac_address,
                interface_model: nic.nic_type.unwrap_or_default(),
            }
        })
        .collect();

    let os_type = info
        .guest_os
        .or_else(|| identity.as_ref().and_then(|i| i.name.clone()));

    SourceVmSnapshot {
        id: vm_id,
        name: info.name,
        cluster,
        uuid: info.identity.and_then(|i| i.bios_uuid),
        cpu: CpuTopology {
            total_vcpus: info.cpu.count,
            cores_per_socket: info.cpu.cores_per_socket,
        },
        memory_bytes: info.memory.size_mib.saturating_mul(1024 * 1024),
        disks,
        nics,
        firmware: info.boot.map(|b| b.boot_type.to_lowercase()),
        guest_os: GuestOs {
            distribution: None,
            full_version: None,
            os_type,
        },
        power_state: power_state(&info.power_state),
        utc_offset: None,
        has_snapshots: false,
        usb_enabled: false,
    }
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClusterSummary {
    cluster: String,
}

#[derive(Debug, Deserialize)]
struct NetworkSummary {
    network: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatastoreSummary {
    datastore: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    name: String,
    power_state: String,
    cpu: VmCpu,
    memory: VmMemory,
    boot: Option<VmBoot>,
    #[serde(rename = "guest_OS")]
    guest_os: Option<String>,
    identity: Option<VmIdentity>,
    #[serde(default)]
    disks: BTreeMap<String, VmDisk>,
    #[serde(default)]
    nics: BTreeMap<String, VmNic>,
}

#[derive(Debug, Deserialize)]
struct VmCpu {
    count: u32,
    cores_per_socket: u32,
}

#[derive(Debug, Deserialize)]
struct VmMemory {
    #[serde(rename = "size_MiB")]
    size_mib: u64,
}

#[derive(Debug, Deserialize)]
struct VmBoot {
    #[serde(rename = "type")]
    boot_type: String,
}

#[derive(Debug, Deserialize)]
struct VmIdentity {
    bios_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmDisk {
    label: Option<String>,
    #[serde(rename = "type")]
    disk_type: Option<String>,
    capacity: Option<u64>,
    backing: Option<VmDiskBacking>,
}

#[derive(Debug, Deserialize, Default)]
struct VmDiskBacking {
    #[serde(rename = "type", default)]
    backing_type: String,
    vmdk_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmNic {
    label: Option<String>,
    #[serde(rename = "type")]
    nic_type: Option<String>,
    mac_address: Option<String>,
    backing: Option<VmNicBacking>,
}

#[derive(Debug, Deserialize, Default)]
struct VmNicBacking {
    network: Option<String>,
    network_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_datastore_of_vmdk_path() {
        assert_eq!(datastore_of("[datastore1] web01/web01.vmdk"), Some("datastore1"));
        assert_eq!(datastore_of("web01.vmdk"), None);
    }

    #[test]
    fn test_snapshot_resolves_networks_and_datastores() {
        let info: VmInfo = serde_json::from_value(json!({
            "name": "web01",
            "power_state": "POWERED_ON",
            "cpu": {"count": 4, "cores_per_socket": 2},
            "memory": {"size_MiB": 2048},
            "boot": {"type": "EFI"},
            "guest_OS": "RHEL_7_64",
            "identity": {"bios_uuid": "42", "instance_uuid": "50"},
            "disks": {
                "2001": {"label": "Hard disk 2", "type": "SCSI", "capacity": 2147483648u64,
                          "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds2] web01/web01_1.vmdk"}},
                "2000": {"label": "Hard disk 1", "type": "SCSI", "capacity": 17179869184u64,
                          "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] web01/web01.vmdk"}}
            },
            "nics": {
                "4000": {"label": "Network adapter 1", "type": "VMXNET3", "mac_address": "00:50:56:a1:b2:c3",
                          "backing": {"type": "STANDARD_PORTGROUP", "network": "network-12"}}
            }
        }))
        .unwrap();
        let networks = vec![NetworkSummary { network: "network-12".to_string(), name: "VM Network".to_string() }];
        let datastores = vec![DatastoreSummary { datastore: "datastore-1".to_string(), name: "ds1".to_string() }];

        let vm = snapshot_from("vm-42".to_string(), Some("prod".to_string()), info, None, &networks, &datastores);

        assert_eq!(vm.memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(vm.firmware.as_deref(), Some("efi"));
        assert_eq!(vm.guest_os.os_type.as_deref(), Some("RHEL_7_64"));
        assert_eq!(vm.uuid.as_deref(), Some("42"));
        assert_eq!(vm.power_state, PowerState::Up);

        assert_eq!(vm.disks[0].id, "2000");
        assert!(vm.disks[0].bootable);
        assert_eq!(vm.disks[0].storage_id.as_deref(), Some("datastore-1"));
        assert_eq!(vm.disks[1].storage_id, None);
        assert!(!vm.disks[1].bootable);

        assert_eq!(vm.nics[0].network_name.as_deref(), Some("VM Network"));
        assert_eq!(vm.nics[0].interface_model, "VMXNET3");
    }

    #[test]
    fn test_disks_are_ordered_by_numeric_device_key() {
        let info: VmInfo = serde_json::from_value(json!({
            "name": "db02",
            "power_state": "POWERED_OFF",
            "cpu": {"count": 2, "cores_per_socket": 1},
            "memory": {"size_MiB": 1024},
            "disks": {
                "16000": {"label": "SATA disk", "type": "SATA", "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] db02/db02_2.vmdk"}},
                "2000": {"label": "Hard disk 1", "type": "SCSI", "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] db02/db02.vmdk"}},
                "3000": {"label": "IDE disk", "type": "IDE", "backing": {"type": "VMDK_FILE", "vmdk_file": "[ds1] db02/db02_1.vmdk"}}
            },
            "nics": {}
        }))
        .unwrap();

        let vm = snapshot_from("vm-43".to_string(), None, info, None, &[], &[]);

        let ids: Vec<&str> = vm.disks.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["2000", "3000", "16000"]);
        assert!(vm.disks[0].bootable);
        assert!(vm.disks[1..].iter().all(|d| !d.bootable));
    }
}
