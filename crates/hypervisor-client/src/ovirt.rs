//! oVirt REST API client
//!
//! Talks to the oVirt engine API v4 (`/ovirt-engine/api`) with HTTP basic
//! auth. The engine encodes most scalars as JSON strings, so numeric and
//! boolean fields are decoded through [`Scalar`].

use crate::common::{build_http_client, check_status, decode_json};
use crate::error::HypervisorError;
use crate::hypervisor_trait::HypervisorClientTrait;
use crate::models::*;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// oVirt engine client
pub struct OvirtClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    closed: AtomicBool,
}

impl OvirtClient {
    /// Create a new oVirt client
    ///
    /// # Arguments
    /// * `credentials` - `api_url` is the engine API root, e.g. `https://engine/ovirt-engine/api`
    pub fn new(credentials: &Credentials) -> Result<Self, HypervisorError> {
        Ok(Self {
            client: build_http_client(credentials)?,
            base_url: credentials.api_url.trim_end_matches('/').to_string(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), HypervisorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HypervisorError::NotConnected);
        }
        Ok(())
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.username, Some(&self.password))
            .header("Version", "4")
            .header("Accept", "application/json")
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T, HypervisorError> {
        self.ensure_open()?;
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.authorized(self.client.get(&url)).send().await?;
        decode_json(response, what).await
    }

    async fn post_action(&self, vm_id: &str, action: &str) -> Result<(), HypervisorError> {
        self.ensure_open()?;
        let url = format!("{}/vms/{}/{}", self.base_url, vm_id, action);
        debug!("POST {}", url);
        let response = self
            .authorized(self.client.post(&url))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        check_status(response, &format!("{} VM {}", action, vm_id)).await?;
        Ok(())
    }

    async fn find_vm(&self, selector: &VmSelector) -> Result<OvirtVm, HypervisorError> {
        match selector {
            VmSelector::Id(id) => {
                self.get_json(&format!("/vms/{}?follow=cluster", id), &format!("VM id {}", id))
                    .await
            }
            VmSelector::Name { name, cluster } => {
                let mut search = format!("name={}", name);
                if let Some(cluster) = cluster {
                    search.push_str(&format!(" and cluster={}", cluster));
                }
                let list: OvirtVms = self
                    .get_json(
                        &format!("/vms?search={}&follow=cluster", urlencoding::encode(&search)),
                        &format!("VM {}", selector),
                    )
                    .await?;

                let mut matching: Vec<OvirtVm> = list.vm.into_iter().filter(|vm| &vm.name == name).collect();
                match matching.len() {
                    0 => Err(HypervisorError::NotFound(format!("VM {}", selector))),
                    1 => Ok(matching.remove(0)),
                    _ => Err(HypervisorError::Ambiguous {
                        name: name.clone(),
                        ids: matching.into_iter().map(|vm| vm.id).collect(),
                    }),
                }
            }
        }
    }

    async fn vm_status(&self, vm_id: &str) -> Result<PowerState, HypervisorError> {
        let vm: OvirtVm = self.get_json(&format!("/vms/{}", vm_id), &format!("VM id {}", vm_id)).await?;
        Ok(power_state(vm.status.as_deref()))
    }
}

#[async_trait::async_trait]
impl HypervisorClientTrait for OvirtClient {
    fn platform(&self) -> Platform {
        Platform::Ovirt
    }

    async fn test_connection(&self) -> Result<(), HypervisorError> {
        self.ensure_open()?;
        let response = self.authorized(self.client.get(&self.base_url)).send().await?;
        check_status(response, "oVirt API root").await?;
        Ok(())
    }

    async fn fetch_vm(&self, selector: &VmSelector) -> Result<SourceVmSnapshot, HypervisorError> {
        let vm = self.find_vm(selector).await?;
        let attachments: OvirtDiskAttachments = self
            .get_json(&format!("/vms/{}/diskattachments?follow=disk", vm.id), "disk attachments")
            .await?;
        let nics: OvirtNics = self
            .get_json(&format!("/vms/{}/nics?follow=vnic_profile.network", vm.id), "NICs")
            .await?;
        let snapshots: OvirtSnapshots = self
            .get_json(&format!("/vms/{}/snapshots", vm.id), "snapshots")
            .await?;

        let mut domains = HashMap::new();
        for attachment in &attachments.disk_attachment {
            let Some(disk) = &attachment.disk else { continue };
            for domain in disk.storage_domains.iter().flat_map(|d| &d.storage_domain) {
                if !domains.contains_key(&domain.id) {
                    let sd: OvirtStorageDomain = self
                        .get_json(&format!("/storagedomains/{}", domain.id), "storage domain")
                        .await?;
                    domains.insert(domain.id.clone(), sd);
                }
            }
        }

        snapshot_from(vm, attachments, nics, snapshots, &domains)
    }

    async fn start_vm(&self, vm_id: &str) -> Result<(), HypervisorError> {
        if self.vm_status(vm_id).await? == PowerState::Up {
            debug!("VM {} already up", vm_id);
            return Ok(());
        }
        info!("Starting oVirt VM {}", vm_id);
        self.post_action(vm_id, "start").await
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<(), HypervisorError> {
        if self.vm_status(vm_id).await? == PowerState::Down {
            debug!("VM {} already down", vm_id);
            return Ok(());
        }
        info!("Stopping oVirt VM {}", vm_id);
        self.post_action(vm_id, "stop").await
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn power_state(status: Option<&str>) -> PowerState {
    match status {
        Some("up") => PowerState::Up,
        Some("down") => PowerState::Down,
        other => PowerState::Other(other.unwrap_or("unknown").to_string()),
    }
}

/// Flatten the engine's linked documents into one snapshot
fn snapshot_from(
    vm: OvirtVm,
    attachments: OvirtDiskAttachments,
    nics: OvirtNics,
    snapshots: OvirtSnapshots,
    domains: &HashMap<String, OvirtStorageDomain>,
) -> Result<SourceVmSnapshot, HypervisorError> {
    let memory_bytes = vm
        .memory
        .as_ref()
        .and_then(Scalar::as_u64)
        .ok_or_else(|| HypervisorError::InvalidResponse(format!("VM {} has no memory size", vm.id)))?;

    let topology = vm.cpu.and_then(|c| c.topology);
    let sockets = topology.as_ref().and_then(|t| t.sockets.as_ref()).and_then(Scalar::as_u64).unwrap_or(1);
    let cores = topology.as_ref().and_then(|t| t.cores.as_ref()).and_then(Scalar::as_u64).unwrap_or(1);

    let disks = attachments
        .disk_attachment
        .into_iter()
        .filter_map(|attachment| {
            let disk = attachment.disk?;
            let domain = disk
                .storage_domains
                .as_ref()
                .and_then(|d| d.storage_domain.first())
                .and_then(|d| domains.get(&d.id));
            let block_backed = domain
                .and_then(|d| d.storage.as_ref())
                .and_then(|s| s.storage_type.as_deref())
                .is_some_and(|t| matches!(t, "iscsi" | "fcp"));

            Some(SourceDisk {
                backing_location: disk.image_id.clone().unwrap_or_else(|| disk.id.clone()),
                name: disk.name.or(disk.alias).unwrap_or_else(|| disk.id.clone()),
                capacity: disk.provisioned_size.map(|s| s.text()).unwrap_or_default(),
                storage_id: domain.map(|d| d.id.clone()),
                storage_name: domain.and_then(|d| d.name.clone()),
                block_backed,
                lun: disk.storage_type.as_deref() == Some("lun"),
                interface: attachment.interface.unwrap_or_default(),
                bootable: attachment.bootable.as_ref().is_some_and(Scalar::as_bool),
                id: disk.id,
            })
        })
        .collect();

    let nics = nics
        .nic
        .into_iter()
        .map(|nic| {
            let network = nic.vnic_profile.and_then(|p| p.network);
            SourceNetworkAdapter {
                name: nic.name,
                network_id: network.as_ref().map(|n| n.id.clone()),
                network_name: network.and_then(|n| n.name),
                mac_address: nic.mac.and_then(|m| m.address),
                interface_model: nic.interface.unwrap_or_default(),
            }
        })
        .collect();

    Ok(SourceVmSnapshot {
        cluster: vm.cluster.and_then(|c| c.name),
        uuid: None,
        cpu: CpuTopology {
            total_vcpus: u32::try_from(sockets.saturating_mul(cores)).unwrap_or(u32::MAX),
            cores_per_socket: u32::try_from(cores).unwrap_or(u32::MAX),
        },
        memory_bytes,
        disks,
        nics,
        firmware: vm.bios.and_then(|b| b.bios_type),
        guest_os: GuestOs {
            distribution: vm.guest_operating_system.as_ref().and_then(|g| g.distribution.clone()),
            full_version: vm
                .guest_operating_system
                .and_then(|g| g.version)
                .and_then(|v| v.full_version),
            os_type: vm.os.and_then(|o| o.os_type),
        },
        power_state: power_state(vm.status.as_deref()),
        utc_offset: vm.time_zone.and_then(|tz| tz.utc_offset),
        has_snapshots: snapshots
            .snapshot
            .iter()
            .any(|s| s.snapshot_type.as_deref() != Some("active")),
        usb_enabled: vm.usb.and_then(|u| u.enabled).as_ref().is_some_and(Scalar::as_bool),
        id: vm.id,
        name: vm.name,
    })
}

/// oVirt scalar, sent either as a JSON string or as a native value
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(u64),
    Flag(bool),
    Text(String),
}

impl Scalar {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => s.parse().ok(),
            Scalar::Flag(_) => None,
        }
    }

    fn as_bool(&self) -> bool {
        match self {
            Scalar::Flag(b) => *b,
            Scalar::Text(s) => s == "true",
            Scalar::Number(_) => false,
        }
    }

    fn text(&self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Flag(b) => b.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OvirtRef {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtVms {
    #[serde(default)]
    vm: Vec<OvirtVm>,
}

#[derive(Debug, Deserialize)]
struct OvirtVm {
    id: String,
    name: String,
    status: Option<String>,
    cpu: Option<OvirtCpu>,
    memory: Option<Scalar>,
    bios: Option<OvirtBios>,
    os: Option<OvirtOs>,
    guest_operating_system: Option<OvirtGuestOs>,
    time_zone: Option<OvirtTimeZone>,
    usb: Option<OvirtUsb>,
    cluster: Option<OvirtRef>,
}

#[derive(Debug, Deserialize)]
struct OvirtCpu {
    topology: Option<OvirtTopology>,
}

#[derive(Debug, Deserialize)]
struct OvirtTopology {
    sockets: Option<Scalar>,
    cores: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct OvirtBios {
    #[serde(rename = "type")]
    bios_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtOs {
    #[serde(rename = "type")]
    os_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtGuestOs {
    distribution: Option<String>,
    version: Option<OvirtVersion>,
}

#[derive(Debug, Deserialize)]
struct OvirtVersion {
    full_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtTimeZone {
    utc_offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtUsb {
    enabled: Option<Scalar>,
}

#[derive(Debug, Deserialize)]
struct OvirtDiskAttachments {
    #[serde(default)]
    disk_attachment: Vec<OvirtDiskAttachment>,
}

#[derive(Debug, Deserialize)]
struct OvirtDiskAttachment {
    bootable: Option<Scalar>,
    interface: Option<String>,
    disk: Option<OvirtDisk>,
}

#[derive(Debug, Deserialize)]
struct OvirtDisk {
    id: String,
    name: Option<String>,
    alias: Option<String>,
    image_id: Option<String>,
    provisioned_size: Option<Scalar>,
    storage_type: Option<String>,
    storage_domains: Option<OvirtStorageDomainRefs>,
}

#[derive(Debug, Deserialize)]
struct OvirtStorageDomainRefs {
    #[serde(default)]
    storage_domain: Vec<OvirtRef>,
}

#[derive(Debug, Deserialize)]
struct OvirtStorageDomain {
    id: String,
    name: Option<String>,
    storage: Option<OvirtStorage>,
}

#[derive(Debug, Deserialize)]
struct OvirtStorage {
    #[serde(rename = "type")]
    storage_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtNics {
    #[serde(default)]
    nic: Vec<OvirtNic>,
}

#[derive(Debug, Deserialize)]
struct OvirtNic {
    name: String,
    interface: Option<String>,
    mac: Option<OvirtMac>,
    vnic_profile: Option<OvirtVnicProfile>,
}

#[derive(Debug, Deserialize)]
struct OvirtMac {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OvirtVnicProfile {
    network: Option<OvirtRef>,
}

#[derive(Debug, Deserialize)]
struct OvirtSnapshots {
    #[serde(default)]
    snapshot: Vec<OvirtSnapshot>,
}

#[derive(Debug, Deserialize)]
struct OvirtSnapshot {
    snapshot_type: Option<String>,
}
