//! Attribute mapper.
//!
//! Pure translation of a [`SourceVmSnapshot`] plus mapping rules into the
//! disk plans and the KubeVirt `VirtualMachine` spec of the target. Nothing
//! here talks to the cluster or the hypervisor.

use crate::error::ControllerError;
use crds::{
    BiosBootloader, Bootloader, Clock, ClockOffsetUtc, Cpu, Disk, DiskTarget, EfiBootloader, Firmware,
    Interface, InterfaceBridge, InterfaceMasquerade, Mappings, Memory, MultusNetwork, Network, NetworkType,
    OS_LABEL_PREFIX, PodNetwork, TemplateMetadata, VirtualMachineSpec, Volume, VolumeDataVolume, VolumeMode,
};
use hypervisor_client::{SourceDisk, SourceNetworkAdapter, SourceVmSnapshot};
use tracing::warn;

/// Maximum length of a DNS-1123 label
const MAX_NAME_LEN: usize = 63;

/// Bus every imported disk is attached with
const DISK_BUS: &str = "virtio";

/// Source disk interfaces the target can attach
const SUPPORTED_DISK_INTERFACES: &[&str] = &["virtio", "virtio_scsi", "sata", "ide", "scsi", "nvme"];

/// Plan for copying one source disk into a DataVolume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPlan {
    /// Deterministic DataVolume name, also used as the VM disk and volume name
    pub volume_name: String,
    pub disk: SourceDisk,

    /// `None` leaves the choice to the cluster default storage class
    pub storage_class: Option<String>,
    pub volume_mode: VolumeMode,

    /// Requested size as a Kubernetes quantity
    pub size: String,

    /// A disk or storage rule matched this disk
    pub storage_mapped: bool,
}

/// Maps one source VM with one set of rules
#[derive(Debug, Clone)]
pub struct VmMapper {
    vm: SourceVmSnapshot,
    mappings: Mappings,
}

impl VmMapper {
    pub fn new(vm: SourceVmSnapshot, mappings: Mappings) -> Self {
        Self { vm, mappings }
    }

    /// Name of the target VM: the explicit name when given, else the normalized source name
    pub fn resolve_vm_name(&self, explicit: Option<&str>) -> Result<String, ControllerError> {
        if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        let name = normalize_name(&self.vm.name);
        if name.is_empty() {
            return Err(ControllerError::Mapping(format!(
                "source VM name '{}' cannot be turned into a valid VM name",
                self.vm.name
            )));
        }
        Ok(name)
    }

    /// One plan per source disk, in source order
    pub fn map_data_volumes(&self, target_vm_name: &str) -> Result<Vec<DiskPlan>, ControllerError> {
        self.vm
            .disks
            .iter()
            .map(|disk| {
                let bytes = parse_quantity(&disk.capacity).map_err(|e| {
                    ControllerError::Mapping(format!("disk {} has invalid capacity: {}", disk.id, e))
                })?;
                let (storage_class, rule_mode, storage_mapped) = self.storage_for(disk);
                let volume_mode = match rule_mode {
                    Some(mode) => mode,
                    None if disk.block_backed => VolumeMode::Block,
                    None => VolumeMode::Filesystem,
                };
                Ok(DiskPlan {
                    volume_name: volume_name(target_vm_name, &disk.id),
                    disk: disk.clone(),
                    storage_class,
                    volume_mode,
                    size: format_quantity(bytes),
                    storage_mapped,
                })
            })
            .collect()
    }

    /// Disk rules (by id, then by name) win over storage domain / datastore rules
    fn storage_for(&self, disk: &SourceDisk) -> (Option<String>, Option<VolumeMode>, bool) {
        let rules = &self.mappings.disk_mappings;
        let disk_rule = rules
            .iter()
            .find(|r| r.source.matches_id(&disk.id))
            .or_else(|| rules.iter().find(|r| r.source.matches_name(&disk.name)));
        if let Some(rule) = disk_rule {
            return (Some(rule.target.storage_class.clone()), rule.volume_mode, true);
        }

        let storage_rule = self.mappings.storage_mappings.iter().find(|r| {
            disk.storage_id.as_deref().is_some_and(|id| r.source.matches_id(id))
                || disk.storage_name.as_deref().is_some_and(|name| r.source.matches_name(name))
        });
        match storage_rule {
            Some(rule) => (Some(rule.target.storage_class.clone()), rule.volume_mode, true),
            None => (None, None, false),
        }
    }

    /// Map the source VM onto a skeleton spec (from a template, or empty).
    ///
    /// CPU, memory, firmware, clock and networking are replaced; disks and
    /// volumes are cleared and added back with [`VmMapper::map_disk`]. The OS
    /// label is set on the instance template.
    pub fn map_vm(&self, mut spec: VirtualMachineSpec, os: &str) -> Result<VirtualMachineSpec, ControllerError> {
        let domain = &mut spec.template.spec.domain;
        domain.cpu = Some(self.map_cpu());
        domain.memory = Some(Memory {
            guest: Some(format_quantity(self.vm.memory_bytes)),
        });
        if let Some(bootloader) = map_firmware(self.vm.firmware.as_deref())? {
            let serial = domain.firmware.take().and_then(|f| f.serial);
            domain.firmware = Some(Firmware {
                bootloader: Some(bootloader),
                serial,
            });
        }
        domain.clock = Some(Clock {
            utc: Some(ClockOffsetUtc {
                offset_seconds: Some(parse_utc_offset(self.vm.utc_offset.as_deref())?),
            }),
        });

        let (networks, interfaces) = self.map_networks()?;
        domain.devices.interfaces = interfaces;
        domain.devices.disks.clear();
        spec.template.spec.networks = networks;
        spec.template.spec.volumes.clear();

        spec.template
            .metadata
            .get_or_insert_with(TemplateMetadata::default)
            .labels
            .insert(format!("{}{}", OS_LABEL_PREFIX, os), "true".to_string());
        spec.running = Some(false);

        Ok(spec)
    }

    fn map_cpu(&self) -> Cpu {
        let cores = self.vm.cpu.cores_per_socket.max(1);
        let total = self.vm.cpu.total_vcpus;
        if total % cores != 0 {
            warn!(
                "VM {} has {} vCPUs, not a multiple of {} cores per socket; truncating to {} sockets",
                self.vm.name,
                total,
                cores,
                total / cores
            );
        }
        Cpu {
            sockets: (total / cores).max(1),
            cores,
            threads: 1,
        }
    }

    fn map_networks(&self) -> Result<(Vec<Network>, Vec<Interface>), ControllerError> {
        let mut networks = Vec::with_capacity(self.vm.nics.len());
        let mut interfaces = Vec::with_capacity(self.vm.nics.len());
        let mut pod_mapped = false;

        for nic in &self.vm.nics {
            let name = normalize_name(&nic.name);
            let mut network = Network {
                name: name.clone(),
                ..Default::default()
            };
            let mut interface = Interface {
                name,
                mac_address: nic.mac_address.clone(),
                model: map_nic_model(&nic.interface_model)?.map(str::to_string),
                ..Default::default()
            };

            match self.network_rule(nic) {
                Some(rule) if rule.network_type == NetworkType::Pod => {
                    if pod_mapped {
                        return Err(ControllerError::Mapping(
                            "only one source network can be mapped to the pod network".to_string(),
                        ));
                    }
                    pod_mapped = true;
                    network.pod = Some(PodNetwork {});
                    interface.masquerade = Some(InterfaceMasquerade {});
                }
                Some(rule) => {
                    let target = rule.target.as_ref().ok_or_else(|| {
                        ControllerError::Mapping(format!(
                            "attachment mapping for NIC {} has no target network",
                            nic.name
                        ))
                    })?;
                    network.multus = Some(MultusNetwork {
                        network_name: target.qualified_name(),
                    });
                    interface.bridge = Some(InterfaceBridge {});
                }
                None => {}
            }

            networks.push(network);
            interfaces.push(interface);
        }
        Ok((networks, interfaces))
    }

    fn network_rule(&self, nic: &SourceNetworkAdapter) -> Option<&crds::NetworkMappingRule> {
        self.mappings.network_mappings.iter().find(|r| {
            nic.network_id.as_deref().is_some_and(|id| r.source.matches_id(id))
                || nic.network_name.as_deref().is_some_and(|name| r.source.matches_name(name))
        })
    }

    /// Attach a planned volume to the VM spec. Re-adding the same volume replaces it.
    pub fn map_disk(&self, spec: &mut VirtualMachineSpec, plan: &DiskPlan) {
        let disk = Disk {
            name: plan.volume_name.clone(),
            disk: Some(DiskTarget {
                bus: Some(DISK_BUS.to_string()),
            }),
            boot_order: plan.disk.bootable.then_some(1),
        };
        let volume = Volume {
            name: plan.volume_name.clone(),
            data_volume: Some(VolumeDataVolume {
                name: plan.volume_name.clone(),
            }),
        };

        let disks = &mut spec.template.spec.domain.devices.disks;
        match disks.iter_mut().find(|d| d.name == disk.name) {
            Some(existing) => *existing = disk,
            None => disks.push(disk),
        }
        let volumes = &mut spec.template.spec.volumes;
        match volumes.iter_mut().find(|v| v.name == volume.name) {
            Some(existing) => *existing = volume,
            None => volumes.push(volume),
        }
    }
}

/// Turn an arbitrary name into a DNS-1123 label.
///
/// Lowercases, replaces every other character with `-`, collapses repeats,
/// trims leading and trailing separators and truncates to 63 characters.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Deterministic DataVolume name for a disk of the target VM
pub fn volume_name(target_vm_name: &str, disk_id: &str) -> String {
    normalize_name(&format!("{}-{}", target_vm_name, disk_id))
}

/// True when the target can attach a disk with this source interface
pub fn is_supported_disk_interface(interface: &str) -> bool {
    SUPPORTED_DISK_INTERFACES
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(interface))
}

/// KubeVirt interface model for a source NIC model; `None` keeps the default
pub fn map_nic_model(model: &str) -> Result<Option<&'static str>, ControllerError> {
    let mapped = match model.to_ascii_lowercase().as_str() {
        "" => None,
        "virtio" | "vmxnet" | "vmxnet2" | "vmxnet3" => Some("virtio"),
        "e1000" => Some("e1000"),
        "e1000e" => Some("e1000e"),
        "rtl8139" => Some("rtl8139"),
        "pcnet32" => Some("pcnet"),
        _ => {
            return Err(ControllerError::Mapping(format!(
                "NIC model '{}' has no target equivalent",
                model
            )));
        }
    };
    Ok(mapped)
}

/// Bootloader for a source firmware / chipset hint. `None` keeps the platform default.
pub fn map_firmware(firmware: Option<&str>) -> Result<Option<Bootloader>, ControllerError> {
    let Some(firmware) = firmware else {
        return Ok(None);
    };
    let efi = |secure_boot: bool| Bootloader {
        efi: Some(EfiBootloader {
            secure_boot: Some(secure_boot),
        }),
        bios: None,
    };
    let bios = Bootloader {
        efi: None,
        bios: Some(BiosBootloader {}),
    };
    match firmware.to_ascii_lowercase().as_str() {
        "q35_ovmf" | "efi" => Ok(Some(efi(false))),
        "q35_secure_boot" => Ok(Some(efi(true))),
        "i440fx_sea_bios" | "q35_sea_bios" | "bios" | "cluster_default" => Ok(Some(bios)),
        other => Err(ControllerError::Mapping(format!("unsupported firmware '{}'", other))),
    }
}

/// Seconds east of UTC for an offset like `+02:00` or `-05:30`. No offset means UTC.
pub fn parse_utc_offset(offset: Option<&str>) -> Result<i32, ControllerError> {
    let Some(raw) = offset.map(str::trim).filter(|o| !o.is_empty()) else {
        return Ok(0);
    };
    let invalid = || ControllerError::Mapping(format!("invalid UTC offset '{}'", raw));

    let (sign, rest) = match raw.as_bytes()[0] {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    Ok(sign * (hours * 3600 + minutes * 60))
}

const BINARY_SUFFIXES: &[(&str, u128)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
];
const DECIMAL_SUFFIXES: &[(&str, u128)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
];

/// Parse a byte quantity: plain bytes or a Kubernetes quantity (`10Gi`, `1.5G`).
///
/// Fractions must resolve to a whole number of bytes.
pub fn parse_quantity(quantity: &str) -> Result<u64, String> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let multiplier = if suffix.is_empty() {
        1
    } else {
        BINARY_SUFFIXES
            .iter()
            .chain(DECIMAL_SUFFIXES)
            .find(|(s, _)| *s == suffix)
            .map(|(_, m)| *m)
            .ok_or_else(|| format!("unknown quantity suffix in '{}'", quantity))?
    };

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() || fraction.contains('.') || (number.contains('.') && fraction.is_empty()) {
        return Err(format!("malformed quantity '{}'", quantity));
    }
    let whole: u128 = whole.parse().map_err(|_| format!("malformed quantity '{}'", quantity))?;
    let mut bytes = whole
        .checked_mul(multiplier)
        .ok_or_else(|| format!("quantity '{}' is too large", quantity))?;

    if !fraction.is_empty() {
        let digits: u128 = fraction.parse().map_err(|_| format!("malformed quantity '{}'", quantity))?;
        let scale = 10u128
            .checked_pow(fraction.len() as u32)
            .ok_or_else(|| format!("malformed quantity '{}'", quantity))?;
        let scaled = digits
            .checked_mul(multiplier)
            .ok_or_else(|| format!("quantity '{}' is too large", quantity))?;
        if scaled % scale != 0 {
            return Err(format!("quantity '{}' is not a whole number of bytes", quantity));
        }
        bytes += scaled / scale;
    }

    u64::try_from(bytes).map_err(|_| format!("quantity '{}' is too large", quantity))
}

/// Format bytes with the largest binary suffix that represents them exactly
pub fn format_quantity(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, multiplier) in BINARY_SUFFIXES.iter().rev().skip(1) {
        let multiplier = *multiplier as u64;
        if bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    bytes.to_string()
}
