//! VMware provider: disks are copied through VDDK, then virt-v2v converts the
//! guest in place on the copied volumes.

use super::{Provider, ProviderBase, TransferRefs};
use crate::error::ControllerError;
use crate::mapper::DiskPlan;
use crds::{DataVolumeSource, SourcePlatform, VddkSource, VirtualMachineSpec, VolumeMode};
use hypervisor_client::SourceVmSnapshot;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Volume as PodVolume, VolumeDevice, VolumeMount,
};
use kube::Resource;
use tracing::info;

/// ConfigMap key holding the libvirt domain XML virt-v2v converts
pub const DOMAIN_XML_KEY: &str = "input.xml";

const CONFIG_VOLUME: &str = "libvirt-domain-xml";
const CONFIG_MOUNT_PATH: &str = "/mnt/v2v";
const CONVERSION_BACKOFF_LIMIT: i32 = 2;

pub struct VmwareProvider {
    base: ProviderBase,
}

impl VmwareProvider {
    pub fn new(base: ProviderBase) -> Self {
        Self { base }
    }
}

/// Where disk `index` is visible inside the conversion pod
fn disk_path(index: usize, mode: VolumeMode) -> String {
    match mode {
        VolumeMode::Block => format!("/dev/v2v-disk{}", index + 1),
        VolumeMode::Filesystem => format!("/mnt/disks/disk{}/disk.img", index + 1),
    }
}

/// SCSI target name of disk `index`: `sda`..`sdz`, then `sdaa`, `sdab`, ...
fn disk_target(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        letters.push(char::from(b'a' + (n % 26) as u8));
        n /= 26;
    }
    letters.iter().rev().fold(String::from("sd"), |mut target, c| {
        target.push(*c);
        target
    })
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Libvirt domain describing the copied disks, the input virt-v2v converts
pub fn domain_xml(vm_name: &str, vm: &SourceVmSnapshot, vm_spec: &VirtualMachineSpec, plans: &[DiskPlan]) -> String {
    let memory_kib = vm.memory_bytes / 1024;
    let vcpus = vm_spec
        .template
        .spec
        .domain
        .cpu
        .as_ref()
        .map(|cpu| cpu.sockets.saturating_mul(cpu.cores).saturating_mul(cpu.threads))
        .unwrap_or(vm.cpu.total_vcpus)
        .max(1);
    let efi = vm_spec
        .template
        .spec
        .domain
        .firmware
        .as_ref()
        .and_then(|f| f.bootloader.as_ref())
        .is_some_and(|b| b.efi.is_some());

    let mut xml = String::new();
    xml.push_str("<domain type='kvm'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", escape_xml(vm_name)));
    xml.push_str(&format!("  <memory unit='KiB'>{}</memory>\n", memory_kib));
    xml.push_str(&format!("  <vcpu>{}</vcpu>\n", vcpus));
    xml.push_str("  <os>\n");
    xml.push_str("    <type arch='x86_64'>hvm</type>\n");
    if efi {
        xml.push_str("    <loader readonly='yes' type='pflash'>/usr/share/OVMF/OVMF_CODE.fd</loader>\n");
    }
    xml.push_str("  </os>\n");
    xml.push_str("  <devices>\n");
    for (index, plan) in plans.iter().enumerate() {
        let path = escape_xml(&disk_path(index, plan.volume_mode));
        match plan.volume_mode {
            VolumeMode::Block => {
                xml.push_str("    <disk type='block' device='disk'>\n");
                xml.push_str("      <driver name='qemu' type='raw'/>\n");
                xml.push_str(&format!("      <source dev='{}'/>\n", path));
            }
            VolumeMode::Filesystem => {
                xml.push_str("    <disk type='file' device='disk'>\n");
                xml.push_str("      <driver name='qemu' type='raw'/>\n");
                xml.push_str(&format!("      <source file='{}'/>\n", path));
            }
        }
        xml.push_str(&format!("      <target dev='{}' bus='scsi'/>\n", disk_target(index)));
        xml.push_str("    </disk>\n");
    }
    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

impl VmwareProvider {
    fn conversion_job(&self, config_map_name: &str, plans: &[DiskPlan]) -> Job {
        let config = &self.base.config;
        let mut volumes = Vec::with_capacity(plans.len() + 1);
        let mut mounts = Vec::with_capacity(plans.len() + 1);
        let mut devices = Vec::new();

        for (index, plan) in plans.iter().enumerate() {
            let volume_name = format!("disk{}", index + 1);
            volumes.push(PodVolume {
                name: volume_name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: plan.volume_name.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            });
            match plan.volume_mode {
                VolumeMode::Block => devices.push(VolumeDevice {
                    name: volume_name,
                    device_path: disk_path(index, VolumeMode::Block),
                }),
                VolumeMode::Filesystem => mounts.push(VolumeMount {
                    name: volume_name,
                    mount_path: format!("/mnt/disks/disk{}", index + 1),
                    ..Default::default()
                }),
            }
        }

        volumes.push(PodVolume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name.to_string().into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });

        Job {
            spec: Some(JobSpec {
                backoff_limit: Some(CONVERSION_BACKOFF_LIMIT),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "virt-v2v".to_string(),
                            image: Some(config.virtv2v_image.clone()),
                            image_pull_policy: Some(config.image_pull_policy.clone()),
                            args: Some(vec![
                                "-i".to_string(),
                                "libvirtxml".to_string(),
                                format!("{}/{}", CONFIG_MOUNT_PATH, DOMAIN_XML_KEY),
                                "--in-place".to_string(),
                            ]),
                            volume_mounts: Some(mounts),
                            volume_devices: (!devices.is_empty()).then_some(devices),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Provider for VmwareProvider {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ProviderBase {
        &mut self.base
    }

    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Vmware
    }

    fn needs_guest_conversion(&self) -> bool {
        true
    }

    async fn prepare_transfer(&self) -> Result<TransferRefs, ControllerError> {
        let secret = self.base.ensure_transfer_secret().await?;
        Ok(TransferRefs {
            secret_name: secret.meta().name.clone().unwrap_or_default(),
            cert_config_map: None,
        })
    }

    fn data_volume_source(&self, plan: &DiskPlan, transfer: &TransferRefs) -> Result<DataVolumeSource, ControllerError> {
        let vm = self.base.vm()?;
        let uuid = vm.uuid.clone().ok_or_else(|| {
            ControllerError::Mapping(format!("VM {} has no BIOS UUID, VDDK cannot locate it", vm.name))
        })?;
        let credentials = self.base.credentials()?;
        Ok(DataVolumeSource {
            imageio: None,
            vddk: Some(VddkSource {
                url: credentials.api_url.clone(),
                secret_ref: transfer.secret_name.clone(),
                uuid,
                backing_file: plan.disk.backing_location.clone(),
                thumbprint: credentials.thumbprint.clone(),
            }),
        })
    }

    async fn launch_guest_conversion_job(
        &self,
        vm_spec: &VirtualMachineSpec,
        plans: &[DiskPlan],
    ) -> Result<Job, ControllerError> {
        let vm = self.base.vm()?;
        let import = &self.base.import;
        let xml = domain_xml(&import.name, vm, vm_spec, plans);

        let config_map = self
            .base
            .config_maps
            .ensure_for(import, || ConfigMap {
                data: Some([(DOMAIN_XML_KEY.to_string(), xml)].into()),
                ..Default::default()
            })
            .await?;
        let config_map_name = config_map.meta().name.clone().unwrap_or_default();

        if let Some(job) = self.base.jobs.find_for(import).await? {
            return Ok(job);
        }
        let job = self
            .base
            .jobs
            .create_for(import, self.conversion_job(&config_map_name, plans))
            .await?;
        info!(
            "Launched guest conversion job {} for import {}",
            job.meta().name.as_deref().unwrap_or_default(),
            import
        );
        Ok(job)
    }
}
