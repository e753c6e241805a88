//! Source providers.
//!
//! A [`Provider`] wraps one source platform for the duration of one
//! reconcile pass: it owns the hypervisor connection and the fetched VM
//! snapshot, and creates the platform-specific subordinate resources (transfer
//! credentials, CA bundles, conversion jobs). The orchestrator only talks to
//! the trait; the set of platforms is closed and chosen by [`provider_for`].

mod ovirt;
mod vmware;

pub use ovirt::OvirtProvider;
pub use vmware::VmwareProvider;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::managed::{ImportRef, ManagedResources};
use crate::mapper::{DiskPlan, VmMapper};
use crate::store::Stores;
use crate::validation::{ValidationFailure, validate_mappings, validate_vm};
use crds::{DataVolume, DataVolumeSource, Mappings, SourcePlatform, SourceVmIdentity, VirtualMachine, VirtualMachineSpec};
use hypervisor_client::{
    Credentials, HypervisorClientTrait, HypervisorConnector, HypervisorError, Platform, PowerState, SourceVmSnapshot,
    VmSelector,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Secret keys CDI reads transfer credentials from
pub const ACCESS_KEY_ID: &str = "accessKeyId";
pub const SECRET_KEY: &str = "secretKey";

/// Everything a provider needs from the controller
#[derive(Clone)]
pub struct ProviderContext {
    pub stores: Stores,
    pub connector: Arc<dyn HypervisorConnector>,
    pub config: Arc<ControllerConfig>,
}

/// Names of the transient objects a disk transfer reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRefs {
    pub secret_name: String,
    pub cert_config_map: Option<String>,
}

/// Progress of a guest conversion job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionState {
    Running,
    Succeeded,
    Failed(String),
}

impl ConversionState {
    pub fn of(job: &Job) -> Self {
        let Some(status) = &job.status else {
            return ConversionState::Running;
        };
        let condition = |kind: &str| {
            status
                .conditions
                .iter()
                .flatten()
                .find(|c| c.type_ == kind && c.status == "True")
        };
        if condition("Complete").is_some() || status.succeeded.unwrap_or(0) > 0 {
            return ConversionState::Succeeded;
        }
        if let Some(failed) = condition("Failed") {
            return ConversionState::Failed(
                failed
                    .message
                    .clone()
                    .unwrap_or_else(|| "conversion job failed".to_string()),
            );
        }
        ConversionState::Running
    }
}

/// State shared by every provider implementation
pub struct ProviderBase {
    pub import: ImportRef,
    pub config: Arc<ControllerConfig>,
    connector: Arc<dyn HypervisorConnector>,
    client: Option<Box<dyn HypervisorClientTrait>>,
    credentials: Option<Credentials>,
    vm: Option<SourceVmSnapshot>,
    mappings: Mappings,
    pub secrets: ManagedResources<Secret>,
    pub config_maps: ManagedResources<ConfigMap>,
    pub jobs: ManagedResources<Job>,
    pub data_volumes: ManagedResources<DataVolume>,
    pub virtual_machines: ManagedResources<VirtualMachine>,
}

impl ProviderBase {
    pub fn new(import: ImportRef, ctx: &ProviderContext) -> Self {
        Self {
            import,
            config: Arc::clone(&ctx.config),
            connector: Arc::clone(&ctx.connector),
            client: None,
            credentials: None,
            vm: None,
            mappings: Mappings::default(),
            secrets: ManagedResources::owned(Arc::clone(&ctx.stores.secrets)),
            config_maps: ManagedResources::owned(Arc::clone(&ctx.stores.config_maps)),
            jobs: ManagedResources::owned(Arc::clone(&ctx.stores.jobs)),
            data_volumes: ManagedResources::unowned(Arc::clone(&ctx.stores.data_volumes)),
            virtual_machines: ManagedResources::unowned(Arc::clone(&ctx.stores.virtual_machines)),
        }
    }

    fn client(&self) -> Result<&dyn HypervisorClientTrait, ControllerError> {
        self.client
            .as_deref()
            .ok_or(ControllerError::Hypervisor(HypervisorError::NotConnected))
    }

    pub fn credentials(&self) -> Result<&Credentials, ControllerError> {
        self.credentials
            .as_ref()
            .ok_or(ControllerError::Hypervisor(HypervisorError::NotConnected))
    }

    pub fn vm(&self) -> Result<&SourceVmSnapshot, ControllerError> {
        self.vm
            .as_ref()
            .ok_or_else(|| ControllerError::MissingResource(format!("source VM of import {} not loaded", self.import)))
    }

    pub fn mappings(&self) -> &Mappings {
        &self.mappings
    }

    /// Ensure the transient Secret CDI reads transfer credentials from
    pub async fn ensure_transfer_secret(&self) -> Result<Secret, ControllerError> {
        let credentials = self.credentials()?;
        let data: BTreeMap<String, ByteString> = [
            (ACCESS_KEY_ID.to_string(), ByteString(credentials.username.clone().into_bytes())),
            (SECRET_KEY.to_string(), ByteString(credentials.password.clone().into_bytes())),
        ]
        .into();
        self.secrets
            .ensure_for(&self.import, || Secret {
                data: Some(data),
                ..Default::default()
            })
            .await
    }
}

/// Decode secret `data` and `stringData` into plain strings
fn secret_strings(secret: &Secret) -> Result<BTreeMap<String, String>, ControllerError> {
    let mut values = BTreeMap::new();
    for (key, value) in secret.data.iter().flatten() {
        let decoded = String::from_utf8(value.0.clone())
            .map_err(|_| ControllerError::InvalidSpec(format!("credentials key '{}' is not valid UTF-8", key)))?;
        values.insert(key.clone(), decoded);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        values.insert(key.clone(), value.clone());
    }
    Ok(values)
}

/// Hypervisor platform for a source platform
pub fn hypervisor_platform(platform: SourcePlatform) -> Platform {
    match platform {
        SourcePlatform::Ovirt => Platform::Ovirt,
        SourcePlatform::Vmware => Platform::Vmware,
    }
}

/// Workflow contract of one source platform
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn base(&self) -> &ProviderBase;
    fn base_mut(&mut self) -> &mut ProviderBase;
    fn platform(&self) -> SourcePlatform;

    /// Read credentials from the provider secret and open the connection
    async fn init(&mut self, secret: &Secret) -> Result<(), ControllerError> {
        let credentials = Credentials::from_secret_data(&secret_strings(secret)?)?;
        let platform = hypervisor_platform(self.platform());
        debug!("Connecting to {} at {} for import {}", platform, credentials.api_url, self.base().import);
        let client = self.base().connector.connect(platform, &credentials).await?;
        let base = self.base_mut();
        base.client = Some(client);
        base.credentials = Some(credentials);
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), ControllerError> {
        Ok(self.base().client()?.test_connection().await?)
    }

    /// Fetch the source VM by id, or by name within an optional cluster
    async fn load_source_vm(&mut self, identity: &SourceVmIdentity) -> Result<(), ControllerError> {
        let selector = match (&identity.id, &identity.name) {
            (Some(id), _) => VmSelector::Id(id.clone()),
            (None, Some(name)) => VmSelector::Name {
                name: name.clone(),
                cluster: identity.cluster.clone(),
            },
            (None, None) => {
                return Err(ControllerError::InvalidSpec(
                    "source VM must be identified by id or name".to_string(),
                ));
            }
        };
        let vm = self.base().client()?.fetch_vm(&selector).await?;
        info!("Loaded source VM {} ({}) for import {}", vm.name, vm.id, self.base().import);
        self.base_mut().vm = Some(vm);
        Ok(())
    }

    /// Mapping rules used by validation and the mapper
    fn set_mappings(&mut self, mappings: Mappings) {
        self.base_mut().mappings = mappings;
    }

    fn vm_name(&self) -> Result<String, ControllerError> {
        Ok(self.base().vm()?.name.clone())
    }

    fn vm_status(&self) -> Result<PowerState, ControllerError> {
        Ok(self.base().vm()?.power_state.clone())
    }

    async fn start_vm(&self) -> Result<(), ControllerError> {
        let vm = self.base().vm()?;
        self.base().client()?.start_vm(&vm.id).await?;
        info!("Started source VM {} for import {}", vm.name, self.base().import);
        Ok(())
    }

    async fn stop_vm(&self) -> Result<(), ControllerError> {
        let vm = self.base().vm()?;
        self.base().client()?.stop_vm(&vm.id).await?;
        info!("Stopped source VM {} for import {}", vm.name, self.base().import);
        Ok(())
    }

    fn create_mapper(&self) -> Result<VmMapper, ControllerError> {
        Ok(VmMapper::new(self.base().vm()?.clone(), self.base().mappings.clone()))
    }

    /// Admission checks on the loaded VM and the mapping rules
    fn validate(&self) -> Result<Vec<ValidationFailure>, ControllerError> {
        let vm = self.base().vm()?;
        let mut failures = validate_vm(vm);
        failures.extend(validate_mappings(vm, &self.base().mappings));
        Ok(failures)
    }

    fn needs_guest_conversion(&self) -> bool;

    /// Ensure the transient objects the disk transfers read
    async fn prepare_transfer(&self) -> Result<TransferRefs, ControllerError>;

    /// CDI source for one planned disk
    fn data_volume_source(&self, plan: &DiskPlan, transfer: &TransferRefs) -> Result<DataVolumeSource, ControllerError>;

    async fn get_guest_conversion_job(&self) -> Result<Option<Job>, ControllerError> {
        self.base().jobs.find_for(&self.base().import).await
    }

    /// Ensure the guest conversion job bound to the copied volumes
    async fn launch_guest_conversion_job(
        &self,
        _vm_spec: &VirtualMachineSpec,
        _plans: &[DiskPlan],
    ) -> Result<Job, ControllerError> {
        Err(ControllerError::InvalidSpec(format!(
            "{} imports do not use guest conversion",
            self.platform().as_str()
        )))
    }

    /// Delete transient subordinate resources.
    ///
    /// Credentials and config are always deleted and the conversion job is
    /// always kept. On failure the DataVolumes and the target VM are deleted
    /// too. Every resource is attempted; all errors are reported together.
    async fn clean_up(&self, failure: bool) -> Result<(), ControllerError> {
        let base = self.base();
        let import = &base.import;
        let mut failures = Vec::new();

        if let Err(e) = base.secrets.delete_for(import).await {
            failures.push(format!("Secret: {}", e));
        }
        if let Err(e) = base.config_maps.delete_for(import).await {
            failures.push(format!("ConfigMap: {}", e));
        }

        if failure {
            match base.data_volumes.list_for(import).await {
                Ok(volumes) => {
                    for volume in volumes {
                        let name = volume.meta().name.clone().unwrap_or_default();
                        if let Err(e) = base.data_volumes.delete_named(import, &name).await {
                            failures.push(format!("DataVolume {}: {}", name, e));
                        }
                    }
                }
                Err(e) => failures.push(format!("DataVolumes: {}", e)),
            }
            match base.virtual_machines.list_for(import).await {
                Ok(vms) => {
                    for vm in vms {
                        let name = vm.meta().name.clone().unwrap_or_default();
                        if let Err(e) = base.virtual_machines.delete_named(import, &name).await {
                            failures.push(format!("VirtualMachine {}: {}", name, e));
                        }
                    }
                }
                Err(e) => failures.push(format!("VirtualMachines: {}", e)),
            }
        }

        if failures.is_empty() {
            info!("Cleaned up import {} (failure: {})", import, failure);
            Ok(())
        } else {
            Err(ControllerError::Cleanup {
                import: import.to_string(),
                failures,
            })
        }
    }

    /// Release the hypervisor connection. Safe to call more than once.
    async fn close(&mut self) {
        let Some(client) = self.base_mut().client.take() else {
            return;
        };
        if let Err(e) = client.close().await {
            warn!("Failed to close hypervisor connection for import {}: {}", self.base().import, e);
        }
    }
}

/// Provider for the import's source platform
pub fn provider_for(platform: SourcePlatform, import: ImportRef, ctx: &ProviderContext) -> Box<dyn Provider> {
    let base = ProviderBase::new(import, ctx);
    match platform {
        SourcePlatform::Ovirt => Box::new(OvirtProvider::new(base)),
        SourcePlatform::Vmware => Box::new(VmwareProvider::new(base)),
    }
}
