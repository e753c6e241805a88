//! Import orchestrator.
//!
//! [`Reconciler::reconcile_import`] is the single re-entrant pass that drives a
//! `VirtualMachineImport` through its phases:
//!
//! `New -> Connecting -> Validating -> MappingResources -> CreatingVolumes ->
//! (PoweringOffSource) -> (EnsuringGuestConversion) -> CreatingTargetVM -> Succeeded`
//!
//! Any permanent error moves the import to `Failed` and rolls back the copied
//! volumes and the target VM. Deleting the import runs
//! `Deleting -> CleaningUp -> Deleted` before the cleanup finalizer is released.
//!
//! Each pass resumes from what already exists in the cluster: subordinate
//! resources are found by label or deterministic name before anything is
//! created, and status is only written when it changed.

use crate::backoff::FibonacciBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::managed::ImportRef;
use crate::mapper::DiskPlan;
use crate::os::load_os_maps;
use crate::provider::{ConversionState, Provider, ProviderContext, provider_for};
use crate::store::{Stores, with_resource_version};
use crate::templates::{VmSkeleton, find_template, process_template};
use crate::validation::{Severity, failure_conditions, summary_conditions};
use crds::{
    CLEANUP_FINALIZER, CONDITION_OS_MAP_OVERRIDE, CONDITION_PROCESSING, CONDITION_SUCCEEDED, CONDITION_VALIDATION_PREFIX, Condition,
    ConditionStatus, DataVolume, DataVolumeItem, DataVolumePvc, DataVolumeSpec, IMPORT_LABEL, ImportPhase,
    Mappings, OS_LABEL_PREFIX, PlatformSource, PvcRequests, PvcResources, RESTORE_VM_STATE_FINALIZER,
    SOURCE_PLATFORM_LABEL, SOURCE_VM_ID_ANNOTATION, SourcePlatform, VirtualMachine, VirtualMachineImport,
    VirtualMachineImportStatus, VirtualMachineSpec, find_condition, set_condition,
};
use hypervisor_client::{HypervisorConnector, PowerState};
use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use kube_runtime::controller::Action;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue delay after an optimistic concurrency conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Access mode of every imported disk
const ACCESS_MODE: &str = "ReadWriteOnce";

/// Backoff state for an import
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_seconds, max_seconds),
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Everything the mapping phase produced, kept for the rest of the pass
struct ImportPlan {
    target_vm_name: String,
    disks: Vec<DiskPlan>,
    vm_spec: VirtualMachineSpec,
    labels: BTreeMap<String, String>,
}

/// Reconciles `VirtualMachineImport` resources.
pub struct Reconciler {
    pub(crate) stores: Stores,
    ctx: ProviderContext,
    config: Arc<ControllerConfig>,
    /// Error count tracking per import (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(stores: Stores, connector: Arc<dyn HypervisorConnector>, config: ControllerConfig) -> Self {
        let config = Arc::new(config);
        Self {
            ctx: ProviderContext {
                stores: stores.clone(),
                connector,
                config: Arc::clone(&config),
            },
            stores,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next backoff delay and error count for an import
    fn get_backoff_for_resource(&self, resource_key: &str) -> (Duration, u32) {
        let mut states = match self.backoff_states.lock() {
            Ok(states) => states,
            Err(e) => {
                warn!("Backoff state lock poisoned: {}", e);
                return (Duration::from_secs(self.config.retry_min_secs), 0);
            }
        };
        let state = states
            .entry(resource_key.to_string())
            .or_insert_with(|| BackoffState::new(self.config.retry_min_secs, self.config.retry_max_secs));
        state.increment_error();
        (state.backoff.next_backoff(), state.error_count)
    }

    fn reset_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }

    /// Run one reconcile pass for an import.
    ///
    /// Only unexpected failures are returned as errors; everything the import
    /// can recover from is turned into a requeue here.
    pub async fn reconcile_import(&self, import: &VirtualMachineImport) -> Result<Action, ControllerError> {
        let import_ref = ImportRef::from_import(import)?;
        let key = import_ref.to_string();

        let result = if import.metadata.deletion_timestamp.is_some() {
            self.finalize(import.clone(), &import_ref).await
        } else {
            self.run_pass(import.clone(), &import_ref).await
        };

        match result {
            Ok(action) => {
                self.reset_error(&key);
                Ok(action)
            }
            Err(e) if e.is_conflict() => {
                debug!("Import {} changed during the pass, retrying: {}", key, e);
                Ok(Action::requeue(CONFLICT_REQUEUE))
            }
            Err(e) if e.is_permanent() && import.metadata.deletion_timestamp.is_none() => {
                error!("Import {} failed: {}", key, e);
                match self.fail_import(&import_ref, &e).await {
                    Ok(action) => Ok(action),
                    Err(fail_err) if fail_err.is_conflict() => Ok(Action::requeue(CONFLICT_REQUEUE)),
                    Err(fail_err) => Ok(self.retry_later(&import_ref, &fail_err).await),
                }
            }
            Err(e) => Ok(self.retry_later(&import_ref, &e).await),
        }
    }

    /// Record a transient error and requeue with backoff
    async fn retry_later(&self, import_ref: &ImportRef, err: &ControllerError) -> Action {
        let key = import_ref.to_string();
        let (delay, error_count) = self.get_backoff_for_resource(&key);
        warn!(
            "Import {} hit a transient error (attempt {}), retrying in {:?}: {}",
            key, error_count, delay, err
        );

        if let Err(e) = self.record_retry(import_ref, err).await {
            debug!("Could not record retry condition on import {}: {}", key, e);
        }
        Action::requeue(delay)
    }

    async fn record_retry(&self, import_ref: &ImportRef, err: &ControllerError) -> Result<(), ControllerError> {
        let Some(mut import) = self.stores.imports.get(&import_ref.namespace, &import_ref.name).await? else {
            return Ok(());
        };
        let mut status = import.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_PROCESSING, ConditionStatus::True, err.reason(), err.to_string()),
        );
        self.write_status(&mut import, import_ref, &status).await
    }

    async fn run_pass(&self, mut import: VirtualMachineImport, import_ref: &ImportRef) -> Result<Action, ControllerError> {
        let mut status = import.status.clone().unwrap_or_default();
        if status.phase == ImportPhase::Failed {
            return self.finish_failed(&mut import, import_ref).await;
        }
        if status.phase.is_terminal() {
            debug!("Import {} is {}, nothing to do", import_ref, status.phase);
            return Ok(Action::await_change());
        }

        self.ensure_finalizer(&mut import, import_ref, CLEANUP_FINALIZER).await?;

        let (platform, source) = import.spec.source.selected().ok_or_else(|| {
            ControllerError::InvalidSpec("exactly one of source.ovirt or source.vmware must be set".to_string())
        })?;
        let source = source.clone();

        let mut provider = provider_for(platform, import_ref.clone(), &self.ctx);
        let result = self
            .drive(&mut import, import_ref, &mut status, provider.as_mut(), platform, &source)
            .await;
        provider.close().await;
        result
    }

    async fn drive(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        status: &mut VirtualMachineImportStatus,
        provider: &mut dyn Provider,
        platform: SourcePlatform,
        source: &PlatformSource,
    ) -> Result<Action, ControllerError> {
        self.enter_phase(import, import_ref, status, ImportPhase::Connecting).await?;
        let secret = self.provider_secret(import, import_ref).await?;
        provider.init(&secret).await?;
        provider.test_connection().await?;
        provider.load_source_vm(&source.vm).await?;
        let mappings = self.resolve_mappings(import, import_ref, platform, source).await?;
        provider.set_mappings(mappings);

        self.enter_phase(import, import_ref, status, ImportPhase::Validating).await?;
        self.validate(import, import_ref, status, provider).await?;

        self.enter_phase(import, import_ref, status, ImportPhase::MappingResources).await?;
        let plan = self.map_resources(import, status, provider).await?;

        self.enter_phase(import, import_ref, status, ImportPhase::CreatingVolumes).await?;
        self.create_volumes(import_ref, status, provider, &plan).await?;
        self.write_status(import, import_ref, status).await?;

        if import.spec.cold_copy && provider.vm_status()? == PowerState::Up {
            self.enter_phase(import, import_ref, status, ImportPhase::PoweringOffSource).await?;
            self.ensure_finalizer(import, import_ref, RESTORE_VM_STATE_FINALIZER).await?;
            provider.stop_vm().await?;
        }

        if let Some(pending) = self.pending_volumes(import_ref, provider, &plan).await? {
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_PROCESSING, ConditionStatus::True, "CopyingDisks", pending),
            );
            self.write_status(import, import_ref, status).await?;
            return Ok(Action::requeue(self.config.requeue_interval));
        }

        if provider.needs_guest_conversion() {
            self.enter_phase(import, import_ref, status, ImportPhase::EnsuringGuestConversion).await?;
            let job = match provider.get_guest_conversion_job().await? {
                Some(job) => job,
                None => provider.launch_guest_conversion_job(&plan.vm_spec, &plan.disks).await?,
            };
            match ConversionState::of(&job) {
                ConversionState::Succeeded => {
                    info!("Guest conversion finished for import {}", import_ref);
                }
                ConversionState::Failed(message) => return Err(ControllerError::ConversionFailed(message)),
                ConversionState::Running => {
                    set_condition(
                        &mut status.conditions,
                        Condition::new(
                            CONDITION_PROCESSING,
                            ConditionStatus::True,
                            "ConvertingGuest",
                            format!("waiting for job {}", job.meta().name.as_deref().unwrap_or_default()),
                        ),
                    );
                    self.write_status(import, import_ref, status).await?;
                    return Ok(Action::requeue(self.config.requeue_interval));
                }
            }
        }

        self.enter_phase(import, import_ref, status, ImportPhase::CreatingTargetVm).await?;
        self.ensure_target_vm(import_ref, provider, platform, &plan).await?;

        self.succeed(import, import_ref, status, provider, &plan).await
    }

    /// Record the validation results; blocking failures stop the import
    async fn validate(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        status: &mut VirtualMachineImportStatus,
        provider: &dyn Provider,
    ) -> Result<(), ControllerError> {
        let failures = provider.validate()?;
        let (mapping_checks, vm_checks): (Vec<_>, Vec<_>) =
            failures.iter().cloned().partition(|f| f.check_id.starts_with("mapping."));

        let reported: Vec<String> = failures
            .iter()
            .map(|f| format!("{}{}", CONDITION_VALIDATION_PREFIX, f.check_id))
            .collect();
        status.conditions.retain(|c| {
            !c.condition_type.starts_with(CONDITION_VALIDATION_PREFIX) || reported.contains(&c.condition_type)
        });
        for failure in &failures {
            match failure.severity {
                Severity::Block => warn!("Import {} blocked by {}: {}", import_ref, failure.check_id, failure.message),
                Severity::Warn => warn!("Import {} check {}: {}", import_ref, failure.check_id, failure.message),
                Severity::Log => info!("Import {} check {}: {}", import_ref, failure.check_id, failure.message),
            }
        }
        for condition in failure_conditions(&failures) {
            set_condition(&mut status.conditions, condition);
        }
        for condition in summary_conditions(&vm_checks, &mapping_checks) {
            set_condition(&mut status.conditions, condition);
        }
        self.write_status(import, import_ref, status).await?;

        let blocking: Vec<&str> = failures
            .iter()
            .filter(|f| f.severity == Severity::Block)
            .map(|f| f.message.as_str())
            .collect();
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(ControllerError::ValidationFailed(blocking.join("; ")))
        }
    }

    /// Name the target, plan the disks, resolve OS and template, and map the VM
    async fn map_resources(
        &self,
        import: &VirtualMachineImport,
        status: &mut VirtualMachineImportStatus,
        provider: &dyn Provider,
    ) -> Result<ImportPlan, ControllerError> {
        let mapper = provider.create_mapper()?;
        let target_vm_name = match &status.target_vm_name {
            Some(name) => name.clone(),
            None => mapper.resolve_vm_name(import.spec.target_vm_name.as_deref())?,
        };
        status.target_vm_name = Some(target_vm_name.clone());

        let disks = mapper.map_data_volumes(&target_vm_name)?;

        let os_maps = load_os_maps(self.stores.config_maps.as_ref(), self.config.os_config_map.as_ref()).await;
        match &os_maps.override_error {
            Some(e) => set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_OS_MAP_OVERRIDE,
                    ConditionStatus::False,
                    "BuiltinOSMapsInUse",
                    e.to_string(),
                ),
            ),
            None => status.conditions.retain(|c| c.condition_type != CONDITION_OS_MAP_OVERRIDE),
        }
        let os = os_maps.maps.resolve(&provider.base().vm()?.guest_os)?;
        debug!("Resolved OS {} for source VM {}", os, provider.vm_name()?);

        let skeleton = match &self.config.template_namespace {
            Some(namespace) => {
                let template = find_template(self.stores.templates.as_ref(), namespace, &os).await?;
                process_template(&template, &target_vm_name)?
            }
            None => VmSkeleton::default(),
        };

        let mut vm_spec = mapper.map_vm(skeleton.spec, &os)?;
        for disk in &disks {
            mapper.map_disk(&mut vm_spec, disk);
        }
        let mut labels = skeleton.labels;
        labels.insert(format!("{}{}", OS_LABEL_PREFIX, os), "true".to_string());

        Ok(ImportPlan {
            target_vm_name,
            disks,
            vm_spec,
            labels,
        })
    }

    async fn create_volumes(
        &self,
        import_ref: &ImportRef,
        status: &mut VirtualMachineImportStatus,
        provider: &dyn Provider,
        plan: &ImportPlan,
    ) -> Result<(), ControllerError> {
        let transfer = provider.prepare_transfer().await?;
        for disk in &plan.disks {
            let data_volume = DataVolume::new(
                &disk.volume_name,
                DataVolumeSpec {
                    source: provider.data_volume_source(disk, &transfer)?,
                    pvc: DataVolumePvc {
                        access_modes: vec![ACCESS_MODE.to_string()],
                        resources: PvcResources {
                            requests: PvcRequests {
                                storage: disk.size.clone(),
                            },
                        },
                        storage_class_name: disk.storage_class.clone(),
                        volume_mode: Some(disk.volume_mode),
                    },
                },
            );
            provider.base().data_volumes.ensure_named(import_ref, data_volume).await?;
        }
        status.data_volumes = plan
            .disks
            .iter()
            .map(|d| DataVolumeItem {
                name: d.volume_name.clone(),
            })
            .collect();
        Ok(())
    }

    /// `None` once every volume finished copying, else a progress message
    async fn pending_volumes(
        &self,
        import_ref: &ImportRef,
        provider: &dyn Provider,
        plan: &ImportPlan,
    ) -> Result<Option<String>, ControllerError> {
        let mut pending = Vec::new();
        for disk in &plan.disks {
            let volume = provider
                .base()
                .data_volumes
                .find_named(import_ref, &disk.volume_name)
                .await?
                .ok_or_else(|| ControllerError::MissingResource(format!("DataVolume {}", disk.volume_name)))?;
            if volume.is_failed() {
                return Err(ControllerError::DataVolumeFailed(disk.volume_name.clone()));
            }
            if !volume.is_succeeded() {
                let progress = volume
                    .status
                    .as_ref()
                    .and_then(|s| s.progress.clone())
                    .unwrap_or_else(|| "N/A".to_string());
                pending.push(format!("{} ({})", disk.volume_name, progress));
            }
        }
        if pending.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!("copying disks: {}", pending.join(", "))))
        }
    }

    async fn ensure_target_vm(
        &self,
        import_ref: &ImportRef,
        provider: &dyn Provider,
        platform: SourcePlatform,
        plan: &ImportPlan,
    ) -> Result<(), ControllerError> {
        let virtual_machines = &provider.base().virtual_machines;
        let name = &plan.target_vm_name;

        if let Some(existing) = virtual_machines.find_named(import_ref, name).await? {
            let ours = existing
                .meta()
                .labels
                .as_ref()
                .and_then(|l| l.get(IMPORT_LABEL))
                .is_some_and(|v| *v == import_ref.label_value());
            if !ours {
                return Err(ControllerError::InvalidSpec(format!(
                    "VirtualMachine {}/{} already exists and was not created by this import",
                    import_ref.namespace, name
                )));
            }
            let mut spec = plan.vm_spec.clone();
            spec.running = existing.spec.running;
            let patch = with_resource_version(json!({"spec": spec}), existing.meta().resource_version.as_deref());
            self.stores.virtual_machines.merge_patch(&import_ref.namespace, name, &patch).await?;
            debug!("Updated target VM {}/{} for import {}", import_ref.namespace, name, import_ref);
            return Ok(());
        }

        let mut vm = VirtualMachine::new(name, plan.vm_spec.clone());
        let mut labels = plan.labels.clone();
        labels.insert(SOURCE_PLATFORM_LABEL.to_string(), platform.as_str().to_string());
        vm.metadata.labels = Some(labels);
        vm.metadata.annotations = Some(
            [(SOURCE_VM_ID_ANNOTATION.to_string(), provider.base().vm()?.id.clone())].into(),
        );
        vm.spec.running = Some(false);
        virtual_machines.ensure_named(import_ref, vm).await?;
        Ok(())
    }

    async fn succeed(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        status: &mut VirtualMachineImportStatus,
        provider: &dyn Provider,
        plan: &ImportPlan,
    ) -> Result<Action, ControllerError> {
        provider.clean_up(false).await?;
        self.remove_finalizer(import, import_ref, RESTORE_VM_STATE_FINALIZER).await?;

        if import.spec.start_vm.unwrap_or(false) {
            self.stores
                .virtual_machines
                .merge_patch(&import_ref.namespace, &plan.target_vm_name, &json!({"spec": {"running": true}}))
                .await?;
            info!("Started target VM {}/{}", import_ref.namespace, plan.target_vm_name);
        }

        status.phase = ImportPhase::Succeeded;
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_SUCCEEDED,
                ConditionStatus::True,
                "VirtualMachineReady",
                format!("imported as VirtualMachine {}", plan.target_vm_name),
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_PROCESSING, ConditionStatus::False, "Completed", "import finished"),
        );
        self.write_status(import, import_ref, status).await?;
        info!("Import {} succeeded: VirtualMachine {}", import_ref, plan.target_vm_name);
        Ok(Action::await_change())
    }

    /// Move a running import to `Failed`, then roll it back
    async fn fail_import(&self, import_ref: &ImportRef, err: &ControllerError) -> Result<Action, ControllerError> {
        let Some(mut import) = self.stores.imports.get(&import_ref.namespace, &import_ref.name).await? else {
            return Ok(Action::await_change());
        };
        let mut status = import.status.clone().unwrap_or_default();
        status.phase = ImportPhase::Failed;
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_SUCCEEDED, ConditionStatus::False, err.reason(), err.to_string()),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_PROCESSING, ConditionStatus::False, err.reason(), "import failed"),
        );
        self.write_status(&mut import, import_ref, &status).await?;
        self.finish_failed(&mut import, import_ref).await
    }

    /// Roll back a failed import. Safe to repeat until it completes.
    async fn finish_failed(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
    ) -> Result<Action, ControllerError> {
        let Some((platform, _)) = import.spec.source.selected() else {
            return Ok(Action::await_change());
        };
        provider_for(platform, import_ref.clone(), &self.ctx).clean_up(true).await?;

        if has_finalizer(import, RESTORE_VM_STATE_FINALIZER) {
            self.restore_source_vm(import, import_ref).await?;
            self.remove_finalizer(import, import_ref, RESTORE_VM_STATE_FINALIZER).await?;
        }
        Ok(Action::await_change())
    }

    /// Deletion path: restore the source VM if needed, clean up, release the import
    async fn finalize(&self, mut import: VirtualMachineImport, import_ref: &ImportRef) -> Result<Action, ControllerError> {
        if !has_finalizer(&import, CLEANUP_FINALIZER) && !has_finalizer(&import, RESTORE_VM_STATE_FINALIZER) {
            return Ok(Action::await_change());
        }
        info!("Finalizing deleted import {}", import_ref);

        let mut status = import.status.clone().unwrap_or_default();
        let succeeded = find_condition(&status.conditions, CONDITION_SUCCEEDED)
            .is_some_and(|c| c.status == ConditionStatus::True);

        self.enter_phase(&mut import, import_ref, &mut status, ImportPhase::Deleting).await?;
        if has_finalizer(&import, RESTORE_VM_STATE_FINALIZER) {
            self.restore_source_vm(&import, import_ref).await?;
            self.remove_finalizer(&mut import, import_ref, RESTORE_VM_STATE_FINALIZER).await?;
        }

        self.enter_phase(&mut import, import_ref, &mut status, ImportPhase::CleaningUp).await?;
        if let Some((platform, _)) = import.spec.source.selected() {
            provider_for(platform, import_ref.clone(), &self.ctx)
                .clean_up(!succeeded)
                .await?;
        }

        self.enter_phase(&mut import, import_ref, &mut status, ImportPhase::Deleted).await?;
        self.remove_finalizer(&mut import, import_ref, CLEANUP_FINALIZER).await?;
        info!("Import {} deleted", import_ref);
        Ok(Action::await_change())
    }

    /// Power the source VM back on after the import stopped it.
    ///
    /// A source VM that can no longer be reached by a permanent error is
    /// reported and left alone, so the finalizer never blocks forever.
    async fn restore_source_vm(&self, import: &VirtualMachineImport, import_ref: &ImportRef) -> Result<(), ControllerError> {
        let Some((platform, source)) = import.spec.source.selected() else {
            return Ok(());
        };
        let secret = self.provider_secret(import, import_ref).await?;
        let mut provider = provider_for(platform, import_ref.clone(), &self.ctx);
        let result = start_source_vm(provider.as_mut(), &secret, source).await;
        provider.close().await;

        match result {
            Err(e) if e.is_permanent() => {
                warn!("Could not restore source VM of import {}: {}", import_ref, e);
                Ok(())
            }
            other => other,
        }
    }

    async fn provider_secret(&self, import: &VirtualMachineImport, import_ref: &ImportRef) -> Result<Secret, ControllerError> {
        let reference = &import.spec.provider_credentials_secret;
        let namespace = reference.namespace.as_deref().unwrap_or(&import_ref.namespace);
        self.stores
            .secrets
            .get(namespace, &reference.name)
            .await?
            .ok_or_else(|| ControllerError::MissingResource(format!("provider secret {}/{}", namespace, reference.name)))
    }

    /// Shared ResourceMapping rules for the platform, overridden by the inline ones
    async fn resolve_mappings(
        &self,
        import: &VirtualMachineImport,
        import_ref: &ImportRef,
        platform: SourcePlatform,
        source: &PlatformSource,
    ) -> Result<Mappings, ControllerError> {
        let inline = source.mappings.clone().unwrap_or_default();
        let Some(reference) = &import.spec.resource_mapping else {
            return Ok(inline);
        };
        let namespace = reference.namespace.as_deref().unwrap_or(&import_ref.namespace);
        let mapping = self
            .stores
            .resource_mappings
            .get(namespace, &reference.name)
            .await?
            .ok_or_else(|| ControllerError::MissingResource(format!("ResourceMapping {}/{}", namespace, reference.name)))?;
        let shared = mapping.spec.for_platform(platform).cloned().unwrap_or_default();
        Ok(shared.merged_with(&inline))
    }

    /// Advance the phase; a pass re-walking earlier steps leaves it unchanged
    async fn enter_phase(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        status: &mut VirtualMachineImportStatus,
        phase: ImportPhase,
    ) -> Result<(), ControllerError> {
        if phase <= status.phase {
            return Ok(());
        }
        debug!("Import {} entering phase {}", import_ref, phase);
        status.phase = phase;
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_PROCESSING, ConditionStatus::True, phase.as_str(), format!("phase {}", phase)),
        );
        self.write_status(import, import_ref, status).await
    }

    /// Patch the status when it differs from the stored one
    async fn write_status(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        status: &VirtualMachineImportStatus,
    ) -> Result<(), ControllerError> {
        if import.status.as_ref() == Some(status) {
            return Ok(());
        }
        let patch = with_resource_version(json!({"status": status}), import.metadata.resource_version.as_deref());
        *import = self
            .stores
            .imports
            .merge_patch_status(&import_ref.namespace, &import_ref.name, &patch)
            .await?;
        Ok(())
    }

    async fn ensure_finalizer(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        finalizer: &str,
    ) -> Result<(), ControllerError> {
        if has_finalizer(import, finalizer) {
            return Ok(());
        }
        let mut finalizers = import.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(import, import_ref, finalizers).await?;
        debug!("Added finalizer {} to import {}", finalizer, import_ref);
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        finalizer: &str,
    ) -> Result<(), ControllerError> {
        if !has_finalizer(import, finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = import
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(import, import_ref, finalizers).await?;
        debug!("Removed finalizer {} from import {}", finalizer, import_ref);
        Ok(())
    }

    async fn patch_finalizers(
        &self,
        import: &mut VirtualMachineImport,
        import_ref: &ImportRef,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        let patch = with_resource_version(
            json!({"metadata": {"finalizers": finalizers}}),
            import.metadata.resource_version.as_deref(),
        );
        let updated = self
            .stores
            .imports
            .merge_patch(&import_ref.namespace, &import_ref.name, &patch)
            .await?;
        import.metadata = updated.metadata;
        Ok(())
    }
}

async fn start_source_vm(
    provider: &mut dyn Provider,
    secret: &Secret,
    source: &PlatformSource,
) -> Result<(), ControllerError> {
    provider.init(secret).await?;
    provider.load_source_vm(&source.vm).await?;
    provider.start_vm().await
}

fn has_finalizer(import: &VirtualMachineImport, finalizer: &str) -> bool {
    import.metadata.finalizers.iter().flatten().any(|f| f == finalizer)
}
