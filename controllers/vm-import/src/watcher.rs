//! Kubernetes resource watchers.
//!
//! Watches `VirtualMachineImport` resources and the objects an import waits
//! on, and triggers reconciliation using kube_runtime::Controller.
//!
//! Conversion Jobs carry a controller owner reference and are followed with
//! `owns`. DataVolumes outlive the import and have no owner reference, so
//! they are mapped back to their import through the ownership label.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{DataVolume, IMPORT_LABEL, VirtualMachineImport};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, Resource};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher, controller::{Action, Config as ControllerConfig}};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Generic watcher helper that runs a configured kube_runtime::Controller.
///
/// The Controller handles reconnection, retries and backoff, and keeps
/// watching indefinitely.
async fn watch_resource<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Action, ControllerError>> + Send>> + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    // Reached only for errors the reconciler could not turn into a requeue
    let error_policy = |obj: Arc<K>, error: &ControllerError, _ctx: Arc<Reconciler>| {
        error!("Reconciliation error for {} {:?}: {}", resource_name, obj, error);
        Action::requeue(Duration::from_secs(60))
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        let resource_name = resource_name.to_string();
        async move {
            debug!("Reconciling {} {:?}", resource_name, obj.meta().name);

            match reconcile_fn(ctx, obj).await {
                Ok(action) => Ok(action),
                Err(e) => {
                    error!("Reconciliation failed for {}: {}", resource_name, e);
                    Err(e)
                }
            }
        }
    };

    // Debounce batches the status writes of one pass into a single trigger
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3);

    controller
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    Ok(())
}

/// Import owning a DataVolume, from its ownership label
fn import_for_data_volume(volume: DataVolume) -> Option<ObjectRef<VirtualMachineImport>> {
    let namespace = volume.meta().namespace.clone()?;
    let name = volume.meta().labels.as_ref()?.get(IMPORT_LABEL)?.clone();
    Some(ObjectRef::new(&name).within(&namespace))
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    import_api: Api<VirtualMachineImport>,
    job_api: Api<Job>,
    data_volume_api: Api<DataVolume>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        import_api: Api<VirtualMachineImport>,
        job_api: Api<Job>,
        data_volume_api: Api<DataVolume>,
    ) -> Self {
        Self {
            reconciler,
            import_api,
            job_api,
            data_volume_api,
        }
    }

    /// Watches VirtualMachineImport resources, their conversion Jobs and DataVolumes.
    pub async fn watch_imports(&self) -> Result<(), ControllerError> {
        let job_config = watcher::Config::default().labels(IMPORT_LABEL);
        let data_volume_config = watcher::Config::default().labels(IMPORT_LABEL);
        let controller = Controller::new(self.import_api.clone(), watcher::Config::default())
            .owns(self.job_api.clone(), job_config)
            .watches(self.data_volume_api.clone(), data_volume_config, import_for_data_volume);

        watch_resource(
            controller,
            self.reconciler.clone(),
            |reconciler, import| Box::pin(async move { reconciler.reconcile_import(&import).await }),
            "VirtualMachineImport",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::DataVolumeSpec;

    #[test]
    fn test_data_volume_maps_to_labelled_import() {
        let mut volume = DataVolume::new("db01-prod-disk-1", DataVolumeSpec::default());
        volume.metadata.namespace = Some("migrations".to_string());
        assert!(import_for_data_volume(volume.clone()).is_none());

        volume.metadata.labels = Some([(IMPORT_LABEL.to_string(), "db01".to_string())].into());
        let import = import_for_data_volume(volume).unwrap();
        assert_eq!(import.name, "db01");
        assert_eq!(import.namespace.as_deref(), Some("migrations"));
    }
}
