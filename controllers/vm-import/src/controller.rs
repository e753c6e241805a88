//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Kubernetes
//! client, the record stores and the hypervisor connector into the import
//! reconciler, and runs the `VirtualMachineImport` watcher.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::store::Stores;
use crate::watcher::Watcher;
use crds::{DataVolume, VirtualMachineImport};
use hypervisor_client::RestConnector;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main controller for VM imports.
pub struct Controller {
    import_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts watching.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing VM Import Controller");

        let kube_client = Client::try_default().await?;

        let (import_api, job_api, data_volume_api): (Api<VirtualMachineImport>, Api<Job>, Api<DataVolume>) =
            match config.watch_namespace.as_deref() {
                Some(ns) => (
                    Api::namespaced(kube_client.clone(), ns),
                    Api::namespaced(kube_client.clone(), ns),
                    Api::namespaced(kube_client.clone(), ns),
                ),
                None => (
                    Api::all(kube_client.clone()),
                    Api::all(kube_client.clone()),
                    Api::all(kube_client.clone()),
                ),
            };

        let reconciler = Arc::new(Reconciler::new(
            Stores::kube(kube_client),
            Arc::new(RestConnector),
            config,
        ));
        let watcher = Arc::new(Watcher::new(reconciler, import_api, job_api, data_volume_api));

        let import_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_imports().await })
        };

        info!("VM Import Controller initialized");
        Ok(Self { import_watcher })
    }

    /// Runs the controller until the watcher exits or a shutdown signal arrives.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("VM Import Controller running");

        tokio::select! {
            result = &mut self.import_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VirtualMachineImport watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("VirtualMachineImport watcher error: {}", e)))?;
                error!("VirtualMachineImport watcher exited");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping VM Import Controller");
                self.import_watcher.abort();
            }
        }

        Ok(())
    }
}
