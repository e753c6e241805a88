//! VM Import Controller
//!
//! Migrates virtual machines from oVirt and VMware into KubeVirt.
//!
//! This controller reconciles `VirtualMachineImport` CRDs: it connects to the
//! source hypervisor, validates and maps the source VM, copies its disks with
//! CDI DataVolumes, runs guest conversion where the platform needs it, and
//! creates the target KubeVirt `VirtualMachine`.

mod backoff;
mod config;
mod controller;
mod error;
mod managed;
mod mapper;
#[cfg(test)]
mod memory_store;
mod os;
mod provider;
mod reconciler;
mod store;
mod templates;
#[cfg(test)]
mod test_utils;
mod validation;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    // kube and reqwest both use rustls; pick the provider before any client is built
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting VM Import Controller");

    let config = ControllerConfig::from_env()?;
    config.log();

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
