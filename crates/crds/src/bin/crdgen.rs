//! Prints the CRD manifests owned by the VM import controller.

use crds::{ResourceMapping, VirtualMachineImport};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&VirtualMachineImport::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ResourceMapping::crd())?);
    Ok(())
}
