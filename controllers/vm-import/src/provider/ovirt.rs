//! oVirt provider: disks are copied through imageio, no guest conversion.

use super::{Provider, ProviderBase, TransferRefs};
use crate::error::ControllerError;
use crate::mapper::DiskPlan;
use crds::{DataVolumeSource, ImageioSource, SourcePlatform};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Resource;

/// ConfigMap key holding the engine CA bundle
pub const CA_BUNDLE_KEY: &str = "ca.pem";

pub struct OvirtProvider {
    base: ProviderBase,
}

impl OvirtProvider {
    pub fn new(base: ProviderBase) -> Self {
        Self { base }
    }
}

#[async_trait::async_trait]
impl Provider for OvirtProvider {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ProviderBase {
        &mut self.base
    }

    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Ovirt
    }

    fn needs_guest_conversion(&self) -> bool {
        false
    }

    async fn prepare_transfer(&self) -> Result<TransferRefs, ControllerError> {
        let secret = self.base.ensure_transfer_secret().await?;

        let cert_config_map = match &self.base.credentials()?.ca_cert {
            Some(ca_cert) => {
                let config_map = self
                    .base
                    .config_maps
                    .ensure_for(&self.base.import, || ConfigMap {
                        data: Some([(CA_BUNDLE_KEY.to_string(), ca_cert.clone())].into()),
                        ..Default::default()
                    })
                    .await?;
                config_map.meta().name.clone()
            }
            None => None,
        };

        Ok(TransferRefs {
            secret_name: secret.meta().name.clone().unwrap_or_default(),
            cert_config_map,
        })
    }

    fn data_volume_source(&self, plan: &DiskPlan, transfer: &TransferRefs) -> Result<DataVolumeSource, ControllerError> {
        Ok(DataVolumeSource {
            imageio: Some(ImageioSource {
                url: self.base.credentials()?.api_url.clone(),
                secret_ref: transfer.secret_name.clone(),
                cert_config_map: transfer.cert_config_map.clone(),
                disk_id: plan.disk.id.clone(),
            }),
            vddk: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ACCESS_KEY_ID, provider_for};
    use crate::test_utils::*;
    use crds::Mappings;
    use hypervisor_client::{MockHypervisorClient, Platform};

    #[tokio::test]
    async fn test_prepare_transfer_creates_secret_and_ca_bundle_once() {
        let client = MockHypervisorClient::new(Platform::Ovirt);
        client.add_vm(ovirt_vm());
        let harness = TestHarness::new(client);
        let mut provider = provider_for(SourcePlatform::Ovirt, test_import_ref("db01"), &harness.context());
        provider.init(&provider_secret("creds")).await.unwrap();

        let first = provider.prepare_transfer().await.unwrap();
        let second = provider.prepare_transfer().await.unwrap();

        assert_eq!(first, second);
        let secrets = harness.secrets.all("default");
        assert_eq!(secrets.len(), 1);
        let data = secrets[0].data.as_ref().unwrap();
        assert_eq!(data[ACCESS_KEY_ID].0, b"admin@internal".to_vec());
        let config_maps = harness.config_maps.all("default");
        assert_eq!(config_maps.len(), 1);
        assert!(config_maps[0].data.as_ref().unwrap()[CA_BUNDLE_KEY].contains("BEGIN CERTIFICATE"));
        assert_eq!(first.cert_config_map, config_maps[0].metadata.name);
    }

    #[tokio::test]
    async fn test_imageio_source_per_disk() {
        let client = MockHypervisorClient::new(Platform::Ovirt);
        client.add_vm(ovirt_vm());
        let harness = TestHarness::new(client);
        let mut provider = provider_for(SourcePlatform::Ovirt, test_import_ref("db01"), &harness.context());
        provider.init(&provider_secret("creds")).await.unwrap();
        provider.load_source_vm(&ovirt_identity()).await.unwrap();
        provider.set_mappings(Mappings::default());
        let plans = provider.create_mapper().unwrap().map_data_volumes("db01").unwrap();
        let transfer = TransferRefs {
            secret_name: "vmimport-abcde".to_string(),
            cert_config_map: Some("vmimport-fghij".to_string()),
        };

        let source = provider.data_volume_source(&plans[0], &transfer).unwrap();

        let imageio = source.imageio.unwrap();
        assert_eq!(imageio.url, "https://engine.example.com/ovirt-engine/api");
        assert_eq!(imageio.disk_id, "disk-1");
        assert_eq!(imageio.cert_config_map.as_deref(), Some("vmimport-fghij"));
        assert!(source.vddk.is_none());
        assert!(!provider.needs_guest_conversion());
    }
}
