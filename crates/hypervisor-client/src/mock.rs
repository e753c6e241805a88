//! Mock hypervisor client for unit testing
//!
//! Stores VMs in memory and records power and close calls so tests can
//! assert on them without a running oVirt engine or vCenter.

use crate::error::HypervisorError;
use crate::hypervisor_trait::{HypervisorClientTrait, HypervisorConnector};
use crate::models::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock hypervisor client for testing
///
/// Clones share state, so a test can keep one handle while the code under
/// test owns another.
#[derive(Clone)]
pub struct MockHypervisorClient {
    platform: Platform,
    vms: Arc<Mutex<HashMap<String, SourceVmSnapshot>>>,
    start_calls: Arc<Mutex<Vec<String>>>,
    stop_calls: Arc<Mutex<Vec<String>>>,
    close_calls: Arc<Mutex<u32>>,
    fail_connection: Arc<Mutex<bool>>,
}

impl MockHypervisorClient {
    /// Create a new mock client
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            vms: Arc::new(Mutex::new(HashMap::new())),
            start_calls: Arc::new(Mutex::new(Vec::new())),
            stop_calls: Arc::new(Mutex::new(Vec::new())),
            close_calls: Arc::new(Mutex::new(0)),
            fail_connection: Arc::new(Mutex::new(false)),
        }
    }

    /// Add a VM to the mock store (for test setup)
    pub fn add_vm(&self, vm: SourceVmSnapshot) {
        self.vms.lock().unwrap().insert(vm.id.clone(), vm);
    }

    /// Current state of a stored VM
    pub fn vm(&self, id: &str) -> Option<SourceVmSnapshot> {
        self.vms.lock().unwrap().get(id).cloned()
    }

    /// Make `test_connection` fail with an authentication error
    pub fn set_fail_connection(&self, fail: bool) {
        *self.fail_connection.lock().unwrap() = fail;
    }

    /// VM ids `start_vm` actually powered on
    pub fn start_calls(&self) -> Vec<String> {
        self.start_calls.lock().unwrap().clone()
    }

    /// VM ids `stop_vm` actually powered off
    pub fn stop_calls(&self) -> Vec<String> {
        self.stop_calls.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> u32 {
        *self.close_calls.lock().unwrap()
    }

    fn set_power(&self, vm_id: &str, state: PowerState, calls: &Mutex<Vec<String>>) -> Result<(), HypervisorError> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| HypervisorError::NotFound(format!("VM id {}", vm_id)))?;
        if vm.power_state != state {
            vm.power_state = state;
            calls.lock().unwrap().push(vm_id.to_string());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl HypervisorClientTrait for MockHypervisorClient {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn test_connection(&self) -> Result<(), HypervisorError> {
        if *self.fail_connection.lock().unwrap() {
            return Err(HypervisorError::Authentication("mock: 401 Unauthorized".to_string()));
        }
        Ok(())
    }

    async fn fetch_vm(&self, selector: &VmSelector) -> Result<SourceVmSnapshot, HypervisorError> {
        let vms = self.vms.lock().unwrap();
        match selector {
            VmSelector::Id(id) => vms
                .get(id)
                .cloned()
                .ok_or_else(|| HypervisorError::NotFound(format!("VM {}", selector))),
            VmSelector::Name { name, cluster } => {
                let mut matching: Vec<&SourceVmSnapshot> = vms
                    .values()
                    .filter(|vm| &vm.name == name)
                    .filter(|vm| cluster.is_none() || vm.cluster == *cluster)
                    .collect();
                matching.sort_by(|a, b| a.id.cmp(&b.id));
                match matching.as_slice() {
                    [] => Err(HypervisorError::NotFound(format!("VM {}", selector))),
                    [vm] => Ok((*vm).clone()),
                    _ => Err(HypervisorError::Ambiguous {
                        name: name.clone(),
                        ids: matching.iter().map(|vm| vm.id.clone()).collect(),
                    }),
                }
            }
        }
    }

    async fn start_vm(&self, vm_id: &str) -> Result<(), HypervisorError> {
        self.set_power(vm_id, PowerState::Up, &self.start_calls)
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<(), HypervisorError> {
        self.set_power(vm_id, PowerState::Down, &self.stop_calls)
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        *self.close_calls.lock().unwrap() += 1;
        Ok(())
    }
}

/// Connector handing out clones of one mock client
#[derive(Clone)]
pub struct MockConnector {
    client: MockHypervisorClient,
    connections: Arc<Mutex<Vec<Credentials>>>,
}

impl MockConnector {
    pub fn new(client: MockHypervisorClient) -> Self {
        Self {
            client,
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Credentials of every `connect` call so far
    pub fn connections(&self) -> Vec<Credentials> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HypervisorConnector for MockConnector {
    async fn connect(
        &self,
        platform: Platform,
        credentials: &Credentials,
    ) -> Result<Box<dyn HypervisorClientTrait>, HypervisorError> {
        if platform != self.client.platform {
            return Err(HypervisorError::InvalidRequest(format!(
                "mock serves {}, not {}",
                self.client.platform, platform
            )));
        }
        self.connections.lock().unwrap().push(credentials.clone());
        Ok(Box::new(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str, name: &str, cluster: &str) -> SourceVmSnapshot {
        SourceVmSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            cluster: Some(cluster.to_string()),
            uuid: None,
            cpu: CpuTopology { total_vcpus: 2, cores_per_socket: 1 },
            memory_bytes: 1 << 30,
            disks: vec![],
            nics: vec![],
            firmware: None,
            guest_os: GuestOs::default(),
            power_state: PowerState::Up,
            utc_offset: None,
            has_snapshots: false,
            usb_enabled: false,
        }
    }

    #[tokio::test]
    async fn test_fetch_by_name_reports_every_match() {
        let client = MockHypervisorClient::new(Platform::Ovirt);
        client.add_vm(vm("b", "web", "prod"));
        client.add_vm(vm("a", "web", "prod"));
        client.add_vm(vm("c", "web", "test"));

        let selector = VmSelector::Name { name: "web".to_string(), cluster: Some("prod".to_string()) };
        match client.fetch_vm(&selector).await {
            Err(HypervisorError::Ambiguous { ids, .. }) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("expected ambiguous match, got {:?}", other),
        }

        let selector = VmSelector::Name { name: "web".to_string(), cluster: Some("test".to_string()) };
        assert_eq!(client.fetch_vm(&selector).await.unwrap().id, "c");

        let selector = VmSelector::Name { name: "db".to_string(), cluster: None };
        assert!(matches!(client.fetch_vm(&selector).await, Err(HypervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_power_calls_are_idempotent() {
        let client = MockHypervisorClient::new(Platform::Vmware);
        client.add_vm(vm("vm-1", "web", "prod"));

        client.stop_vm("vm-1").await.unwrap();
        client.stop_vm("vm-1").await.unwrap();
        client.start_vm("vm-1").await.unwrap();

        assert_eq!(client.stop_calls(), vec!["vm-1"]);
        assert_eq!(client.start_calls(), vec!["vm-1"]);
        assert_eq!(client.vm("vm-1").unwrap().power_state, PowerState::Up);
    }
}
