use async_trait::async_trait;
use devlab_model::Device;
use tokio::sync::RwLock;

use super::{DeviceStore, StoreError, StoreResult};

/// Device store held in process memory.
#[derive(Default)]
pub struct InMemoryDeviceStore {
    devices: RwLock<Vec<Device>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. in tests.
    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn find(&self, id: &str, host: &str) -> StoreResult<Option<Device>> {
        let devices = self.devices.read().await;
        Ok(devices
            .iter()
            .find(|d| d.is_identified_by(id, host))
            .cloned())
    }

    async fn find_all(&self) -> StoreResult<Vec<Device>> {
        Ok(self.devices.read().await.clone())
    }

    async fn find_by_host(&self, host: &str) -> StoreResult<Vec<Device>> {
        let devices = self.devices.read().await;
        Ok(devices.iter().filter(|d| d.host == host).cloned().collect())
    }

    async fn save(&self, device: Device) -> StoreResult<()> {
        if device.id.is_empty() || device.host.is_empty() {
            return Err(StoreError::Invalid(
                "device id and host must not be empty".to_string(),
            ));
        }

        let mut devices = self.devices.write().await;
        match devices
            .iter_mut()
            .find(|d| d.is_identified_by(&device.id, &device.host))
        {
            Some(existing) => *existing = device,
            None => devices.push(device),
        }
        Ok(())
    }

    async fn delete(&self, id: &str, host: &str) -> StoreResult<bool> {
        let mut devices = self.devices.write().await;
        let before = devices.len();
        devices.retain(|d| !d.is_identified_by(id, host));
        Ok(devices.len() != before)
    }
}
