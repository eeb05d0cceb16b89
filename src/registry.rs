//! The catalog of known socks and the set currently in use.

use crate::clock::{CancelToken, Clock};
use crate::device::{Device, DeviceSettings};
use crate::transport::SerialBackend;

use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Baud rate given to every discovered port.
pub const DEFAULT_FREQUENCY: u32 = 9600;

#[derive(Default)]
struct RegistryInner {
    catalog: BTreeMap<String, Arc<Device>>,
    active: Vec<Arc<Device>>,
}

/// Discovers ports, hands out [`Device`]s, and tears them down in bulk.
pub struct DeviceRegistry {
    backend: Arc<dyn SerialBackend>,
    clock: Arc<dyn Clock>,
    settings: DeviceSettings,
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    /// An empty registry over `backend`.
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        clock: Arc<dyn Clock>,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            backend,
            clock,
            settings,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ports the backend currently reports. Enumeration failures read as
    /// no ports.
    pub fn available_ports(&self) -> Vec<String> {
        match self.backend.available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                error!("Error enumerating serial ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Add a device for every port not already in the catalog.
    pub fn scan(&self) {
        let ports = self.available_ports();
        if ports.is_empty() {
            warn!("No serial ports available");
        }

        let mut inner = self.inner();
        for port in ports {
            if inner.catalog.contains_key(&port) {
                continue;
            }
            let device = Device::new(
                port.clone(),
                DEFAULT_FREQUENCY,
                self.backend.clone(),
                self.clock.clone(),
                self.settings.clone(),
            );
            info!("Discovered new device: {} on {}", device.name(), port);
            inner.catalog.insert(port, Arc::new(device));
        }
        info!("Device scan completed, {} known", inner.catalog.len());
    }

    /// Connect the catalogued device at `path` and mark it active.
    ///
    /// Returns `None` for unknown paths and failed connections.
    pub fn connect(&self, path: &str, cancel: &CancelToken) -> Option<Arc<Device>> {
        let Some(device) = self.find(path) else {
            warn!("No device found at path {}", path);
            return None;
        };

        if let Err(e) = device.connect(cancel) {
            warn!("Failed to connect to device {}: {}", device.name(), e);
            return None;
        }

        let mut inner = self.inner();
        if inner.active.iter().any(|d| Arc::ptr_eq(d, &device)) {
            info!("Device {} on {} is already active", device.name(), path);
        } else {
            inner.active.push(device.clone());
            info!(
                "Device {} on {} connected and identified as {} sock",
                device.name(),
                path,
                device.side()
            );
        }
        Some(device)
    }

    /// Stop and disconnect every active device and forget all devices.
    pub fn cleanup(&self) {
        info!("Cleaning up devices");
        let active = {
            let mut inner = self.inner();
            inner.catalog.clear();
            std::mem::take(&mut inner.active)
        };
        for device in active {
            info!("Disconnecting {} on {}", device.name(), device.path());
            device.disconnect();
        }
        info!("Cleanup completed");
    }

    /// The catalogued device at `path`.
    pub fn find(&self, path: &str) -> Option<Arc<Device>> {
        self.inner().catalog.get(path).cloned()
    }

    /// Every catalogued device, ordered by path.
    pub fn all_devices(&self) -> Vec<Arc<Device>> {
        self.inner().catalog.values().cloned().collect()
    }

    /// A snapshot of the active devices, in activation order. Devices that
    /// lost their link since activation are dropped from the active set.
    pub fn connected_devices(&self) -> Vec<Arc<Device>> {
        self.prune_active().active.clone()
    }

    /// The most recently activated device that is still connected.
    pub fn active_device(&self) -> Option<Arc<Device>> {
        self.prune_active().active.last().cloned()
    }

    fn prune_active(&self) -> MutexGuard<'_, RegistryInner> {
        let mut inner = self.inner();
        inner.active.retain(|device| {
            let connected = device.is_connected();
            if !connected {
                info!("{} on {} is no longer connected", device.name(), device.path());
            }
            connected
        });
        inner
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::tests::test_settings;
    use crate::device::DeviceState;
    use crate::transport::mock::{MockBackend, MockTransport};
    use std::path::PathBuf;

    pub(crate) fn registry_with(ports: &[(&str, u32)]) -> (DeviceRegistry, MockBackend) {
        let backend = MockBackend::new();
        for (path, module) in ports {
            backend.add(path, MockTransport::sock(*module));
        }
        let registry = DeviceRegistry::new(
            Arc::new(backend.clone()),
            Arc::new(ManualClock::new()),
            test_settings(PathBuf::from(".")),
        );
        (registry, backend)
    }

    #[test]
    fn scan_is_idempotent() {
        let (registry, backend) = registry_with(&[("/dev/a", 1), ("/dev/b", 2)]);
        registry.scan();
        let first = registry.find("/dev/a").unwrap();
        registry.scan();
        assert_eq!(registry.all_devices().len(), 2);
        assert!(Arc::ptr_eq(&first, &registry.find("/dev/a").unwrap()));

        backend.add("/dev/c", MockTransport::sock(3));
        registry.scan();
        assert_eq!(registry.all_devices().len(), 3);
        assert_eq!(registry.find("/dev/c").unwrap().frequency(), DEFAULT_FREQUENCY);
    }

    #[test]
    fn unknown_path_is_none() {
        let (registry, _) = registry_with(&[("/dev/a", 1)]);
        registry.scan();
        assert!(registry.connect("/dev/zzz", &CancelToken::new()).is_none());
        assert!(registry.connected_devices().is_empty());
    }

    #[test]
    fn duplicate_activation_is_ignored() {
        let (registry, _) = registry_with(&[("/dev/a", 1), ("/dev/b", 2)]);
        registry.scan();
        let cancel = CancelToken::new();
        registry.connect("/dev/a", &cancel).unwrap();
        registry.connect("/dev/b", &cancel).unwrap();
        registry.connect("/dev/a", &cancel).unwrap();

        let active: Vec<String> = registry
            .connected_devices()
            .iter()
            .map(|d| d.path().to_string())
            .collect();
        assert_eq!(active, vec!["/dev/a", "/dev/b"]);
        assert_eq!(registry.active_device().unwrap().path(), "/dev/b");
        registry.cleanup();
    }

    #[test]
    fn cleanup_disconnects_and_forgets() {
        let (registry, _) = registry_with(&[("/dev/a", 1)]);
        registry.scan();
        let device = registry.connect("/dev/a", &CancelToken::new()).unwrap();
        device.start().unwrap();

        registry.cleanup();
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(registry.all_devices().is_empty());
        assert!(registry.connected_devices().is_empty());
        assert!(registry.active_device().is_none());
    }

    #[test]
    fn failed_link_leaves_the_active_set() {
        let (registry, backend) = registry_with(&[("/dev/a", 1), ("/dev/b", 2)]);
        registry.scan();
        let cancel = CancelToken::new();
        registry.connect("/dev/a", &cancel).unwrap();
        let b = registry.connect("/dev/b", &cancel).unwrap();

        backend.port("/dev/b").unwrap().close();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while b.is_connected() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let active: Vec<String> = registry
            .connected_devices()
            .iter()
            .map(|d| d.path().to_string())
            .collect();
        assert_eq!(active, vec!["/dev/a"]);
        assert_eq!(registry.active_device().unwrap().path(), "/dev/a");
        registry.cleanup();
    }
}
