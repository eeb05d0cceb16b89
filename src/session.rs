//! Session-level orchestration of the registry: the operations behind the
//! operator's `connect`, `calibrate`, `start`, and `stop` commands.

use crate::clock::{CancelToken, Clock};
use crate::device::Device;
use crate::registry::DeviceRegistry;

use log::{info, warn};
use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Default name of the file an external selector drops the chosen ports in.
pub const SELECTION_FILE: &str = "selected_ports.txt";

/// Something that shows the operator the available ports and reports the
/// two they chose.
pub trait PortSelector {
    /// Present `ports` and block until two are chosen. `None` when the
    /// operator gave up, the selection was unusable, or `cancel` fired.
    fn select(&self, ports: &[String], cancel: &CancelToken) -> Option<(String, String)>;
}

/// Waits for a `port1,port2` selection file, then deletes it.
pub struct PortFileSelector {
    path: PathBuf,
    poll: Duration,
    clock: Arc<dyn Clock>,
}

impl PortFileSelector {
    /// Watch `path`, checking every `poll`.
    pub fn new(path: impl Into<PathBuf>, poll: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            poll,
            clock,
        }
    }
}

fn parse_selection(contents: &str) -> Option<(String, String)> {
    let mut parts = contents.trim().split(',').map(str::trim);
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some((a.to_string(), b.to_string())),
        _ => None,
    }
}

impl PortSelector for PortFileSelector {
    fn select(&self, ports: &[String], cancel: &CancelToken) -> Option<(String, String)> {
        info!("Available ports: {}", ports.join(","));
        info!("Waiting for selected ports file {}", self.path.display());
        while !self.path.exists() {
            if self.clock.pause(self.poll, cancel).is_err() {
                info!("Port selection cancelled");
                return None;
            }
        }

        let contents = fs::read_to_string(&self.path);
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not delete {}: {}", self.path.display(), e);
        }
        match contents.ok().as_deref().and_then(parse_selection) {
            Some(selection) => {
                info!("Chosen ports: {} and {}", selection.0, selection.1);
                Some(selection)
            }
            None => {
                warn!("Selection file did not name two ports");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    running: bool,
    calibrating: bool,
    acquiring: bool,
    selected_ports: Option<(String, String)>,
    connected: Vec<Arc<Device>>,
}

/// Drives the registry on behalf of the operator.
pub struct SessionController {
    registry: Arc<DeviceRegistry>,
    state: Mutex<SessionState>,
}

impl SessionController {
    /// A stopped controller over `registry`.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The registry being driven.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Mark the session running and scan for devices.
    pub fn start(&self) {
        {
            let mut state = self.state();
            if state.running {
                info!("Session already running");
                return;
            }
            state.running = true;
        }
        info!("Starting, scanning for devices");
        self.registry.scan();
        info!("Devices scanned, ready for commands");
    }

    /// Tear down every device and mark the session stopped.
    pub fn stop(&self) {
        {
            let mut state = self.state();
            if !state.running {
                info!("Session not running");
                return;
            }
            state.running = false;
            state.acquiring = false;
            state.connected.clear();
        }
        info!("Stopping session");
        self.registry.cleanup();
    }

    /// Record the operator's two-port choice.
    pub fn handle_port_response(&self, port1: &str, port2: &str) {
        self.state().selected_ports = Some((port1.to_string(), port2.to_string()));
    }

    /// The last recorded two-port choice.
    pub fn selected_ports(&self) -> Option<(String, String)> {
        self.state().selected_ports.clone()
    }

    /// Have `selector` pick two of the available ports and connect them.
    ///
    /// Ports that vanished since enumeration or that are already connected
    /// are skipped. Returns the devices connected by this call.
    pub fn handle_connect_command(
        &self,
        selector: &dyn PortSelector,
        cancel: &CancelToken,
    ) -> Vec<Arc<Device>> {
        let ports = self.registry.available_ports();
        if ports.is_empty() {
            info!("No available serial ports");
            return Vec::new();
        }
        info!("Available serial ports: {}", ports.join(", "));

        if let Some((a, b)) = selector.select(&ports, cancel) {
            self.handle_port_response(&a, &b);
        }
        let Some((a, b)) = self.selected_ports() else {
            warn!("No ports selected");
            return Vec::new();
        };

        self.registry.scan();
        self.state().connected.retain(|d| d.is_connected());
        let mut newly_connected = Vec::new();
        for (i, port) in [a, b].iter().enumerate() {
            if !self.registry.available_ports().contains(port) {
                warn!("Invalid port '{}', skipping device {}", port, i + 1);
                continue;
            }
            if self.state().connected.iter().any(|d| d.path() == port) {
                info!("Device on {} is already connected, skipping", port);
                continue;
            }

            match self.registry.connect(port, cancel) {
                Some(device) => {
                    info!("Device on {} is a {} sock", port, device.side());
                    self.state().connected.push(device.clone());
                    newly_connected.push(device);
                }
                None => warn!("Failed to connect to device on {}", port),
            }
        }
        info!("All devices connected, waiting for further commands");
        newly_connected
    }

    /// Calibrate every connected device in turn, starting the data stream
    /// first if needed. Returns each device's name and outcome.
    pub fn handle_calibrate_command(&self, cancel: &CancelToken) -> Vec<(String, bool)> {
        let (devices, start_stream) = {
            let mut state = self.state();
            if state.connected.is_empty() {
                info!("No devices connected, use 'connect' first");
                return Vec::new();
            }
            if state.calibrating {
                info!("Calibration is already in progress");
                return Vec::new();
            }
            state.calibrating = true;
            (state.connected.clone(), !state.acquiring)
        };

        if start_stream {
            self.start_data_stream();
        }

        let outcomes = devices
            .iter()
            .map(|device| {
                let ok = device.calibrate(cancel);
                if ok {
                    info!("Calibration completed for {}", device.name());
                } else {
                    warn!("Calibration failed for {}, no valid samples", device.name());
                }
                (device.name().to_string(), ok)
            })
            .collect();

        self.state().calibrating = false;
        outcomes
    }

    /// Start streaming on every connected device.
    pub fn start_data_stream(&self) {
        let devices = {
            let mut state = self.state();
            if state.acquiring {
                info!("Data acquisition is already running");
                return;
            }
            state.acquiring = true;
            state.connected.clone()
        };
        for device in devices {
            info!("Starting data stream for {}", device.name());
            if let Err(e) = device.start() {
                warn!("Failed to start data stream for {}: {}", device.name(), e);
            }
        }
    }

    /// Stop streaming on every connected device.
    pub fn stop_data_stream(&self) {
        let devices = {
            let mut state = self.state();
            if !state.acquiring {
                info!("No active data streams to stop");
                return;
            }
            state.acquiring = false;
            state.connected.clone()
        };
        for device in devices {
            match device.stop() {
                Ok(()) => info!("Data stream stopped for {}", device.name()),
                Err(e) => warn!("Failed to stop data stream for {}: {}", device.name(), e),
            }
        }
        info!("All data streams stopped");
    }

    /// Devices connected through this controller whose links are still up.
    pub fn connected_devices(&self) -> Vec<Arc<Device>> {
        let mut state = self.state();
        state.connected.retain(|d| d.is_connected());
        state.connected.clone()
    }

    /// Whether `start` has run without a matching `stop`.
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Whether the data stream is on.
    pub fn is_acquiring(&self) -> bool {
        self.state().acquiring
    }

    /// Whether a calibration pass is underway.
    pub fn is_calibrating(&self) -> bool {
        self.state().calibrating
    }
}
