//! One sock on one serial port.
//!
//! A [`Device`] owns its [`SensorLink`], walks the connection lifecycle
//! `Disconnected → Connecting → Connected → Streaming`, runs a reader thread
//! while connected and a log writer while streaming, and republishes every
//! decoded frame on its [`EventHub`] tagged with the device's name and side.

use crate::clock::{CancelToken, Cancelled, Clock};
use crate::event_hub::{EventHub, Subscription, SubscriptionId};
use crate::frame_log::{self, LogQueue, LogWriter};
use crate::sensor_link::{
    parse_module_number, CalibrationSettings, SensorLink, SockSide, CHANNELS, IDENTITY_QUERY,
};
use crate::transport::{SerialBackend, SockTransport, TransportError};

use chrono::Local;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

/// Command that starts the sensor stream.
pub const START_COMMAND: &str = "BT^START";
/// Command that stops the sensor stream.
pub const STOP_COMMAND: &str = "BT^STOP";

const READ_CHUNK: usize = 512;

/// Where a device is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No port open
    Disconnected,
    /// Port open, waiting for the module identity
    Connecting,
    /// Identified, reader running, not streaming
    Connected,
    /// Sensor stream and log writer running
    Streaming,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A CoP update tagged with the device it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CopEvent {
    /// Name of the publishing device
    pub device_name: String,
    /// Foot the device is worn on
    pub side: SockSide,
    /// Calibrated CoP X
    pub x: f64,
    /// Calibrated CoP Y
    pub y: f64,
    /// Filtered pad pressures
    pub pressures: [f64; CHANNELS],
}

/// Everything a device publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A valid frame, as dash-separated hex. Only while streaming.
    Raw {
        /// Name of the publishing device
        device_name: String,
        /// The frame bytes
        hex: String,
    },
    /// A new CoP reading.
    Cop(CopEvent),
    /// The serial link failed and the reader stopped. The device is
    /// disconnected the next time its state is touched.
    LinkLost {
        /// Name of the publishing device
        device_name: String,
        /// Foot the device was worn on
        side: SockSide,
    },
}

/// Tunables shared by every device of a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Wait between identity queries
    pub identity_poll: Duration,
    /// Identity queries sent before giving up
    pub identity_attempts: u32,
    /// Directory holding the `ActiveLogFile_<Side>.txt` files
    pub log_dir: PathBuf,
    /// How often the log writer drains its queue
    pub log_drain: Duration,
    /// Calibration pass timing
    pub calibration: CalibrationSettings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            identity_poll: Duration::from_millis(500),
            identity_attempts: 20,
            log_dir: PathBuf::from("."),
            log_drain: frame_log::DRAIN_INTERVAL,
            calibration: CalibrationSettings::default(),
        }
    }
}

/// Why a device operation failed.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The serial link failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The sock never answered the identity query.
    #[error("no module identity from {path} after {attempts} queries")]
    NoIdentity {
        /// Port path
        path: String,
        /// Queries sent
        attempts: u32,
    },
    /// The caller gave up.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

type SharedTransport = Arc<Mutex<Box<dyn SockTransport>>>;

fn lock_transport(transport: &SharedTransport) -> MutexGuard<'_, Box<dyn SockTransport>> {
    transport.lock().unwrap_or_else(|e| e.into_inner())
}

struct Reader {
    cancel: CancelToken,
    handle: thread::JoinHandle<()>,
}

struct DeviceInner {
    state: DeviceState,
    transport: Option<SharedTransport>,
    reader: Option<Reader>,
    writer: Option<LogWriter>,
}

/// A sock on a serial port.
pub struct Device {
    path: String,
    name: String,
    frequency: u32,
    backend: Arc<dyn SerialBackend>,
    clock: Arc<dyn Clock>,
    settings: DeviceSettings,
    link: Arc<SensorLink>,
    hub: Arc<EventHub<DeviceEvent>>,
    log_queue: Arc<LogQueue>,
    streaming: Arc<AtomicBool>,
    logging: Arc<AtomicBool>,
    link_lost: Arc<AtomicBool>,
    inner: Mutex<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("frequency", &self.frequency)
            .field("state", &self.state())
            .finish()
    }
}

impl Device {
    /// A disconnected device for `path`, opened through `backend` at
    /// `frequency` baud when connected.
    pub fn new(
        path: impl Into<String>,
        frequency: u32,
        backend: Arc<dyn SerialBackend>,
        clock: Arc<dyn Clock>,
        settings: DeviceSettings,
    ) -> Self {
        let path = path.into();
        Self {
            name: format!("Device on {}", path),
            path,
            frequency,
            backend,
            clock,
            settings,
            link: Arc::new(SensorLink::new()),
            hub: Arc::new(EventHub::new()),
            log_queue: Arc::new(LogQueue::new()),
            streaming: Arc::new(AtomicBool::new(false)),
            logging: Arc::new(AtomicBool::new(false)),
            link_lost: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Disconnected,
                transport: None,
                reader: None,
                writer: None,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, DeviceInner> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.link_lost.swap(false, Ordering::SeqCst) {
            self.reap_lost_link(&mut inner);
        }
        inner
    }

    /// Tear down after the reader gave up on a failed link. No stop command
    /// is sent; the port is gone.
    fn reap_lost_link(&self, inner: &mut DeviceInner) {
        if let Some(writer) = inner.writer.take() {
            writer.stop();
        }
        self.log_queue.drain();
        if let Some(reader) = inner.reader.take() {
            if reader.handle.join().is_err() {
                error!("{}: reader thread panicked", self.name);
            }
        }
        inner.transport = None;
        if inner.state != DeviceState::Disconnected {
            warn!("{} lost its serial link while {}", self.name, inner.state);
            inner.state = DeviceState::Disconnected;
        }
    }

    /// Port path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Baud rate.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.inner().state
    }

    /// Connected or streaming.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            DeviceState::Connected | DeviceState::Streaming
        )
    }

    /// Streaming.
    pub fn is_streaming(&self) -> bool {
        self.state() == DeviceState::Streaming
    }

    /// The foot this sock is on; right until identified.
    pub fn side(&self) -> SockSide {
        self.link.side()
    }

    /// Module number, once identified.
    pub fn module_number(&self) -> Option<u32> {
        self.link.identity().map(|(n, _)| n)
    }

    /// The device's decoder.
    pub fn link(&self) -> &Arc<SensorLink> {
        &self.link
    }

    /// Receive this device's events through a channel of `capacity`.
    pub fn subscribe(&self, capacity: usize) -> Subscription<DeviceEvent> {
        self.hub.subscribe(capacity)
    }

    /// Stop receiving events on subscription `id`.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id)
    }

    /// Open the port, learn the module identity, and start the reader.
    ///
    /// A no-op unless disconnected. On failure the device is left
    /// disconnected with no port open.
    pub fn connect(&self, cancel: &CancelToken) -> Result<(), DeviceError> {
        let mut inner = self.inner();
        if inner.state != DeviceState::Disconnected {
            debug!("{} is already {}", self.name, inner.state);
            return Ok(());
        }
        inner.state = DeviceState::Connecting;

        let result = self.open_and_identify(cancel);
        match result {
            Ok(transport) => {
                let transport: SharedTransport = Arc::new(Mutex::new(transport));
                inner.reader = Some(self.spawn_reader(transport.clone()));
                inner.transport = Some(transport);
                inner.state = DeviceState::Connected;
                info!(
                    "{} connected as {} sock (module {:?})",
                    self.name,
                    self.side(),
                    self.module_number()
                );
                Ok(())
            }
            Err(e) => {
                inner.state = DeviceState::Disconnected;
                error!("Failed to connect to device on {}: {}", self.path, e);
                Err(e)
            }
        }
    }

    fn open_and_identify(&self, cancel: &CancelToken) -> Result<Box<dyn SockTransport>, DeviceError> {
        let mut transport = self.backend.open(&self.path, self.frequency)?;
        if self.link.identity().is_none() {
            let module_number = self.query_identity(transport.as_mut(), cancel)?;
            self.link.set_identity(module_number);
        }
        Ok(transport)
    }

    fn query_identity(
        &self,
        transport: &mut dyn SockTransport,
        cancel: &CancelToken,
    ) -> Result<u32, DeviceError> {
        let mut response = Vec::new();
        let mut buffer = [0u8; READ_CHUNK];
        let attempts = self.settings.identity_attempts.max(1);

        for attempt in 1..=attempts {
            transport.send_command(IDENTITY_QUERY)?;
            self.clock.pause(self.settings.identity_poll, cancel)?;
            loop {
                let n = transport.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&buffer[..n]);
            }
            if let Some(module_number) = parse_module_number(&String::from_utf8_lossy(&response)) {
                return Ok(module_number);
            }
            debug!("{}: no identity yet after {} queries", self.name, attempt);
        }

        Err(DeviceError::NoIdentity {
            path: self.path.clone(),
            attempts,
        })
    }

    fn spawn_reader(&self, transport: SharedTransport) -> Reader {
        let cancel = CancelToken::new();
        let th_cancel = cancel.clone();
        let link = self.link.clone();
        let hub = self.hub.clone();
        let queue = self.log_queue.clone();
        let streaming = self.streaming.clone();
        let logging = self.logging.clone();
        let link_lost = self.link_lost.clone();
        let name = self.name.clone();

        let handle = thread::spawn(move || {
            let mut buffer = [0u8; READ_CHUNK];
            while !th_cancel.is_cancelled() {
                let read = lock_transport(&transport).read(&mut buffer);
                let n = match read {
                    Ok(0) => {
                        thread::yield_now();
                        continue;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("{}: serial read failed, stopping reader: {}", name, e);
                        streaming.store(false, Ordering::SeqCst);
                        logging.store(false, Ordering::SeqCst);
                        link_lost.store(true, Ordering::SeqCst);
                        hub.publish(&DeviceEvent::LinkLost {
                            device_name: name.clone(),
                            side: link.side(),
                        });
                        break;
                    }
                };

                let side = link.side();
                for (frame, reading) in link.ingest(&buffer[..n]) {
                    if streaming.load(Ordering::SeqCst) {
                        if logging.load(Ordering::SeqCst) {
                            queue.push(frame_log::queue_entry(&Local::now(), &frame));
                        }
                        hub.publish(&DeviceEvent::Raw {
                            device_name: name.clone(),
                            hex: frame.to_hex(),
                        });
                    }
                    hub.publish(&DeviceEvent::Cop(CopEvent {
                        device_name: name.clone(),
                        side,
                        x: reading.x,
                        y: reading.y,
                        pressures: reading.pressures,
                    }));
                }
            }
            debug!("{}: reader stopped", name);
        });

        Reader { cancel, handle }
    }

    /// Start the sensor stream and the frame log. A no-op unless connected.
    pub fn start(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner();
        if inner.state != DeviceState::Connected {
            info!("{}: cannot start streaming while {}", self.name, inner.state);
            return Ok(());
        }
        let Some(transport) = inner.transport.clone() else {
            return Ok(());
        };

        lock_transport(&transport).send_command(START_COMMAND)?;
        self.streaming.store(true, Ordering::SeqCst);
        inner.state = DeviceState::Streaming;

        let side = self.side();
        let writer = frame_log::resolve_log_path(&self.settings.log_dir, side).and_then(|path| {
            LogWriter::start(path, self.log_queue.clone(), self.settings.log_drain)
        });
        match writer {
            Ok(writer) => {
                self.logging.store(true, Ordering::SeqCst);
                inner.writer = Some(writer);
            }
            Err(e) => error!("{}: {} sock logging skipped: {}", self.name, side, e),
        }

        info!("{} started streaming", self.name);
        Ok(())
    }

    /// Stop the sensor stream and close the frame log. A no-op unless
    /// streaming.
    pub fn stop(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner();
        self.stop_locked(&mut inner)
    }

    fn stop_locked(&self, inner: &mut DeviceInner) -> Result<(), DeviceError> {
        if inner.state != DeviceState::Streaming {
            debug!("{}: not streaming", self.name);
            return Ok(());
        }
        if let Some(transport) = &inner.transport {
            lock_transport(transport).send_command(STOP_COMMAND)?;
        }

        self.streaming.store(false, Ordering::SeqCst);
        self.logging.store(false, Ordering::SeqCst);
        if let Some(writer) = inner.writer.take() {
            writer.stop();
        }
        self.log_queue.drain();
        inner.state = DeviceState::Connected;
        info!("{} stopped streaming", self.name);
        Ok(())
    }

    /// Stop streaming if needed, stop the reader, and close the port.
    pub fn disconnect(&self) {
        let mut inner = self.inner();
        if let Err(e) = self.stop_locked(&mut inner) {
            warn!("{}: failed to stop stream before disconnecting: {}", self.name, e);
            self.streaming.store(false, Ordering::SeqCst);
            self.logging.store(false, Ordering::SeqCst);
            inner.writer.take();
        }
        if let Some(reader) = inner.reader.take() {
            reader.cancel.cancel();
            if reader.handle.join().is_err() {
                error!("{}: reader thread panicked", self.name);
            }
        }
        inner.transport = None;
        if inner.state != DeviceState::Disconnected {
            inner.state = DeviceState::Disconnected;
            info!("{} disconnected", self.name);
        }
    }

    /// Calibrate the link for this device's side. Blocks for the
    /// calibration duration.
    pub fn calibrate(&self, cancel: &CancelToken) -> bool {
        let side = self.side();
        info!("Calibrating {} ({} sock)", self.name, side);
        self.link
            .calibrate(side, self.settings.calibration, self.clock.as_ref(), cancel)
    }

    /// Filtered pressures; empty unless streaming.
    pub fn pressures(&self) -> Vec<f64> {
        if !self.is_streaming() {
            warn!(
                "Attempted to get sensor pressures for {} while not streaming",
                self.name
            );
            return Vec::new();
        }
        self.link.pressures().to_vec()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let reader = self.inner().reader.take();
        if let Some(reader) = reader {
            reader.cancel.cancel();
            let _ = reader.handle.join();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sensor_link::tests::pressure_frame;
    use crate::transport::mock::{MockBackend, MockTransport};
    use std::fs;
    use std::time::Instant;

    pub(crate) fn test_settings(log_dir: PathBuf) -> DeviceSettings {
        DeviceSettings {
            identity_poll: Duration::from_millis(500),
            identity_attempts: 3,
            log_dir,
            log_drain: Duration::from_millis(5),
            calibration: CalibrationSettings::default(),
        }
    }

    fn device_on(backend: &MockBackend, path: &str, log_dir: PathBuf) -> Device {
        Device::new(
            path,
            9600,
            Arc::new(backend.clone()),
            Arc::new(ManualClock::new()),
            test_settings(log_dir),
        )
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn connect_identifies_side() {
        let backend = MockBackend::new();
        backend.add("/dev/ttyUSB0", MockTransport::sock(3));
        let device = device_on(&backend, "/dev/ttyUSB0", PathBuf::from("."));

        device.connect(&CancelToken::new()).unwrap();
        assert_eq!(device.state(), DeviceState::Connected);
        assert_eq!(device.side(), SockSide::Left);
        assert_eq!(device.module_number(), Some(3));
        assert_eq!(device.name(), "Device on /dev/ttyUSB0");

        // connecting again is a no-op
        device.connect(&CancelToken::new()).unwrap();
        let written = backend.port("/dev/ttyUSB0").unwrap().written();
        assert_eq!(written.matches(IDENTITY_QUERY).count(), 1);
        device.disconnect();
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn silent_sock_fails_to_connect() {
        let backend = MockBackend::new();
        backend.add("/dev/ttyUSB1", MockTransport::new());
        let device = device_on(&backend, "/dev/ttyUSB1", PathBuf::from("."));

        let err = device.connect(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, DeviceError::NoIdentity { attempts: 3, .. }));
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn cancelled_connect_leaves_device_disconnected() {
        let backend = MockBackend::new();
        backend.add("/dev/ttyUSB1", MockTransport::new());
        let device = device_on(&backend, "/dev/ttyUSB1", PathBuf::from("."));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            device.connect(&cancel),
            Err(DeviceError::Cancelled(_))
        ));
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn start_and_stop_are_guarded() {
        let backend = MockBackend::new();
        backend.add("/dev/ttyUSB0", MockTransport::sock(2));
        let device = device_on(&backend, "/dev/ttyUSB0", PathBuf::from("/nonexistent"));

        // not connected: nothing happens
        device.start().unwrap();
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert!(device.pressures().is_empty());

        device.connect(&CancelToken::new()).unwrap();
        device.stop().unwrap();
        assert_eq!(device.state(), DeviceState::Connected);

        // a missing log path does not prevent streaming
        device.start().unwrap();
        assert_eq!(device.state(), DeviceState::Streaming);
        assert_eq!(device.pressures().len(), CHANNELS);
        device.stop().unwrap();
        assert_eq!(device.state(), DeviceState::Connected);

        let written = backend.port("/dev/ttyUSB0").unwrap().written();
        assert!(written.ends_with("BT^START\r\nBT^STOP\r\n"));
        device.disconnect();
    }

    #[test]
    fn streaming_publishes_and_logs_frames() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("UserID_1_Right_1.txt");
        fs::write(&log_path, format!("{}\n", frame_log::LOG_HEADER)).unwrap();
        fs::write(
            frame_log::active_log_file(dir.path(), SockSide::Right),
            format!("{}\n", log_path.display()),
        )
        .unwrap();

        let backend = MockBackend::new();
        let mock = MockTransport::sock(4);
        backend.add("/dev/ttyACM0", mock.clone());
        let device = device_on(&backend, "/dev/ttyACM0", dir.path().to_path_buf());
        device.connect(&CancelToken::new()).unwrap();
        let events = device.subscribe(64);

        device.start().unwrap();
        mock.inject(pressure_frame(SockSide::Right, [100, 100, 100, 100]).as_bytes());

        let mut saw_raw = false;
        let mut cop = None;
        while cop.is_none() {
            match events.rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                DeviceEvent::Raw { .. } => saw_raw = true,
                DeviceEvent::Cop(event) => cop = Some(event),
                DeviceEvent::LinkLost { .. } => panic!("link lost while streaming"),
            }
        }
        let cop = cop.unwrap();
        assert!(saw_raw);
        assert_eq!(cop.side, SockSide::Right);
        assert_eq!(cop.device_name, "Device on /dev/ttyACM0");
        assert!(cop.x.abs() < 1e-9 && cop.y.abs() < 1e-9);

        assert!(wait_for(|| device.log_queue.is_empty()));
        device.stop().unwrap();
        device.disconnect();

        let contents = fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with("Data receival has resumed."));
        assert!(lines[3].ends_with("Data receival has been stopped."));
    }

    #[test]
    fn read_failure_disconnects_device() {
        let backend = MockBackend::new();
        let mock = MockTransport::sock(2);
        backend.add("/dev/ttyUSB0", mock.clone());
        let device = device_on(&backend, "/dev/ttyUSB0", PathBuf::from("."));
        device.connect(&CancelToken::new()).unwrap();
        let events = device.subscribe(8);

        mock.close();
        assert!(wait_for(|| device.state() == DeviceState::Disconnected));
        assert_eq!(
            events.rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DeviceEvent::LinkLost {
                device_name: "Device on /dev/ttyUSB0".into(),
                side: SockSide::Right,
            }
        );
        assert!(!device.is_connected());

        // disconnecting the dead device is harmless
        device.disconnect();
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn read_failure_while_streaming_closes_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("UserID_1_Left_1.txt");
        fs::write(&log_path, format!("{}\n", frame_log::LOG_HEADER)).unwrap();
        fs::write(
            frame_log::active_log_file(dir.path(), SockSide::Left),
            format!("{}\n", log_path.display()),
        )
        .unwrap();

        let backend = MockBackend::new();
        let mock = MockTransport::sock(1);
        backend.add("/dev/ttyUSB0", mock.clone());
        let device = device_on(&backend, "/dev/ttyUSB0", dir.path().to_path_buf());
        device.connect(&CancelToken::new()).unwrap();
        device.start().unwrap();
        assert!(device.is_streaming());

        mock.close();
        assert!(wait_for(|| device.state() == DeviceState::Disconnected));
        assert!(device.pressures().is_empty());

        let contents = fs::read_to_string(&log_path).unwrap();
        assert!(contents.trim_end().ends_with("Data receival has been stopped."));
    }
}
