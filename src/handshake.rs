//! The binary handshake a remote consumer uses to claim devices.
//!
//! ```text
//! request:  u8 n, then n bytes of NUL-separated port paths (none = all)
//! response: for each granted device, ASCII path, 0x00, i32 LE frequency
//! ```
//!
//! After the reply the handler stays subscribed to the granted devices for
//! the life of the connection.

use crate::clock::CancelToken;
use crate::device::{Device, DeviceEvent};
use crate::event_hub::{Subscription, SubscriptionId};
use crate::registry::DeviceRegistry;

use log::{debug, error, info, warn};
use nom::{
    bytes::complete::{tag, take_until},
    combinator::{all_consuming, map, map_res},
    multi::many0,
    number::complete::le_i32,
    sequence::{pair, terminated},
    IResult,
};
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        mpsc::TryRecvError,
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

/// Read timeout applied to handshake connections.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;
const RELAY_IDLE: Duration = Duration::from_millis(10);
const ACCEPT_IDLE: Duration = Duration::from_millis(50);

/// Handshake failures. Any of them ends the connection's handler.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Reading or writing the peer failed, including timeouts.
    #[error("handshake I/O error: {0}")]
    Io(#[from] io::Error),
    /// More paths than fit in one length byte.
    #[error("request of {0} bytes exceeds 255")]
    RequestTooLong(usize),
    /// A descriptor list that does not parse.
    #[error("malformed descriptor list")]
    Malformed,
}

/// One granted device as it appears in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Port path
    pub path: String,
    /// Baud rate
    pub frequency: i32,
}

impl DeviceDescriptor {
    fn of(device: &Device) -> Self {
        Self {
            path: device.path().to_string(),
            frequency: device.frequency() as i32,
        }
    }
}

/// Build a request for `paths`. An empty slice requests every device.
pub fn encode_request(paths: &[&str]) -> Result<Vec<u8>, HandshakeError> {
    let body = paths.join("\0").into_bytes();
    let len = u8::try_from(body.len()).map_err(|_| HandshakeError::RequestTooLong(body.len()))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(len);
    out.extend(body);
    Ok(out)
}

/// Split a request body into its non-empty paths.
pub fn decode_request(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .filter(|p| !p.is_empty())
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

/// Serialize the response for `descriptors`.
pub fn encode_descriptors(descriptors: &[DeviceDescriptor]) -> Vec<u8> {
    let mut out = Vec::new();
    for d in descriptors {
        out.extend_from_slice(d.path.as_bytes());
        out.push(0);
        out.extend_from_slice(&d.frequency.to_le_bytes());
    }
    out
}

fn descriptor(input: &[u8]) -> IResult<&[u8], DeviceDescriptor> {
    map(
        pair(
            map_res(terminated(take_until(&b"\0"[..]), tag(&b"\0"[..])), |p: &[u8]| {
                std::str::from_utf8(p).map(str::to_owned)
            }),
            le_i32,
        ),
        |(path, frequency)| DeviceDescriptor { path, frequency },
    )(input)
}

/// Parse a response back into descriptors.
pub fn decode_descriptors(bytes: &[u8]) -> Result<Vec<DeviceDescriptor>, HandshakeError> {
    all_consuming(many0(descriptor))(bytes)
        .map(|(_, ds)| ds)
        .map_err(|_| HandshakeError::Malformed)
}

struct Relay {
    cancel: CancelToken,
    handle: thread::JoinHandle<()>,
}

#[derive(Default)]
struct HandlerState {
    subscriptions: Vec<(Arc<Device>, SubscriptionId)>,
    relay: Option<Relay>,
}

/// The server side of one handshake connection.
pub struct ClientHandshake {
    registry: Arc<DeviceRegistry>,
    state: Mutex<HandlerState>,
}

impl ClientHandshake {
    /// A handler resolving paths through `registry`.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(HandlerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the handshake on `stream` and subscribe to the granted devices.
    ///
    /// On any failure the handler is stopped and the error returned.
    pub fn negotiate<S: Read + Write>(
        &self,
        stream: &mut S,
        cancel: &CancelToken,
    ) -> Result<Vec<DeviceDescriptor>, HandshakeError> {
        info!("Handshake started");
        let result = self.try_negotiate(stream, cancel);
        if let Err(e) = &result {
            error!("Handshake failed: {}", e);
            self.stop();
        }
        result
    }

    fn try_negotiate<S: Read + Write>(
        &self,
        stream: &mut S,
        cancel: &CancelToken,
    ) -> Result<Vec<DeviceDescriptor>, HandshakeError> {
        let mut len = [0u8; 1];
        stream.read_exact(&mut len)?;
        let mut body = vec![0u8; len[0] as usize];
        stream.read_exact(&mut body)?;

        let paths = decode_request(&body);
        info!("Requested device paths: {:?}", paths);
        let devices = self.resolve(&paths);

        for device in &devices {
            info!("Registering and connecting device at {}", device.path());
            if let Err(e) = device.connect(cancel) {
                warn!("Device at {} did not connect: {}", device.path(), e);
            }
        }

        let descriptors: Vec<DeviceDescriptor> =
            devices.iter().map(|d| DeviceDescriptor::of(d)).collect();
        stream.write_all(&encode_descriptors(&descriptors))?;
        stream.flush()?;

        self.attach(devices);
        Ok(descriptors)
    }

    fn resolve(&self, paths: &[String]) -> Vec<Arc<Device>> {
        if paths.is_empty() {
            return self.registry.all_devices();
        }
        paths
            .iter()
            .filter_map(|path| {
                let found = self.registry.find(path);
                if found.is_none() {
                    warn!("Requested device {} is unknown, dropping it", path);
                }
                found
            })
            .collect()
    }

    fn attach(&self, devices: Vec<Arc<Device>>) {
        let mut state = self.state();
        let mut feeds: Vec<(String, Subscription<DeviceEvent>)> = Vec::new();
        for device in devices {
            if state
                .subscriptions
                .iter()
                .any(|(d, _)| Arc::ptr_eq(d, &device))
            {
                continue;
            }
            let sub = device.subscribe(EVENT_CAPACITY);
            state.subscriptions.push((device.clone(), sub.id));
            feeds.push((device.path().to_string(), sub));
            info!("Subscribed to events for {}", device.name());
        }
        if feeds.is_empty() {
            return;
        }

        let cancel = CancelToken::new();
        let th_cancel = cancel.clone();
        let handle = thread::spawn(move || relay_events(feeds, th_cancel));
        if let Some(old) = state.relay.replace(Relay { cancel, handle }) {
            old.cancel.cancel();
            let _ = old.handle.join();
        }
    }

    /// Devices this handler is subscribed to.
    pub fn subscribed(&self) -> Vec<Arc<Device>> {
        self.state()
            .subscriptions
            .iter()
            .map(|(d, _)| d.clone())
            .collect()
    }

    /// Unsubscribe from every device and stop relaying.
    pub fn stop(&self) {
        let mut state = self.state();
        for (device, id) in state.subscriptions.drain(..) {
            device.unsubscribe(id);
        }
        if let Some(relay) = state.relay.take() {
            relay.cancel.cancel();
            if relay.handle.join().is_err() {
                error!("Handshake relay panicked");
            }
        }
        info!("Handler stopped and devices cleared");
    }
}

impl Drop for ClientHandshake {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relay_events(mut feeds: Vec<(String, Subscription<DeviceEvent>)>, cancel: CancelToken) {
    while !cancel.is_cancelled() && !feeds.is_empty() {
        let mut idle = true;
        feeds.retain(|(path, sub)| loop {
            match sub.rx.try_recv() {
                Ok(DeviceEvent::Raw { device_name, hex }) => {
                    idle = false;
                    debug!("Raw data from {}: {}", device_name, hex);
                }
                Ok(DeviceEvent::Cop(cop)) => {
                    idle = false;
                    debug!(
                        "{} sock {} -> CoP X={:.2}, Y={:.2}, pressures {:.2?}",
                        cop.side, cop.device_name, cop.x, cop.y, cop.pressures
                    );
                }
                Ok(DeviceEvent::LinkLost { device_name, side }) => {
                    idle = false;
                    warn!("{} sock {} lost its serial link", side, device_name);
                }
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Disconnected) => {
                    debug!("Event feed for {} closed", path);
                    break false;
                }
            }
        });
        if idle {
            thread::sleep(RELAY_IDLE);
        }
    }
}

/// Accepts TCP connections and runs one [`ClientHandshake`] per connection
/// until the peer closes.
pub struct HandshakeServer {
    local_addr: SocketAddr,
    cancel: CancelToken,
    handle: Option<thread::JoinHandle<()>>,
}

impl HandshakeServer {
    /// Bind `addr` and start accepting.
    pub fn bind<A: ToSocketAddrs>(addr: A, registry: Arc<DeviceRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("Handshake server listening on {}", local_addr);

        let cancel = CancelToken::new();
        let th_cancel = cancel.clone();
        let handle = thread::spawn(move || {
            while !th_cancel.is_cancelled() {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let cancel = th_cancel.clone();
                        thread::spawn(move || {
                            if let Err(e) = serve(stream, registry, &cancel) {
                                warn!("Handshake connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_IDLE),
                    Err(e) => {
                        error!("Handshake accept failed: {}", e);
                        thread::sleep(ACCEPT_IDLE);
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            cancel,
            handle: Some(handle),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Live connections end when their peers close.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HandshakeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(
    mut stream: TcpStream,
    registry: Arc<DeviceRegistry>,
    cancel: &CancelToken,
) -> Result<(), HandshakeError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let handler = ClientHandshake::new(registry);
    let granted = handler.negotiate(&mut stream, cancel)?;
    info!("Granted {} device(s)", granted.len());

    let mut buf = [0u8; 64];
    let result = loop {
        match stream.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if cancel.is_cancelled() {
                    break Ok(());
                }
            }
            Err(e) => break Err(e.into()),
        }
    };
    handler.stop();
    result
}
