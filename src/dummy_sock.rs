//! Simulated socks for running the whole pipeline without hardware.
//!
//! Each simulated port owns a generator thread that answers the identity
//! query and, once started, emits sealed frames whose pressure pads sway
//! slowly around the center of the foot.

use crate::packet::{RawFrame, FRAME_LEN};
use crate::sensor_link::{SockSide, CHANNELS};
use crate::transport::{SerialBackend, SockTransport, TransportError};

use log::{debug, info};
use rand::prelude::*;
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const BASE_RAW: f64 = 600.0;

/// A backend exposing two simulated socks, module 1 (left) and 2 (right).
#[derive(Debug, Clone)]
pub struct DummySocks {
    ports: Vec<(String, u32)>,
    sway: f64,
    noise: f64,
}

impl Default for DummySocks {
    fn default() -> Self {
        Self {
            ports: vec![("sim://sock-1".into(), 1), ("sim://sock-2".into(), 2)],
            sway: 0.3,
            noise: 0.02,
        }
    }
}

impl DummySocks {
    /// The default pair of simulated socks.
    pub fn new() -> Self {
        Self::default()
    }

    /// How far the simulated weight shifts, as a fraction of pad load.
    pub fn with_sway(mut self, sway: f64) -> Self {
        self.sway = sway;
        self
    }

    /// Random jitter added to every pad, as a fraction of pad load.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }
}

impl SerialBackend for DummySocks {
    fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.ports.iter().map(|(p, _)| p.clone()).collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SockTransport>, TransportError> {
        let (_, module_number) = self
            .ports
            .iter()
            .find(|(p, _)| p == path)
            .ok_or_else(|| TransportError::NoSuchPort(path.to_string()))?;
        info!("Simulating sock {} on {} at {} baud", module_number, path, baud_rate);
        Ok(Box::new(DummySock::spawn(
            *module_number,
            self.sway,
            self.noise,
        )))
    }
}

enum Signal {
    Identify,
    Start,
    Stop,
    Shutdown,
}

/// One simulated port.
pub struct DummySock {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    outgoing: Arc<Mutex<VecDeque<u8>>>,
}

impl DummySock {
    fn spawn(module_number: u32, sway: f64, noise: f64) -> Self {
        let (tx, rx) = mpsc::channel::<Signal>();
        let outgoing = Arc::new(Mutex::new(VecDeque::new()));
        let th_outgoing = Arc::clone(&outgoing);
        let side = SockSide::from_module_number(module_number);

        let handle = thread::spawn(move || {
            let mut rng = thread_rng();
            let mut streaming = false;
            let mut time_ms: u32 = 0;
            loop {
                while let Ok(signal) = rx.try_recv() {
                    match signal {
                        Signal::Identify => {
                            let reply = format!("Register 6 value: {}\r\n", module_number);
                            push(&th_outgoing, reply.as_bytes());
                        }
                        Signal::Start => streaming = true,
                        Signal::Stop => streaming = false,
                        Signal::Shutdown => return,
                    }
                }
                if streaming {
                    let phase = time_ms as f64 / 1000.0;
                    let frame = generate_frame(side, time_ms, phase, sway, noise, &mut rng);
                    push(&th_outgoing, frame.as_bytes());
                }
                time_ms = time_ms.wrapping_add(FRAME_INTERVAL.as_millis() as u32);
                thread::sleep(FRAME_INTERVAL);
            }
        });

        DummySock {
            handle: Some(handle),
            tx,
            outgoing,
        }
    }
}

fn push(queue: &Mutex<VecDeque<u8>>, bytes: &[u8]) {
    queue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .extend(bytes.iter().copied());
}

impl SockTransport for DummySock {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let mut queue = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let n = queue.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        drop(queue);
        if n == 0 {
            thread::sleep(FRAME_INTERVAL / 2);
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let command = String::from_utf8_lossy(data);
        let signal = match command.trim() {
            "BTS6?" => Signal::Identify,
            "BT^START" => Signal::Start,
            "BT^STOP" => Signal::Stop,
            other => {
                debug!("Simulated sock ignoring {:?}", other);
                return Ok(());
            }
        };
        self.tx.send(signal).map_err(|_| TransportError::Closed)
    }
}

impl Drop for DummySock {
    fn drop(&mut self) {
        let _ = self.tx.send(Signal::Shutdown);
        if let Some(thread) = self.handle.take() {
            let _ = thread.join();
        }
    }
}

/// Pad loads for a weight shift of `sway` toward `angle` (radians).
fn pad_loads(side: SockSide, angle: f64, sway: f64) -> [f64; CHANNELS] {
    let xs = side.x_positions();
    let ys = side.y_positions();
    std::array::from_fn(|i| {
        1.0 + sway * (angle.cos() * xs[i] / 3.0 + angle.sin() * ys[i] / 4.0) / 2.0
    })
}

fn generate_frame(
    side: SockSide,
    time_ms: u32,
    angle: f64,
    sway: f64,
    noise: f64,
    rng: &mut impl Rng,
) -> RawFrame {
    let mut body = [0u8; FRAME_LEN];
    body[2] = rng.gen_range(80..=100);
    body[3..7].copy_from_slice(&time_ms.to_le_bytes());
    for i in 0..3 {
        let accel: i16 = rng.gen_range(-64..64);
        body[23 + 2 * i..25 + 2 * i].copy_from_slice(&accel.to_le_bytes());
    }

    let loads = pad_loads(side, angle, sway);
    for (offset, load) in side.sensor_offsets().into_iter().zip(loads) {
        let jitter = if noise > 0.0 {
            rng.gen_range(-noise..noise)
        } else {
            0.0
        };
        // raw readings are resistances, so a heavier pad reads lower
        let raw = (BASE_RAW / (load + jitter).max(0.05)).round() as u16;
        body[offset..offset + 2].copy_from_slice(&raw.to_be_bytes());
    }
    RawFrame::seal(body)
}
