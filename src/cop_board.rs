//! Latest center of pressure per foot, fed by device subscriptions.
//!
//! The exercise engine reads whatever was published last; there is no
//! queueing and no staleness bound. A foot whose sock loses its link has
//! no reading until the sock reports again.

use crate::clock::CancelToken;
use crate::device::{CopEvent, Device, DeviceEvent};
use crate::event_hub::{Subscription, SubscriptionId};
use crate::exercise::CopSource;
use crate::sensor_link::SockSide;

use log::{debug, error, info, warn};
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const EVENT_CAPACITY: usize = 16;
const PUMP_IDLE: Duration = Duration::from_millis(5);

type Latest = Arc<Mutex<[Option<(f64, f64)>; 2]>>;

fn slot(side: SockSide) -> usize {
    match side {
        SockSide::Left => 0,
        SockSide::Right => 1,
    }
}

struct Pump {
    cancel: CancelToken,
    handle: thread::JoinHandle<()>,
}

#[derive(Default)]
struct BoardState {
    subscriptions: Vec<(Arc<Device>, SubscriptionId)>,
    pump: Option<Pump>,
}

/// Collects CoP events from the connected socks.
#[derive(Default)]
pub struct CopBoard {
    latest: Latest,
    state: Mutex<BoardState>,
}

impl CopBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `event` as its foot's latest reading.
    pub fn record(&self, event: &CopEvent) {
        record(&self.latest, event);
    }

    /// The last reading for `side`, if one has arrived.
    pub fn latest(&self, side: SockSide) -> Option<(f64, f64)> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())[slot(side)]
    }

    /// Subscribe to `devices` and start pumping their CoP events.
    ///
    /// Replaces any previous attachment.
    pub fn attach(&self, devices: &[Arc<Device>]) {
        self.detach();
        let mut state = self.state();
        let mut feeds = Vec::with_capacity(devices.len());
        for device in devices {
            let sub = device.subscribe(EVENT_CAPACITY);
            state.subscriptions.push((device.clone(), sub.id));
            feeds.push(sub);
            info!("CoP board subscribed to {}", device.name());
        }
        if feeds.is_empty() {
            return;
        }

        let cancel = CancelToken::new();
        let th_cancel = cancel.clone();
        let latest = self.latest.clone();
        let handle = thread::spawn(move || pump(feeds, latest, th_cancel));
        state.pump = Some(Pump { cancel, handle });
    }

    /// Unsubscribe from every device and stop the pump.
    pub fn detach(&self) {
        let mut state = self.state();
        for (device, id) in state.subscriptions.drain(..) {
            device.unsubscribe(id);
        }
        if let Some(pump) = state.pump.take() {
            pump.cancel.cancel();
            if pump.handle.join().is_err() {
                error!("CoP pump panicked");
            }
        }
    }
}

impl CopSource for CopBoard {
    fn cop(&self, side: SockSide) -> Option<(f64, f64)> {
        self.latest(side)
    }
}

impl Drop for CopBoard {
    fn drop(&mut self) {
        self.detach();
    }
}

fn record(latest: &Latest, event: &CopEvent) {
    latest.lock().unwrap_or_else(|e| e.into_inner())[slot(event.side)] = Some((event.x, event.y));
}

fn forget(latest: &Latest, side: SockSide) {
    latest.lock().unwrap_or_else(|e| e.into_inner())[slot(side)] = None;
}

fn pump(mut feeds: Vec<Subscription<DeviceEvent>>, latest: Latest, cancel: CancelToken) {
    while !cancel.is_cancelled() && !feeds.is_empty() {
        let mut idle = true;
        feeds.retain(|sub| loop {
            match sub.rx.try_recv() {
                Ok(DeviceEvent::Cop(event)) => {
                    idle = false;
                    record(&latest, &event);
                }
                Ok(DeviceEvent::LinkLost { device_name, side }) => {
                    idle = false;
                    warn!("{} dropped out, forgetting the {} foot", device_name, side);
                    forget(&latest, side);
                }
                Ok(DeviceEvent::Raw { .. }) => idle = false,
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Disconnected) => {
                    debug!("CoP feed {} closed", sub.id);
                    break false;
                }
            }
        });
        if idle {
            thread::sleep(PUMP_IDLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::tests::test_settings;
    use crate::device::DeviceState;
    use crate::sensor_link::tests::pressure_frame;
    use crate::transport::mock::{MockBackend, MockTransport};
    use std::path::PathBuf;
    use std::time::Instant;

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

    fn event(side: SockSide, x: f64, y: f64) -> CopEvent {
        CopEvent {
            device_name: "test".into(),
            side,
            x,
            y,
            pressures: [0.0; 4],
        }
    }

    #[test]
    fn keeps_latest_per_side() {
        let board = CopBoard::new();
        assert_eq!(board.latest(SockSide::Left), None);
        assert_eq!(board.cop(SockSide::Left), None);

        board.record(&event(SockSide::Left, 1.0, 2.0));
        board.record(&event(SockSide::Left, -1.0, 0.5));
        board.record(&event(SockSide::Right, 0.2, 0.3));

        assert_eq!(board.cop(SockSide::Left), Some((-1.0, 0.5)));
        assert_eq!(board.cop(SockSide::Right), Some((0.2, 0.3)));
    }

    #[test]
    fn pumps_events_from_streaming_device() {
        let backend = MockBackend::new();
        let mock = MockTransport::sock(2);
        backend.add("/dev/ttyUSB0", mock.clone());
        let device = Arc::new(Device::new(
            "/dev/ttyUSB0",
            9600,
            Arc::new(backend.clone()),
            Arc::new(ManualClock::new()),
            test_settings(PathBuf::from("/nonexistent")),
        ));
        device.connect(&CancelToken::new()).unwrap();
        device.start().unwrap();

        let board = CopBoard::new();
        board.attach(&[device.clone()]);
        mock.inject(pressure_frame(SockSide::Right, [100, 100, 100, 100]).as_bytes());

        assert!(wait_for(|| board.latest(SockSide::Right).is_some()));
        let (x, y) = board.latest(SockSide::Right).unwrap();
        assert!(x.abs() < 1e-9 && y.abs() < 1e-9);
        assert_eq!(board.latest(SockSide::Left), None);

        // a dead link takes the foot's reading with it
        mock.close();
        assert!(wait_for(|| board.cop(SockSide::Right).is_none()));
        assert_eq!(device.state(), DeviceState::Disconnected);

        board.detach();
    }
}
