//! Messages for the head-mounted display and the sinks that deliver them.
//!
//! Messages are JSON objects tagged by `type`, one per line on the wire.

use crate::clock::{CancelToken, Clock};
use crate::exercise::{ExerciseDefinition, LegsUsed, Span, Zone};
use crate::sensor_link::SockSide;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

/// Connection attempts made before giving up on the HMD.
pub const CONNECT_RETRIES: u32 = 10;
/// Pause between connection attempts.
pub const CONNECT_DELAY: Duration = Duration::from_secs(3);

/// One phase as the HMD sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSequenceItem {
    pub duration: u32,
    pub green_zone_x: Span,
    pub green_zone_y: Span,
    pub red_zone_x: Span,
    pub red_zone_y: Span,
}

/// Sent before each exercise starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseConfigMessage {
    pub repetition_id: u32,
    pub name: String,
    pub legs_used: LegsUsed,
    pub intro: u32,
    pub demo: u32,
    pub preparation_cop: u32,
    pub timing_cop: u32,
    pub release: u32,
    pub sets: u32,
    pub zone_sequence: Vec<ZoneSequenceItem>,
}

impl From<&ExerciseDefinition> for ExerciseConfigMessage {
    fn from(def: &ExerciseDefinition) -> Self {
        Self {
            repetition_id: def.repetition_id,
            name: def.name.clone(),
            legs_used: def.legs_used,
            intro: def.intro,
            demo: def.demo,
            preparation_cop: def.preparation_cop,
            timing_cop: def.timing_cop,
            release: def.release,
            sets: def.sets,
            zone_sequence: def
                .zone_sequence
                .iter()
                .map(|phase| ZoneSequenceItem {
                    duration: phase.duration,
                    green_zone_x: phase.zones.green.x,
                    green_zone_y: phase.zones.green.y,
                    red_zone_x: phase.zones.red.x,
                    red_zone_y: phase.zones.red.y,
                })
                .collect(),
        }
    }
}

/// A zone report for one foot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackMessage {
    pub repetition_id: u32,
    pub foot: SockSide,
    pub zone: i32,
}

/// Everything sent to the HMD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HmdMessage {
    /// An exercise is about to start
    ExerciseConfig(ExerciseConfigMessage),
    /// A foot changed zone
    Feedback(FeedbackMessage),
}

impl HmdMessage {
    /// Feedback for `foot` during exercise `repetition_id`.
    pub fn feedback(repetition_id: u32, foot: SockSide, zone: Zone) -> Self {
        HmdMessage::Feedback(FeedbackMessage {
            repetition_id,
            foot,
            zone: zone.code(),
        })
    }

    /// The configuration announcement for `def`.
    pub fn config(def: &ExerciseDefinition) -> Self {
        HmdMessage::ExerciseConfig(def.into())
    }

    /// The message as a single JSON line, without the newline.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Failures reaching the HMD.
#[derive(Debug, thiserror::Error)]
pub enum HmdError {
    /// Every connection attempt failed.
    #[error("failed to connect to HMD after {attempts} attempts: {last}")]
    Unreachable {
        /// Attempts made
        attempts: u32,
        /// The last attempt's error
        last: io::Error,
    },
    /// Gave up waiting.
    #[error(transparent)]
    Cancelled(#[from] crate::clock::Cancelled),
}

/// Where the exercise engine sends its output.
pub trait FeedbackSink: Send {
    /// Deliver a message to the HMD.
    fn send(&mut self, message: &HmdMessage);

    /// Report progress to the operator.
    fn status(&mut self, text: &str) {
        info!("{}", text);
    }
}

/// Newline-delimited JSON over TCP.
pub struct TcpHmdLink {
    stream: TcpStream,
}

impl TcpHmdLink {
    /// Connect to `addr`, retrying up to `retries` times `delay` apart.
    pub fn connect<A: ToSocketAddrs + Copy>(
        addr: A,
        retries: u32,
        delay: Duration,
        clock: &dyn Clock,
        cancel: &CancelToken,
    ) -> Result<Self, HmdError> {
        let retries = retries.max(1);
        let mut last = io::Error::new(io::ErrorKind::NotConnected, "no attempt made");
        for attempt in 1..=retries {
            cancel.check()?;
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    info!("HMD connected");
                    return Ok(Self { stream });
                }
                Err(e) => {
                    warn!("HMD connection attempt {} failed: {}", attempt, e);
                    last = e;
                    if attempt < retries {
                        clock.pause(delay, cancel)?;
                    }
                }
            }
        }
        Err(HmdError::Unreachable {
            attempts: retries,
            last,
        })
    }
}

impl FeedbackSink for TcpHmdLink {
    fn send(&mut self, message: &HmdMessage) {
        let line = match message.to_json() {
            Ok(json) => json + "\n",
            Err(e) => {
                warn!("Could not encode HMD message: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.flush())
        {
            warn!("Error sending data to HMD: {}", e);
        }
    }
}

/// Used when the HMD is bypassed: messages are only logged.
#[derive(Debug, Default)]
pub struct LogOnlySink;

impl FeedbackSink for LogOnlySink {
    fn send(&mut self, message: &HmdMessage) {
        match message {
            HmdMessage::Feedback(f) => info!("[Feedback]: {} foot -> zone {}", f.foot, f.zone),
            HmdMessage::ExerciseConfig(c) => {
                info!("[Feedback]: configuration for exercise {}", c.repetition_id)
            }
        }
        debug!("HMD bypassed, not sending {:?}", message);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exercise::Catalog;
    use serde_json::{json, Value};
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// Keeps every message and status line for inspection.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub messages: Arc<Mutex<Vec<HmdMessage>>>,
        pub statuses: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        pub fn feedback(&self) -> Vec<(SockSide, i32)> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    HmdMessage::Feedback(f) => Some((f.foot, f.zone)),
                    _ => None,
                })
                .collect()
        }

        pub fn configs(&self) -> Vec<u32> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    HmdMessage::ExerciseConfig(c) => Some(c.repetition_id),
                    _ => None,
                })
                .collect()
        }
    }

    impl FeedbackSink for RecordingSink {
        fn send(&mut self, message: &HmdMessage) {
            self.messages.lock().unwrap().push(message.clone());
        }

        fn status(&mut self, text: &str) {
            self.statuses.lock().unwrap().push(text.to_string());
        }
    }

    #[test]
    fn feedback_json_shape() {
        let msg = HmdMessage::feedback(4, SockSide::Left, Zone::FrontLeft);
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "Feedback", "repetitionId": 4, "foot": "Left", "zone": 4})
        );
    }

    #[test]
    fn config_json_shape() {
        let catalog = Catalog::builtin();
        let def = catalog.get(1).unwrap();
        let value: Value = serde_json::from_str(&HmdMessage::config(def).to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "ExerciseConfig");
        assert_eq!(value["repetitionId"], 1);
        assert_eq!(value["name"], "Single-Leg Stance - Right Leg");
        assert_eq!(value["legsUsed"], "right");
        assert_eq!(value["timingCop"], 30);
        assert_eq!(value["zoneSequence"][0]["duration"], 30);
        assert_eq!(value["zoneSequence"][0]["greenZoneX"], json!([-0.5, 0.5]));
        assert_eq!(value["zoneSequence"][0]["redZoneY"], json!([-4.0, 4.1]));
    }

    #[test]
    fn messages_parse_back() {
        let msg = HmdMessage::feedback(9, SockSide::Right, Zone::Lost);
        let parsed: HmdMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn tcp_link_writes_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let clock = ManualClock::new();
        let mut link = TcpHmdLink::connect(addr, 3, CONNECT_DELAY, &clock, &CancelToken::new()).unwrap();
        let (peer, _) = listener.accept().unwrap();

        link.send(&HmdMessage::feedback(1, SockSide::Right, Zone::Green));
        link.send(&HmdMessage::feedback(1, SockSide::Right, Zone::Lost));

        let mut lines = BufReader::new(peer).lines();
        let first: Value = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        let second: Value = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        assert_eq!(first["zone"], 1);
        assert_eq!(second["zone"], 7);
    }

    #[test]
    fn unreachable_hmd_gives_up_after_retries() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let clock = ManualClock::new();
        let result = TcpHmdLink::connect(addr, 3, CONNECT_DELAY, &clock, &CancelToken::new());
        assert!(matches!(result, Err(HmdError::Unreachable { attempts: 3, .. })));
        assert_eq!(clock.elapsed(), CONNECT_DELAY * 2);
    }
}
