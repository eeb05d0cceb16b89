//! Per-device frame logging.
//!
//! While a device streams, every decoded frame is queued as a
//! `timestamp,HEX-HEX-...` entry. A writer thread drains the queue
//! periodically, parses each entry back into [`FrameFields`], and appends a
//! tab-separated row to the log file named in the side's
//! `ActiveLogFile_<Side>.txt`.

use crate::clock::CancelToken;
use crate::packet::{FrameFields, RawFrame};
use crate::sensor_link::SockSide;

use chrono::{DateTime, FixedOffset, Local, TimeZone};
use log::{error, info, warn};
use nom::{
    bytes::complete::{take_until, take_while_m_n},
    character::complete::char,
    combinator::{all_consuming, map_opt, map_res},
    multi::separated_list1,
    sequence::separated_pair,
    IResult,
};
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};

/// Column header of every per-user log file.
pub const LOG_HEADER: &str = "Timestamp\tBattery\tTime_ms\tQ0\tQ1\tQ2\tQ3\tAcc_X\tAcc_Y\tAcc_Z\tSensor1\tSensor2\tSensor3\tSensor4\tSensor5\tSensor6\tSensor7\tSensor8";

const RESUMED: &str = "Data receival has resumed.";
const STOPPED: &str = "Data receival has been stopped.";
const ROW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How often the writer drains its queue by default.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Failures locating or writing a log file.
#[derive(Debug, thiserror::Error)]
pub enum FrameLogError {
    /// The side-channel file naming the log could not be read.
    #[error("cannot read active log file {path}: {source}")]
    ActiveFile {
        /// Side-channel file path
        path: PathBuf,
        /// Underlying cause
        source: io::Error,
    },
    /// The side-channel file names no existing log.
    #[error("log file path is missing or invalid: {0:?}")]
    InvalidLogPath(PathBuf),
    /// Writing the log failed.
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Path of the side-channel file that names `side`'s current log.
pub fn active_log_file(dir: &Path, side: SockSide) -> PathBuf {
    dir.join(format!("ActiveLogFile_{}.txt", side))
}

/// Read the first line of `side`'s side-channel file; it must name an
/// existing file.
pub fn resolve_log_path(dir: &Path, side: SockSide) -> Result<PathBuf, FrameLogError> {
    let active = active_log_file(dir, side);
    let contents = fs::read_to_string(&active).map_err(|source| FrameLogError::ActiveFile {
        path: active.clone(),
        source,
    })?;
    let named = contents.lines().next().map(str::trim).unwrap_or_default();
    if named.is_empty() {
        return Err(FrameLogError::InvalidLogPath(PathBuf::new()));
    }

    let path = PathBuf::from(named);
    let path = if path.is_relative() { dir.join(path) } else { path };
    if !path.is_file() {
        return Err(FrameLogError::InvalidLogPath(path));
    }
    Ok(path)
}

/// Create a fresh `UserID_<id>_<Side>_<n>.txt` for each side, using the
/// first free `n`, and point each side-channel file at it.
pub fn create_user_log_files(dir: &Path, user_id: u32) -> Result<Vec<PathBuf>, FrameLogError> {
    SockSide::both()
        .into_iter()
        .map(|side| -> Result<PathBuf, FrameLogError> {
            let path = (1u32..)
                .map(|n| dir.join(format!("UserID_{}_{}_{}.txt", user_id, side, n)))
                .find(|p| !p.exists())
                .unwrap_or_default();

            let mut file = File::create(&path)?;
            writeln!(file, "{}", LOG_HEADER)?;
            fs::write(active_log_file(dir, side), format!("{}\n", path.display()))?;
            info!("Created {} log file {}", side, path.display());
            Ok(path)
        })
        .collect()
}

/// A queued frame in its textual form.
pub fn queue_entry<Tz: TimeZone>(received: &DateTime<Tz>, frame: &RawFrame) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{},{}", received.to_rfc3339(), frame.to_hex())
}

fn hex_byte(s: &str) -> IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |h| {
        u8::from_str_radix(h, 16)
    })(s)
}

fn timestamp(s: &str) -> IResult<&str, DateTime<FixedOffset>> {
    map_res(take_until(","), DateTime::parse_from_rfc3339)(s)
}

fn frame_hex(s: &str) -> IResult<&str, RawFrame> {
    map_opt(separated_list1(char('-'), hex_byte), |bytes: Vec<u8>| {
        RawFrame::parse(&bytes)
    })(s)
}

/// Parse a queue entry back into its receipt time and frame.
pub fn parse_queue_entry(entry: &str) -> Option<(DateTime<FixedOffset>, RawFrame)> {
    all_consuming(separated_pair(timestamp, char(','), frame_hex))(entry.trim())
        .ok()
        .map(|(_, parsed)| parsed)
}

/// One tab-separated log row.
pub fn format_row(received: &DateTime<FixedOffset>, fields: &FrameFields) -> String {
    format!("{}\t{}", received.format(ROW_TIME_FORMAT), fields.to_columns())
}

fn marker_line(message: &str) -> String {
    format!("{}\t{}\n", Local::now().format(ROW_TIME_FORMAT), message)
}

fn append(path: &Path, text: &str) -> io::Result<()> {
    OpenOptions::new()
        .append(true)
        .open(path)?
        .write_all(text.as_bytes())
}

/// Entries waiting for the writer.
#[derive(Debug, Default)]
pub struct LogQueue {
    entries: Mutex<VecDeque<String>>,
}

impl LogQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one entry.
    pub fn push(&self, entry: String) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
    }

    /// Take every queued entry.
    pub fn drain(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turn queued entries into rows, skipping anything that does not parse.
pub fn render_rows(entries: &[String]) -> String {
    let mut out = String::new();
    for entry in entries {
        match parse_queue_entry(entry) {
            Some((received, frame)) => {
                out.push_str(&format_row(&received, &frame.fields()));
                out.push('\n');
            }
            None => warn!("Skipping malformed log entry"),
        }
    }
    out
}

/// The background writer for one streaming session.
pub struct LogWriter {
    path: PathBuf,
    cancel: CancelToken,
    handle: Option<thread::JoinHandle<()>>,
}

impl LogWriter {
    /// Write the resume marker to `path` and start draining `queue` into it
    /// every `interval`.
    pub fn start(
        path: PathBuf,
        queue: std::sync::Arc<LogQueue>,
        interval: Duration,
    ) -> Result<Self, FrameLogError> {
        append(&path, &marker_line(RESUMED))?;

        let cancel = CancelToken::new();
        let th_cancel = cancel.clone();
        let th_path = path.clone();
        let handle = thread::spawn(move || loop {
            let stopping = th_cancel.is_cancelled();
            let rows = render_rows(&queue.drain());
            if !rows.is_empty() {
                if let Err(e) = append(&th_path, &rows) {
                    error!("Error writing to log file {}: {}", th_path.display(), e);
                }
            }
            if stopping {
                break;
            }
            thread::sleep(interval);
        });

        info!("Logging frames to {}", path.display());
        Ok(Self {
            path,
            cancel,
            handle: Some(handle),
        })
    }

    /// The file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush what is queued, stop the thread, and write the stop marker.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.cancel();
        if handle.join().is_err() {
            error!("Log writer for {} panicked", self.path.display());
        }
        if let Err(e) = append(&self.path, &marker_line(STOPPED)) {
            error!("Error writing stop message to {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
