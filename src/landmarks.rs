//! Hand landmark frames and the sources that deliver them.
//!
//! Landmarks arrive as JSON lines from an external hand-landmark model:
//!
//! ```text
//! {"t": 1234, "hands": [[[0.51, 0.62], [0.49, 0.55], ... 21 points], ...]}
//! ```
//!
//! Coordinates are normalized to the image (`[0,1]`), `t` is an optional
//! monotonic timestamp in milliseconds and any landmark may be `null` when
//! the model only produced a partial detection.

use log::{debug, info, trace, warn};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, Read},
    os::unix::fs::{FileTypeExt, OpenOptionsExt},
    path::Path,
};

use crate::capture::CaptureError;

/// Fixed landmark indices (MediaPipe hand model layout).
pub mod idx {
    pub const WRIST: usize = 0;
    pub const THUMB_TIP: usize = 4;
    pub const INDEX_DIP: usize = 7;
    pub const INDEX_TIP: usize = 8;
    pub const MIDDLE_DIP: usize = 11;
    pub const MIDDLE_TIP: usize = 12;
    pub const RING_DIP: usize = 15;
    pub const RING_TIP: usize = 16;
    pub const PINKY_DIP: usize = 19;
    pub const PINKY_TIP: usize = 20;
}

pub const LANDMARK_COUNT: usize = 21;
pub const MAX_HANDS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// One hand's landmarks for a single frame. Entries may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandFrame {
    pub landmarks: Vec<Option<Point>>,
}

impl HandFrame {
    pub fn new(landmarks: Vec<Option<Point>>) -> Self {
        Self { landmarks }
    }

    /// Landmark at `i`, or `None` if it was not detected.
    pub fn get(&self, i: usize) -> Option<Point> {
        self.landmarks.get(i).copied().flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkFrame {
    pub timestamp_ms: Option<u64>,
    pub hands: Vec<HandFrame>,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    t: Option<u64>,
    #[serde(default)]
    hands: Vec<Vec<Option<[f32; 2]>>>,
}

/// Parse one JSON line into a frame. Hands beyond [`MAX_HANDS`] are dropped.
pub fn parse_frame(line: &str) -> serde_json::Result<LandmarkFrame> {
    let wire: WireFrame = serde_json::from_str(line)?;
    let hands = wire
        .hands
        .into_iter()
        .take(MAX_HANDS)
        .map(|pts| {
            HandFrame::new(
                pts.into_iter()
                    .take(LANDMARK_COUNT)
                    .map(|p| p.filter(|&[x, y]| x.is_finite() && y.is_finite()))
                    .map(|p| p.map(|[x, y]| Point::new(x, y)))
                    .collect(),
            )
        })
        .collect();
    Ok(LandmarkFrame {
        timestamp_ms: wire.t,
        hands,
    })
}

/// Result of polling a source for the next frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Frame(LandmarkFrame),
    /// Nothing new since the last poll.
    Pending,
    /// A line arrived but could not be parsed.
    Malformed,
    /// The stream is finished; capture should stop.
    Ended,
}

pub trait LandmarkSource {
    fn open(&mut self) -> Result<(), CaptureError>;
    fn poll(&mut self) -> SourcePoll;
    /// Release the underlying stream. Safe to call when not open.
    fn close(&mut self);
}

/// `O_NONBLOCK` for [`OpenOptionsExt::custom_flags`].
#[cfg(target_os = "linux")]
const O_NONBLOCK: i32 = 0o4000;
#[cfg(not(target_os = "linux"))]
const O_NONBLOCK: i32 = 0x0004;

const READ_CHUNK: usize = 8 * 1024;

/// Reads landmark JSON lines from stdin (`-`), a file or a FIFO.
///
/// The stream is opened nonblocking and read directly from `poll`, so the
/// frame loop never waits on the producer and `close` drops the descriptor
/// before returning. Stdin is reopened through `/dev/stdin` to get a private
/// nonblocking file description.
///
/// A [`live`](Self::live) source hands out only the newest complete frame on
/// each poll and drops anything older; the default mode delivers every line
/// in order.
pub struct JsonLinesSource {
    path: String,
    latest_only: bool,
    file: Option<File>,
    /// Named FIFOs outlive their writers; EOF there means "no writer yet".
    wait_for_writer: bool,
    partial: Vec<u8>,
    lines: VecDeque<String>,
    eof: bool,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            latest_only: false,
            file: None,
            wait_for_writer: false,
            partial: Vec::new(),
            lines: VecDeque::new(),
            eof: false,
        }
    }

    /// Real-time source for the daemon: stale frames are skipped.
    pub fn live(path: impl Into<String>) -> Self {
        Self {
            latest_only: true,
            ..Self::new(path)
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn os_path(&self) -> &Path {
        if self.path == "-" {
            Path::new("/dev/stdin")
        } else {
            Path::new(&self.path)
        }
    }

    /// Pull whatever is readable right now into `lines`. In ordered mode
    /// reading stops as soon as one complete line is queued.
    fn fill(&mut self) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if !self.latest_only && !self.lines.is_empty() {
                return Ok(());
            }
            match file.read(&mut chunk) {
                Ok(0) => {
                    if !self.wait_for_writer {
                        self.eof = true;
                        if !self.partial.is_empty() {
                            let rest = std::mem::take(&mut self.partial);
                            self.lines.push_back(String::from_utf8_lossy(&rest).into_owned());
                        }
                    }
                    return Ok(());
                }
                Ok(n) => {
                    self.partial.extend_from_slice(&chunk[..n]);
                    while let Some(nl) = self.partial.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = self.partial.drain(..=nl).collect();
                        self.lines
                            .push_back(String::from_utf8_lossy(&line[..nl]).into_owned());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn next_in_order(&mut self) -> SourcePoll {
        while let Some(line) = self.lines.pop_front() {
            if line.trim().is_empty() {
                continue;
            }
            return match parse_frame(&line) {
                Ok(frame) => SourcePoll::Frame(frame),
                Err(e) => {
                    debug!("landmarks: skipping malformed line: {e}");
                    SourcePoll::Malformed
                }
            };
        }
        self.idle_poll()
    }

    fn newest(&mut self) -> SourcePoll {
        let mut latest = None;
        let mut malformed = 0usize;
        let mut skipped = 0usize;
        for line in self.lines.drain(..) {
            if line.trim().is_empty() {
                continue;
            }
            match parse_frame(&line) {
                Ok(frame) => {
                    if latest.replace(frame).is_some() {
                        skipped += 1;
                    }
                }
                Err(_) => malformed += 1,
            }
        }
        if skipped > 0 {
            trace!("landmarks: dropped {skipped} stale frames");
        }
        match latest {
            Some(frame) => SourcePoll::Frame(frame),
            None if malformed > 0 => {
                debug!("landmarks: skipping {malformed} malformed lines");
                SourcePoll::Malformed
            }
            None => self.idle_poll(),
        }
    }

    fn idle_poll(&self) -> SourcePoll {
        if self.eof {
            SourcePoll::Ended
        } else {
            SourcePoll::Pending
        }
    }
}

fn map_open_error(path: &str, e: io::Error) -> CaptureError {
    match e.kind() {
        io::ErrorKind::NotFound => CaptureError::NoDevice(path.to_string()),
        io::ErrorKind::PermissionDenied => CaptureError::DeviceDenied(path.to_string()),
        _ => CaptureError::TrackingUnavailable(format!("{path}: {e}")),
    }
}

impl LandmarkSource for JsonLinesSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.close();
        let path = self.os_path();
        let meta = path
            .metadata()
            .map_err(|e| map_open_error(&self.path, e))?;
        // opening the read end of a FIFO nonblocking never waits for a writer
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(O_NONBLOCK)
            .open(path)
            .map_err(|e| map_open_error(&self.path, e))?;

        self.wait_for_writer = meta.file_type().is_fifo() && self.path != "-";
        self.file = Some(file);
        info!(
            "landmarks: reading from {}{}",
            if self.path == "-" { "stdin" } else { self.path.as_str() },
            if self.latest_only { " (latest frame only)" } else { "" }
        );
        Ok(())
    }

    fn poll(&mut self) -> SourcePoll {
        if self.file.is_none() {
            return SourcePoll::Ended;
        }
        if let Err(e) = self.fill() {
            warn!("landmarks: read failed on {}: {e}", self.path);
            self.close();
            return SourcePoll::Ended;
        }
        if self.latest_only {
            self.newest()
        } else {
            self.next_in_order()
        }
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("landmarks: closed {}", self.path);
        }
        self.partial.clear();
        self.lines.clear();
        self.eof = false;
    }
}
