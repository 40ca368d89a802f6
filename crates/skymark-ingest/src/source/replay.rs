//! Frame recordings.
//!
//! Recorded frames use a simple length-prefixed format:
//!
//! ```text
//! [u32 little-endian length][raw frame payload]
//! [u32 little-endian length][raw frame payload]
//! ...
//! ```
//!
//! [`FrameRecorder`] writes it from a live firehose; [`ReplaySource`] feeds a
//! recording back through the pipeline.

use super::{FrameSource, SourceControl, SourceStats};
use crate::{Error, Result};
use skymark_core::Frame;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

/// Upper bound on a single recorded frame. Larger prefixes mean corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Appends raw frames to a recording.
pub struct FrameRecorder {
    writer: BufWriter<File>,
    frames_written: u64,
}

impl FrameRecorder {
    /// Open `path` for appending, creating it if needed.
    pub fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            frames_written: 0,
        })
    }

    /// Write one frame payload.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("frame too large to record: {} bytes", payload.len()),
            )
        })?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flush buffered frames to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

/// Replays a frame recording.
pub struct ReplaySource<R> {
    reader: R,
    control: SourceControl,
}

impl ReplaySource<BufReader<File>> {
    /// Open a recording file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ReplaySource<R> {
    /// Replay frames from any reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            control: SourceControl::new(None),
        }
    }

    /// Read the next frame payload. `Ok(None)` at a clean end of file.
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        // End of file is only clean on a frame boundary.
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.reader.read_exact(&mut len_bytes[1..]).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                std::io::Error::new(ErrorKind::UnexpectedEof, "recording ends inside a length prefix")
            } else {
                e
            }
        })?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("recorded frame length {len} exceeds limit"),
            )));
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(Some(payload))
    }
}

impl<R: Read> FrameSource for ReplaySource<R> {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn control(&self) -> SourceControl {
        self.control.clone()
    }

    fn run<F, E>(&mut self, mut on_frame: F, _on_error: E) -> Result<SourceStats>
    where
        F: FnMut(Frame) -> Result<bool>,
        E: FnMut(&Error),
    {
        let mut stats = SourceStats::default();

        while self.control.is_running() {
            let Some(payload) = self.next_payload()? else {
                tracing::info!("Replay finished after {} frames", stats.frames_received);
                break;
            };

            stats.bytes_received += payload.len() as u64;
            let frame = Frame::new(stats.frames_received, payload);
            stats.frames_received += 1;

            if !on_frame(frame)? {
                stats.stopped_by_handler = true;
                break;
            }
        }

        Ok(stats)
    }
}
