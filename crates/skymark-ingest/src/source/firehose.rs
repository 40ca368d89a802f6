//! Live firehose source.
//!
//! Subscribes to `com.atproto.sync.subscribeRepos` over a blocking WebSocket
//! and hands every binary message to the dispatcher as a [`Frame`].
//!
//! # Connection handling
//!
//! - The socket read timeout bounds how long a stop request can go unseen.
//! - A dropped connection is reported through `on_error` and re-established
//!   with exponential backoff, resuming from the cursor last passed to
//!   [`SourceControl::update_cursor`]. The delay only falls back to its
//!   initial value once a connection has delivered a frame.
//! - Failure of the very first connection is fatal.

use super::replay::FrameRecorder;
use super::{FrameSource, SourceControl, SourceStats};
use crate::{Error, Result};
use skymark_core::metrics::increment;
use skymark_core::{Frame, SUBSCRIBE_REPOS_PATH};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Granularity of backoff sleeps, so stop requests are noticed quickly.
const BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Configuration for the firehose source.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Relay base URL (`wss://host`).
    pub url: String,

    /// Socket read timeout; also the stop-request poll interval.
    pub read_timeout: Duration,

    /// First reconnect delay.
    pub initial_backoff: Duration,

    /// Reconnect delay ceiling.
    pub max_backoff: Duration,

    /// Append received frames to this recording.
    pub record: Option<PathBuf>,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            url: crate::config::DEFAULT_FIREHOSE_URL.to_string(),
            read_timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            record: None,
        }
    }
}

/// Why a connection's read loop ended.
enum ReadOutcome {
    /// The control handle was stopped.
    Stopped,
    /// The frame handler returned `Ok(false)`.
    HandlerStopped,
    /// The connection dropped.
    Dropped(Error),
}

/// Reconnect delay that doubles while connections keep failing.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// Delay to wait now. The following one is twice as long, up to `max`.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

/// Live `subscribeRepos` source.
pub struct FirehoseSource {
    config: FirehoseConfig,
    control: SourceControl,
    recorder: Option<FrameRecorder>,
    next_index: u64,
}

impl FirehoseSource {
    /// Create a source, optionally resuming from `start_cursor`.
    pub fn new(config: FirehoseConfig, start_cursor: Option<i64>) -> Result<Self> {
        let recorder = match &config.record {
            Some(path) => {
                tracing::info!("Recording firehose frames to {}", path.display());
                Some(FrameRecorder::append(path)?)
            }
            None => None,
        };

        Ok(Self {
            config,
            control: SourceControl::new(start_cursor),
            recorder,
            next_index: 0,
        })
    }

    fn connect(&self) -> Result<Socket> {
        let url = subscribe_url(&self.config.url, self.control.resume_cursor());
        tracing::info!("Connecting to {}", url);

        let (socket, _response) = tungstenite::connect(url.as_str())?;
        set_read_timeout(&socket, self.config.read_timeout)?;
        Ok(socket)
    }

    fn read_loop<F>(
        &mut self,
        socket: &mut Socket,
        on_frame: &mut F,
        stats: &mut SourceStats,
    ) -> Result<ReadOutcome>
    where
        F: FnMut(Frame) -> Result<bool>,
    {
        while self.control.is_running() {
            let message = match socket.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => return Ok(ReadOutcome::Dropped(e.into())),
            };

            let payload = match message {
                Message::Binary(data) => data.to_vec(),
                Message::Close(close) => {
                    tracing::info!("Firehose closed the connection: {:?}", close);
                    return Ok(ReadOutcome::Dropped(tungstenite::Error::ConnectionClosed.into()));
                }
                Message::Text(text) => {
                    tracing::debug!("Ignoring text message ({} bytes)", text.len());
                    continue;
                }
                _ => continue,
            };

            if let Some(recorder) = self.recorder.as_mut()
                && let Err(e) = recorder.write(&payload)
            {
                tracing::warn!("Disabling frame recording after write failure: {}", e);
                self.recorder = None;
            }

            stats.frames_received += 1;
            stats.bytes_received += payload.len() as u64;
            let frame = Frame::new(self.next_index, payload);
            self.next_index += 1;

            if !on_frame(frame)? {
                return Ok(ReadOutcome::HandlerStopped);
            }
        }

        Ok(ReadOutcome::Stopped)
    }

    /// Sleep for `delay`, waking early if the source is stopped.
    fn backoff_sleep(&self, delay: Duration) {
        tracing::info!("Reconnecting in {:?}", delay);
        let mut remaining = delay;
        while !remaining.is_zero() && self.control.is_running() {
            let step = remaining.min(BACKOFF_STEP);
            std::thread::sleep(step);
            remaining -= step;
        }
    }

    fn finish(&mut self, stats: SourceStats) -> Result<SourceStats> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.flush()?;
            tracing::info!("Recorded {} frames", recorder.frames_written());
        }
        Ok(stats)
    }
}

impl FrameSource for FirehoseSource {
    fn name(&self) -> &'static str {
        "firehose"
    }

    fn control(&self) -> SourceControl {
        self.control.clone()
    }

    fn run<F, E>(&mut self, mut on_frame: F, mut on_error: E) -> Result<SourceStats>
    where
        F: FnMut(Frame) -> Result<bool>,
        E: FnMut(&Error),
    {
        let mut stats = SourceStats::default();
        let mut connected_once = false;
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        while self.control.is_running() {
            let mut socket = match self.connect() {
                Ok(socket) => socket,
                Err(e) if !connected_once => return Err(e),
                Err(e) => {
                    stats.stream_errors += 1;
                    on_error(&e);
                    self.backoff_sleep(backoff.next_delay());
                    continue;
                }
            };

            if connected_once {
                stats.reconnects += 1;
                increment("firehose_reconnects_total", 1);
            }
            connected_once = true;

            let frames_before = stats.frames_received;
            let outcome = self.read_loop(&mut socket, &mut on_frame, &mut stats);
            let _ = socket.close(None);
            let _ = socket.flush();

            // A connection that dropped before delivering anything keeps
            // the delay growing.
            if stats.frames_received > frames_before {
                backoff.reset();
            }

            match outcome? {
                ReadOutcome::Stopped => break,
                ReadOutcome::HandlerStopped => {
                    stats.stopped_by_handler = true;
                    break;
                }
                ReadOutcome::Dropped(e) => {
                    stats.stream_errors += 1;
                    on_error(&e);
                    if self.control.is_running() {
                        self.backoff_sleep(backoff.next_delay());
                    }
                }
            }
        }

        self.finish(stats)
    }
}

/// Build the subscription URL for `base`, resuming after `cursor` if set.
pub fn subscribe_url(base: &str, cursor: Option<i64>) -> String {
    let base = base.trim_end_matches('/');
    match cursor {
        Some(seq) => format!("{base}{SUBSCRIBE_REPOS_PATH}?cursor={seq}"),
        None => format!("{base}{SUBSCRIBE_REPOS_PATH}"),
    }
}

fn set_read_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(timeout))?,
        MaybeTlsStream::Rustls(stream) => stream.get_ref().set_read_timeout(Some(timeout))?,
        _ => tracing::warn!("Unknown stream type; stop requests may be delayed"),
    }
    Ok(())
}
