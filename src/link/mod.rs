//! # Link Layer Module
//!
//! Byte-stream transports that carry raw mesh frames. A link client owns a
//! connection to either a radio modem's TCP data port ([`modem::ModemLink`])
//! or a remote qmesh peer over authenticated TCP ([`tcp::TcpMeshLink`]), and
//! any number of links can be fanned out behind one
//! [`multiplex::MultiplexLink`].
//!
//! ## Framing
//!
//! Every frame on the stream is encoded as a 2-byte big-endian length prefix
//! followed by the raw mesh payload (header at byte 0, no AX.25/KISS):
//!
//! ```text
//! [len_hi][len_lo] + <mesh frame bytes>
//! ```
//!
//! The maximum frame size is 65,535 bytes. Partial frames are buffered until
//! the remainder arrives; the buffer is cleared on every reconnect.
//!
//! ## Failure model
//!
//! The registered receive callback classifies its own failures through
//! [`FrameError`]: a [`FrameError::Malformed`] result is an expected
//! decode/validation failure and drops only that frame, while
//! [`FrameError::Fatal`] marks a consumer programming defect and stops the
//! owning link instead of letting a tight failure loop burn airtime.

pub mod modem;
pub mod multiplex;
pub mod tcp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::warn;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Maximum payload carried by one length-prefixed frame.
pub const MAX_FRAME_LEN: usize = 0xFFFF;

/// Interval at which link workers re-check the shutdown flag while idle.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Link-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("handshake rejected: {0}")]
    Auth(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of the receive callback for one frame.
///
/// `Malformed` is the "expected" class (bad header, undecodable payload):
/// the frame is dropped and the link keeps running. `Fatal` is anything the
/// consumer considers a programming defect; the link stops defensively.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("consumer failure: {0}")]
    Fatal(String),
}

/// Callback invoked once per fully reassembled inbound frame.
pub type FrameCallback = Arc<dyn Fn(&[u8]) -> Result<(), FrameError> + Send + Sync>;

/// One stable metrics value shared by every link variant.
///
/// Timestamps are unix seconds; zero means "never".
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkMetrics {
    pub name: String,
    pub link_type: String,
    pub running: bool,
    pub connected: bool,

    pub started_ts: f64,
    pub last_connect_ts: f64,
    pub last_disconnect_ts: f64,
    pub last_rx_ts: f64,
    pub last_tx_ts: f64,

    pub rx_frames: u64,
    pub tx_frames: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,

    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub disconnects: u64,
    pub tx_dropped: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub last_error: String,

    /// Per-child metrics when this is a composite link.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<LinkMetrics>,
}

/// Common transport contract implemented by single links and the multiplexer.
///
/// `start` spawns the link workers (must be called on a Tokio runtime),
/// `stop` raises the shutdown flag (workers observe it within
/// [`POLL_INTERVAL`]), and `send` queues one frame best-effort: a full
/// transmit queue drops the frame rather than stalling the caller.
pub trait LinkTransport: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn send(&self, frame: &[u8]);
    fn metrics(&self) -> LinkMetrics;
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Incremental length-prefix framer.
///
/// Fed arbitrary chunks off the stream; yields whole frames when available.
/// A zero declared length is skipped (keeps the stream aligned without
/// manufacturing empty frames).
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < 2 {
                return None;
            }
            let frame_len = ((self.buf[0] as usize) << 8) | self.buf[1] as usize;
            if frame_len == 0 {
                self.buf.advance(2);
                continue;
            }
            if self.buf.len() < 2 + frame_len {
                return None;
            }
            self.buf.advance(2);
            return Some(self.buf.split_to(frame_len).to_vec());
        }
    }

    /// Discard any partially buffered frame (used when a connection is
    /// replaced and stream alignment restarts from zero).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encode one frame for the wire. Returns `None` when the payload exceeds
/// the 16-bit length prefix.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return None;
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

/// State shared between a link's public handle and its worker tasks.
pub(crate) struct LinkCore {
    pub name: String,
    running: AtomicBool,
    connected: AtomicBool,
    metrics: Mutex<LinkMetrics>,
    pub rx_callback: FrameCallback,
    pub tx: mpsc::Sender<Vec<u8>>,
}

impl LinkCore {
    pub fn new(
        name: &str,
        link_type: &str,
        rx_callback: FrameCallback,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            metrics: Mutex::new(LinkMetrics {
                name: name.to_string(),
                link_type: link_type.to_string(),
                ..LinkMetrics::default()
            }),
            rx_callback,
            tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, value: bool) -> bool {
        let prev = self.running.swap(value, Ordering::SeqCst);
        if value && !prev {
            self.with_metrics(|m| m.started_ts = unix_now());
        }
        prev
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn note_connect_attempt(&self) {
        self.with_metrics(|m| m.connect_attempts += 1);
    }

    pub fn note_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.with_metrics(|m| {
            m.last_connect_ts = unix_now();
            m.connect_successes += 1;
            m.last_error.clear();
        });
    }

    pub fn note_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.with_metrics(|m| {
                m.last_disconnect_ts = unix_now();
                m.disconnects += 1;
            });
        }
    }

    pub fn note_rx_frame(&self, len: usize) {
        self.with_metrics(|m| {
            m.rx_frames += 1;
            m.rx_bytes += len as u64;
            m.last_rx_ts = unix_now();
        });
    }

    pub fn note_tx_frame(&self, len: usize) {
        self.with_metrics(|m| {
            m.tx_frames += 1;
            m.tx_bytes += len as u64;
            m.last_tx_ts = unix_now();
        });
    }

    pub fn note_tx_dropped(&self) {
        self.with_metrics(|m| m.tx_dropped += 1);
    }

    pub fn note_error(&self, kind: &str, rx: bool) {
        self.with_metrics(|m| {
            if rx {
                m.rx_errors += 1;
            } else {
                m.tx_errors += 1;
            }
            m.last_error = kind.to_string();
        });
    }

    pub fn set_last_error(&self, kind: &str) {
        self.with_metrics(|m| m.last_error = kind.to_string());
    }

    pub fn snapshot(&self) -> LinkMetrics {
        let mut snap = self
            .metrics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        snap.running = self.is_running();
        snap.connected = self.is_connected();
        snap
    }

    fn with_metrics(&self, f: impl FnOnce(&mut LinkMetrics)) {
        let mut guard = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }
}

/// Why [`pump_stream`] returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// Shutdown flag observed or transmit queue closed.
    Stopped,
    /// Connection lost; caller should reconnect (or re-accept).
    Disconnected,
    /// The consumer callback reported a programming defect; stop the link.
    Fatal,
}

/// Drive one established connection: reassemble inbound frames and deliver
/// them to the callback, drain the transmit queue onto the wire, observe the
/// shutdown flag at short poll intervals.
///
/// The frame buffer is created fresh here, so any partial frame from a
/// previous connection is discarded.
pub(crate) async fn pump_stream(
    core: &LinkCore,
    stream: TcpStream,
    txq: &mut mpsc::Receiver<Vec<u8>>,
) -> PumpExit {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; 4096];

    loop {
        if !core.is_running() {
            return PumpExit::Stopped;
        }
        tokio::select! {
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        warn!("{}: connection closed by peer", core.name);
                        return PumpExit::Disconnected;
                    }
                    Ok(n) => {
                        frames.push(&chunk[..n]);
                        while let Some(frame) = frames.next_frame() {
                            core.note_rx_frame(frame.len());
                            match (core.rx_callback)(&frame) {
                                Ok(()) => {}
                                Err(FrameError::Malformed(reason)) => {
                                    core.note_error("rx_callback_error", true);
                                    warn!(
                                        "{}: frame dropped by consumer: {}",
                                        core.name, reason
                                    );
                                }
                                Err(FrameError::Fatal(reason)) => {
                                    core.note_error("rx_callback_crash", true);
                                    log::error!(
                                        "{}: consumer defect, stopping link: {}",
                                        core.name, reason
                                    );
                                    return PumpExit::Fatal;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!("{}: read failed: {}", core.name, err);
                        core.note_error("rx_error", true);
                        return PumpExit::Disconnected;
                    }
                }
            }
            queued = txq.recv() => {
                let Some(payload) = queued else {
                    return PumpExit::Stopped;
                };
                let Some(wire) = encode_frame(&payload) else {
                    warn!(
                        "{}: payload exceeds 16-bit frame length, dropped",
                        core.name
                    );
                    core.note_tx_dropped();
                    continue;
                };
                if let Err(err) = writer.write_all(&wire).await {
                    warn!("{}: write failed: {}", core.name, err);
                    core.note_error("tx_error", false);
                    return PumpExit::Disconnected;
                }
                core.note_tx_frame(payload.len());
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Sleep for `total`, waking early if the link's shutdown flag is raised.
/// Backoff delays can reach a minute; a stop request must not wait them out.
pub(crate) async fn sleep_while_running(core: &LinkCore, total: Duration) {
    let mut remaining = total;
    while core.is_running() && !remaining.is_zero() {
        let step = remaining.min(POLL_INTERVAL);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

/// Queue a frame on a link core, best-effort. Empty payloads are ignored
/// (the wire framing cannot carry them meaningfully); a full queue drops the
/// frame so the forwarding hot path never blocks.
pub(crate) fn queue_send(core: &LinkCore, frame: &[u8]) {
    if !core.is_running() {
        return;
    }
    if frame.is_empty() {
        return;
    }
    if core.tx.try_send(frame.to_vec()).is_err() {
        core.note_tx_dropped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_round_trip() {
        let mut fb = FrameBuffer::new();
        let frame = b"hello mesh".to_vec();
        fb.push(&encode_frame(&frame).unwrap());
        assert_eq!(fb.next_frame(), Some(frame));
        assert_eq!(fb.next_frame(), None);
    }

    #[test]
    fn framer_holds_partial_frames() {
        let mut fb = FrameBuffer::new();
        let wire = encode_frame(b"split across reads").unwrap();
        fb.push(&wire[..5]);
        assert_eq!(fb.next_frame(), None);
        fb.push(&wire[5..]);
        assert_eq!(fb.next_frame(), Some(b"split across reads".to_vec()));
    }

    #[test]
    fn framer_extracts_back_to_back_frames() {
        let mut fb = FrameBuffer::new();
        let mut wire = encode_frame(b"one").unwrap();
        wire.extend_from_slice(&encode_frame(b"two").unwrap());
        fb.push(&wire);
        assert_eq!(fb.next_frame(), Some(b"one".to_vec()));
        assert_eq!(fb.next_frame(), Some(b"two".to_vec()));
        assert_eq!(fb.next_frame(), None);
    }

    #[test]
    fn framer_skips_zero_length_prefix() {
        let mut fb = FrameBuffer::new();
        fb.push(&[0, 0]);
        fb.push(&encode_frame(b"after").unwrap());
        assert_eq!(fb.next_frame(), Some(b"after".to_vec()));
    }

    #[test]
    fn clear_discards_partial_frame() {
        let mut fb = FrameBuffer::new();
        let wire = encode_frame(b"interrupted").unwrap();
        fb.push(&wire[..4]);
        fb.clear();
        fb.push(&encode_frame(b"fresh").unwrap());
        assert_eq!(fb.next_frame(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let big = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(encode_frame(&big).is_none());
        let max = vec![7u8; MAX_FRAME_LEN];
        let mut fb = FrameBuffer::new();
        fb.push(&encode_frame(&max).unwrap());
        assert_eq!(fb.next_frame().map(|f| f.len()), Some(MAX_FRAME_LEN));
    }
}
