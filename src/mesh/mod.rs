//! # Mesh Routing Engine
//!
//! BATMAN-lite flood routing over a broadcast link layer. Every node
//! periodically floods an originator message (OGM); hearing an OGM teaches a
//! node which neighbor most recently relayed word of each origin, and that
//! neighbor becomes the best next hop for data addressed to it. Data frames
//! are deduplicated by `(origin, seqno)` and re-broadcast with a decremented
//! TTL until they reach their destination or run out of hops.
//!
//! ## Frame format
//!
//! 16-byte header on every frame:
//!
//! ```text
//! version(1) type(1) flags(1) ttl(1) origin_id(8) seqno(u32 BE)
//! ```
//!
//! OGM body: `prev_hop(8) + link_metric(1)`.
//! DATA body: `dest_id(8) + data_seqno(u32 BE) + payload`, where payload is
//! `nonce(12) + ciphertext` when the ENCRYPTED flag is set, else raw or
//! zlib-compressed application bytes per the COMPRESSED flag.
//!
//! ## Duplicate suppression
//!
//! The `(origin, seqno)` dedup cache is the only duplicate/loop suppression
//! for DATA; there is no separate per-hop "already retransmitted" guard, so
//! dense meshes can still spend redundant airtime within the TTL budget.
//! This is a known simplification inherited from the protocol design.

pub mod crypto;

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use rand::Rng;
use tokio::task::JoinHandle;

use crate::link::{FrameCallback, FrameError, LinkMetrics, LinkTransport};
use crypto::{CryptoError, PayloadCipher, NONCE_LEN};

pub const MESH_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_ENCRYPTED: u8 = 0x02;

/// Sweep cadence for the expiry loop.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(250);
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 8-byte node identifier: ASCII callsign right-padded with zero bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 8]);

impl NodeId {
    pub fn from_callsign(callsign: &str) -> Self {
        let mut id = [0u8; 8];
        for (slot, byte) in id.iter_mut().zip(callsign.bytes().filter(u8::is_ascii)) {
            *slot = byte;
        }
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Read a node id from the head of a buffer.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = slice.get(..8)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 || !hex.is_ascii() {
            return None;
        }
        let mut id = [0u8; 8];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            id[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(id))
    }
}

impl fmt::Display for NodeId {
    /// Trimmed callsign form, falling back to hex for non-printable ids.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trimmed: Vec<u8> = self.0.iter().copied().take_while(|&b| b != 0).collect();
        match std::str::from_utf8(&trimmed) {
            Ok(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_graphic()) => {
                f.write_str(s)
            }
            _ => f.write_str(&self.to_hex()),
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// Mesh frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Ogm,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Ogm => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Ogm),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("malformed {0} body")]
    MalformedBody(&'static str),

    #[error("payload decompression failed")]
    Decompress,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("mesh node is not running")]
    NotRunning,
}

impl MeshError {
    fn into_frame_error(self) -> FrameError {
        FrameError::Malformed(self.to_string())
    }
}

/// Parsed 16-byte mesh header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: u8,
    pub ttl: u8,
    pub origin: NodeId,
    pub seqno: u32,
}

impl MeshHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.version;
        header[1] = self.frame_type.as_u8();
        header[2] = self.flags;
        header[3] = self.ttl;
        header[4..12].copy_from_slice(self.origin.as_bytes());
        header[12..16].copy_from_slice(&self.seqno.to_be_bytes());
        header
    }

    /// Split a raw frame into header and body.
    ///
    /// Unknown version/type are reported as `Ok(None)` so the caller can
    /// count and drop them silently (they are not malformed, just foreign).
    pub fn decode(frame: &[u8]) -> Result<Option<(MeshHeader, &[u8])>, MeshError> {
        if frame.len() < HEADER_LEN {
            return Err(MeshError::Truncated(frame.len()));
        }
        let version = frame[0];
        if version != MESH_VERSION {
            return Ok(None);
        }
        let Some(frame_type) = FrameType::from_u8(frame[1]) else {
            return Ok(None);
        };
        let origin = NodeId::from_slice(&frame[4..12]).ok_or(MeshError::Truncated(frame.len()))?;
        let header = MeshHeader {
            version,
            frame_type,
            flags: frame[2],
            ttl: frame[3],
            origin,
            seqno: u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]),
        };
        Ok(Some((header, &frame[HEADER_LEN..])))
    }
}

/// Routing and sweep behavior.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub ogm_interval: Duration,
    pub ogm_ttl: u8,
    pub route_expiry: Duration,
    pub neighbor_expiry: Duration,
    pub dedup_expiry: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ogm_interval: Duration::from_secs(600),
            ogm_ttl: 5,
            route_expiry: Duration::from_secs(120),
            neighbor_expiry: Duration::from_secs(60),
            dedup_expiry: Duration::from_secs(30),
        }
    }
}

/// One known destination: refreshed only by strictly newer OGM seqnos so a
/// delayed copy of an old advertisement can never flap an established route.
#[derive(Debug, Clone)]
pub struct OriginatorEntry {
    pub best_next_hop: NodeId,
    pub last_seqno: u32,
    pub metric: u8,
    pub last_seen: Instant,
}

/// One directly-heard node.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    pub last_seen: Instant,
    pub link_metric: u8,
}

/// Routing-table row for status surfaces.
#[derive(Debug, Clone)]
pub struct KnownNode {
    pub node: NodeId,
    pub next_hop: NodeId,
    pub metric: u8,
    pub age_secs: f64,
}

/// Delivery callback: `(origin_id, dest_id, data_seqno, app_bytes)`.
pub type DeliveryFn = Arc<dyn Fn(NodeId, NodeId, u32, Vec<u8>) + Send + Sync>;

#[derive(Default)]
struct NodeCounters {
    rx_ogm: AtomicU64,
    rx_data: AtomicU64,
    dup_dropped: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    foreign_dropped: AtomicU64,
    decode_failures: AtomicU64,
    tx_data: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub rx_ogm: u64,
    pub rx_data: u64,
    pub dup_dropped: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub foreign_dropped: u64,
    pub decode_failures: u64,
    pub tx_data: u64,
}

/// Full mesh node: identity, routing state, dedup cache, and the background
/// OGM/sweep workers, on top of one [`LinkTransport`].
pub struct MeshNode {
    node_id: NodeId,
    cfg: RoutingConfig,
    link: Arc<dyn LinkTransport>,
    cipher: PayloadCipher,
    delivery: DeliveryFn,
    // Handle back to our own Arc, for spawning workers from &self.
    self_ref: Weak<MeshNode>,

    originators: Mutex<HashMap<NodeId, OriginatorEntry>>,
    neighbors: Mutex<HashMap<NodeId, NeighborEntry>>,
    data_seen: Mutex<HashMap<(NodeId, u32), Instant>>,

    seqno: AtomicU32,
    running: AtomicBool,
    counters: NodeCounters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build a node around a link produced by `link_factory`, which receives
    /// the frame callback wired back into this node.
    pub fn new(
        callsign: &str,
        cfg: RoutingConfig,
        cipher: PayloadCipher,
        link_factory: impl FnOnce(FrameCallback) -> Arc<dyn LinkTransport>,
        delivery: DeliveryFn,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MeshNode>| {
            let rx_node = weak.clone();
            let callback: FrameCallback = Arc::new(move |frame: &[u8]| {
                match rx_node.upgrade() {
                    Some(node) => node
                        .handle_frame(frame)
                        .map_err(MeshError::into_frame_error),
                    None => Ok(()),
                }
            });
            let link = link_factory(callback);
            MeshNode {
                node_id: NodeId::from_callsign(callsign),
                cfg,
                link,
                cipher,
                delivery,
                self_ref: weak.clone(),
                originators: Mutex::new(HashMap::new()),
                neighbors: Mutex::new(HashMap::new()),
                data_seen: Mutex::new(HashMap::new()),
                seqno: AtomicU32::new(0),
                running: AtomicBool::new(false),
                counters: NodeCounters::default(),
                tasks: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the link plus the OGM and sweep workers.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("mesh node {} already running", self.node_id);
            return;
        }
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        info!("mesh node {} starting", self.node_id);
        self.link.start();

        let ogm = tokio::spawn(me.clone().ogm_loop());
        let sweep = tokio::spawn(me.sweep_loop());
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(ogm);
        tasks.push(sweep);
    }

    /// Stop workers and the link. Joins are bounded; a wedged worker is
    /// abandoned after the timeout.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.link.stop();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("mesh node {}: worker did not stop in time", self.node_id);
            }
        }
        info!("mesh node {} stopped", self.node_id);
    }

    /// Send application bytes to a destination. Returns the data seqno
    /// assigned to the frame.
    pub fn send_application_data(
        &self,
        dest: NodeId,
        payload: &[u8],
    ) -> Result<u32, MeshError> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }
        let seqno = self.next_seqno();
        let frame = self.build_data_frame(dest, seqno, payload)?;
        self.link.send(&frame);
        self.counters.tx_data.fetch_add(1, Ordering::Relaxed);
        Ok(seqno)
    }

    /// Routing table snapshot ordered by freshness.
    pub fn known_nodes(&self) -> Vec<KnownNode> {
        let now = Instant::now();
        let mut nodes: Vec<KnownNode> = {
            let originators = self.originators.lock().unwrap_or_else(|p| p.into_inner());
            originators
                .iter()
                .map(|(node, entry)| KnownNode {
                    node: *node,
                    next_hop: entry.best_next_hop,
                    metric: entry.metric,
                    age_secs: now.duration_since(entry.last_seen).as_secs_f64(),
                })
                .collect()
        };
        nodes.sort_by(|a, b| a.age_secs.total_cmp(&b.age_secs));
        nodes
    }

    /// Seconds since this origin was last heard from, if it is known at all.
    pub fn peer_age_secs(&self, node: NodeId) -> Option<f64> {
        let originators = self.originators.lock().unwrap_or_else(|p| p.into_inner());
        originators
            .get(&node)
            .map(|entry| entry.last_seen.elapsed().as_secs_f64())
    }

    /// Seconds since any frame arrived over the link layer, if one ever has.
    pub fn last_rx_age_secs(&self) -> Option<f64> {
        let metrics = self.link.metrics();
        if metrics.last_rx_ts == 0.0 {
            return None;
        }
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        Some((now - metrics.last_rx_ts).max(0.0))
    }

    pub fn link_metrics(&self) -> LinkMetrics {
        self.link.metrics()
    }

    pub fn stats(&self) -> NodeStats {
        let c = &self.counters;
        NodeStats {
            rx_ogm: c.rx_ogm.load(Ordering::Relaxed),
            rx_data: c.rx_data.load(Ordering::Relaxed),
            dup_dropped: c.dup_dropped.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            foreign_dropped: c.foreign_dropped.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            tx_data: c.tx_data.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Frame handling
    // ------------------------------------------------------------------

    /// Process one raw inbound frame from any link.
    pub fn handle_frame(&self, frame: &[u8]) -> Result<(), MeshError> {
        let Some((header, body)) = MeshHeader::decode(frame)? else {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        // Our own flooded frames come back around; never process them.
        if header.origin == self.node_id {
            return Ok(());
        }

        match header.frame_type {
            FrameType::Ogm => {
                if body.len() < 9 {
                    return Err(MeshError::MalformedBody("OGM"));
                }
                let prev_hop =
                    NodeId::from_slice(body).ok_or(MeshError::MalformedBody("OGM"))?;
                self.counters.rx_ogm.fetch_add(1, Ordering::Relaxed);
                self.handle_ogm(&header, prev_hop, body[8]);
                Ok(())
            }
            FrameType::Data => {
                self.counters.rx_data.fetch_add(1, Ordering::Relaxed);
                self.handle_data(&header, body)
            }
        }
    }

    fn handle_ogm(&self, header: &MeshHeader, prev_hop: NodeId, link_metric: u8) {
        let now = Instant::now();

        {
            let mut neighbors = self.neighbors.lock().unwrap_or_else(|p| p.into_inner());
            let entry = neighbors.entry(prev_hop).or_insert(NeighborEntry {
                last_seen: now,
                link_metric,
            });
            entry.last_seen = now;
            entry.link_metric = link_metric;
        }

        {
            let mut originators = self.originators.lock().unwrap_or_else(|p| p.into_inner());
            match originators.get_mut(&header.origin) {
                None => {
                    originators.insert(
                        header.origin,
                        OriginatorEntry {
                            best_next_hop: prev_hop,
                            last_seqno: header.seqno,
                            metric: link_metric,
                            last_seen: now,
                        },
                    );
                    debug!(
                        "learned route to {} via {} (seq {})",
                        header.origin, prev_hop, header.seqno
                    );
                }
                Some(entry) => {
                    // Strictly greater only: equal or older seqnos are
                    // stale copies of an advertisement we already applied.
                    if header.seqno > entry.last_seqno {
                        entry.best_next_hop = prev_hop;
                        entry.last_seqno = header.seqno;
                        entry.metric = link_metric;
                        entry.last_seen = now;
                    }
                }
            }
        }

        if header.ttl > 1 {
            let fwd = MeshHeader {
                ttl: header.ttl - 1,
                ..*header
            };
            let mut frame = fwd.encode().to_vec();
            frame.extend_from_slice(self.node_id.as_bytes());
            frame.push(link_metric);
            self.link.send(&frame);
        }
    }

    fn handle_data(&self, header: &MeshHeader, body: &[u8]) -> Result<(), MeshError> {
        // Dedup before anything else: flooding hands us the same frame once
        // per neighbor, and each copy must be processed at most once.
        {
            let mut seen = self.data_seen.lock().unwrap_or_else(|p| p.into_inner());
            let key = (header.origin, header.seqno);
            if seen.contains_key(&key) {
                self.counters.dup_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            seen.insert(key, Instant::now());
        }

        if body.len() < 12 {
            return Err(MeshError::MalformedBody("DATA"));
        }
        let dest = NodeId::from_slice(body).ok_or(MeshError::MalformedBody("DATA"))?;
        let data_seqno = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
        let remainder = &body[12..];

        if dest == self.node_id {
            let app_bytes = self.open_payload(header, dest, data_seqno, remainder)?;
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            (self.delivery)(header.origin, dest, data_seqno, app_bytes);
            return Ok(());
        }

        if header.ttl <= 1 {
            return Ok(());
        }

        let next_hop = {
            let originators = self.originators.lock().unwrap_or_else(|p| p.into_inner());
            originators.get(&dest).map(|entry| entry.best_next_hop)
        };
        if next_hop.is_none() {
            self.counters.foreign_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("no route to {}, dropping DATA from {}", dest, header.origin);
            return Ok(());
        }

        // The medium is broadcast: forwarding is re-transmission of the
        // frame unchanged except for the decremented TTL.
        let fwd = MeshHeader {
            ttl: header.ttl - 1,
            ..*header
        };
        let mut frame = fwd.encode().to_vec();
        frame.extend_from_slice(body);
        self.link.send(&frame);
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unseal an inbound payload addressed to us: decrypt (if flagged), then
    /// decompress (if flagged).
    fn open_payload(
        &self,
        header: &MeshHeader,
        dest: NodeId,
        data_seqno: u32,
        remainder: &[u8],
    ) -> Result<Vec<u8>, MeshError> {
        let mut app_bytes: Vec<u8>;
        if header.flags & FLAG_ENCRYPTED != 0 {
            if remainder.len() < NONCE_LEN + 1 {
                return Err(MeshError::MalformedBody("DATA"));
            }
            let aad = associated_data(header.origin, dest, data_seqno);
            app_bytes =
                self.cipher
                    .decrypt(&remainder[..NONCE_LEN], &remainder[NONCE_LEN..], &aad)?;
        } else {
            app_bytes = remainder.to_vec();
        }
        if header.flags & FLAG_COMPRESSED != 0 {
            app_bytes = zlib_decompress(&app_bytes).map_err(|_| MeshError::Decompress)?;
        }
        Ok(app_bytes)
    }

    fn build_data_frame(
        &self,
        dest: NodeId,
        data_seqno: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, MeshError> {
        let mut flags = 0u8;

        // Compression only pays when it actually shrinks the payload.
        let compressed = zlib_compress(payload);
        let to_send: Vec<u8> = match compressed {
            Some(smaller) if smaller.len() < payload.len() => {
                flags |= FLAG_COMPRESSED;
                smaller
            }
            _ => payload.to_vec(),
        };

        let mut body = Vec::with_capacity(12 + to_send.len() + NONCE_LEN);
        body.extend_from_slice(dest.as_bytes());
        body.extend_from_slice(&data_seqno.to_be_bytes());

        if self.cipher.enabled() {
            let aad = associated_data(self.node_id, dest, data_seqno);
            let (nonce, ciphertext) = self.cipher.encrypt(&to_send, &aad)?;
            flags |= FLAG_ENCRYPTED;
            body.extend_from_slice(&nonce);
            body.extend_from_slice(&ciphertext);
        } else {
            body.extend_from_slice(&to_send);
        }

        let header = MeshHeader {
            version: MESH_VERSION,
            frame_type: FrameType::Data,
            flags,
            ttl: self.cfg.ogm_ttl,
            origin: self.node_id,
            seqno: data_seqno,
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn build_ogm_frame(&self) -> Vec<u8> {
        let header = MeshHeader {
            version: MESH_VERSION,
            frame_type: FrameType::Ogm,
            flags: 0,
            ttl: self.cfg.ogm_ttl,
            origin: self.node_id,
            seqno: self.next_seqno(),
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(self.node_id.as_bytes());
        frame.push(255); // own link metric is perfect by definition
        frame
    }

    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    // ------------------------------------------------------------------
    // Background workers
    // ------------------------------------------------------------------

    async fn ogm_loop(self: Arc<Self>) {
        while self.is_running() {
            self.link.send(&self.build_ogm_frame());

            // ±5% jitter so co-channel nodes do not key up in lockstep.
            let interval = self.cfg.ogm_interval.as_secs_f64();
            let jitter = interval * 0.05;
            let mut sleep_secs = interval + rand::thread_rng().gen_range(-jitter..=jitter);
            if sleep_secs < 1.0 {
                sleep_secs = 1.0;
            }
            self.sleep_observing(Duration::from_secs_f64(sleep_secs)).await;
        }
        debug!("ogm loop for {} terminated", self.node_id);
    }

    async fn sweep_loop(self: Arc<Self>) {
        while self.is_running() {
            self.sleep_observing(SWEEP_INTERVAL).await;
            if !self.is_running() {
                break;
            }
            let now = Instant::now();
            {
                let mut originators =
                    self.originators.lock().unwrap_or_else(|p| p.into_inner());
                originators
                    .retain(|_, e| now.duration_since(e.last_seen) <= self.cfg.route_expiry);
            }
            {
                let mut neighbors = self.neighbors.lock().unwrap_or_else(|p| p.into_inner());
                neighbors
                    .retain(|_, e| now.duration_since(e.last_seen) <= self.cfg.neighbor_expiry);
            }
            {
                let mut seen = self.data_seen.lock().unwrap_or_else(|p| p.into_inner());
                seen.retain(|_, ts| now.duration_since(*ts) <= self.cfg.dedup_expiry);
            }
        }
        debug!("sweep loop for {} terminated", self.node_id);
    }

    async fn sleep_observing(&self, total: Duration) {
        let mut remaining = total;
        while self.is_running() && !remaining.is_zero() {
            let step = remaining.min(STOP_POLL);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

fn associated_data(origin: NodeId, dest: NodeId, data_seqno: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(20);
    aad.extend_from_slice(origin.as_bytes());
    aad.extend_from_slice(dest.as_bytes());
    aad.extend_from_slice(&data_seqno.to_be_bytes());
    aad
}

fn zlib_compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

fn zlib_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_from_callsign_pads_with_zeros() {
        let id = NodeId::from_callsign("X");
        assert_eq!(id.as_bytes(), b"X\0\0\0\0\0\0\0");
        assert_eq!(id.to_string(), "X");
    }

    #[test]
    fn node_id_truncates_long_callsigns() {
        let id = NodeId::from_callsign("VERYLONGCALL");
        assert_eq!(id.as_bytes(), b"VERYLONG");
    }

    #[test]
    fn node_id_hex_round_trip() {
        let id = NodeId::from_callsign("K1ABC");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 16);
        assert_eq!(NodeId::from_hex(&hex), Some(id));
        assert_eq!(NodeId::from_hex("zz"), None);
    }

    #[test]
    fn header_round_trip() {
        let header = MeshHeader {
            version: MESH_VERSION,
            frame_type: FrameType::Data,
            flags: FLAG_COMPRESSED,
            ttl: 5,
            origin: NodeId::from_callsign("N0CALL"),
            seqno: 0xDEADBEEF,
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(b"body");
        let (decoded, body) = MeshHeader::decode(&frame).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"body");
    }

    #[test]
    fn header_rejects_short_frames() {
        assert!(matches!(
            MeshHeader::decode(&[1, 0, 0]),
            Err(MeshError::Truncated(3))
        ));
    }

    #[test]
    fn header_skips_unknown_version_and_type() {
        let mut frame = [0u8; HEADER_LEN];
        frame[0] = 99;
        assert!(MeshHeader::decode(&frame).unwrap().is_none());
        frame[0] = MESH_VERSION;
        frame[1] = 7;
        assert!(MeshHeader::decode(&frame).unwrap().is_none());
    }

    #[test]
    fn zlib_round_trip() {
        let text = b"the same phrase over and over, the same phrase over and over";
        let packed = zlib_compress(text).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(zlib_decompress(&packed).unwrap(), text);
        assert!(zlib_decompress(b"\x01\x02not zlib").is_err());
    }

    struct NullLink;

    impl LinkTransport for NullLink {
        fn start(&self) {}
        fn stop(&self) {}
        fn send(&self, _frame: &[u8]) {}
        fn metrics(&self) -> LinkMetrics {
            LinkMetrics::default()
        }
    }

    fn quiet_node(callsign: &str, cipher: PayloadCipher) -> (Arc<MeshNode>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let delivered: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let node = MeshNode::new(
            callsign,
            RoutingConfig::default(),
            cipher,
            |_rx| Arc::new(NullLink) as Arc<dyn LinkTransport>,
            Arc::new(move |_origin, _dest, _seqno, payload| {
                sink.lock().unwrap().push(payload);
            }),
        );
        (node, delivered)
    }

    #[test]
    fn compression_flag_set_only_when_smaller() {
        let (node, _) = quiet_node("A", PayloadCipher::disabled());
        let dest = NodeId::from_callsign("B");

        let repetitive = vec![b'x'; 400];
        let frame = node.build_data_frame(dest, 1, &repetitive).unwrap();
        let (header, body) = MeshHeader::decode(&frame).unwrap().unwrap();
        assert_ne!(header.flags & FLAG_COMPRESSED, 0);
        assert!(body.len() - 12 < repetitive.len());

        // Tiny payloads grow under zlib and must stay raw.
        let tiny = b"hi";
        let frame = node.build_data_frame(dest, 2, tiny).unwrap();
        let (header, body) = MeshHeader::decode(&frame).unwrap().unwrap();
        assert_eq!(header.flags & FLAG_COMPRESSED, 0);
        assert_eq!(&body[12..], tiny);
    }

    #[test]
    fn encrypted_frame_round_trips_between_keyed_nodes() {
        let key = [9u8; 32];
        let (sender, _) = quiet_node("A", PayloadCipher::new(&key).unwrap());
        let (receiver, delivered) = quiet_node("B", PayloadCipher::new(&key).unwrap());

        let payload = b"sealed and signed, the net meets at nine";
        let frame = sender
            .build_data_frame(receiver.node_id(), 1, payload)
            .unwrap();
        let (header, _) = MeshHeader::decode(&frame).unwrap().unwrap();
        assert_ne!(header.flags & FLAG_ENCRYPTED, 0);

        receiver.handle_frame(&frame).unwrap();
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], payload);
    }

    #[test]
    fn wrong_key_drops_encrypted_frame() {
        let (sender, _) = quiet_node("A", PayloadCipher::new(&[1u8; 32]).unwrap());
        let (receiver, delivered) = quiet_node("B", PayloadCipher::new(&[2u8; 32]).unwrap());

        let frame = sender
            .build_data_frame(receiver.node_id(), 1, b"secret")
            .unwrap();
        assert!(receiver.handle_frame(&frame).is_err());
        assert!(delivered.lock().unwrap().is_empty());
    }
}
