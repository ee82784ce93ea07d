//! Test utilities & fixtures.
//!
//! `TestLink` is a capture-only transport: frames a node sends land in a
//! shared buffer instead of a socket, and inbound frames are driven through
//! `MeshNode::handle_frame` directly, so routing tests control topology and
//! timing exactly.

use std::sync::{Arc, Mutex};

use qmesh::link::{LinkMetrics, LinkTransport};
use qmesh::mesh::crypto::PayloadCipher;
use qmesh::mesh::{
    DeliveryFn, FrameType, MeshHeader, MeshNode, NodeId, RoutingConfig, MESH_VERSION,
};

/// Frames captured from one node's transmit side.
pub type Capture = Arc<Mutex<Vec<Vec<u8>>>>;

/// `(origin, data_seqno, payload)` triples delivered to the application.
pub type Delivered = Arc<Mutex<Vec<(NodeId, u32, Vec<u8>)>>>;

pub struct TestLink {
    sent: Capture,
}

impl LinkTransport for TestLink {
    fn start(&self) {}
    fn stop(&self) {}
    fn send(&self, frame: &[u8]) {
        self.sent.lock().unwrap().push(frame.to_vec());
    }
    fn metrics(&self) -> LinkMetrics {
        LinkMetrics {
            name: "test".to_string(),
            link_type: "test".to_string(),
            running: true,
            connected: true,
            ..LinkMetrics::default()
        }
    }
}

/// Build a mesh node over a capture link with default routing config.
pub fn test_node(callsign: &str) -> (Arc<MeshNode>, Capture, Delivered) {
    let capture: Capture = Arc::new(Mutex::new(Vec::new()));
    let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
    let link_capture = capture.clone();
    let sink = delivered.clone();
    let delivery: DeliveryFn = Arc::new(move |origin, _dest, seqno, payload| {
        sink.lock().unwrap().push((origin, seqno, payload));
    });
    let node = MeshNode::new(
        callsign,
        RoutingConfig::default(),
        PayloadCipher::disabled(),
        move |_rx| Arc::new(TestLink { sent: link_capture }) as Arc<dyn LinkTransport>,
        delivery,
    );
    (node, capture, delivered)
}

/// Drain every captured frame.
#[allow(dead_code)]
pub fn take_frames(capture: &Capture) -> Vec<Vec<u8>> {
    std::mem::take(&mut *capture.lock().unwrap())
}

/// Build a raw OGM frame.
#[allow(dead_code)]
pub fn ogm_frame(origin: NodeId, seqno: u32, ttl: u8, prev_hop: NodeId, metric: u8) -> Vec<u8> {
    let header = MeshHeader {
        version: MESH_VERSION,
        frame_type: FrameType::Ogm,
        flags: 0,
        ttl,
        origin,
        seqno,
    };
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(prev_hop.as_bytes());
    frame.push(metric);
    frame
}

/// Build a raw plaintext DATA frame.
#[allow(dead_code)]
pub fn data_frame(
    origin: NodeId,
    seqno: u32,
    ttl: u8,
    dest: NodeId,
    data_seqno: u32,
    payload: &[u8],
) -> Vec<u8> {
    let header = MeshHeader {
        version: MESH_VERSION,
        frame_type: FrameType::Data,
        flags: 0,
        ttl,
        origin,
        seqno,
    };
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(dest.as_bytes());
    frame.extend_from_slice(&data_seqno.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[allow(dead_code)]
pub fn frame_type(frame: &[u8]) -> u8 {
    frame[1]
}

#[allow(dead_code)]
pub fn frame_ttl(frame: &[u8]) -> u8 {
    frame[3]
}
