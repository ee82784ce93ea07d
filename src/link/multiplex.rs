//! Composite link that fans one outbound frame to every child link.
//!
//! Inbound frames reach the mesh through the shared receive callback each
//! child was constructed with, so the multiplexer only has to cascade
//! lifecycle calls, broadcast sends, and aggregate health.

use std::sync::Arc;

use super::{LinkMetrics, LinkTransport};

pub struct MultiplexLink {
    name: String,
    links: Vec<Arc<dyn LinkTransport>>,
}

impl MultiplexLink {
    pub fn new(name: &str, links: Vec<Arc<dyn LinkTransport>>) -> Self {
        Self {
            name: name.to_string(),
            links,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }
}

impl LinkTransport for MultiplexLink {
    fn start(&self) {
        for link in &self.links {
            link.start();
        }
    }

    fn stop(&self) {
        for link in &self.links {
            link.stop();
        }
    }

    fn send(&self, frame: &[u8]) {
        for link in &self.links {
            link.send(frame);
        }
    }

    /// Aggregate view: `running`/`connected` are ORed across children,
    /// counters are summed, activity timestamps take the most recent child,
    /// and the per-child snapshots ride along in `children`.
    fn metrics(&self) -> LinkMetrics {
        let children: Vec<LinkMetrics> = self.links.iter().map(|l| l.metrics()).collect();
        let mut agg = LinkMetrics {
            name: self.name.clone(),
            link_type: "multiplex".to_string(),
            ..LinkMetrics::default()
        };
        for child in &children {
            agg.running |= child.running;
            agg.connected |= child.connected;
            agg.started_ts = pick_earliest(agg.started_ts, child.started_ts);
            agg.last_connect_ts = agg.last_connect_ts.max(child.last_connect_ts);
            agg.last_disconnect_ts = agg.last_disconnect_ts.max(child.last_disconnect_ts);
            agg.last_rx_ts = agg.last_rx_ts.max(child.last_rx_ts);
            agg.last_tx_ts = agg.last_tx_ts.max(child.last_tx_ts);
            agg.rx_frames += child.rx_frames;
            agg.tx_frames += child.tx_frames;
            agg.rx_bytes += child.rx_bytes;
            agg.tx_bytes += child.tx_bytes;
            agg.connect_attempts += child.connect_attempts;
            agg.connect_successes += child.connect_successes;
            agg.disconnects += child.disconnects;
            agg.tx_dropped += child.tx_dropped;
            agg.tx_errors += child.tx_errors;
            agg.rx_errors += child.rx_errors;
            if !child.last_error.is_empty() {
                agg.last_error = child.last_error.clone();
            }
        }
        agg.children = children;
        agg
    }
}

fn pick_earliest(current: f64, candidate: f64) -> f64 {
    if candidate == 0.0 {
        current
    } else if current == 0.0 {
        candidate
    } else {
        current.min(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeLink {
        running: AtomicBool,
        connected: bool,
        sent: AtomicUsize,
    }

    impl FakeLink {
        fn new(connected: bool) -> Self {
            Self {
                running: AtomicBool::new(false),
                connected,
                sent: AtomicUsize::new(0),
            }
        }
    }

    impl LinkTransport for FakeLink {
        fn start(&self) {
            self.running.store(true, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
        fn send(&self, _frame: &[u8]) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        fn metrics(&self) -> LinkMetrics {
            LinkMetrics {
                name: "fake".to_string(),
                link_type: "fake".to_string(),
                running: self.running.load(Ordering::SeqCst),
                connected: self.connected,
                tx_frames: self.sent.load(Ordering::SeqCst) as u64,
                ..LinkMetrics::default()
            }
        }
    }

    #[test]
    fn broadcast_and_aggregate() {
        let a = Arc::new(FakeLink::new(false));
        let b = Arc::new(FakeLink::new(true));
        let mux = MultiplexLink::new("mux", vec![a.clone(), b.clone()]);

        mux.start();
        mux.send(b"frame");
        let metrics = mux.metrics();

        assert!(metrics.running);
        assert!(metrics.connected); // OR across children
        assert_eq!(metrics.tx_frames, 2);
        assert_eq!(metrics.children.len(), 2);
        assert_eq!(a.sent.load(Ordering::SeqCst), 1);
        assert_eq!(b.sent.load(Ordering::SeqCst), 1);

        mux.stop();
        assert!(!mux.metrics().running);
    }

    #[test]
    fn empty_multiplex_reports_idle() {
        let mux = MultiplexLink::new("mux", Vec::new());
        assert!(mux.is_empty());
        assert_eq!(mux.len(), 0);
        let metrics = mux.metrics();
        assert!(!metrics.running);
        assert!(!metrics.connected);
    }
}
