//! Channel sync policy and range-request planning.
//!
//! The gap tracker says *what* is missing; this layer decides *whether and
//! how much* airtime to spend getting it back. Confirmed ranges are merged
//! when they sit close together, split when they exceed the per-request
//! bound, capped per trigger, and rate-limited per origin. Channel gates can
//! disable sync outright, demand recent link activity before a request is
//! worth sending, and soften the schedule for peers that look stale.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

use crate::mesh::NodeId;

/// Per-channel sync gates. A channel missing from the override table uses
/// the default policy.
#[derive(Debug, Clone)]
pub struct ChannelPolicy {
    /// Master switch; a disabled channel sends no sync traffic at all.
    pub enabled: bool,
    /// When set, a sync request is only sent if the link heard *something*
    /// this recently; otherwise the request parks in the pending queue.
    pub require_rx_within: Option<Duration>,
    /// Window for judging peer freshness from the routing table.
    pub peer_fresh_window: Duration,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            require_rx_within: None,
            peer_fresh_window: Duration::from_secs(1800),
        }
    }
}

/// Channel policy table: one default plus per-channel overrides.
#[derive(Debug, Clone, Default)]
pub struct SyncPolicy {
    pub default_channel: ChannelPolicy,
    pub channels: HashMap<String, ChannelPolicy>,
}

impl SyncPolicy {
    pub fn for_channel(&self, channel: &str) -> &ChannelPolicy {
        self.channels.get(channel).unwrap_or(&self.default_channel)
    }
}

/// Peer liveness judgment from routing-table age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFreshness {
    /// Heard within the freshness window.
    Fresh,
    /// Unseen for more than 1x the window.
    Stale,
    /// Unseen for more than 2x the window, or never heard at all.
    LikelyOffline,
}

impl PeerFreshness {
    pub fn classify(age_secs: Option<f64>, window: Duration) -> Self {
        let window = window.as_secs_f64();
        match age_secs {
            Some(age) if age <= window => PeerFreshness::Fresh,
            Some(age) if age <= window * 2.0 => PeerFreshness::Stale,
            _ => PeerFreshness::LikelyOffline,
        }
    }

    /// Soft backoff multiplier: stale peers get a slower schedule, never a
    /// hard block (they may come back mid-schedule).
    pub fn backoff_multiplier(self) -> u32 {
        match self {
            PeerFreshness::Fresh => 1,
            PeerFreshness::Stale => 2,
            PeerFreshness::LikelyOffline => 4,
        }
    }
}

/// Bounds on how confirmed gaps translate into range requests.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Ranges separated by at most this many present seqnos merge into one.
    pub coalesce_distance: u32,
    /// A merged range longer than this splits into multiple requests.
    pub max_range_len: u32,
    /// Requests emitted per trigger, across all of an origin's ranges.
    pub max_requests_per_trigger: usize,
    /// Quiet period per origin between triggers.
    pub origin_cooldown: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            coalesce_distance: 8,
            max_range_len: 50,
            max_requests_per_trigger: 3,
            origin_cooldown: Duration::from_secs(120),
        }
    }
}

/// Turns confirmed missing ranges into bounded range-sync requests.
pub struct RangePlanner {
    cfg: PlannerConfig,
    last_trigger: HashMap<NodeId, Instant>,
}

impl RangePlanner {
    pub fn new(cfg: PlannerConfig) -> Self {
        Self {
            cfg,
            last_trigger: HashMap::new(),
        }
    }

    /// Plan requests for one origin's confirmed ranges. Empty when the
    /// origin is inside its cooldown or nothing is confirmed.
    pub fn plan(
        &mut self,
        origin: NodeId,
        confirmed: &[(u32, u32)],
        now: Instant,
    ) -> Vec<(u32, u32)> {
        if confirmed.is_empty() {
            return Vec::new();
        }
        if let Some(last) = self.last_trigger.get(&origin) {
            if now.duration_since(*last) < self.cfg.origin_cooldown {
                return Vec::new();
            }
        }

        let merged = merge_ranges(confirmed, self.cfg.coalesce_distance);
        let mut requests = Vec::new();
        'outer: for (start, end) in merged {
            let mut chunk_start = start;
            loop {
                if requests.len() >= self.cfg.max_requests_per_trigger {
                    debug!(
                        "range plan for {} capped at {} requests",
                        origin, self.cfg.max_requests_per_trigger
                    );
                    break 'outer;
                }
                let span = end - chunk_start;
                let chunk_end = if span + 1 > self.cfg.max_range_len {
                    chunk_start + self.cfg.max_range_len - 1
                } else {
                    end
                };
                requests.push((chunk_start, chunk_end));
                if chunk_end >= end {
                    break;
                }
                chunk_start = chunk_end + 1;
            }
        }

        if !requests.is_empty() {
            self.last_trigger.insert(origin, now);
        }
        requests
    }
}

/// Merge sorted-or-not ranges whose separation is within `distance`.
fn merge_ranges(ranges: &[(u32, u32)], distance: u32) -> Vec<(u32, u32)> {
    let mut sorted: Vec<(u32, u32)> = ranges.to_vec();
    sorted.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(sorted.len());
    for (start, end) in sorted {
        match merged.last_mut() {
            Some((_, last_end)) if start.saturating_sub(*last_end) <= distance + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}
