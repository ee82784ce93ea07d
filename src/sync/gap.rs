//! Per-origin sequence-gap detection.
//!
//! Every origin numbers its data frames with a contiguous seqno stream, so a
//! hole in the stream means a message this node never received. The tracker
//! keeps, per origin, the highest fully-contiguous seqno plus an out-of-order
//! buffer, and derives the set of missing ranges from them.
//!
//! A fresh range is only *suspected*: flooding reorders frames routinely and
//! most holes fill themselves within seconds. Once a range survives the
//! confirmation delay unchanged it becomes *confirmed* and is worth spending
//! airtime on. Reports are rate-limited: one fires only when the normalized
//! range signature changes and the minimum report interval has elapsed, plus
//! a one-time resolved notice when the last range clears.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::mesh::NodeId;

#[derive(Debug, Clone)]
pub struct GapConfig {
    /// Age at which a missing range is considered genuinely lost rather
    /// than reordered.
    pub confirm_delay: Duration,
    /// Minimum spacing between reports for one origin.
    pub min_report_interval: Duration,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            confirm_delay: Duration::from_secs(90),
            min_report_interval: Duration::from_secs(30),
        }
    }
}

/// One missing seqno range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingRange {
    pub start: u32,
    pub end: u32,
    pub detected_at: Instant,
}

#[derive(Debug, Default)]
struct OriginState {
    seen_any: bool,
    hi_contig: u32,
    buffer: BTreeSet<u32>,
    ranges: Vec<MissingRange>,
    last_signature: String,
    last_report_at: Option<Instant>,
    resolved_pending: bool,
}

/// A rate-limited gap report for one origin.
#[derive(Debug, Clone)]
pub struct GapReport {
    pub origin: NodeId,
    /// Ranges newer than the confirmation delay.
    pub suspected: Vec<(u32, u32)>,
    /// Ranges that outlived the confirmation delay.
    pub confirmed: Vec<(u32, u32)>,
    /// True for the one-time all-clear notice.
    pub resolved: bool,
    pub summary: String,
}

/// Gap state machines for every remote origin.
pub struct GapTracker {
    cfg: GapConfig,
    origins: HashMap<NodeId, OriginState>,
}

impl GapTracker {
    pub fn new(cfg: GapConfig) -> Self {
        Self {
            cfg,
            origins: HashMap::new(),
        }
    }

    /// Feed one observed `(origin, seqno)`.
    ///
    /// The first sighting of an origin becomes its baseline: a node joining
    /// mid-stream must not report the origin's entire past history missing.
    pub fn record(&mut self, origin: NodeId, seqno: u32, now: Instant) {
        let state = self.origins.entry(origin).or_default();

        if !state.seen_any {
            state.seen_any = true;
            state.hi_contig = seqno;
            return;
        }
        if seqno <= state.hi_contig || state.buffer.contains(&seqno) {
            return; // duplicate or already-counted history
        }

        if seqno == state.hi_contig + 1 {
            state.hi_contig = seqno;
            // Drain anything buffered that just became contiguous.
            loop {
                let next = state.hi_contig.wrapping_add(1);
                if state.buffer.remove(&next) {
                    state.hi_contig = next;
                } else {
                    break;
                }
            }
        } else {
            state.buffer.insert(seqno);
        }

        Self::recompute_ranges(state, now);
    }

    /// Current missing ranges for one origin (test/diagnostic surface).
    pub fn missing(&self, origin: NodeId) -> Vec<(u32, u32)> {
        self.origins
            .get(&origin)
            .map(|s| s.ranges.iter().map(|r| (r.start, r.end)).collect())
            .unwrap_or_default()
    }

    pub fn hi_contig(&self, origin: NodeId) -> Option<u32> {
        self.origins
            .get(&origin)
            .filter(|s| s.seen_any)
            .map(|s| s.hi_contig)
    }

    /// Collect reports that are due: signature changed and the report
    /// interval elapsed, or a resolved notice is pending.
    pub fn poll_reports(&mut self, now: Instant) -> Vec<GapReport> {
        let mut reports = Vec::new();
        for (origin, state) in self.origins.iter_mut() {
            if state.ranges.is_empty() {
                if state.resolved_pending {
                    state.resolved_pending = false;
                    state.last_signature.clear();
                    state.last_report_at = Some(now);
                    reports.push(GapReport {
                        origin: *origin,
                        suspected: Vec::new(),
                        confirmed: Vec::new(),
                        resolved: true,
                        summary: format!("origin {}: all gaps resolved", origin),
                    });
                }
                continue;
            }

            let mut suspected = Vec::new();
            let mut confirmed = Vec::new();
            for range in &state.ranges {
                let pair = (range.start, range.end);
                if now.duration_since(range.detected_at) >= self.cfg.confirm_delay {
                    confirmed.push(pair);
                } else {
                    suspected.push(pair);
                }
            }

            // The confirmation marker is part of the signature so a
            // suspected range aging into confirmed triggers a report even
            // though the range set itself is unchanged.
            let signature = signature_of(&suspected, &confirmed);
            if signature == state.last_signature {
                continue;
            }
            let interval_ok = state
                .last_report_at
                .map_or(true, |t| now.duration_since(t) >= self.cfg.min_report_interval);
            if !interval_ok {
                continue;
            }

            state.last_signature = signature;
            state.last_report_at = Some(now);
            reports.push(GapReport {
                origin: *origin,
                summary: summarize(*origin, &suspected, &confirmed),
                suspected,
                confirmed,
                resolved: false,
            });
        }
        reports
    }

    fn recompute_ranges(state: &mut OriginState, now: Instant) {
        let had_ranges = !state.ranges.is_empty();
        let old_ranges = std::mem::take(&mut state.ranges);

        if let Some(&max_buffered) = state.buffer.iter().next_back() {
            let mut cursor = state.hi_contig.wrapping_add(1);
            for &buffered in state.buffer.iter() {
                if buffered > cursor {
                    let (start, end) = (cursor, buffered - 1);
                    state.ranges.push(MissingRange {
                        start,
                        end,
                        detected_at: inherited_detection(&old_ranges, start, end, now),
                    });
                }
                cursor = buffered.wrapping_add(1);
            }
            debug_assert!(cursor > max_buffered);
        }

        if had_ranges && state.ranges.is_empty() {
            state.resolved_pending = true;
        }
    }
}

/// Earliest `detected_at` among old ranges overlapping or adjacent to the
/// new one; merged and split ranges keep aging toward confirmation instead
/// of resetting.
fn inherited_detection(
    old_ranges: &[MissingRange],
    start: u32,
    end: u32,
    now: Instant,
) -> Instant {
    old_ranges
        .iter()
        .filter(|old| old.start <= end.saturating_add(1) && start <= old.end.saturating_add(1))
        .map(|old| old.detected_at)
        .min()
        .unwrap_or(now)
}

fn signature_of(suspected: &[(u32, u32)], confirmed: &[(u32, u32)]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(suspected.len() + confirmed.len());
    for (start, end) in confirmed {
        parts.push(format!("{}-{}!", start, end));
    }
    for (start, end) in suspected {
        parts.push(format!("{}-{}?", start, end));
    }
    parts.sort();
    parts.join(",")
}

fn summarize(origin: NodeId, suspected: &[(u32, u32)], confirmed: &[(u32, u32)]) -> String {
    let render = |ranges: &[(u32, u32)]| {
        ranges
            .iter()
            .map(|(s, e)| {
                if s == e {
                    s.to_string()
                } else {
                    format!("{}-{}", s, e)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut parts = Vec::new();
    if !confirmed.is_empty() {
        parts.push(format!("confirmed [{}]", render(confirmed)));
    }
    if !suspected.is_empty() {
        parts.push(format!("suspected [{}]", render(suspected)));
    }
    format!("origin {}: missing {}", origin, parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> NodeId {
        NodeId::from_callsign("K1ABC")
    }

    fn tracker() -> GapTracker {
        GapTracker::new(GapConfig {
            confirm_delay: Duration::from_secs(90),
            min_report_interval: Duration::from_secs(30),
        })
    }

    #[test]
    fn contiguous_stream_has_no_gaps() {
        let mut gt = tracker();
        let t0 = Instant::now();
        for seq in 1..=5 {
            gt.record(origin(), seq, t0);
        }
        assert!(gt.missing(origin()).is_empty());
        assert_eq!(gt.hi_contig(origin()), Some(5));
    }

    #[test]
    fn classic_gap_sequence() {
        // Spec sequence: 1,2,4,5,7 must yield missing {3} and {6}.
        let mut gt = tracker();
        let t0 = Instant::now();
        for seq in [1, 2, 4, 5, 7] {
            gt.record(origin(), seq, t0);
        }
        assert_eq!(gt.missing(origin()), vec![(3, 3), (6, 6)]);
        assert_eq!(gt.hi_contig(origin()), Some(2));
    }

    #[test]
    fn buffered_seqnos_drain_when_hole_fills() {
        let mut gt = tracker();
        let t0 = Instant::now();
        for seq in [1, 2, 4, 5, 7] {
            gt.record(origin(), seq, t0);
        }
        gt.record(origin(), 3, t0);
        assert_eq!(gt.hi_contig(origin()), Some(5));
        assert_eq!(gt.missing(origin()), vec![(6, 6)]);
        gt.record(origin(), 6, t0);
        assert_eq!(gt.hi_contig(origin()), Some(7));
        assert!(gt.missing(origin()).is_empty());
    }

    #[test]
    fn duplicates_and_old_seqnos_are_noops() {
        let mut gt = tracker();
        let t0 = Instant::now();
        for seq in [1, 2, 4] {
            gt.record(origin(), seq, t0);
        }
        let before = gt.missing(origin());
        gt.record(origin(), 2, t0);
        gt.record(origin(), 4, t0);
        assert_eq!(gt.missing(origin()), before);
    }

    #[test]
    fn first_sighting_is_baseline() {
        let mut gt = tracker();
        let t0 = Instant::now();
        gt.record(origin(), 500, t0);
        assert!(gt.missing(origin()).is_empty());
        gt.record(origin(), 501, t0);
        assert_eq!(gt.hi_contig(origin()), Some(501));
    }

    #[test]
    fn ranges_confirm_after_delay() {
        let mut gt = tracker();
        let t0 = Instant::now();
        for seq in [1, 3] {
            gt.record(origin(), seq, t0);
        }

        let reports = gt.poll_reports(t0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].suspected, vec![(2, 2)]);
        assert!(reports[0].confirmed.is_empty());

        // Unchanged state inside the interval: nothing new to say.
        assert!(gt.poll_reports(t0 + Duration::from_secs(5)).is_empty());

        // Past the confirm delay the same range promotes to confirmed.
        let later = t0 + Duration::from_secs(120);
        let reports = gt.poll_reports(later);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].suspected.is_empty());
        assert_eq!(reports[0].confirmed, vec![(2, 2)]);
    }

    #[test]
    fn merged_range_inherits_detection_time() {
        let mut gt = tracker();
        let t0 = Instant::now();
        gt.record(origin(), 1, t0);
        gt.record(origin(), 5, t0); // missing 2-4 detected at t0

        let t1 = t0 + Duration::from_secs(60);
        gt.record(origin(), 7, t1); // missing 6-6 detected at t1; 2-4 keeps t0

        let t2 = t0 + Duration::from_secs(100); // 2-4 aged past 90s, 6-6 not
        let reports = gt.poll_reports(t2);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].confirmed, vec![(2, 4)]);
        assert_eq!(reports[0].suspected, vec![(6, 6)]);
    }

    #[test]
    fn resolved_notice_fires_once() {
        let mut gt = tracker();
        let t0 = Instant::now();
        gt.record(origin(), 1, t0);
        gt.record(origin(), 3, t0);
        let _ = gt.poll_reports(t0);

        gt.record(origin(), 2, t0 + Duration::from_secs(1));
        let reports = gt.poll_reports(t0 + Duration::from_secs(2));
        assert_eq!(reports.len(), 1);
        assert!(reports[0].resolved);

        assert!(gt.poll_reports(t0 + Duration::from_secs(90)).is_empty());
    }

    #[test]
    fn report_rate_limit_defers_signature_changes() {
        let mut gt = tracker();
        let t0 = Instant::now();
        gt.record(origin(), 1, t0);
        gt.record(origin(), 3, t0);
        assert_eq!(gt.poll_reports(t0).len(), 1);

        // New hole right away: signature changed but interval not elapsed.
        gt.record(origin(), 6, t0 + Duration::from_secs(1));
        assert!(gt.poll_reports(t0 + Duration::from_secs(2)).is_empty());

        // After the interval the combined state reports.
        let reports = gt.poll_reports(t0 + Duration::from_secs(31));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].suspected, vec![(2, 2), (4, 5)]);
    }
}
