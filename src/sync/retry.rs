//! Sync-request retry scheduler.
//!
//! One task owns every piece of pending/retry state and ticks on a fixed
//! interval; everything else talks to it through a command channel, so there
//! is exactly one mutator and no lock ordering to reason about.
//!
//! Each sync request that goes out is re-sent on a `base * 2^n` backoff
//! (capped), at most [`RetryConfig::max_attempts`] times, with a small
//! deterministic jitter derived from the destination and channel bytes.
//! Retries for a channel are cancelled the moment a sync response applies at
//! least one new record there. A request that exhausts its attempts is
//! marked given-up and goes quiet; there is no user-visible failure, because
//! a later peer rediscovery or manual sync can always resume progress.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
// Tokio's Instant (not std) so scheduler timing follows the runtime clock,
// including the paused clock used by timing tests.
use tokio::time::Instant;

use crate::chat::protocol::SyncRequest;
use crate::mesh::NodeId;

use super::policy::{PeerFreshness, SyncPolicy};

/// One sync request addressed to a peer.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub dest: NodeId,
    pub channel: String,
    pub request: SyncRequest,
}

impl SyncJob {
    /// Stable identity for retry bookkeeping: destination, channel, and the
    /// request shape (two different ranges to the same peer retry
    /// independently).
    fn key(&self) -> String {
        let shape = match &self.request {
            SyncRequest::SinceTs { .. } => "since".to_string(),
            SyncRequest::SeqnoInventory { .. } => "inv".to_string(),
            SyncRequest::Range {
                origin_id_hex,
                start,
                end,
            } => format!("range:{}:{}-{}", origin_id_hex, start, end),
        };
        format!("{}|{}|{}", self.dest.to_hex(), self.channel, shape)
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub tick: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            max_attempts: 6,
        }
    }
}

/// Hooks the scheduler needs from the rest of the node: how to put a request
/// on the air, how old the newest link RX activity is, and how long ago a
/// peer was last heard of.
pub struct SyncContext {
    pub send: Box<dyn Fn(&SyncJob) + Send + Sync>,
    pub last_rx_age: Box<dyn Fn() -> Option<f64> + Send + Sync>,
    pub peer_age: Box<dyn Fn(NodeId) -> Option<f64> + Send + Sync>,
}

enum Command {
    Request(SyncJob),
    SyncApplied { channel: String, applied: usize },
    Snapshot(oneshot::Sender<RetryStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Scheduler counters for status surfaces and tests.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub active: usize,
    pub gave_up: usize,
    pub pending: usize,
    pub sent_total: u64,
    pub retries_total: u64,
    pub cancelled_total: u64,
}

#[derive(Clone)]
pub struct RetrySchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RetrySchedulerHandle {
    /// Submit a sync request for sending (now, or deferred behind the
    /// channel's RX-activity gate) plus retry scheduling.
    pub fn request(&self, job: SyncJob) {
        let _ = self.tx.send(Command::Request(job));
    }

    /// Report that a sync response applied `applied` new records for a
    /// channel; any positive count cancels that channel's retries.
    pub fn sync_applied(&self, channel: &str, applied: usize) {
        let _ = self.tx.send(Command::SyncApplied {
            channel: channel.to_string(),
            applied,
        });
    }

    pub async fn snapshot(&self) -> Option<RetryStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Shutdown(tx));
        let _ = rx.await;
    }
}

struct RetryState {
    job: SyncJob,
    attempts: u32,
    next_due: Instant,
    gave_up: bool,
}

struct Scheduler {
    cfg: RetryConfig,
    policy: SyncPolicy,
    ctx: SyncContext,
    retries: HashMap<String, RetryState>,
    pending: VecDeque<SyncJob>,
    stats: RetryStats,
}

/// Spawn the scheduler task and return its handle.
pub fn start_retry_scheduler(
    cfg: RetryConfig,
    policy: SyncPolicy,
    ctx: SyncContext,
) -> RetrySchedulerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let handle = RetrySchedulerHandle { tx };
    let tick = cfg.tick;

    let mut scheduler = Scheduler {
        cfg,
        policy,
        ctx,
        retries: HashMap::new(),
        pending: VecDeque::new(),
        stats: RetryStats::default(),
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Request(job)) => scheduler.on_request(job),
                        Some(Command::SyncApplied { channel, applied }) => {
                            scheduler.on_applied(&channel, applied);
                        }
                        Some(Command::Snapshot(resp)) => {
                            let _ = resp.send(scheduler.snapshot());
                        }
                        Some(Command::Shutdown(done)) => {
                            let _ = done.send(());
                            break;
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(tick) => {}
            }
            scheduler.tick(Instant::now());
        }
        debug!("retry scheduler terminated");
    });

    handle
}

impl Scheduler {
    fn on_request(&mut self, job: SyncJob) {
        let channel_policy = self.policy.for_channel(&job.channel);
        if !channel_policy.enabled {
            debug!("sync disabled for {}, dropping request", job.channel);
            return;
        }
        if self.rx_gate_blocks(&job.channel) {
            debug!("deferring sync for {} until link activity", job.channel);
            self.pending.push_back(job);
            return;
        }
        self.dispatch(job, Instant::now());
    }

    fn on_applied(&mut self, channel: &str, applied: usize) {
        if applied == 0 {
            return;
        }
        let before = self.retries.len();
        self.retries.retain(|_, state| state.job.channel != channel);
        let cancelled = before - self.retries.len();
        self.pending.retain(|job| job.channel != channel);
        if cancelled > 0 {
            self.stats.cancelled_total += cancelled as u64;
            info!(
                "sync applied {} record(s) on {}, cancelled {} retry state(s)",
                applied, channel, cancelled
            );
        }
    }

    fn tick(&mut self, now: Instant) {
        // Drain deferred requests whose RX gate has opened.
        for _ in 0..self.pending.len() {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            if !self.policy.for_channel(&job.channel).enabled {
                continue; // channel was disabled while parked
            }
            if self.rx_gate_blocks(&job.channel) {
                self.pending.push_back(job);
            } else {
                self.dispatch(job, now);
            }
        }

        // Fire due retries.
        let due_keys: Vec<String> = self
            .retries
            .iter()
            .filter(|(_, s)| !s.gave_up && s.next_due <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due_keys {
            if let Some(state) = self.retries.get(&key) {
                if self.rx_gate_blocks(&state.job.channel) {
                    // Not an attempt: just look again shortly.
                    if let Some(state) = self.retries.get_mut(&key) {
                        state.next_due = now + Duration::from_secs(2);
                    }
                    continue;
                }
            }
            let Some(state) = self.retries.get_mut(&key) else {
                continue;
            };
            if state.attempts >= self.cfg.max_attempts {
                state.gave_up = true;
                debug!(
                    "sync for {} on {} gave up after {} attempts",
                    state.job.dest, state.job.channel, state.attempts
                );
                continue;
            }
            (self.ctx.send)(&state.job);
            state.attempts += 1;
            self.stats.sent_total += 1;
            self.stats.retries_total += 1;
            let job = state.job.clone();
            let attempts = state.attempts;
            let due = self.next_due(&job, attempts, now);
            if let Some(state) = self.retries.get_mut(&key) {
                state.next_due = due;
            }
        }
    }

    /// Send a job immediately and register its retry state.
    fn dispatch(&mut self, job: SyncJob, now: Instant) {
        (self.ctx.send)(&job);
        self.stats.sent_total += 1;
        let key = job.key();
        let next_due = self.next_due(&job, 1, now);
        self.retries.insert(
            key,
            RetryState {
                job,
                attempts: 1,
                next_due,
                gave_up: false,
            },
        );
    }

    /// Due time after `attempts` sends: exponential backoff, capped, scaled
    /// by peer staleness, plus deterministic jitter.
    fn next_due(&self, job: &SyncJob, attempts: u32, now: Instant) -> Instant {
        let exponent = attempts.saturating_sub(1).min(16);
        let backoff = self
            .cfg
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.cfg.max_delay);
        let window = self.policy.for_channel(&job.channel).peer_fresh_window;
        let freshness = PeerFreshness::classify((self.ctx.peer_age)(job.dest), window);
        let scaled = backoff.saturating_mul(freshness.backoff_multiplier());
        let jitter =
            Duration::from_millis(deterministic_jitter_ms(job.dest.as_bytes(), &job.channel));
        now + scaled + jitter
    }

    fn rx_gate_blocks(&self, channel: &str) -> bool {
        let Some(require) = self.policy.for_channel(channel).require_rx_within else {
            return false;
        };
        match (self.ctx.last_rx_age)() {
            Some(age) => age > require.as_secs_f64(),
            None => true, // nothing ever heard; the link is not usefully up
        }
    }

    fn snapshot(&self) -> RetryStats {
        let gave_up = self.retries.values().filter(|s| s.gave_up).count();
        RetryStats {
            active: self.retries.len() - gave_up,
            gave_up,
            pending: self.pending.len(),
            ..self.stats.clone()
        }
    }
}

/// Deterministic, non-cryptographic jitter: FNV-1a over the destination and
/// channel bytes, reduced mod 1000 ms. Spreads co-scheduled retries apart
/// while keeping backoff timing reproducible in tests.
pub fn deterministic_jitter_ms(dest: &[u8], channel: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in dest.iter().chain(channel.as_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash % 1000
}
