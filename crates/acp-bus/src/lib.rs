// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed publish/subscribe facade over a durable, ordered event stream.
//!
//! Subjects are hierarchical (`events.<domain>.<event>`); consumer groups
//! hold durable cursors into a single ordered log, which is what gives
//! per-`run_id` ordering for free: events of one run are published from one
//! task and read back in sequence. Delivery is at-least-once with explicit
//! acknowledgement; a message redelivered more than `max_deliver` times is
//! routed to the dead-letter subject. Payloads pass through the central
//! redaction pass on publish, so nothing downstream ever sees a raw secret.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::{CloudEvent, redact_value};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Default bound on unacknowledged deliveries per consumer group.
const DEFAULT_MAX_INFLIGHT: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Internal lock poisoned; the bus is unusable.
    #[error("event bus lock poisoned")]
    Poisoned,

    /// The named consumer group does not exist.
    #[error("unknown consumer group '{0}'")]
    UnknownGroup(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retention and redelivery configuration for the stream.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events older than this are pruned.
    pub retention_age: Duration,
    /// At most this many events are retained.
    pub retention_events: usize,
    /// Redeliveries beyond this count dead-letter the event.
    pub max_deliver: u32,
    /// Subject dead-lettered events are republished on.
    pub dlq_subject: String,
    /// Bound on unacknowledged deliveries per consumer group.
    pub max_inflight: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retention_age: Duration::days(7),
            retention_events: 100_000,
            max_deliver: 5,
            dlq_subject: "events.dlq".into(),
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

// ---------------------------------------------------------------------------
// Subject matching
// ---------------------------------------------------------------------------

/// Match a hierarchical subject against a pattern.
///
/// `*` matches exactly one segment, `>` matches the remainder:
///
/// ```
/// use acp_bus::subject_matches;
///
/// assert!(subject_matches("events.execution.*", "events.execution.started"));
/// assert!(subject_matches("events.>", "events.plan.compiled"));
/// assert!(!subject_matches("events.plan.*", "events.execution.started"));
/// ```
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split('.');
    let mut s = subject.split('.');
    loop {
        match (p.next(), s.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(pseg), Some(sseg)) if pseg == sseg => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Stream internals
// ---------------------------------------------------------------------------

/// One event as stored on the stream.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Monotonic sequence number, unique across the stream.
    pub seq: u64,
    /// Subject the event was published on.
    pub subject: String,
    /// The (redacted) envelope.
    pub event: CloudEvent,
    /// When the event was appended.
    pub stored_at: DateTime<Utc>,
}

struct GroupState {
    pattern: String,
    cursor: u64,
    // seq -> delivery count for delivered-but-unacked events.
    pending: HashMap<u64, u32>,
}

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Deliveries handed to consumers (including redeliveries).
    pub delivered: u64,
    /// Events moved to the dead-letter subject.
    pub dead_lettered: u64,
    /// Events pruned by retention.
    pub pruned: u64,
}

#[derive(Default)]
struct StatsInner {
    published: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    pruned: AtomicU64,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// The durable event stream facade.
///
/// Cheap to clone; all clones share the log and consumer state.
#[derive(Clone)]
pub struct EventBus {
    config: Arc<BusConfig>,
    log: Arc<RwLock<Vec<StoredEvent>>>,
    groups: Arc<RwLock<HashMap<String, GroupState>>>,
    next_seq: Arc<AtomicU64>,
    stats: Arc<StatsInner>,
}

impl EventBus {
    /// Create a bus with the given configuration.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config: Arc::new(config),
            log: Arc::new(RwLock::new(Vec::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Publish an event on `subject`.
    ///
    /// The payload is redacted before it is stored; retention is enforced on
    /// every append.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Poisoned`] when the log lock is unusable.
    pub fn publish(&self, subject: &str, mut event: CloudEvent) -> Result<u64, BusError> {
        redact_value(&mut event.data);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let mut log = self.log.write().map_err(|_| BusError::Poisoned)?;
        log.push(StoredEvent {
            seq,
            subject: subject.to_string(),
            event,
            stored_at: Utc::now(),
        });
        self.prune_locked(&mut log);
        drop(log);

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(target: "acp.bus", subject, seq, "event published");
        Ok(seq)
    }

    fn prune_locked(&self, log: &mut Vec<StoredEvent>) {
        let cutoff = Utc::now() - self.config.retention_age;
        let before = log.len();
        log.retain(|e| e.stored_at >= cutoff);
        if log.len() > self.config.retention_events {
            let excess = log.len() - self.config.retention_events;
            log.drain(0..excess);
        }
        let pruned = before - log.len();
        if pruned > 0 {
            self.stats.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
        }
    }

    /// Create (or reuse) a durable consumer group over `pattern`.
    ///
    /// A new group starts at the current end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Poisoned`] when internal state is unusable.
    pub fn ensure_group(&self, group: &str, pattern: &str) -> Result<(), BusError> {
        let mut groups = self.groups.write().map_err(|_| BusError::Poisoned)?;
        groups.entry(group.to_string()).or_insert_with(|| GroupState {
            pattern: pattern.to_string(),
            cursor: self.next_seq.load(Ordering::SeqCst),
            pending: HashMap::new(),
        });
        Ok(())
    }

    /// Reposition a group's cursor for replay.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownGroup`] when the group does not exist.
    pub fn replay_from(&self, group: &str, seq: u64) -> Result<(), BusError> {
        let mut groups = self.groups.write().map_err(|_| BusError::Poisoned)?;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| BusError::UnknownGroup(group.to_string()))?;
        state.cursor = seq;
        state.pending.clear();
        Ok(())
    }

    /// Pull up to `max` matching events for a group.
    ///
    /// Re-delivers unacknowledged events first (incrementing their delivery
    /// count, dead-lettering past `max_deliver`), then advances the cursor.
    /// The in-flight bound caps how many unacked deliveries a group may hold.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownGroup`] when the group does not exist.
    pub fn pull(&self, group: &str, max: usize) -> Result<Vec<StoredEvent>, BusError> {
        let mut dead: Vec<StoredEvent> = Vec::new();
        let out = {
            let mut groups = self.groups.write().map_err(|_| BusError::Poisoned)?;
            let state = groups
                .get_mut(group)
                .ok_or_else(|| BusError::UnknownGroup(group.to_string()))?;
            let log = self.log.read().map_err(|_| BusError::Poisoned)?;

            let mut out = Vec::new();
            let budget = self
                .config
                .max_inflight
                .saturating_sub(state.pending.len())
                .min(max);

            // Redeliveries first, in sequence order.
            let mut pending_seqs: Vec<u64> = state.pending.keys().copied().collect();
            pending_seqs.sort_unstable();
            for seq in pending_seqs {
                if out.len() >= budget {
                    break;
                }
                let Some(stored) = log.iter().find(|e| e.seq == seq) else {
                    // Pruned by retention; nothing left to deliver.
                    state.pending.remove(&seq);
                    continue;
                };
                let count = state.pending.entry(seq).or_insert(0);
                if *count >= self.config.max_deliver {
                    state.pending.remove(&seq);
                    dead.push(stored.clone());
                    continue;
                }
                *count += 1;
                out.push(stored.clone());
            }

            // Fresh deliveries.
            let fresh: Vec<_> = log
                .iter()
                .filter(|e| e.seq >= state.cursor)
                .cloned()
                .collect();
            for stored in fresh.iter() {
                if out.len() >= budget {
                    break;
                }
                state.cursor = stored.seq + 1;
                if !subject_matches(&state.pattern, &stored.subject) {
                    continue;
                }
                state.pending.insert(stored.seq, 1);
                out.push(stored.clone());
            }
            out
        };

        for stored in dead {
            warn!(
                target: "acp.bus",
                seq = stored.seq,
                subject = %stored.subject,
                "max deliveries exceeded; dead-lettering"
            );
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            self.publish(&self.config.dlq_subject.clone(), stored.event)?;
        }

        self.stats
            .delivered
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Acknowledge a delivered event.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownGroup`] when the group does not exist.
    pub fn ack(&self, group: &str, seq: u64) -> Result<(), BusError> {
        let mut groups = self.groups.write().map_err(|_| BusError::Poisoned)?;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| BusError::UnknownGroup(group.to_string()))?;
        state.pending.remove(&seq);
        Ok(())
    }

    /// Snapshot of bus counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            pruned: self.stats.pruned.load(Ordering::Relaxed),
        }
    }

    /// Stored events matching `pattern`, in stream order (diagnostics and
    /// tests).
    #[must_use]
    pub fn events_matching(&self, pattern: &str) -> Vec<StoredEvent> {
        let Ok(log) = self.log.read() else {
            return Vec::new();
        };
        log.iter()
            .filter(|e| subject_matches(pattern, &e.subject))
            .cloned()
            .collect()
    }

    /// Spawn a push consumer: a task that pulls for `group` and invokes
    /// `handler`, acking on success and leaving redelivery to the pending
    /// tracker on failure.
    pub fn subscribe<H>(&self, group: &str, pattern: &str, handler: H) -> Result<(), BusError>
    where
        H: EventHandler + 'static,
    {
        self.ensure_group(group, pattern)?;
        let bus = self.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            loop {
                let batch = match bus.pull(&group, 16) {
                    Ok(batch) => batch,
                    Err(_) => return,
                };
                if batch.is_empty() {
                    // Poll interval keeps decision-to-observation latency well
                    // under the 1 s propagation budget.
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
                for stored in batch {
                    match handler.handle(&stored.event).await {
                        Ok(()) => {
                            let _ = bus.ack(&group, stored.seq);
                        }
                        Err(err) => {
                            warn!(
                                target: "acp.bus",
                                group = %group,
                                seq = stored.seq,
                                error = %err,
                                "handler failed; event stays pending"
                            );
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Async event consumer invoked by [`EventBus::subscribe`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. Returning an error leaves the event unacked for
    /// redelivery.
    async fn handle(&self, event: &CloudEvent) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
