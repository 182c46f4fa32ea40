// SPDX-License-Identifier: MIT OR Apache-2.0
//! Idempotency records: at-most-once acceptance of execute requests.
//!
//! A record binds `(tenant, key)` to a request fingerprint and, once the run
//! reaches a terminal state, to its cached response. Reservation happens
//! under compare-and-set semantics: concurrent contenders see either success
//! or a conflict, never a silent retry.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Outcome of attempting to reserve an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The key is fresh; the caller owns the reservation and must finalize.
    Fresh,
    /// The same request already completed; here is its cached response.
    Replay(Value),
    /// The same request is still executing under this run id.
    InFlight(Uuid),
    /// The key was reused with a different request body.
    Conflict,
}

#[derive(Debug, Clone)]
struct Record {
    fingerprint: String,
    run_id: Uuid,
    response: Option<Value>,
    expires_at: DateTime<Utc>,
}

/// In-process idempotency store with TTL'd records.
#[derive(Debug)]
pub struct IdempotencyStore {
    records: Mutex<HashMap<(String, String), Record>>,
    ttl: Duration,
}

impl IdempotencyStore {
    /// A store whose records live for `ttl_hours` (floor 24 h is enforced at
    /// the config layer).
    #[must_use]
    pub fn new(ttl_hours: u64) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl: Duration::hours(ttl_hours as i64),
        }
    }

    /// Try to reserve `(tenant, key)` for a request with `fingerprint`,
    /// executed by `run_id`.
    #[must_use]
    pub fn begin(&self, tenant: &str, key: &str, fingerprint: &str, run_id: Uuid) -> BeginOutcome {
        let Ok(mut records) = self.records.lock() else {
            return BeginOutcome::Conflict;
        };
        let now = Utc::now();
        records.retain(|_, r| r.expires_at > now);

        let slot = (tenant.to_string(), key.to_string());
        match records.get(&slot) {
            Some(record) if record.fingerprint != fingerprint => BeginOutcome::Conflict,
            Some(record) => match &record.response {
                Some(response) => BeginOutcome::Replay(response.clone()),
                None => BeginOutcome::InFlight(record.run_id),
            },
            None => {
                records.insert(
                    slot,
                    Record {
                        fingerprint: fingerprint.to_string(),
                        run_id,
                        response: None,
                        expires_at: now + self.ttl,
                    },
                );
                BeginOutcome::Fresh
            }
        }
    }

    /// Attach the terminal response to a reservation.
    pub fn finalize(&self, tenant: &str, key: &str, response: Value) {
        if let Ok(mut records) = self.records.lock() {
            if let Some(record) = records.get_mut(&(tenant.to_string(), key.to_string())) {
                record.response = Some(response);
            }
        }
    }

    /// Drop a reservation that will never finalize (the run failed before it
    /// could even start). The key becomes reusable.
    pub fn release(&self, tenant: &str, key: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(&(tenant.to_string(), key.to_string()));
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns `true` when no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_then_replay() {
        let store = IdempotencyStore::new(24);
        let run_id = Uuid::new_v4();
        assert_eq!(store.begin("T1", "k-1", "fp-a", run_id), BeginOutcome::Fresh);
        store.finalize("T1", "k-1", json!({"run_id": run_id.to_string()}));

        let outcome = store.begin("T1", "k-1", "fp-a", Uuid::new_v4());
        assert_eq!(outcome, BeginOutcome::Replay(json!({"run_id": run_id.to_string()})));
    }

    #[test]
    fn same_key_different_fingerprint_conflicts() {
        let store = IdempotencyStore::new(24);
        store.begin("T1", "k-1", "fp-a", Uuid::new_v4());
        assert_eq!(
            store.begin("T1", "k-1", "fp-b", Uuid::new_v4()),
            BeginOutcome::Conflict
        );
    }

    #[test]
    fn in_flight_reports_owning_run() {
        let store = IdempotencyStore::new(24);
        let run_id = Uuid::new_v4();
        store.begin("T1", "k-1", "fp-a", run_id);
        assert_eq!(
            store.begin("T1", "k-1", "fp-a", Uuid::new_v4()),
            BeginOutcome::InFlight(run_id)
        );
    }

    #[test]
    fn keys_are_tenant_scoped() {
        let store = IdempotencyStore::new(24);
        store.begin("T1", "k-1", "fp-a", Uuid::new_v4());
        // Same key, different tenant: fresh.
        assert_eq!(
            store.begin("T2", "k-1", "fp-b", Uuid::new_v4()),
            BeginOutcome::Fresh
        );
    }

    #[test]
    fn release_frees_the_key() {
        let store = IdempotencyStore::new(24);
        store.begin("T1", "k-1", "fp-a", Uuid::new_v4());
        store.release("T1", "k-1");
        assert_eq!(
            store.begin("T1", "k-1", "fp-b", Uuid::new_v4()),
            BeginOutcome::Fresh
        );
    }

    #[test]
    fn expired_records_are_reclaimed() {
        let store = IdempotencyStore::new(24);
        {
            let mut records = store.records.lock().unwrap();
            records.insert(
                ("T1".into(), "k-old".into()),
                Record {
                    fingerprint: "fp".into(),
                    run_id: Uuid::new_v4(),
                    response: Some(json!({})),
                    expires_at: Utc::now() - Duration::hours(1),
                },
            );
        }
        // The stale record must not replay.
        assert_eq!(
            store.begin("T1", "k-old", "fp", Uuid::new_v4()),
            BeginOutcome::Fresh
        );
    }
}
