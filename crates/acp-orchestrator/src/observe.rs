// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution observers: lifecycle extension points registered at startup.

use acp_core::run::{ExecutionRun, RunStatus, StepResult};

/// Extension point called at well-defined moments of a run's lifecycle.
///
/// All methods default to no-ops so observers only override what they care
/// about. Observers must not block: they run inline on the run actor.
pub trait ExecutionObserver: Send + Sync {
    /// The run was accepted and its actor started.
    fn on_run_started(&self, _run: &ExecutionRun) {}

    /// The run moved from `from` to `to`.
    fn on_state_changed(&self, _run: &ExecutionRun, _from: RunStatus, _to: RunStatus) {}

    /// A step finished (successfully or not).
    fn on_step_completed(&self, _run: &ExecutionRun, _result: &StepResult) {}

    /// The run reached a terminal state.
    fn on_run_finished(&self, _run: &ExecutionRun) {}

    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// Ordered collection of observers, fired in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Box<dyn ExecutionObserver>>,
}

impl ObserverRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer.
    pub fn register(&mut self, observer: Box<dyn ExecutionObserver>) {
        self.observers.push(observer);
    }

    /// Fire [`ExecutionObserver::on_run_started`].
    pub fn run_started(&self, run: &ExecutionRun) {
        for o in &self.observers {
            o.on_run_started(run);
        }
    }

    /// Fire [`ExecutionObserver::on_state_changed`].
    pub fn state_changed(&self, run: &ExecutionRun, from: RunStatus, to: RunStatus) {
        for o in &self.observers {
            o.on_state_changed(run, from, to);
        }
    }

    /// Fire [`ExecutionObserver::on_step_completed`].
    pub fn step_completed(&self, run: &ExecutionRun, result: &StepResult) {
        for o in &self.observers {
            o.on_step_completed(run, result);
        }
    }

    /// Fire [`ExecutionObserver::on_run_finished`].
    pub fn run_finished(&self, run: &ExecutionRun) {
        for o in &self.observers {
            o.on_run_finished(run);
        }
    }

    /// Registered observer names, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.observers.iter().map(|o| o.name()).collect()
    }
}

/// Built-in observer that logs lifecycle transitions through `tracing`.
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_run_started(&self, run: &ExecutionRun) {
        tracing::info!(
            target: "acp.orchestrator",
            run_id = %run.run_id,
            plan_hash = %run.plan_hash,
            "run started"
        );
    }

    fn on_state_changed(&self, run: &ExecutionRun, from: RunStatus, to: RunStatus) {
        tracing::debug!(
            target: "acp.orchestrator",
            run_id = %run.run_id,
            %from,
            %to,
            "state changed"
        );
    }

    fn on_step_completed(&self, run: &ExecutionRun, result: &StepResult) {
        tracing::debug!(
            target: "acp.orchestrator",
            run_id = %run.run_id,
            step = %result.step,
            success = result.success,
            attempts = result.attempts,
            "step completed"
        );
    }

    fn on_run_finished(&self, run: &ExecutionRun) {
        tracing::info!(
            target: "acp.orchestrator",
            run_id = %run.run_id,
            status = %run.status,
            "run finished"
        );
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        transitions: Mutex<Vec<(RunStatus, RunStatus)>>,
        finished: AtomicUsize,
    }

    impl ExecutionObserver for std::sync::Arc<Counting> {
        fn on_run_started(&self, _run: &ExecutionRun) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_state_changed(&self, _run: &ExecutionRun, from: RunStatus, to: RunStatus) {
            self.transitions.lock().unwrap().push((from, to));
        }
        fn on_run_finished(&self, _run: &ExecutionRun) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    fn run() -> ExecutionRun {
        ExecutionRun::new("T1", "abc123", Uuid::new_v4())
    }

    #[test]
    fn observers_fire_in_registration_order() {
        let counting = std::sync::Arc::new(Counting::default());
        let mut registry = ObserverRegistry::new();
        registry.register(Box::new(TracingObserver));
        registry.register(Box::new(std::sync::Arc::clone(&counting)));
        assert_eq!(registry.names(), vec!["tracing", "counting"]);

        let r = run();
        registry.run_started(&r);
        registry.state_changed(&r, RunStatus::Pending, RunStatus::Validating);
        registry.run_finished(&r);

        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
        assert_eq!(
            *counting.transitions.lock().unwrap(),
            vec![(RunStatus::Pending, RunStatus::Validating)]
        );
        assert_eq!(counting.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_registry_is_harmless() {
        let registry = ObserverRegistry::new();
        let r = run();
        registry.run_started(&r);
        registry.run_finished(&r);
        assert!(registry.names().is_empty());
    }
}
