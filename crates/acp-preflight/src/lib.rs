// SPDX-License-Identifier: MIT OR Apache-2.0
//! Preflight simulation: execute a compiled plan with zero side effects.
//!
//! Each step calls a [`MockToolRegistry`] entry instead of a real tool.
//! Latency is sampled at base ± 30 %, failures are sampled from the step's
//! risk level, and the result is an immutable [`PreflightReport`] bound to
//! exactly one plan hash. Simulated time is virtual: a multi-minute plan
//! simulates in milliseconds.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Mock tool registry for side-effect-free simulation.
pub mod mock;
/// Heuristic recommendation rules.
pub mod rules;

pub use mock::{MockTool, MockToolRegistry};

use acp_core::plan::{ExecutablePlan, RiskLevel};
use acp_core::{CloudEvent, subjects};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Severity of a simulation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Informational; no action needed.
    Info,
    /// Worth attention before executing.
    Warning,
    /// Blocks feasibility.
    Critical,
}

/// One finding surfaced during simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// How serious the finding is.
    pub severity: IssueSeverity,
    /// The step the finding concerns, when step-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Human-readable description.
    pub message: String,
}

/// Simulated outcome for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name.
    pub step: String,
    /// Tool the step would invoke.
    pub tool: String,
    /// Compiled risk level.
    pub risk: RiskLevel,
    /// Sampled latency in milliseconds.
    pub simulated_latency_ms: u64,
    /// Whether the simulated call succeeded.
    pub succeeded: bool,
    /// The mock response payload (null when the call failed).
    pub output: serde_json::Value,
}

/// Immutable result of one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Unique report identifier.
    pub report_id: Uuid,
    /// The plan this report is bound to.
    pub plan_hash: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Per-step results in simulation order.
    pub steps: Vec<StepReport>,
    /// Max of the step risk levels.
    pub overall_risk: RiskLevel,
    /// `true` when no critical issue was found.
    pub feasible: bool,
    /// Critical-path duration estimate in milliseconds.
    pub estimated_duration_ms: u64,
    /// Total cost estimate in micro-units.
    pub estimated_cost_micros: u64,
    /// Findings, most severe first.
    pub issues: Vec<Issue>,
    /// Heuristic recommendations.
    pub recommendations: Vec<String>,
    /// When the simulation finished.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Knobs for one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Upper bound on steps simulated concurrently within a batch.
    pub max_parallelism: usize,
    /// Fixed RNG seed for reproducible simulations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            seed: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Core simulation
// ---------------------------------------------------------------------------

/// Run the simulation synchronously and produce a report.
#[must_use]
pub fn simulate(
    plan: &ExecutablePlan,
    registry: &MockToolRegistry,
    config: &SimulationConfig,
) -> PreflightReport {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let parallelism = config.max_parallelism.max(1);
    let mut steps = Vec::with_capacity(plan.steps.len());
    let mut issues = Vec::new();
    let mut estimated_duration_ms: u64 = 0;

    for batch in &plan.batches {
        // A batch wider than the parallelism bound executes in waves.
        for wave in batch.chunks(parallelism) {
            let mut wave_latency: u64 = 0;
            for name in wave {
                let Some(step) = plan.step(name) else { continue };
                let mock = registry.get(&step.tool);
                if !registry.contains(&step.tool) {
                    issues.push(Issue {
                        severity: IssueSeverity::Info,
                        step: Some(step.name.clone()),
                        message: format!("no mock registered for tool '{}'; using defaults", step.tool),
                    });
                }

                let jitter: f64 = rng.gen_range(0.7..=1.3);
                let latency = (mock.base_latency_ms as f64 * jitter).round() as u64;
                let failed = rng.r#gen::<f64>() < step.risk.failure_probability();

                if failed {
                    let severity = if step.risk >= RiskLevel::High {
                        IssueSeverity::Critical
                    } else {
                        IssueSeverity::Warning
                    };
                    issues.push(Issue {
                        severity,
                        step: Some(step.name.clone()),
                        message: format!(
                            "simulated failure of tool '{}' at {:?} risk",
                            step.tool, step.risk
                        ),
                    });
                }
                if latency > step.timeout_ms {
                    issues.push(Issue {
                        severity: IssueSeverity::Warning,
                        step: Some(step.name.clone()),
                        message: format!(
                            "sampled latency {latency}ms exceeds the step timeout {}ms",
                            step.timeout_ms
                        ),
                    });
                }

                wave_latency = wave_latency.max(latency);
                steps.push(StepReport {
                    step: step.name.clone(),
                    tool: step.tool.clone(),
                    risk: step.risk,
                    simulated_latency_ms: latency,
                    succeeded: !failed,
                    output: if failed {
                        serde_json::Value::Null
                    } else {
                        mock.response.clone()
                    },
                });
            }
            estimated_duration_ms += wave_latency;
        }
    }

    if let Some(max_secs) = plan.security.max_duration_secs {
        if estimated_duration_ms > max_secs * 1_000 {
            issues.push(Issue {
                severity: IssueSeverity::Critical,
                step: None,
                message: format!(
                    "estimated duration {estimated_duration_ms}ms exceeds the security cap {max_secs}s"
                ),
            });
        }
    }

    let overall_risk = plan
        .steps
        .iter()
        .map(|s| s.risk)
        .max()
        .unwrap_or(RiskLevel::Low);
    let estimated_cost_micros = plan.steps.iter().map(|s| s.resources.est_cost_micros).sum();
    issues.sort_by(|a, b| b.severity.cmp(&a.severity));
    let feasible = !issues.iter().any(|i| i.severity == IssueSeverity::Critical);

    PreflightReport {
        report_id: Uuid::new_v4(),
        plan_hash: plan.plan_hash.clone(),
        tenant_id: plan.tenant_id.clone(),
        steps,
        overall_risk,
        feasible,
        estimated_duration_ms,
        estimated_cost_micros,
        issues,
        recommendations: rules::recommendations(plan),
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Async run tracking
// ---------------------------------------------------------------------------

/// Lifecycle status of an asynchronous simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimStatus {
    /// The run is simulating.
    Running,
    /// The run finished; the report is available.
    Completed,
    /// The run was cancelled before finishing.
    Cancelled,
}

struct SimRun {
    status: SimStatus,
    progress: (u32, u32),
    report: Option<Arc<PreflightReport>>,
    cancel: Arc<AtomicBool>,
    tenant_id: String,
}

/// Simulator service with cancellable asynchronous runs.
#[derive(Clone)]
pub struct PreflightSimulator {
    registry: Arc<MockToolRegistry>,
    runs: Arc<RwLock<HashMap<Uuid, SimRun>>>,
}

impl PreflightSimulator {
    /// Create a simulator over a mock registry.
    #[must_use]
    pub fn new(registry: Arc<MockToolRegistry>) -> Self {
        Self {
            registry,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start an asynchronous simulation; returns the run id immediately.
    #[must_use]
    pub fn start(&self, plan: Arc<ExecutablePlan>, config: SimulationConfig) -> Uuid {
        let run_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let total = plan.steps.len() as u32;

        if let Ok(mut runs) = self.runs.write() {
            runs.insert(
                run_id,
                SimRun {
                    status: SimStatus::Running,
                    progress: (0, total),
                    report: None,
                    cancel: Arc::clone(&cancel),
                    tenant_id: plan.tenant_id.clone(),
                },
            );
        }

        let this = self.clone();
        tokio::spawn(async move {
            // Cancellation is observed between batches, the natural
            // suspension points of the simulation.
            let mut done: u32 = 0;
            for batch in &plan.batches {
                if cancel.load(Ordering::SeqCst) {
                    this.finish(run_id, SimStatus::Cancelled, None);
                    return;
                }
                done += batch.len() as u32;
                this.set_progress(run_id, (done, total));
                tokio::task::yield_now().await;
            }

            let report = Arc::new(simulate(&plan, &this.registry, &config));
            info!(
                target: "acp.preflight",
                run_id = %run_id,
                plan_hash = %report.plan_hash,
                feasible = report.feasible,
                "simulation completed"
            );
            this.finish(run_id, SimStatus::Completed, Some(report));
        });

        run_id
    }

    fn set_progress(&self, run_id: Uuid, progress: (u32, u32)) {
        if let Ok(mut runs) = self.runs.write() {
            if let Some(run) = runs.get_mut(&run_id) {
                run.progress = progress;
            }
        }
    }

    fn finish(&self, run_id: Uuid, status: SimStatus, report: Option<Arc<PreflightReport>>) {
        if let Ok(mut runs) = self.runs.write() {
            if let Some(run) = runs.get_mut(&run_id) {
                run.status = status;
                run.report = report;
            }
        }
    }

    /// Status and progress of a run.
    #[must_use]
    pub fn status(&self, run_id: Uuid) -> Option<(SimStatus, (u32, u32))> {
        let runs = self.runs.read().ok()?;
        runs.get(&run_id).map(|r| (r.status, r.progress))
    }

    /// The tenant a run belongs to.
    #[must_use]
    pub fn tenant_of(&self, run_id: Uuid) -> Option<String> {
        let runs = self.runs.read().ok()?;
        runs.get(&run_id).map(|r| r.tenant_id.clone())
    }

    /// The report of a completed run.
    #[must_use]
    pub fn report(&self, run_id: Uuid) -> Option<Arc<PreflightReport>> {
        let runs = self.runs.read().ok()?;
        runs.get(&run_id).and_then(|r| r.report.clone())
    }

    /// Request cancellation. Idempotent; returns `false` for unknown runs.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let Ok(runs) = self.runs.read() else {
            return false;
        };
        match runs.get(&run_id) {
            Some(run) => {
                debug!(target: "acp.preflight", run_id = %run_id, "cancellation requested");
                run.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// The `events.preflight.completed` event for a report.
    #[must_use]
    pub fn completed_event(&self, report: &PreflightReport, correlation_id: Uuid) -> CloudEvent {
        CloudEvent::for_subject(
            subjects::PREFLIGHT_COMPLETED,
            "acp-preflight",
            &report.tenant_id,
            serde_json::json!({
                "report_id": report.report_id.to_string(),
                "plan_hash": report.plan_hash,
                "feasible": report.feasible,
                "overall_risk": report.overall_risk,
                "correlation_id": correlation_id.to_string(),
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
