// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan compiler: validated capsules in, content-addressed plans out.
//!
//! Compilation is deterministic end to end (the same capsule always
//! produces the same `plan_hash`, across processes and time) and compiled
//! plans are cached by hash with O(1) lookup.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Plan optimization: ordering, batching, risk, resources.
pub mod optimize;
/// Transitive capsule dependency resolution.
pub mod resolve;
/// Capsule validation: YAML, structure, business rules.
pub mod validate;

pub use resolve::{CapsuleRegistry, MemoryRegistry};

use acp_core::plan::ExecutablePlan;
use acp_core::{Capsule, CloudEvent, subjects};
use acp_error::ErrorCode;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from capsule compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The capsule source is not valid YAML for a definition.
    #[error("capsule yaml invalid: {0}")]
    Yaml(String),

    /// One or more business rules failed.
    #[error("capsule validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A dependency reference has no registered capsule.
    #[error("dependency not found: {0}")]
    DependencyNotFound(String),

    /// Capsule dependencies form a cycle.
    #[error("dependency cycle through {0}")]
    CycleDetected(String),

    /// The compiled payload could not be canonicalized for hashing.
    #[error("plan hashing failed: {0}")]
    Hashing(String),
}

impl CompileError {
    /// The stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Yaml(_) | Self::Validation(_) => ErrorCode::InvalidCapsule,
            Self::DependencyNotFound(_) => ErrorCode::DependencyNotFound,
            Self::CycleDetected(_) => ErrorCode::CycleDetected,
            Self::Hashing(_) => ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of a successful compilation.
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    /// The deterministic plan hash.
    pub plan_hash: String,
    /// The compiled plan.
    pub plan: Arc<ExecutablePlan>,
    /// Transitive dependency references confirmed during resolution.
    pub resolved_dependencies: Vec<String>,
    /// Whether the plan was served from the cache.
    pub cache_hit: bool,
}

// ---------------------------------------------------------------------------
// Async job tracking
// ---------------------------------------------------------------------------

/// Status of an asynchronous compile job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// The job has been accepted but not started.
    Queued,
    /// The job is compiling.
    Running,
    /// The job finished; the plan is in the cache under this hash.
    Completed {
        /// Hash of the compiled plan.
        plan_hash: String,
    },
    /// The job failed.
    Failed {
        /// Why compilation failed.
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// The plan compiler service.
///
/// Cheap to clone; every clone shares the cache, registry handle, and job
/// table.
#[derive(Clone)]
pub struct PlanCompiler {
    registry: Arc<dyn CapsuleRegistry>,
    cache: Arc<RwLock<HashMap<String, Arc<ExecutablePlan>>>>,
    jobs: Arc<RwLock<HashMap<Uuid, JobStatus>>>,
}

impl PlanCompiler {
    /// Create a compiler over a capsule registry.
    #[must_use]
    pub fn new(registry: Arc<dyn CapsuleRegistry>) -> Self {
        Self {
            registry,
            cache: Arc::new(RwLock::new(HashMap::new())),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Compile a capsule into an executable plan.
    ///
    /// Cached plans are returned without recompiling; cache writes are
    /// deduplicated by hash, so concurrent compiles of the same capsule
    /// settle on one stored plan.
    ///
    /// # Errors
    ///
    /// See [`CompileError`] for the failure stages.
    pub fn compile(&self, capsule: &Capsule) -> Result<CompileOutcome, CompileError> {
        validate::validate(&capsule.definition)?;
        let resolved_dependencies = resolve::resolve_dependencies(self.registry.as_ref(), capsule)?;

        let (steps, batches) = optimize::compile_steps(&capsule.definition);
        let tool_allowlist: BTreeSet<String> = steps.iter().map(|s| s.tool.clone()).collect();

        let mut plan = ExecutablePlan {
            plan_hash: String::new(),
            tenant_id: capsule.tenant_id.clone(),
            capsule_ref: capsule.reference(),
            steps,
            batches,
            tool_allowlist,
            security: capsule.definition.security.clone(),
        };
        plan.plan_hash = plan
            .compute_hash()
            .map_err(|e| CompileError::Hashing(e.to_string()))?;
        let plan_hash = plan.plan_hash.clone();

        // Fast path: another compile already stored this plan.
        if let Some(cached) = self.get(&plan_hash) {
            debug!(target: "acp.compiler", plan_hash, "plan cache hit");
            return Ok(CompileOutcome {
                plan_hash,
                plan: cached,
                resolved_dependencies,
                cache_hit: true,
            });
        }

        let plan = Arc::new(plan);
        if let Ok(mut cache) = self.cache.write() {
            // Deduplicated by hash: first writer wins, identical content anyway.
            cache.entry(plan_hash.clone()).or_insert_with(|| Arc::clone(&plan));
        }

        info!(
            target: "acp.compiler",
            plan_hash,
            capsule = %plan.capsule_ref,
            steps = plan.steps.len(),
            "capsule compiled"
        );
        Ok(CompileOutcome {
            plan_hash,
            plan,
            resolved_dependencies,
            cache_hit: false,
        })
    }

    /// Parse YAML source into a capsule for `tenant_id` and compile it.
    ///
    /// # Errors
    ///
    /// See [`CompileError`].
    pub fn compile_yaml(&self, tenant_id: &str, source: &str) -> Result<CompileOutcome, CompileError> {
        let definition = validate::parse_yaml(source)?;
        let capsule = Capsule::from_definition(tenant_id, definition)
            .map_err(|e| CompileError::Hashing(e.to_string()))?;
        self.compile(&capsule)
    }

    /// Look up a compiled plan by hash. O(1).
    #[must_use]
    pub fn get(&self, plan_hash: &str) -> Option<Arc<ExecutablePlan>> {
        self.cache.read().ok()?.get(plan_hash).cloned()
    }

    /// Insert an externally supplied plan (e.g. an inline plan on execute)
    /// after re-verifying its hash.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::Hashing`] when the stored hash does not match
    /// the recomputed hash.
    pub fn admit(&self, plan: ExecutablePlan) -> Result<Arc<ExecutablePlan>, CompileError> {
        if !plan.hash_valid().map_err(|e| CompileError::Hashing(e.to_string()))? {
            return Err(CompileError::Hashing("plan hash mismatch".into()));
        }
        let hash = plan.plan_hash.clone();
        let plan = Arc::new(plan);
        if let Ok(mut cache) = self.cache.write() {
            cache.entry(hash).or_insert_with(|| Arc::clone(&plan));
        }
        Ok(plan)
    }

    /// Number of cached plans.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// The `events.plan.compiled` event for a compilation outcome.
    #[must_use]
    pub fn compiled_event(&self, outcome: &CompileOutcome, correlation_id: Uuid) -> CloudEvent {
        CloudEvent::for_subject(
            subjects::PLAN_COMPILED,
            "acp-compiler",
            &outcome.plan.tenant_id,
            serde_json::json!({
                "plan_hash": outcome.plan_hash,
                "capsule_ref": outcome.plan.capsule_ref,
                "correlation_id": correlation_id.to_string(),
                "cache_hit": outcome.cache_hit,
            }),
        )
    }

    // -- async jobs ---------------------------------------------------------

    /// Submit a compile job; returns immediately with a job id.
    #[must_use]
    pub fn submit(&self, capsule: Capsule) -> Uuid {
        let job_id = Uuid::new_v4();
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job_id, JobStatus::Queued);
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(mut jobs) = this.jobs.write() {
                jobs.insert(job_id, JobStatus::Running);
            }
            let status = match this.compile(&capsule) {
                Ok(outcome) => JobStatus::Completed {
                    plan_hash: outcome.plan_hash,
                },
                Err(err) => JobStatus::Failed {
                    error: err.to_string(),
                },
            };
            if let Ok(mut jobs) = this.jobs.write() {
                jobs.insert(job_id, status);
            }
        });
        job_id
    }

    /// Status of a previously submitted job.
    #[must_use]
    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.read().ok()?.get(&job_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
