//! Dependency-ordered phase execution with an error boundary
//!
//! The executor walks the registry in execution order, gates each phase on
//! its dependencies and enabled predicate, runs the handler inside an
//! error boundary, and checkpoints completed phases. No phase handler
//! begins until all of its dependencies have completed.

use crate::context::RunContext;
use crate::error::{ErrorKind, ReviewError};
use crate::registry::{PhaseDefinition, PhaseRegistry};
use crate::state::checkpoint::{CheckpointStore, PhaseCheckpoint};
use crate::state::WorkflowState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Why a phase was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A valid checkpoint for this phase was already loaded
    AlreadyDone,
    /// The phase's enabled predicate returned false
    Disabled,
    /// The phase ordinal is below the requested start point
    BeforeStart,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::AlreadyDone => "already done",
            SkipReason::Disabled => "disabled",
            SkipReason::BeforeStart => "before start",
        };
        write!(f, "{}", s)
    }
}

/// Terminal status of one phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

/// Per-phase outcome surfaced on the run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

/// A failure attributed to a specific phase.
#[derive(Debug)]
pub struct ExecutionError {
    pub phase: Option<String>,
    pub kind: ErrorKind,
    pub error: ReviewError,
}

impl ExecutionError {
    fn in_phase(phase: &str, error: ReviewError) -> Self {
        Self {
            phase: Some(phase.to_string()),
            kind: error.kind(),
            error,
        }
    }
}

impl From<ReviewError> for ExecutionError {
    fn from(error: ReviewError) -> Self {
        Self {
            phase: None,
            kind: error.kind(),
            error,
        }
    }
}

/// Successful traversal of the whole registry.
pub struct ExecutionOutcome {
    pub reports: Vec<PhaseReport>,
    pub state: WorkflowState,
}

/// Executes phases against one run's checkpoint store.
pub struct PhaseExecutor<'a> {
    registry: &'a PhaseRegistry,
    store: &'a CheckpointStore,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(registry: &'a PhaseRegistry, store: &'a CheckpointStore) -> Self {
        Self { registry, store }
    }

    /// Traverse the registry in dependency order, starting from the given
    /// accumulated state (hydrated from checkpoints on resume).
    pub async fn execute(
        &self,
        ctx: &RunContext,
        mut state: WorkflowState,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let order = self.registry.execution_order()?;
        let mut reports = Vec::with_capacity(order.len());

        for name in order {
            let phase = self
                .registry
                .get(&name)
                .ok_or_else(|| ReviewError::Internal(format!("phase '{}' vanished", name)))?;

            if state.completed_phases.contains(&name) {
                info!(phase = %name, "checkpoint present, skipping");
                reports.push(skip(&name, SkipReason::AlreadyDone));
                continue;
            }

            if let Some(start) = ctx.config.start_from {
                if phase.ordinal < start {
                    info!(phase = %name, start_from = start, "before start point, skipping");
                    reports.push(skip(&name, SkipReason::BeforeStart));
                    continue;
                }
            }

            let missing: Vec<String> = phase
                .dependencies
                .iter()
                .filter(|dep| !state.completed_phases.contains(*dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(ExecutionError::in_phase(
                    &name,
                    ReviewError::DependencyUnmet {
                        phase: name.clone(),
                        missing,
                    },
                ));
            }

            if !phase.is_enabled(&ctx.config) {
                info!(phase = %name, "disabled by configuration, skipping");
                reports.push(skip(&name, SkipReason::Disabled));
                continue;
            }

            match self.run_boundary(ctx, phase, &state).await {
                Ok(payload) => {
                    state.apply(&payload);
                    if phase.checkpoint {
                        let checkpoint = PhaseCheckpoint {
                            phase: name.clone(),
                            run_id: self.store.run_id(),
                            timestamp: Utc::now(),
                            dependencies: phase.dependencies.iter().cloned().collect(),
                            topic_context: ctx.config.context.clone(),
                            data: payload,
                            prisma_counts: ctx.prisma.counts(),
                            database_breakdown: ctx.prisma.by_database(),
                        };
                        self.store
                            .save(&checkpoint)
                            .map_err(|e| ExecutionError::in_phase(&name, e))?;
                    }
                    info!(phase = %name, "phase completed");
                    reports.push(PhaseReport {
                        phase: name.clone(),
                        status: PhaseStatus::Completed,
                        detail: None,
                    });
                }
                Err(e) => {
                    let kind = e.kind();
                    error!(phase = %name, kind = %kind, error = %e, "phase failed");
                    match kind {
                        // Cancelled phases are never checkpointed and abort
                        // the run regardless of `required`.
                        ErrorKind::Cancelled => {
                            return Err(ExecutionError::in_phase(&name, ReviewError::Cancelled));
                        }
                        // Corrupt state is fatal even for optional phases.
                        ErrorKind::Data => {
                            return Err(ExecutionError::in_phase(&name, e));
                        }
                        _ => {
                            if phase.required {
                                return Err(ExecutionError::in_phase(&name, e));
                            }
                            warn!(phase = %name, "optional phase failed, continuing");
                            reports.push(PhaseReport {
                                phase: name.clone(),
                                status: PhaseStatus::Failed,
                                detail: Some(e.to_string()),
                            });
                        }
                    }
                }
            }
        }

        Ok(ExecutionOutcome { reports, state })
    }

    /// Error boundary: normalize handler errors, never checkpoint a
    /// failure, refuse to start work on a cancelled run.
    async fn run_boundary(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        state: &WorkflowState,
    ) -> Result<crate::state::PhasePayload, ReviewError> {
        ctx.ensure_active()?;
        info!(phase = %phase.name, "executing phase");
        phase.handler.run(ctx, state).await
    }
}

fn skip(phase: &str, reason: SkipReason) -> PhaseReport {
    PhaseReport {
        phase: phase.to_string(),
        status: PhaseStatus::Skipped,
        detail: Some(reason.to_string()),
    }
}
