//! Workflow orchestrator
//!
//! Top-level `run()`: fingerprints the configuration, resolves an existing
//! run (resume) or creates a fresh one, binds the PRISMA counter and
//! checkpoint store, drives the phase executor, evaluates the reliability
//! gates, and finalizes the registry entry. A heartbeat task stamps the
//! registry every ~60 s so observers can tell live runs from crashed ones.

use crate::config::ReviewConfig;
use crate::context::RunContext;
use crate::error::{ErrorKind, ReviewError, ReviewResult};
use crate::executor::{ExecutionError, PhaseExecutor, PhaseReport};
use crate::gates::{CapabilityContract, GateResult, ReliabilityGates};
use crate::phases::standard_registry;
use crate::prisma::{PrismaCounter, PrismaCounts};
use crate::providers::ProviderSet;
use crate::registry::PhaseRegistry;
use crate::state::checkpoint::{self, CheckpointStore, RunSummary};
use crate::state::run_registry::{RunRegistry, RunStatus};
use crate::state::{RunId, WorkflowState};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Structured report for a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    /// Phase that failed, when attributable
    pub phase: Option<String>,
    pub kind: String,
    pub message: String,
    /// Most advanced phase with a durable checkpoint
    pub last_checkpoint: Option<String>,
}

/// Outcome of one `run()` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub resumed: bool,
    pub reports: Vec<PhaseReport>,
    pub gate_results: Vec<GateResult>,
    pub warnings: Vec<String>,
    pub prisma: PrismaCounts,
    pub failure: Option<FailureReport>,
}

/// Binds registry, executor, state store, and PRISMA counter for a config.
pub struct Orchestrator {
    config: Arc<ReviewConfig>,
    providers: Arc<ProviderSet>,
    registry: PhaseRegistry,
}

impl Orchestrator {
    /// Standard pipeline over the given providers.
    pub fn new(config: ReviewConfig, providers: ProviderSet) -> Self {
        Self::with_registry(config, providers, standard_registry())
    }

    /// Custom phase table (tests, partial pipelines).
    pub fn with_registry(
        config: ReviewConfig,
        providers: ProviderSet,
        registry: PhaseRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            providers: Arc::new(providers),
            registry,
        }
    }

    /// Execute the pipeline to completion, resuming when possible.
    ///
    /// Returns `Err` only for configuration and registry-bootstrap
    /// problems; phase failures, gate failures, and cancellation land in
    /// the returned [`RunResult`].
    pub async fn run(&self, cancel: CancellationToken) -> ReviewResult<RunResult> {
        self.config.validate()?;
        let order = self.registry.execution_order()?;
        let fingerprint = self.config.fingerprint();
        let topic = self.config.context.topic.clone();
        let run_registry = Arc::new(RunRegistry::open(&self.config.run_root)?);
        let prisma = Arc::new(PrismaCounter::new());

        let (store, state, resumed) = self.resolve_run(&run_registry, &fingerprint, &prisma, &order)?;
        let run_id = store.run_id();
        run_registry.register(
            run_id,
            &topic,
            &fingerprint,
            store.run_dir(),
            RunStatus::Running,
        )?;
        info!(run_id = %run_id, topic = %topic, resumed, "run started");

        let heartbeat_cancel = cancel.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            run_registry.clone(),
            run_id,
            Duration::from_secs(self.config.heartbeat_secs),
            heartbeat_cancel.clone(),
        ));

        let ctx = RunContext::new(
            self.config.clone(),
            self.providers.clone(),
            prisma.clone(),
            store.run_dir().to_path_buf(),
            cancel,
        );
        let executor = PhaseExecutor::new(&self.registry, &store);
        let execution = executor.execute(&ctx, state).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        let result = match execution {
            Ok(outcome) => self.finalize_success(
                run_id,
                resumed,
                outcome.reports,
                &outcome.state,
                &prisma,
                &store,
                &run_registry,
            )?,
            Err(failure) => {
                self.finalize_failure(run_id, resumed, failure, &prisma, &store, &run_registry)?
            }
        };
        info!(run_id = %run_id, status = %result.status, "run finished");
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize_success(
        &self,
        run_id: RunId,
        resumed: bool,
        reports: Vec<PhaseReport>,
        state: &WorkflowState,
        prisma: &PrismaCounter,
        store: &CheckpointStore,
        run_registry: &RunRegistry,
    ) -> ReviewResult<RunResult> {
        let checkpoint_resume_enabled = self.config.resume;
        let gates = ReliabilityGates::from_settings(&self.config.gates);
        let gate_results = gates.run(
            state,
            checkpoint_resume_enabled,
            self.providers.cost.total(),
        );
        let contract = CapabilityContract::default().validate(state, checkpoint_resume_enabled);

        let failing: Vec<&GateResult> = gate_results.iter().filter(|g| !g.passed).collect();
        let mut warnings: Vec<String> = failing
            .iter()
            .map(|g| format!("gate '{}' failed: {}", g.gate, g.details))
            .collect();
        warnings.extend(
            contract
                .missing
                .iter()
                .map(|c| format!("missing capability: {}", c)),
        );

        if self.config.gates.strict && !warnings.is_empty() {
            let failure = match failing.first() {
                Some(gate) => ReviewError::GateFailed {
                    gate: gate.gate.clone(),
                    details: gate.details.clone(),
                },
                None => ReviewError::GateFailed {
                    gate: "capability_contract".to_string(),
                    details: contract.missing.join(", "),
                },
            };
            error!(error = %failure, "strict gates rejected the run");
            run_registry.update_status(run_id, RunStatus::Failed)?;
            return Ok(RunResult {
                run_id,
                status: RunStatus::Failed,
                resumed,
                reports,
                gate_results,
                warnings,
                prisma: prisma.counts(),
                failure: Some(FailureReport {
                    phase: None,
                    kind: ErrorKind::Validation.to_string(),
                    message: failure.to_string(),
                    last_checkpoint: self.last_checkpoint(store),
                }),
            });
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        run_registry.update_status(run_id, RunStatus::Completed)?;
        Ok(RunResult {
            run_id,
            status: RunStatus::Completed,
            resumed,
            reports,
            gate_results,
            warnings,
            prisma: prisma.counts(),
            failure: None,
        })
    }

    fn finalize_failure(
        &self,
        run_id: RunId,
        resumed: bool,
        failure: ExecutionError,
        prisma: &PrismaCounter,
        store: &CheckpointStore,
        run_registry: &RunRegistry,
    ) -> ReviewResult<RunResult> {
        let status = if failure.kind == ErrorKind::Cancelled {
            RunStatus::Aborted
        } else {
            RunStatus::Failed
        };
        run_registry.update_status(run_id, status)?;
        error!(
            phase = failure.phase.as_deref().unwrap_or("-"),
            kind = %failure.kind,
            error = %failure.error,
            "run failed; completed checkpoints remain for resume"
        );
        Ok(RunResult {
            run_id,
            status,
            resumed,
            reports: vec![],
            gate_results: vec![],
            warnings: vec![],
            prisma: prisma.counts(),
            failure: Some(FailureReport {
                phase: failure.phase,
                kind: failure.kind.to_string(),
                message: failure.error.to_string(),
                last_checkpoint: self.last_checkpoint(store),
            }),
        })
    }

    /// Most advanced checkpointed phase, by registry ordinal.
    fn last_checkpoint(&self, store: &CheckpointStore) -> Option<String> {
        let ordinals = self.registry.ordinals();
        store
            .checkpointed_phases()
            .into_iter()
            .filter(|phase| ordinals.contains_key(phase))
            .max_by_key(|phase| ordinals[phase])
    }

    /// Resolve an existing run (explicit run ID, registry lookup, or
    /// checkpoint-scan fallback) or create a fresh one.
    fn resolve_run(
        &self,
        run_registry: &RunRegistry,
        fingerprint: &str,
        prisma: &Arc<PrismaCounter>,
        order: &[String],
    ) -> ReviewResult<(CheckpointStore, WorkflowState, bool)> {
        let topic = &self.config.context.topic;

        if let Some(id) = &self.config.resume_run_id {
            let run_id = RunId::parse_str(id)?;
            if run_registry.find_by_run_id_with_fallback(run_id)?.is_none() {
                return Err(ReviewError::Config(format!(
                    "run '{}' not found in registry or on disk",
                    run_id
                )));
            }
            let (store, state) = self.hydrate(run_id, prisma, order)?;
            return Ok((store, state, true));
        }

        if self.config.resume {
            if let Some(entry) = run_registry
                .find_by_topic(topic, Some(fingerprint))?
                .into_iter()
                .next()
            {
                let (store, state) = self.hydrate(entry.run_id, prisma, order)?;
                return Ok((store, state, true));
            }
            // Registry row may be missing for runs that predate it; fall
            // back to scanning checkpoints on disk.
            if let Some(candidate) =
                checkpoint::find_by_topic(&self.config.run_root, topic, &self.registry.ordinals())?
            {
                if self.fingerprint_matches(candidate.run_id, fingerprint)? {
                    info!(
                        run_id = %candidate.run_id,
                        completeness = candidate.completeness,
                        latest = %candidate.latest_phase,
                        "resuming run discovered by checkpoint scan"
                    );
                    let (store, state) = self.hydrate(candidate.run_id, prisma, order)?;
                    return Ok((store, state, true));
                }
            }
        }

        let run_id = RunId::new();
        let store = CheckpointStore::create(&self.config.run_root, run_id)?;
        store.write_summary(&RunSummary {
            run_id,
            topic: topic.clone(),
            fingerprint: fingerprint.to_string(),
            start_time: Utc::now(),
            log_dir: None,
        })?;
        Ok((store, WorkflowState::default(), false))
    }

    /// Same topic but different fingerprint means a distinct run; only
    /// resume scan candidates whose recorded fingerprint matches (legacy
    /// runs without a summary are accepted).
    fn fingerprint_matches(&self, run_id: RunId, fingerprint: &str) -> ReviewResult<bool> {
        let store = CheckpointStore::open(&self.config.run_root, run_id)?;
        match store.read_summary()? {
            Some(summary) => Ok(summary.fingerprint == fingerprint),
            None => Ok(true),
        }
    }

    fn hydrate(
        &self,
        run_id: RunId,
        prisma: &Arc<PrismaCounter>,
        order: &[String],
    ) -> ReviewResult<(CheckpointStore, WorkflowState)> {
        let store = CheckpointStore::open(&self.config.run_root, run_id)?;
        let present: BTreeSet<String> = store.checkpointed_phases().into_iter().collect();
        let chain: Vec<String> = order
            .iter()
            .filter(|phase| present.contains(*phase))
            .cloned()
            .collect();
        let (state, latest) = store.load_chain(&chain)?;
        if let Some(latest) = &latest {
            prisma.restore(latest.prisma_counts.clone())?;
        }
        info!(
            run_id = %run_id,
            phases_present = chain.len(),
            latest = latest.as_ref().map(|c| c.phase.as_str()).unwrap_or("-"),
            "hydrated state from checkpoints"
        );
        Ok((store, state))
    }
}

async fn heartbeat_loop(
    registry: Arc<RunRegistry>,
    run_id: RunId,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = registry.update_heartbeat(run_id) {
                    warn!(error = %e, "heartbeat update failed");
                }
            }
        }
    }
}
