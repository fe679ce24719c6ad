#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use task_gateway_collaborators::{
    CollaboratorError, Executor, HttpCollaborators, Planner, Router, Validator,
};
use task_gateway_domain::{
    audit_artifact_uri, derive_idempotency_key, draft_artifact_uri, ensure_non_empty, now_utc,
    AgentResult, ErrorKind, ExecutionStep, PlanResponse, Provenance, RoutingCandidate, TaskSpec,
    TaskStatus, ValidationResult, DEFAULT_ARTIFACT_BASE_URI,
};
use task_gateway_idempotency_core::{
    Claim, IdempotencyStore, TaskRecord, DEFAULT_IN_FLIGHT_TTL, DEFAULT_RESULT_TTL,
};
use task_gateway_policy::AutonomyPolicy;

pub const APPROVAL_MESSAGE: &str = "Task requires approval before execution";

const MIN_LATENCY_MS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub artifact_base_uri: String,
    pub result_ttl: Duration,
    pub in_flight_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            artifact_base_uri: DEFAULT_ARTIFACT_BASE_URI.to_string(),
            result_ttl: DEFAULT_RESULT_TTL,
            in_flight_ttl: DEFAULT_IN_FLIGHT_TTL,
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub router: Arc<dyn Router>,
    pub executor: Arc<dyn Executor>,
    pub validator: Arc<dyn Validator>,
}

impl From<HttpCollaborators> for Collaborators {
    fn from(http: HttpCollaborators) -> Self {
        Self {
            planner: Arc::new(http.planner),
            router: Arc::new(http.router),
            executor: Arc::new(http.executor),
            validator: Arc::new(http.validator),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    Planner,
    Router,
    Executor,
    Validator,
}

impl std::fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Planner => "planner",
            Self::Router => "router",
            Self::Executor => "executor",
            Self::Validator => "validator",
        };
        f.write_str(name)
    }
}

/// Reasons a pipeline ends in `failed`. Recorded on the result, never
/// returned to the caller as an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("planning failed: {0}")]
    PlanningFailed(String),
    #[error("routing failed: {0}")]
    RoutingFailed(String),
    #[error("{collaborator} call failed: {detail}")]
    CollaboratorUnreachable {
        collaborator: CollaboratorKind,
        detail: String,
    },
    #[error("{}", join_failures(.failures))]
    ValidationFailed { failures: Vec<String> },
}

impl PipelineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PlanningFailed(_) => ErrorKind::PlanningFailed,
            Self::RoutingFailed(_) => ErrorKind::RoutingFailed,
            Self::CollaboratorUnreachable { .. } => ErrorKind::CollaboratorUnreachable,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
        }
    }

    fn from_collaborator(collaborator: CollaboratorKind, err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::NoPlanAvailable(detail) => Self::PlanningFailed(detail),
            CollaboratorError::NoCandidates(detail) => Self::RoutingFailed(detail),
            other => Self::CollaboratorUnreachable {
                collaborator,
                detail: other.to_string(),
            },
        }
    }
}

fn join_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        return "validation failed without reported reasons".to_string();
    }
    failures.join(", ")
}

/// Errors that prevent a submission from producing a result at all.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("idempotency key {key} is held by in-flight task {task_id}")]
    SubmissionInFlight { key: String, task_id: String },
    #[error("idempotency store failure: {0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    AwaitingApproval,
}

/// Mutable state of one request between entry and its terminal result.
struct PipelineRun {
    task_id: String,
    started: Instant,
    provenance: Provenance,
    result: Option<Value>,
    draft_artifact: Option<String>,
}

impl PipelineRun {
    fn new(task_id: &str, started: Instant) -> Self {
        Self {
            task_id: task_id.to_string(),
            started,
            provenance: Provenance::new(task_id, now_utc()),
            result: None,
            draft_artifact: None,
        }
    }

    fn finish(mut self, outcome: Result<Terminal, PipelineError>, base_uri: &str) -> AgentResult {
        let (status, error, error_kind) = match outcome {
            Ok(Terminal::Completed) => (TaskStatus::Completed, None, None),
            Ok(Terminal::AwaitingApproval) => (TaskStatus::AwaitingApproval, None, None),
            Err(err) => (TaskStatus::Failed, Some(err.to_string()), Some(err.kind())),
        };

        if status != TaskStatus::AwaitingApproval && !self.provenance.executor_logs.is_empty() {
            self.provenance
                .artifacts
                .push(audit_artifact_uri(base_uri, &self.task_id));
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        self.provenance.latency_ms = elapsed_ms.max(MIN_LATENCY_MS);

        AgentResult {
            task_id: self.task_id,
            status,
            result: self.result,
            artifacts: self.provenance.artifacts.clone(),
            provenance: self.provenance,
            error,
            error_kind,
            draft_artifact: self.draft_artifact,
        }
    }
}

pub struct Orchestrator {
    collaborators: Collaborators,
    policy: Arc<AutonomyPolicy>,
    idempotency: Arc<dyn IdempotencyStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        policy: Arc<AutonomyPolicy>,
        idempotency: Arc<dyn IdempotencyStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            collaborators,
            policy,
            idempotency,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drive a task to a terminal result, or return the cached result for its
    /// idempotency key.
    ///
    /// # Errors
    /// Returns an error when the task is malformed, another request currently
    /// holds the idempotency key, or the idempotency store fails. Collaborator
    /// and validation failures are not errors; they yield a `failed` result.
    pub fn submit(
        &self,
        mut task: TaskSpec,
        idempotency_key: Option<&str>,
    ) -> Result<AgentResult, SubmitError> {
        let started = Instant::now();
        task.validate()
            .map_err(|err| SubmitError::InvalidTask(format!("{err:#}")))?;
        if let Some(key) = idempotency_key {
            ensure_non_empty("idempotency key", key)
                .map_err(|err| SubmitError::InvalidTask(err.to_string()))?;
        }

        let task_id = task.ensure_task_id().to_string();
        let key = idempotency_key.map_or_else(
            || derive_idempotency_key(&task_id, &task.description),
            str::to_string,
        );

        match self
            .idempotency
            .begin(&key, &task_id, self.config.in_flight_ttl)
            .map_err(SubmitError::Store)?
        {
            Claim::Completed(cached) => {
                tracing::info!(
                    task_id = %cached.task_id,
                    idempotency_key = %key,
                    status = cached.status.as_str(),
                    "returning stored result"
                );
                return Ok(*cached);
            }
            Claim::InFlight { task_id: holder } => {
                tracing::warn!(idempotency_key = %key, task_id = %holder, "submission already in flight");
                return Err(SubmitError::SubmissionInFlight { key, task_id: holder });
            }
            Claim::Acquired => {}
        }

        tracing::info!(task_id = %task_id, idempotency_key = %key, task_type = task.task_type.as_str(), "task received");
        let mut run = PipelineRun::new(&task_id, started);
        let outcome = self.advance(&task, &mut run);
        if let Err(err) = &outcome {
            tracing::warn!(task_id = %task_id, error_kind = err.kind().as_str(), error = %err, "pipeline failed");
        }
        let result = run.finish(outcome, &self.config.artifact_base_uri);

        self.idempotency
            .store(&key, &result, self.config.result_ttl)
            .map_err(SubmitError::Store)?;

        tracing::info!(
            task_id = %task_id,
            status = result.status.as_str(),
            retries = result.provenance.retries,
            latency_ms = result.provenance.latency_ms,
            "task finished"
        );
        Ok(result)
    }

    /// Latest live record for `task_id`: a stored result or an in-flight marker.
    ///
    /// # Errors
    /// Returns an error when the idempotency store fails.
    pub fn task_record(&self, task_id: &str) -> Result<Option<TaskRecord>, SubmitError> {
        self.idempotency
            .lookup_task(task_id)
            .map_err(SubmitError::Store)
    }

    fn advance(&self, task: &TaskSpec, run: &mut PipelineRun) -> Result<Terminal, PipelineError> {
        log_stage(run, TaskStatus::Planning);
        let plan = self
            .collaborators
            .planner
            .plan(task)
            .map_err(|err| PipelineError::from_collaborator(CollaboratorKind::Planner, err))?;
        run.provenance.plan = Some(plan.clone());
        if plan.steps.is_empty() {
            return Err(PipelineError::PlanningFailed(
                "no execution plan generated".to_string(),
            ));
        }

        log_stage(run, TaskStatus::Routing);
        let decision = self
            .collaborators
            .router
            .route(task, &plan.candidate_skill_ids())
            .map_err(|err| PipelineError::from_collaborator(CollaboratorKind::Router, err))?;
        run.provenance.router_decision = Some(decision.clone());

        let primary_step = planned_step(&plan, &decision.primary, "primary")?;
        run.provenance.total_cost = decision.primary.estimated_cost;

        if self.policy.requires_approval(task, &decision.primary.skill_id) {
            tracing::info!(task_id = %run.task_id, skill_id = %decision.primary.skill_id, "approval required");
            run.result = Some(json!({ "message": APPROVAL_MESSAGE }));
            run.draft_artifact = Some(draft_artifact_uri(
                &self.config.artifact_base_uri,
                &run.task_id,
            ));
            return Ok(Terminal::AwaitingApproval);
        }

        let first = self.execute_and_validate(task, primary_step, run)?;
        if first.passed {
            return Ok(Terminal::Completed);
        }

        let Some(alternate) = decision.alternates.first() else {
            return Err(PipelineError::ValidationFailed {
                failures: first.failures,
            });
        };
        let fallback_step = planned_step(&plan, alternate, "alternate")?;
        tracing::info!(
            task_id = %run.task_id,
            from_skill = %decision.primary.skill_id,
            to_skill = %alternate.skill_id,
            "validation failed, falling back to alternate skill"
        );

        let second = self.execute_and_validate(task, fallback_step, run)?;
        if second.passed {
            Ok(Terminal::Completed)
        } else {
            Err(PipelineError::ValidationFailed {
                failures: second.failures,
            })
        }
    }

    fn execute_and_validate(
        &self,
        task: &TaskSpec,
        step: &ExecutionStep,
        run: &mut PipelineRun,
    ) -> Result<ValidationResult, PipelineError> {
        log_stage(run, TaskStatus::Executing);
        let response = self
            .collaborators
            .executor
            .execute(step, &task.context)
            .map_err(|err| PipelineError::from_collaborator(CollaboratorKind::Executor, err))?;
        // A missing executor result is stored as absent and validated as `{}`.
        let result = if response.result.is_null() {
            run.result = None;
            json!({})
        } else {
            run.result = Some(response.result.clone());
            response.result.clone()
        };
        if !run.provenance.executor_logs.is_empty() {
            run.provenance.retries += 1;
        }
        run.provenance.record_execution(response);

        log_stage(run, TaskStatus::Validating);
        let validation = self
            .collaborators
            .validator
            .validate(&result, &task.constraints, task.task_type)
            .map_err(|err| PipelineError::from_collaborator(CollaboratorKind::Validator, err))?;
        run.provenance.validator_results.push(validation.clone());
        Ok(validation)
    }
}

fn log_stage(run: &PipelineRun, stage: TaskStatus) {
    tracing::debug!(task_id = %run.task_id, stage = stage.as_str(), "pipeline stage");
}

/// The planned step a routing candidate refers to. A candidate outside the
/// plan, or with malformed estimates, is a routing contract violation.
fn planned_step<'p>(
    plan: &'p PlanResponse,
    candidate: &RoutingCandidate,
    role: &str,
) -> Result<&'p ExecutionStep, PipelineError> {
    candidate
        .ensure_usable()
        .map_err(|err| PipelineError::RoutingFailed(format!("{role} candidate unusable: {err}")))?;
    plan.step_for_skill(&candidate.skill_id).ok_or_else(|| {
        PipelineError::RoutingFailed(format!(
            "{role} skill {} matches no planned step",
            candidate.skill_id
        ))
    })
}
