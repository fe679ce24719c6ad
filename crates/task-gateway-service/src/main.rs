#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Args as ClapArgs, Parser};
use serde::Serialize;
use serde_json::json;
use task_gateway_collaborators::{CollaboratorEndpoints, HttpCollaborators};
use task_gateway_domain::{AgentResult, TaskSpec, TaskStatus, DEFAULT_ARTIFACT_BASE_URI};
use task_gateway_idempotency_core::{IdempotencyStore, TaskRecord};
use task_gateway_idempotency_sqlite::SqliteIdempotencyStore;
use task_gateway_orchestrator::{Collaborators, Orchestrator, OrchestratorConfig, SubmitError};
use task_gateway_policy::{load_policy_from_path, AutonomyPolicy};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "task-gateway.v1";
const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

#[derive(Clone)]
struct ServiceState {
    orchestrator: Arc<Orchestrator>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    service_contract_version: &'static str,
    status: &'static str,
    timeout_ms: u64,
    result_ttl_secs: u64,
    in_flight_ttl_secs: u64,
    telemetry: ServiceTelemetrySnapshot,
}

/// Body of `GET /v1/tasks/:task_id`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum TaskView {
    Stored(Box<AgentResult>),
    Pending { task_id: String, status: &'static str },
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    submission_in_flight_total: AtomicU64,
    task_not_found_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    tasks_completed_total: AtomicU64,
    tasks_failed_total: AtomicU64,
    tasks_awaiting_approval_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    submission_in_flight_total: u64,
    task_not_found_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    tasks_completed_total: u64,
    tasks_failed_total: u64,
    tasks_awaiting_approval_total: u64,
}

#[derive(Debug, Clone, ClapArgs)]
struct CollaboratorArgs {
    #[arg(long, env = "PLANNER_URL", default_value = "http://planner:8001")]
    planner_url: String,
    #[arg(long, env = "ROUTER_URL", default_value = "http://router:8002")]
    router_url: String,
    #[arg(long, env = "EXECUTOR_URL", default_value = "http://executor:8003")]
    executor_url: String,
    #[arg(long, env = "VALIDATOR_URL", default_value = "http://validator:8004")]
    validator_url: String,
    #[arg(long, env = "COLLABORATOR_TIMEOUT_MS", default_value_t = 30_000)]
    collaborator_timeout_ms: u64,
}

impl CollaboratorArgs {
    fn endpoints(&self) -> CollaboratorEndpoints {
        CollaboratorEndpoints {
            planner_url: self.planner_url.clone(),
            router_url: self.router_url.clone(),
            executor_url: self.executor_url.clone(),
            validator_url: self.validator_url.clone(),
            timeout_ms: self.collaborator_timeout_ms,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "task-gateway-service")]
#[command(about = "HTTP front door for the task orchestration pipeline")]
struct Args {
    #[arg(long, env = "TASK_GATEWAY_DB", default_value = "./task_gateway.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "TASK_GATEWAY_BIND", default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    #[arg(long, env = "AUTONOMY_POLICY")]
    autonomy_policy: Option<PathBuf>,
    #[command(flatten)]
    collaborators: CollaboratorArgs,
    /// Upper bound for one submission, covering up to four collaborator calls.
    #[arg(long, default_value_t = 150_000)]
    operation_timeout_ms: u64,
    #[arg(long, env = "IDEMPOTENCY_TTL_SECS", default_value_t = 3600)]
    idempotency_ttl_secs: u64,
    #[arg(long, default_value_t = 600)]
    in_flight_ttl_secs: u64,
    #[arg(long, env = "ARTIFACT_BASE_URI", default_value = DEFAULT_ARTIFACT_BASE_URI)]
    artifact_base_uri: String,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            rejection.body_text(),
            Some(json!({
                "rejection": rejection.to_string(),
                "rejection_status": rejection.status().as_u16(),
            })),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn validation_error_with_telemetry(&self, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
    }

    fn classify_submit_error(err: &SubmitError) -> ServiceFailure {
        match err {
            SubmitError::InvalidTask(message) => Self::failure(
                StatusCode::BAD_REQUEST,
                "validation_error",
                message.clone(),
                None,
            ),
            SubmitError::SubmissionInFlight { key, task_id } => Self::failure(
                StatusCode::CONFLICT,
                "submission_in_flight",
                err.to_string(),
                Some(json!({ "idempotency_key": key, "task_id": task_id })),
            ),
            SubmitError::Store(_) => Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "idempotency_store_unavailable",
                err.to_string(),
                None,
            ),
        }
    }

    /// Run a blocking orchestrator call off the async runtime, bounded by the
    /// operation timeout. The worker keeps running after a timeout; its
    /// result still lands in the idempotency store.
    async fn run_blocking<T, F>(
        &self,
        timeout_status: StatusCode,
        timeout_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Orchestrator>) -> Result<T, SubmitError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::task::spawn_blocking(move || op(orchestrator));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(timeout_code, true);
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                    "operation timed out"
                );
                Self::failure(
                    timeout_status,
                    timeout_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "blocking worker failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_submit_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "submission_in_flight" => {
                self.submission_in_flight_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            "task_not_found" => {
                self.task_not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "idempotency_store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_outcome(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Completed => &self.tasks_completed_total,
            TaskStatus::Failed => &self.tasks_failed_total,
            TaskStatus::AwaitingApproval => &self.tasks_awaiting_approval_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            submission_in_flight_total: self.submission_in_flight_total.load(Ordering::Relaxed),
            task_not_found_total: self.task_not_found_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            tasks_completed_total: self.tasks_completed_total.load(Ordering::Relaxed),
            tasks_failed_total: self.tasks_failed_total.load(Ordering::Relaxed),
            tasks_awaiting_approval_total: self
                .tasks_awaiting_approval_total
                .load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/:task_id", get(task_show))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn build_state(args: &Args) -> Result<ServiceState> {
    let store = SqliteIdempotencyStore::open(&args.db)?;
    store
        .migrate()
        .context("failed to migrate idempotency database")?;

    let policy = match &args.autonomy_policy {
        Some(path) => load_policy_from_path(path)?,
        None => {
            tracing::warn!("no autonomy policy configured; every skill auto-executes");
            AutonomyPolicy::default()
        }
    };

    let collaborators =
        Collaborators::from(HttpCollaborators::from_endpoints(&args.collaborators.endpoints()));
    let config = OrchestratorConfig {
        artifact_base_uri: args.artifact_base_uri.clone(),
        result_ttl: Duration::from_secs(args.idempotency_ttl_secs),
        in_flight_ttl: Duration::from_secs(args.in_flight_ttl_secs),
    };

    Ok(ServiceState {
        orchestrator: Arc::new(Orchestrator::new(
            collaborators,
            Arc::new(policy),
            Arc::new(store),
            config,
        )),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let state = build_state(&args)?;
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "task gateway listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let config = state.orchestrator.config();
    Json(HealthResponse {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        status: "ok",
        timeout_ms: u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX),
        result_ttl_secs: config.result_ttl.as_secs(),
        in_flight_ttl_secs: config.in_flight_ttl.as_secs(),
        telemetry: state.telemetry.snapshot(),
    })
}

async fn submit_task(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<TaskSpec>, JsonRejection>,
) -> Result<Json<AgentResult>, ServiceFailure> {
    let Json(task) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let idempotency_key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| {
                    state.validation_error_with_telemetry(format!(
                        "{IDEMPOTENCY_KEY_HEADER} header MUST be visible ASCII"
                    ))
                })?
                .to_string(),
        ),
        None => None,
    };

    let result = state
        .run_blocking(
            StatusCode::GATEWAY_TIMEOUT,
            "orchestration_timeout",
            "submit_task",
            move |orchestrator| orchestrator.submit(task, idempotency_key.as_deref()),
        )
        .await?;
    state.telemetry.record_outcome(result.status);
    Ok(Json(result))
}

async fn task_show(
    State(state): State<ServiceState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ServiceFailure> {
    let lookup_id = task_id.clone();
    let record = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "idempotency_store_unavailable",
            "task_show",
            move |orchestrator| orchestrator.task_record(&lookup_id),
        )
        .await?;

    match record {
        Some(TaskRecord::Completed(result)) => Ok(Json(TaskView::Stored(result))),
        Some(TaskRecord::InFlight { task_id, .. }) => Ok(Json(TaskView::Pending {
            task_id,
            status: "pending",
        })),
        None => {
            state.telemetry.record_failure("task_not_found", false);
            Err(ServiceState::failure(
                StatusCode::NOT_FOUND,
                "task_not_found",
                format!("no stored result for task {task_id}"),
                Some(json!({ "task_id": task_id })),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use task_gateway_collaborators::{CollaboratorError, Executor, Planner, Router, Validator};
    use task_gateway_domain::{
        ExecutionStep, ExecutorResponse, JsonMap, PlanResponse, RoutingCandidate,
        RoutingDecision, TaskType, ValidationResult,
    };
    use task_gateway_idempotency_core::{Claim, IdempotencyEntry, InMemoryIdempotencyStore};
    use task_gateway_policy::parse_policy_yaml;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StaticPlanner {
        calls: AtomicUsize,
    }

    impl Planner for StaticPlanner {
        fn plan(&self, task: &TaskSpec) -> Result<PlanResponse, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let skill_id = format!("{}-001", task.task_type.as_str());
            Ok(PlanResponse {
                steps: vec![ExecutionStep {
                    step_id: "step-1".to_string(),
                    skill_id,
                    description: "Execute primary skill".to_string(),
                    tool: None,
                    params: JsonMap::new(),
                    dependencies: Vec::new(),
                }],
                total_estimated_cost: 0.05,
                total_estimated_latency_ms: 1_000.0,
                extra: JsonMap::new(),
            })
        }
    }

    struct FirstStepRouter;

    impl Router for FirstStepRouter {
        fn route(
            &self,
            _task: &TaskSpec,
            candidate_skill_ids: &[String],
        ) -> Result<RoutingDecision, CollaboratorError> {
            let Some(skill_id) = candidate_skill_ids.first() else {
                return Err(CollaboratorError::NoCandidates("empty".to_string()));
            };
            Ok(RoutingDecision {
                task_id: String::new(),
                primary: RoutingCandidate {
                    skill_id: skill_id.clone(),
                    score: 0.9,
                    reasoning: "only candidate".to_string(),
                    estimated_cost: 0.05,
                    estimated_latency_ms: 1_000.0,
                },
                alternates: Vec::new(),
                benchmark_snapshot: JsonMap::new(),
                extra: JsonMap::new(),
            })
        }
    }

    #[derive(Default)]
    struct EchoExecutor {
        delay: Duration,
    }

    impl Executor for EchoExecutor {
        fn execute(
            &self,
            step: &ExecutionStep,
            _task_context: &JsonMap,
        ) -> Result<ExecutorResponse, CollaboratorError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(ExecutorResponse {
                step_id: step.step_id.clone(),
                skill_id: step.skill_id.clone(),
                status: "success".to_string(),
                result: json!({ "output": "done" }),
                ..ExecutorResponse::default()
            })
        }
    }

    struct PassingValidator;

    impl Validator for PassingValidator {
        fn validate(
            &self,
            _result: &Value,
            _constraints: &JsonMap,
            _task_type: TaskType,
        ) -> Result<ValidationResult, CollaboratorError> {
            Ok(ValidationResult {
                passed: true,
                ..ValidationResult::default()
            })
        }
    }

    struct UnavailableStore;

    impl IdempotencyStore for UnavailableStore {
        fn migrate(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn lookup(&self, _key: &str) -> anyhow::Result<Option<AgentResult>> {
            Err(anyhow::anyhow!("database is locked"))
        }

        fn begin(&self, _key: &str, _task_id: &str, _ttl: Duration) -> anyhow::Result<Claim> {
            Err(anyhow::anyhow!("database is locked"))
        }

        fn store(&self, _key: &str, _result: &AgentResult, _ttl: Duration) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("database is locked"))
        }

        fn entry(&self, _key: &str) -> anyhow::Result<Option<IdempotencyEntry>> {
            Err(anyhow::anyhow!("database is locked"))
        }

        fn lookup_task(&self, _task_id: &str) -> anyhow::Result<Option<TaskRecord>> {
            Err(anyhow::anyhow!("database is locked"))
        }

        fn purge_expired(&self) -> anyhow::Result<usize> {
            Err(anyhow::anyhow!("database is locked"))
        }
    }

    struct Fixture {
        state: ServiceState,
        planner: Arc<StaticPlanner>,
    }

    fn fixture_with(
        store: Arc<dyn IdempotencyStore>,
        policy: AutonomyPolicy,
        executor: EchoExecutor,
        timeout_ms: u64,
    ) -> Fixture {
        let planner = Arc::new(StaticPlanner::default());
        let orchestrator = Orchestrator::new(
            Collaborators {
                planner: planner.clone(),
                router: Arc::new(FirstStepRouter),
                executor: Arc::new(executor),
                validator: Arc::new(PassingValidator),
            },
            Arc::new(policy),
            store,
            OrchestratorConfig::default(),
        );
        Fixture {
            state: ServiceState {
                orchestrator: Arc::new(orchestrator),
                operation_timeout: Duration::from_millis(timeout_ms),
                telemetry: Arc::new(ServiceTelemetry::default()),
            },
            planner,
        }
    }

    fn fixture() -> (Fixture, Arc<InMemoryIdempotencyStore>) {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let fixture = fixture_with(
            store.clone(),
            AutonomyPolicy::default(),
            EchoExecutor::default(),
            2500,
        );
        (fixture, store)
    }

    fn task_body(task_type: &str, autonomy_mode: &str) -> String {
        json!({
            "task_type": task_type,
            "description": "Summarize the weekly incident report",
            "context": {"team": "sre"},
            "autonomy_mode": autonomy_mode,
        })
        .to_string()
    }

    fn post_task(body: String, idempotency_key: Option<&str>) -> Request<axum::body::Body> {
        let mut builder = Request::builder()
            .uri("/v1/tasks")
            .method("POST")
            .header("content-type", "application/json");
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        builder
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn get(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(axum::body::Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(state: &ServiceState, request: Request<axum::body::Body>) -> Response {
        match app(state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn assert_error_envelope_schema(value: &Value) {
        let schema_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../contracts/v1/schemas/error-envelope.schema.json");
        let raw = std::fs::read_to_string(&schema_path)
            .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
        let schema: Value = serde_json::from_str(&raw)
            .unwrap_or_else(|err| panic!("invalid schema JSON {}: {err}", schema_path.display()));
        let compiled = jsonschema::JSONSchema::compile(&schema)
            .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
        if let Some(errors) = compiled
            .validate(value)
            .err()
            .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
        {
            panic!("schema validation failed:\n{}\nvalue={value}", errors.join("\n"));
        }
    }

    fn error_code(value: &Value) -> Option<&str> {
        value
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(Value::as_str)
    }

    // Test IDs: TGW-SVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (fixture, _store) = fixture();
        let response = send(&fixture.state, get("/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.get("status").and_then(Value::as_str), Some("ok"));
        assert_eq!(value.get("result_ttl_secs").and_then(Value::as_u64), Some(3600));
    }

    // Test IDs: TGW-SVC-002
    #[tokio::test]
    async fn submitted_task_completes_and_is_retrievable() {
        let (fixture, _store) = fixture();
        let response = send(&fixture.state, post_task(task_body("ANALYSIS", "collaborator"), None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let submitted = response_json(response).await;
        assert_eq!(submitted.get("status").and_then(Value::as_str), Some("completed"));
        let task_id = submitted
            .get("task_id")
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing task_id: {submitted}"))
            .to_string();

        let response = send(&fixture.state, get(&format!("/v1/tasks/{task_id}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, submitted);

        let snapshot = fixture.state.telemetry.snapshot();
        assert_eq!(snapshot.tasks_completed_total, 1);
        assert_eq!(snapshot.requests_success_total, 2);
    }

    // Test IDs: TGW-SVC-003
    #[tokio::test]
    async fn repeated_idempotency_key_returns_identical_body() {
        let (fixture, _store) = fixture();
        let first = send(&fixture.state, post_task(task_body("ENG", "collaborator"), Some("key-7"))).await;
        let first = response_json(first).await;
        let second = send(&fixture.state, post_task(task_body("ENG", "collaborator"), Some("key-7"))).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(response_json(second).await, first);
        assert_eq!(fixture.planner.calls.load(Ordering::SeqCst), 1);
    }

    // Test IDs: TGW-SVC-004
    #[tokio::test]
    async fn approval_gate_is_a_successful_response() {
        let policy = parse_policy_yaml("autonomy:\n  modes:\n    approver:\n      auto_execute: false\n")
            .unwrap_or_else(|err| panic!("invalid fixture policy: {err}"));
        let fixture = fixture_with(
            Arc::new(InMemoryIdempotencyStore::new()),
            policy,
            EchoExecutor::default(),
            2500,
        );
        let response = send(&fixture.state, post_task(task_body("COM", "approver"), None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(Value::as_str), Some("awaiting_approval"));
        assert!(value.get("draft_artifact").and_then(Value::as_str).is_some());
        assert_eq!(fixture.state.telemetry.snapshot().tasks_awaiting_approval_total, 1);
    }

    // Test IDs: TGW-SVC-005
    #[tokio::test]
    async fn malformed_payloads_return_invalid_json() {
        let (fixture, _store) = fixture();
        for body in ["{", r#"{"task_type": "UNKNOWN", "description": "x"}"#] {
            let response = send(&fixture.state, post_task(body.to_string(), None)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let value = response_json(response).await;
            assert_eq!(error_code(&value), Some("invalid_json"), "body={body}");
            assert!(
                value
                    .get("error")
                    .and_then(|error| error.get("details"))
                    .and_then(|details| details.get("rejection"))
                    .is_some(),
                "missing json rejection details: {value}"
            );
        }
        assert_eq!(fixture.state.telemetry.snapshot().invalid_json_total, 2);
        assert_eq!(fixture.planner.calls.load(Ordering::SeqCst), 0);
    }

    // Test IDs: TGW-SVC-006
    #[tokio::test]
    async fn blank_description_or_key_returns_validation_error() {
        let (fixture, _store) = fixture();
        let blank = json!({"task_type": "ENG", "description": "  "}).to_string();
        let response = send(&fixture.state, post_task(blank, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response_json(response).await), Some("validation_error"));

        let response = send(&fixture.state, post_task(task_body("ENG", "collaborator"), Some(" "))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response_json(response).await), Some("validation_error"));
        assert_eq!(fixture.state.telemetry.snapshot().validation_error_total, 2);
    }

    // Test IDs: TGW-SVC-007
    #[tokio::test]
    async fn key_held_in_flight_returns_conflict() {
        let (fixture, store) = fixture();
        let claim = store.begin("busy-key", "task-in-progress", Duration::from_secs(60));
        assert!(matches!(claim, Ok(Claim::Acquired)));

        let response = send(&fixture.state, post_task(task_body("ENG", "collaborator"), Some("busy-key"))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("submission_in_flight"));
        assert_error_envelope_schema(&value);
        assert_eq!(
            value
                .get("error")
                .and_then(|error| error.get("details"))
                .and_then(|details| details.get("task_id"))
                .and_then(Value::as_str),
            Some("task-in-progress")
        );

        let response = send(&fixture.state, get("/v1/tasks/task-in-progress")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(Value::as_str), Some("pending"));
        assert_eq!(value.get("task_id").and_then(Value::as_str), Some("task-in-progress"));
    }

    // Test IDs: TGW-SVC-008
    #[tokio::test]
    async fn unknown_task_returns_not_found() {
        let (fixture, _store) = fixture();
        let response = send(&fixture.state, get("/v1/tasks/01J0000000000000000000000")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("task_not_found"));
        assert_error_envelope_schema(&value);
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(fixture.state.telemetry.snapshot().task_not_found_total, 1);
    }

    // Test IDs: TGW-SVC-009
    #[tokio::test]
    async fn store_failure_returns_service_unavailable() {
        let fixture = fixture_with(
            Arc::new(UnavailableStore),
            AutonomyPolicy::default(),
            EchoExecutor::default(),
            2500,
        );
        let response = send(&fixture.state, post_task(task_body("OPS", "collaborator"), None)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            error_code(&response_json(response).await),
            Some("idempotency_store_unavailable")
        );

        let response = send(&fixture.state, get("/v1/tasks/anything")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fixture.planner.calls.load(Ordering::SeqCst), 0);
    }

    // Test IDs: TGW-SVC-010
    #[tokio::test]
    async fn slow_pipeline_returns_gateway_timeout() {
        let fixture = fixture_with(
            Arc::new(InMemoryIdempotencyStore::new()),
            AutonomyPolicy::default(),
            EchoExecutor {
                delay: Duration::from_millis(50),
            },
            1,
        );
        let response = send(&fixture.state, post_task(task_body("ENG", "collaborator"), None)).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("orchestration_timeout"));
        assert_error_envelope_schema(&value);

        let snapshot = fixture.state.telemetry.snapshot();
        assert_eq!(snapshot.timeout_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
    }

    // Test IDs: TGW-SVC-011
    #[tokio::test]
    async fn telemetry_counters_track_success_failure_and_timeout() {
        let (fixture, _store) = fixture();
        let state = ServiceState {
            operation_timeout: Duration::from_millis(1),
            ..fixture.state
        };

        let success = state
            .run_blocking(
                StatusCode::GATEWAY_TIMEOUT,
                "orchestration_timeout",
                "telemetry_success",
                |_orchestrator| Ok::<_, SubmitError>(1_u32),
            )
            .await;
        assert!(success.is_ok(), "expected success path for telemetry test");

        let timeout = state
            .run_blocking(
                StatusCode::GATEWAY_TIMEOUT,
                "orchestration_timeout",
                "telemetry_timeout",
                |_orchestrator| {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok::<_, SubmitError>(0_u32)
                },
            )
            .await;
        match timeout {
            Ok(_) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
                assert!(err.message.contains("timed out"), "message: {}", err.message);
                assert!(err.details.is_some());
            }
        }

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success_total, 1);
        assert_eq!(snapshot.requests_failure_total, 1);
        assert_eq!(snapshot.timeout_total, 1);
    }
}
