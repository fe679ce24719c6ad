#![forbid(unsafe_code)]

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use task_gateway_domain::{
    ExecutionStep, ExecutorResponse, JsonMap, PlanResponse, RoutingDecision, TaskSpec, TaskType,
    ValidationResult,
};

pub const DEFAULT_COLLABORATOR_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("no execution plan available: {0}")]
    NoPlanAvailable(String),
    #[error("no routing candidates: {0}")]
    NoCandidates(String),
    #[error("http transport failure: {0}")]
    Transport(String),
    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
}

pub trait Planner: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn plan(&self, task: &TaskSpec) -> Result<PlanResponse, CollaboratorError>;
}

pub trait Router: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn route(
        &self,
        task: &TaskSpec,
        candidate_skill_ids: &[String],
    ) -> Result<RoutingDecision, CollaboratorError>;
}

pub trait Executor: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn execute(
        &self,
        step: &ExecutionStep,
        task_context: &JsonMap,
    ) -> Result<ExecutorResponse, CollaboratorError>;
}

pub trait Validator: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn validate(
        &self,
        result: &Value,
        constraints: &JsonMap,
        task_type: TaskType,
    ) -> Result<ValidationResult, CollaboratorError>;
}

/// Base URLs of the four collaborator services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorEndpoints {
    pub planner_url: String,
    pub router_url: String,
    pub executor_url: String,
    pub validator_url: String,
    pub timeout_ms: u64,
}

impl Default for CollaboratorEndpoints {
    fn default() -> Self {
        Self {
            planner_url: "http://planner:8001".to_string(),
            router_url: "http://router:8002".to_string(),
            executor_url: "http://executor:8003".to_string(),
            validator_url: "http://validator:8004".to_string(),
            timeout_ms: DEFAULT_COLLABORATOR_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone)]
struct JsonServiceClient {
    base_url: String,
    agent: ureq::Agent,
}

impl JsonServiceClient {
    fn new(base_url: &str, timeout_ms: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> Result<T, CollaboratorError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .agent
            .request("POST", &url)
            .set("content-type", "application/json");
        for (name, value) in query {
            req = req.query(name, value);
        }

        match req.send_json(body) {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|err| CollaboratorError::Decode(format!("{url}: {err}")))?;
                serde_json::from_str(&text)
                    .map_err(|err| CollaboratorError::Decode(format!("{url}: {err}")))
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(CollaboratorError::Status {
                    code,
                    body: error_detail(&body),
                })
            }
            Err(ureq::Error::Transport(err)) => {
                Err(CollaboratorError::Transport(format!("{url}: {err}")))
            }
        }
    }
}

/// Prefer a service's `detail` field over the raw error body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Clone)]
pub struct HttpPlanner {
    client: JsonServiceClient,
}

impl HttpPlanner {
    #[must_use]
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        Self {
            client: JsonServiceClient::new(base_url, timeout_ms),
        }
    }
}

impl Planner for HttpPlanner {
    fn plan(&self, task: &TaskSpec) -> Result<PlanResponse, CollaboratorError> {
        let body = serde_json::to_value(task)
            .map_err(|err| CollaboratorError::Decode(err.to_string()))?;
        self.client
            .post_json("/v1/plan", &[], &body)
            .map_err(|err| match err {
                CollaboratorError::Status { code: 404, body } => {
                    CollaboratorError::NoPlanAvailable(body)
                }
                other => other,
            })
    }
}

#[derive(Debug, Clone)]
pub struct HttpRouter {
    client: JsonServiceClient,
}

impl HttpRouter {
    #[must_use]
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        Self {
            client: JsonServiceClient::new(base_url, timeout_ms),
        }
    }
}

impl Router for HttpRouter {
    fn route(
        &self,
        task: &TaskSpec,
        candidate_skill_ids: &[String],
    ) -> Result<RoutingDecision, CollaboratorError> {
        if candidate_skill_ids.is_empty() {
            return Err(CollaboratorError::NoCandidates(
                "candidate skill list is empty".to_string(),
            ));
        }
        let body = serde_json::to_value(task)
            .map_err(|err| CollaboratorError::Decode(err.to_string()))?;
        let query: Vec<(&str, &str)> = candidate_skill_ids
            .iter()
            .map(|skill_id| ("candidate_skills", skill_id.as_str()))
            .collect();
        self.client
            .post_json("/v1/route", &query, &body)
            .map_err(|err| match err {
                CollaboratorError::Status {
                    code: 400 | 404,
                    body,
                } => CollaboratorError::NoCandidates(body),
                other => other,
            })
    }
}

#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: JsonServiceClient,
}

impl HttpExecutor {
    #[must_use]
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        Self {
            client: JsonServiceClient::new(base_url, timeout_ms),
        }
    }
}

impl Executor for HttpExecutor {
    fn execute(
        &self,
        step: &ExecutionStep,
        task_context: &JsonMap,
    ) -> Result<ExecutorResponse, CollaboratorError> {
        let body = json!({
            "step": step,
            "task_context": task_context,
        });
        self.client.post_json("/v1/execute", &[], &body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpValidator {
    client: JsonServiceClient,
}

impl HttpValidator {
    #[must_use]
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        Self {
            client: JsonServiceClient::new(base_url, timeout_ms),
        }
    }
}

impl Validator for HttpValidator {
    fn validate(
        &self,
        result: &Value,
        constraints: &JsonMap,
        task_type: TaskType,
    ) -> Result<ValidationResult, CollaboratorError> {
        let body = json!({
            "result": result,
            "constraints": constraints,
            "task_type": task_type,
        });
        self.client.post_json("/v1/validate", &[], &body)
    }
}

/// The four HTTP clients built from one set of endpoints.
#[derive(Debug, Clone)]
pub struct HttpCollaborators {
    pub planner: HttpPlanner,
    pub router: HttpRouter,
    pub executor: HttpExecutor,
    pub validator: HttpValidator,
}

impl HttpCollaborators {
    #[must_use]
    pub fn from_endpoints(endpoints: &CollaboratorEndpoints) -> Self {
        tracing::debug!(
            planner = %endpoints.planner_url,
            router = %endpoints.router_url,
            executor = %endpoints.executor_url,
            validator = %endpoints.validator_url,
            timeout_ms = endpoints.timeout_ms,
            "configured collaborator clients"
        );
        Self {
            planner: HttpPlanner::new(&endpoints.planner_url, endpoints.timeout_ms),
            router: HttpRouter::new(&endpoints.router_url, endpoints.timeout_ms),
            executor: HttpExecutor::new(&endpoints.executor_url, endpoints.timeout_ms),
            validator: HttpValidator::new(&endpoints.validator_url, endpoints.timeout_ms),
        }
    }
}
