#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;
pub type JsonMap = Map<String, Value>;

pub const PLANNER_VERSION: &str = "1.0.0";
pub const DEFAULT_ARTIFACT_BASE_URI: &str = "minio://";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TaskType {
    #[serde(rename = "COM", alias = "communication")]
    Communication,
    #[serde(rename = "OPS", alias = "operations")]
    Operations,
    #[serde(rename = "ENG", alias = "engineering")]
    Engineering,
    #[serde(rename = "ANALYSIS", alias = "analysis")]
    Analysis,
    #[serde(rename = "CREATIVE", alias = "creative")]
    Creative,
}

impl TaskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Communication => "COM",
            Self::Operations => "OPS",
            Self::Engineering => "ENG",
            Self::Analysis => "ANALYSIS",
            Self::Creative => "CREATIVE",
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Approver,
    #[default]
    Collaborator,
}

impl AutonomyMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approver => "approver",
            Self::Collaborator => "collaborator",
        }
    }
}

impl std::str::FromStr for AutonomyMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "approver" => Ok(Self::Approver),
            "collaborator" => Ok(Self::Collaborator),
            other => Err(anyhow!("unknown autonomy mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Routing,
    Executing,
    Validating,
    Completed,
    Failed,
    AwaitingApproval,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::AwaitingApproval
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Routing => "routing",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }
}

/// Machine-readable classification of a FAILED result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlanningFailed,
    RoutingFailed,
    CollaboratorUnreachable,
    ValidationFailed,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanningFailed => "planning_failed",
            Self::RoutingFailed => "routing_failed",
            Self::CollaboratorUnreachable => "collaborator_unreachable",
            Self::ValidationFailed => "validation_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub task_type: TaskType,
    pub description: String,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub constraints: JsonMap,
    #[serde(default)]
    pub autonomy_mode: AutonomyMode,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl TaskSpec {
    /// Validate caller-supplied fields before the task enters the pipeline.
    ///
    /// # Errors
    /// Returns an error when the description or a supplied task id is blank.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("description", &self.description)?;
        if let Some(task_id) = &self.task_id {
            ensure_non_empty("task_id", task_id)?;
        }
        Ok(())
    }

    /// Return the task id, assigning a fresh one when the caller omitted it.
    pub fn ensure_task_id(&mut self) -> &str {
        self.task_id.get_or_insert_with(new_task_id).as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStep {
    pub step_id: String,
    pub skill_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub params: JsonMap,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanResponse {
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub total_estimated_cost: f64,
    #[serde(default)]
    pub total_estimated_latency_ms: f64,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl PlanResponse {
    /// Skill ids of the planned steps, in plan order.
    #[must_use]
    pub fn candidate_skill_ids(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.skill_id.clone()).collect()
    }

    #[must_use]
    pub fn step_for_skill(&self, skill_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|step| step.skill_id == skill_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingCandidate {
    pub skill_id: String,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub estimated_latency_ms: f64,
}

impl RoutingCandidate {
    /// Check the numeric fields a router must keep well-formed.
    ///
    /// # Errors
    /// Returns an error for a non-finite score or a negative/non-finite estimate.
    pub fn ensure_usable(&self) -> Result<()> {
        ensure_non_empty("skill_id", &self.skill_id)?;
        if !self.score.is_finite() {
            return Err(anyhow!("candidate {} has a non-finite score", self.skill_id));
        }
        for (field_name, value) in [
            ("estimated_cost", self.estimated_cost),
            ("estimated_latency_ms", self.estimated_latency_ms),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!(
                    "candidate {} has invalid {field_name}: {value}",
                    self.skill_id
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    #[serde(default)]
    pub task_id: String,
    pub primary: RoutingCandidate,
    #[serde(default)]
    pub alternates: Vec<RoutingCandidate>,
    #[serde(default)]
    pub benchmark_snapshot: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutorResponse {
    #[serde(default)]
    pub step_id: String,
    #[serde(default)]
    pub skill_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl ExecutorResponse {
    /// Artifacts produced by this call: the listed ones in order, then
    /// `artifact_uri` unless it is already listed.
    ///
    /// Blank entries and the `artifact_uri` echo are dropped within this one
    /// response only. Artifacts recorded across calls are appended as-is.
    #[must_use]
    pub fn produced_artifacts(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .artifacts
            .iter()
            .filter(|uri| !uri.trim().is_empty())
            .cloned()
            .collect();
        if let Some(uri) = &self.artifact_uri {
            if !uri.trim().is_empty() && !out.contains(uri) {
                out.push(uri.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub passed: bool,
    #[serde(default)]
    pub checks: BTreeMap<String, bool>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Audit trail for one task. Collaborator responses are kept as received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub task_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
    pub planner_version: String,
    #[serde(default)]
    pub plan: Option<PlanResponse>,
    #[serde(default)]
    pub router_decision: Option<RoutingDecision>,
    #[serde(default)]
    pub executor_logs: Vec<ExecutorResponse>,
    #[serde(default)]
    pub validator_results: Vec<ValidationResult>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub latency_ms: f64,
}

impl Provenance {
    #[must_use]
    pub fn new(task_id: &str, timestamp: DateTimeUtc) -> Self {
        Self {
            task_id: task_id.to_string(),
            timestamp,
            planner_version: PLANNER_VERSION.to_string(),
            plan: None,
            router_decision: None,
            executor_logs: Vec::new(),
            validator_results: Vec::new(),
            artifacts: Vec::new(),
            retries: 0,
            total_cost: 0.0,
            latency_ms: 0.0,
        }
    }

    /// Record one executor call and the artifacts it produced.
    pub fn record_execution(&mut self, response: ExecutorResponse) {
        self.artifacts.extend(response.produced_artifacts());
        self.executor_logs.push(response);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub provenance: Provenance,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub draft_artifact: Option<String>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn new_task_id() -> String {
    Ulid::new().to_string()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Idempotency key used when the caller does not supply one.
///
/// Stable across processes and releases; it is an identifier, not a secret.
#[must_use]
pub fn derive_idempotency_key(task_id: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update([0_u8]);
    hasher.update(description.as_bytes());
    hex::encode(hasher.finalize())
}

/// Placeholder reference for a task parked in `awaiting_approval`.
#[must_use]
pub fn draft_artifact_uri(base_uri: &str, task_id: &str) -> String {
    format!("{base_uri}drafts/task_{task_id}_draft.json")
}

#[must_use]
pub fn audit_artifact_uri(base_uri: &str, task_id: &str) -> String {
    format!("{base_uri}audit/task_{task_id}_audit.json")
}

#[cfg(test)]
mod tests {
    use super::{
        audit_artifact_uri, derive_idempotency_key, draft_artifact_uri, AgentResult,
        AutonomyMode, ExecutorResponse, Provenance, RoutingCandidate, TaskSpec, TaskStatus,
        TaskType, DEFAULT_ARTIFACT_BASE_URI,
    };
    use serde_json::json;

    fn candidate(score: f64, cost: f64) -> RoutingCandidate {
        RoutingCandidate {
            skill_id: "ENG-001".to_string(),
            score,
            reasoning: "fixture".to_string(),
            estimated_cost: cost,
            estimated_latency_ms: 10.0,
        }
    }

    #[test]
    fn task_spec_accepts_short_and_long_task_type_names() {
        let short: Result<TaskSpec, _> =
            serde_json::from_value(json!({"task_type": "ENG", "description": "x"}));
        let long: Result<TaskSpec, _> =
            serde_json::from_value(json!({"task_type": "engineering", "description": "x"}));
        assert!(short.is_ok());
        assert!(long.is_ok());
        let short = short.unwrap_or_else(|_| unreachable!());
        let long = long.unwrap_or_else(|_| unreachable!());
        assert_eq!(short.task_type, TaskType::Engineering);
        assert_eq!(long.task_type, TaskType::Engineering);
        assert_eq!(short.autonomy_mode, AutonomyMode::Collaborator);

        let serialized = serde_json::to_value(&long).unwrap_or_else(|_| unreachable!());
        assert_eq!(serialized.get("task_type"), Some(&json!("ENG")));
    }

    #[test]
    fn task_spec_rejects_unknown_task_type_and_blank_description() {
        let unknown: Result<TaskSpec, _> =
            serde_json::from_value(json!({"task_type": "LEGAL", "description": "x"}));
        assert!(unknown.is_err());

        let blank: TaskSpec =
            serde_json::from_value(json!({"task_type": "OPS", "description": "   "}))
                .unwrap_or_else(|_| unreachable!());
        assert!(blank.validate().is_err());
    }

    #[test]
    fn ensure_task_id_assigns_once() {
        let mut task: TaskSpec =
            serde_json::from_value(json!({"task_type": "OPS", "description": "restart"}))
                .unwrap_or_else(|_| unreachable!());
        let first = task.ensure_task_id().to_string();
        let second = task.ensure_task_id().to_string();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn derived_idempotency_key_is_stable_and_input_sensitive() {
        let a = derive_idempotency_key("task-1", "write a haiku");
        let b = derive_idempotency_key("task-1", "write a haiku");
        let c = derive_idempotency_key("task-1", "write a sonnet");
        let d = derive_idempotency_key("task-1w", "rite a haiku");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn synthetic_artifact_references_are_deterministic() {
        assert_eq!(
            draft_artifact_uri(DEFAULT_ARTIFACT_BASE_URI, "t1"),
            "minio://drafts/task_t1_draft.json"
        );
        assert_eq!(
            audit_artifact_uri(DEFAULT_ARTIFACT_BASE_URI, "t1"),
            "minio://audit/task_t1_audit.json"
        );
    }

    #[test]
    fn candidate_usability_rejects_non_finite_and_negative_values() {
        assert!(candidate(0.8, 0.02).ensure_usable().is_ok());
        assert!(candidate(f64::NAN, 0.02).ensure_usable().is_err());
        assert!(candidate(f64::INFINITY, 0.02).ensure_usable().is_err());
        assert!(candidate(0.8, -1.0).ensure_usable().is_err());
        assert!(candidate(-3.0, 0.0).ensure_usable().is_ok());
    }

    #[test]
    fn produced_artifacts_merges_artifact_uri_without_duplicating() {
        let response: ExecutorResponse = serde_json::from_value(json!({
            "step_id": "step-1",
            "skill_id": "ENG-001",
            "status": "success",
            "result": {"ok": true},
            "artifacts": ["minio://a.json", ""],
            "artifact_uri": "minio://b.json",
            "duration_ms": 12
        }))
        .unwrap_or_else(|_| unreachable!());
        assert_eq!(
            response.produced_artifacts(),
            vec!["minio://a.json".to_string(), "minio://b.json".to_string()]
        );
        assert_eq!(response.extra.get("duration_ms"), Some(&json!(12)));

        let same = ExecutorResponse {
            artifacts: vec!["minio://a.json".to_string()],
            artifact_uri: Some("minio://a.json".to_string()),
            ..ExecutorResponse::default()
        };
        assert_eq!(same.produced_artifacts(), vec!["minio://a.json".to_string()]);
    }

    #[test]
    fn agent_result_survives_json_persistence_unchanged() {
        let mut provenance = Provenance::new("t1", time::OffsetDateTime::now_utc());
        provenance.record_execution(ExecutorResponse {
            step_id: "step-1".to_string(),
            skill_id: "ENG-001".to_string(),
            status: "success".to_string(),
            result: json!({"score": 0.1_f64 + 0.2_f64}),
            artifacts: vec!["minio://code/x.py".to_string()],
            ..ExecutorResponse::default()
        });
        provenance.total_cost = 0.1 + 0.2;
        provenance.latency_ms = 12.345_678;
        let result = AgentResult {
            task_id: "t1".to_string(),
            status: TaskStatus::Completed,
            result: Some(json!({"ok": true})),
            artifacts: provenance.artifacts.clone(),
            provenance,
            error: None,
            error_kind: None,
            draft_artifact: None,
        };

        let encoded = serde_json::to_string(&result).unwrap_or_else(|_| unreachable!());
        let decoded: AgentResult =
            serde_json::from_str(&encoded).unwrap_or_else(|_| unreachable!());
        assert_eq!(decoded, result);
        assert!(decoded.status.is_terminal());
    }
}
