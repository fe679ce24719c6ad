#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use task_gateway_domain::{ensure_non_empty, AutonomyMode, TaskSpec};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModePolicy {
    #[serde(default)]
    pub auto_execute: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillOverride {
    pub mode: String,
}

/// Autonomy rules loaded once at startup. Never mutated afterwards; reloading
/// means building a new orchestrator around a new value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutonomyPolicy {
    #[serde(default)]
    pub default_mode: Option<AutonomyMode>,
    #[serde(default)]
    pub modes: BTreeMap<String, ModePolicy>,
    #[serde(default)]
    pub skill_overrides: BTreeMap<String, SkillOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    autonomy: AutonomyPolicy,
}

impl AutonomyPolicy {
    /// Whether executing `skill_id` for `task` needs human sign-off first.
    ///
    /// A per-skill override wins over the task's mode. A mode without an
    /// explicit `auto_execute` flag auto-executes.
    #[must_use]
    pub fn requires_approval(&self, task: &TaskSpec, skill_id: &str) -> bool {
        self.requires_approval_in_mode(task.autonomy_mode, skill_id)
    }

    #[must_use]
    pub fn requires_approval_in_mode(&self, mode: AutonomyMode, skill_id: &str) -> bool {
        if let Some(skill_override) = self.skill_overrides.get(skill_id) {
            return skill_override.mode == AutonomyMode::Approver.as_str();
        }
        let auto_execute = self
            .modes
            .get(mode.as_str())
            .and_then(|mode| mode.auto_execute)
            .unwrap_or(true);
        !auto_execute
    }
}

/// Load an autonomy policy file from disk.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a valid policy document.
pub fn load_policy_from_path(path: &Path) -> Result<AutonomyPolicy> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read autonomy policy at {}", path.display()))?;
    parse_policy_yaml(&content)
}

/// Parse an autonomy policy document (`autonomy: {modes, skill_overrides}`).
///
/// # Errors
/// Returns an error on malformed YAML or a blank override key/mode.
pub fn parse_policy_yaml(yaml: &str) -> Result<AutonomyPolicy> {
    if yaml.trim().is_empty() {
        return Ok(AutonomyPolicy::default());
    }
    let document: PolicyDocument = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid autonomy policy YAML structure: {err}"))?;
    validate_policy(&document.autonomy)?;
    Ok(document.autonomy)
}

fn validate_policy(policy: &AutonomyPolicy) -> Result<()> {
    for (skill_id, skill_override) in &policy.skill_overrides {
        ensure_non_empty("skill_overrides key", skill_id)?;
        ensure_non_empty("skill_overrides.mode", &skill_override.mode)
            .with_context(|| format!("skill override {skill_id}"))?;
    }
    Ok(())
}
