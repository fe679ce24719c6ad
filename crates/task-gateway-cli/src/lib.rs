//! Command surface for operating the task gateway without the HTTP service.
//!
//! - [`run_cli`] executes a parsed [`Cli`].
//! - [`build_orchestrator`] wires HTTP collaborators, the `SQLite` idempotency
//!   store and an autonomy policy the same way the service does.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use task_gateway_collaborators::{
    CollaboratorEndpoints, HttpCollaborators, DEFAULT_COLLABORATOR_TIMEOUT_MS,
};
use task_gateway_domain::{now_utc, AutonomyMode, TaskSpec, DEFAULT_ARTIFACT_BASE_URI};
use task_gateway_idempotency_core::{IdempotencyStore, TaskRecord};
use task_gateway_idempotency_sqlite::SqliteIdempotencyStore;
use task_gateway_orchestrator::{Collaborators, Orchestrator, OrchestratorConfig};
use task_gateway_policy::{load_policy_from_path, AutonomyPolicy};

#[derive(Debug, Parser)]
#[command(name = "task-gateway")]
#[command(about = "Task Gateway orchestration CLI")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "TASK_GATEWAY_DB",
        default_value = "./task_gateway.sqlite3"
    )]
    idempotency_db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one task through plan, route, execute and validate.
    Submit(Box<SubmitArgs>),
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
    Idempotency {
        #[command(subcommand)]
        command: IdempotencyCommand,
    },
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Task JSON (`task_type`, `description`, optional `context`, `constraints`, ...).
    #[arg(long)]
    task: String,
    #[arg(long)]
    idempotency_key: Option<String>,
    #[arg(long, env = "AUTONOMY_POLICY")]
    autonomy_policy: Option<PathBuf>,
    #[command(flatten)]
    collaborators: CollaboratorArgs,
    #[arg(long, default_value = DEFAULT_ARTIFACT_BASE_URI)]
    artifact_base_uri: String,
    #[arg(long, default_value_t = 3600)]
    idempotency_ttl_secs: u64,
    #[arg(long, default_value_t = 600)]
    in_flight_ttl_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct CollaboratorArgs {
    #[arg(long, env = "PLANNER_URL", default_value = "http://planner:8001")]
    planner_url: String,
    #[arg(long, env = "ROUTER_URL", default_value = "http://router:8002")]
    router_url: String,
    #[arg(long, env = "EXECUTOR_URL", default_value = "http://executor:8003")]
    executor_url: String,
    #[arg(long, env = "VALIDATOR_URL", default_value = "http://validator:8004")]
    validator_url: String,
    #[arg(long, default_value_t = DEFAULT_COLLABORATOR_TIMEOUT_MS)]
    collaborator_timeout_ms: u64,
}

#[derive(Debug, Subcommand)]
pub enum TasksCommand {
    /// Print the latest live record stored for a task id.
    Show {
        #[arg(long)]
        task_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum IdempotencyCommand {
    Show {
        #[arg(long)]
        key: String,
    },
    /// Delete every expired entry.
    Purge,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Report whether a skill needs approval under an autonomy mode.
    Check {
        #[arg(long)]
        autonomy_policy: PathBuf,
        #[arg(long)]
        skill: String,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Approver,
    Collaborator,
}

/// Wiring shared by every command that runs the pipeline.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub idempotency_db: PathBuf,
    pub autonomy_policy: Option<PathBuf>,
    pub endpoints: CollaboratorEndpoints,
    pub config: OrchestratorConfig,
}

/// Execute a parsed command line.
///
/// # Errors
/// Returns an error when the command's inputs are invalid, the idempotency
/// store fails, or the requested record does not exist.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Submit(args) => run_submit(&cli.idempotency_db, *args),
        Command::Tasks { command } => {
            let store = open_store(&cli.idempotency_db)?;
            run_tasks(command, &store)
        }
        Command::Idempotency { command } => {
            let store = open_store(&cli.idempotency_db)?;
            run_idempotency(command, &store)
        }
        Command::Policy { command } => run_policy(command),
    }
}

/// Build an orchestrator backed by HTTP collaborators and a migrated `SQLite`
/// idempotency store.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// autonomy policy file cannot be loaded.
pub fn build_orchestrator(settings: &GatewaySettings) -> Result<Orchestrator> {
    let store = open_store(&settings.idempotency_db)?;
    let policy = match &settings.autonomy_policy {
        Some(path) => load_policy_from_path(path)?,
        None => AutonomyPolicy::default(),
    };
    Ok(Orchestrator::new(
        Collaborators::from(HttpCollaborators::from_endpoints(&settings.endpoints)),
        Arc::new(policy),
        Arc::new(store),
        settings.config.clone(),
    ))
}

fn open_store(path: &Path) -> Result<SqliteIdempotencyStore> {
    let store = SqliteIdempotencyStore::open(path)?;
    store
        .migrate()
        .context("failed to migrate idempotency database")?;
    Ok(store)
}

fn run_submit(idempotency_db: &Path, args: SubmitArgs) -> Result<()> {
    let task = parse_task_json(&args.task)?;
    let settings = GatewaySettings {
        idempotency_db: idempotency_db.to_path_buf(),
        autonomy_policy: args.autonomy_policy,
        endpoints: args.collaborators.endpoints(),
        config: OrchestratorConfig {
            artifact_base_uri: args.artifact_base_uri,
            result_ttl: Duration::from_secs(args.idempotency_ttl_secs),
            in_flight_ttl: Duration::from_secs(args.in_flight_ttl_secs),
        },
    };
    let orchestrator = build_orchestrator(&settings)?;
    let result = orchestrator
        .submit(task, args.idempotency_key.as_deref())
        .context("task submission failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_tasks(command: TasksCommand, store: &SqliteIdempotencyStore) -> Result<()> {
    match command {
        TasksCommand::Show { task_id } => match store.lookup_task(&task_id)? {
            Some(TaskRecord::Completed(result)) => {
                println!("{}", serde_json::to_string_pretty(&result)?);
                Ok(())
            }
            Some(TaskRecord::InFlight {
                task_id,
                idempotency_key,
            }) => {
                let payload = json!({
                    "task_id": task_id,
                    "status": "pending",
                    "idempotency_key": idempotency_key,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
                Ok(())
            }
            None => Err(anyhow!("no stored result for task {task_id}")),
        },
    }
}

fn run_idempotency(command: IdempotencyCommand, store: &SqliteIdempotencyStore) -> Result<()> {
    match command {
        IdempotencyCommand::Show { key } => {
            let entry = store
                .entry(&key)?
                .ok_or_else(|| anyhow!("no idempotency entry for key {key}"))?;
            let live = entry.is_live_at(now_utc());
            let mut payload = serde_json::to_value(&entry)?;
            if let Some(object) = payload.as_object_mut() {
                object.insert("live".to_string(), json!(live));
            }
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        IdempotencyCommand::Purge => {
            let purged = store.purge_expired()?;
            tracing::info!(purged, "purged expired idempotency entries");
            println!("{}", serde_json::to_string_pretty(&json!({ "purged": purged }))?);
            Ok(())
        }
    }
}

fn run_policy(command: PolicyCommand) -> Result<()> {
    match command {
        PolicyCommand::Check {
            autonomy_policy,
            skill,
            mode,
        } => {
            let policy = load_policy_from_path(&autonomy_policy)?;
            let mode = mode
                .map(map_mode)
                .or(policy.default_mode)
                .unwrap_or_default();
            let payload = json!({
                "skill_id": skill,
                "autonomy_mode": mode.as_str(),
                "requires_approval": policy.requires_approval_in_mode(mode, &skill),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
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

fn parse_task_json(raw: &str) -> Result<TaskSpec> {
    serde_json::from_str(raw).context("--task must be a valid task JSON object")
}

fn map_mode(value: ModeArg) -> AutonomyMode {
    match value {
        ModeArg::Approver => AutonomyMode::Approver,
        ModeArg::Collaborator => AutonomyMode::Collaborator,
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_task_json, Cli};
    use clap::{CommandFactory, Parser};
    use task_gateway_domain::TaskType;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn db_flag_is_accepted_after_the_subcommand() {
        let parsed = Cli::try_parse_from([
            "task-gateway",
            "idempotency",
            "purge",
            "--idempotency-db",
            "/tmp/gateway.sqlite3",
        ]);
        assert!(parsed.is_ok());
        let parsed = parsed.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            parsed.idempotency_db,
            std::path::PathBuf::from("/tmp/gateway.sqlite3")
        );
    }

    #[test]
    fn task_json_accepts_aliases_and_rejects_garbage() {
        let task = parse_task_json(r#"{"task_type": "communication", "description": "ping"}"#);
        assert!(task.is_ok());
        let task = task.unwrap_or_else(|_| unreachable!());
        assert_eq!(task.task_type, TaskType::Communication);

        assert!(parse_task_json("not json").is_err());
        assert!(parse_task_json(r#"{"description": "missing type"}"#).is_err());
    }
}
