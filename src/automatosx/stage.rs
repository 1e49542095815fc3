//! Staged pipelines with checkpoint persistence and resume.
//!
//! A profile's `stages[]` run strictly in order: each stage gets its own
//! synthesized task, its own timeout and retry budget, and its output is
//! accumulated as context for the stages after it. When checkpoints are
//! enabled, a [`CheckpointData`] snapshot is written atomically after
//! every completed *or* failed stage, so a crashed or aborted run can be
//! resumed from the stage after the last completed one.
//!
//! ```text
//! run ─ S1 ✓ ─ checkpoint ─ S2 ✗ (retries exhausted) ─ checkpoint ─ stop
//!                                                        │
//! resume(run_id) ──────── skips S1 ──── retries S2 ──────┘─ S3 ...
//! ```
//!
//! The checkpoint carries a SHA-256 checksum over its stable
//! serialization (with the checksum field blanked); a mismatch on load is
//! an integrity failure and is never swallowed.

use crate::automatosx::context::{ContextManager, ContextOptions};
use crate::automatosx::executor::{AgentExecutor, ExecutionOptions, RetryPolicy};
use crate::automatosx::memory::{MemoryEntryType, MemoryManager, MemoryMetadata};
use crate::automatosx::profile::{ProfileLoader, StageSpec};
use crate::automatosx::provider::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Checkpoint schema version written by this controller.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 5;

/// Errors raised by the stage controller.
#[derive(Debug)]
pub enum StageError {
    /// The profile declares no stages.
    NoStages,
    /// Two stages share a name.
    DuplicateStageName(String),
    /// No checkpoint exists for the run id.
    CheckpointNotFound(String),
    /// The checkpoint failed checksum or schema validation.
    CheckpointCorrupt(String),
    /// A stage failed in a way that is not stage-retryable.
    Execution(String),
    /// Checkpoint persistence failure.
    Io(String),
}

impl StageError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::NoStages => "NoStages",
            StageError::DuplicateStageName(_) => "DuplicateStageName",
            StageError::CheckpointNotFound(_) => "CheckpointNotFound",
            StageError::CheckpointCorrupt(_) => "CheckpointCorrupt",
            StageError::Execution(_) => "StageExecutionError",
            StageError::Io(_) => "CheckpointIoError",
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::NoStages => write!(f, "Profile has no stages to run"),
            StageError::DuplicateStageName(name) => {
                write!(f, "Duplicate stage name '{}'", name)
            }
            StageError::CheckpointNotFound(run_id) => {
                write!(f, "No checkpoint found for run '{}'", run_id)
            }
            StageError::CheckpointCorrupt(message) => {
                write!(f, "Checkpoint is corrupt: {}", message)
            }
            StageError::Execution(message) => write!(f, "Stage execution failed: {}", message),
            StageError::Io(message) => write!(f, "Checkpoint I/O error: {}", message),
        }
    }
}

impl Error for StageError {}

/// Lifecycle state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Queued,
    Running,
    Completed,
    Error,
    Skipped,
}

/// Output captured from a completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub content: String,
    pub tokens_used: TokenUsage,
    pub duration_ms: u64,
    /// Memory entry written for this stage when `saveToMemory` was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<i64>,
}

/// Per-stage record inside a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub name: String,
    pub description: String,
    pub index: usize,
    pub status: StageStatus,
    /// Retries consumed so far, cumulative across resumes.
    pub retries: u32,
    /// Whether a checkpoint is requested after this stage.
    pub checkpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Crash-safe snapshot of a stage run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    pub schema_version: u32,
    /// SHA-256 hex over the stable serialization with this field blank.
    pub checksum: String,
    pub run_id: String,
    pub agent: String,
    pub task: String,
    /// Execution mode label, e.g. `"stages"`.
    pub mode: String,
    pub stages: Vec<StageRecord>,
    /// Highest index whose status is `completed`, or -1 when none. Never
    /// forced to the last index just because processing stopped.
    pub last_completed_stage_index: i64,
    /// Completed stage outputs in stage order.
    pub previous_outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointData {
    /// Compute the checksum over the stable serialization, excluding the
    /// checksum field itself.
    pub fn compute_checksum(&self) -> String {
        let mut canonical = self.clone();
        canonical.checksum = String::new();
        let bytes = serde_json::to_vec(&canonical).expect("checkpoint serializes");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Verify the stored checksum.
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// Summary returned by [`StageExecutionController::run`] and `resume`.
#[derive(Debug, Clone)]
pub struct StageRunSummary {
    pub run_id: String,
    pub agent: String,
    pub task: String,
    pub stages: Vec<StageRecord>,
    /// True only when every stage completed.
    pub completed: bool,
    pub previous_outputs: Vec<String>,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct StageControllerConfig {
    /// Directory for `<runId>.json` checkpoints.
    pub checkpoint_dir: PathBuf,
    /// Whether checkpoints are written at stage boundaries.
    pub checkpoints_enabled: bool,
    /// Timeout for stages without their own, in milliseconds.
    pub default_stage_timeout_ms: Option<u64>,
    /// Retry budget for stages without their own.
    pub default_max_retries: u32,
    /// Fixed delay between stage retries, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for StageControllerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".automatosx/checkpoints"),
            checkpoints_enabled: true,
            default_stage_timeout_ms: None,
            default_max_retries: 1,
            retry_delay_ms: 1_000,
        }
    }
}

/// Orchestrates a profile's staged workflow. See the module docs.
pub struct StageExecutionController {
    executor: Arc<AgentExecutor>,
    context_manager: Arc<ContextManager>,
    profiles: Arc<ProfileLoader>,
    memory: Option<Arc<MemoryManager>>,
    config: StageControllerConfig,
}

impl StageExecutionController {
    /// Wire up a controller.
    pub fn new(
        executor: Arc<AgentExecutor>,
        context_manager: Arc<ContextManager>,
        profiles: Arc<ProfileLoader>,
        memory: Option<Arc<MemoryManager>>,
        config: StageControllerConfig,
    ) -> Self {
        Self {
            executor,
            context_manager,
            profiles,
            memory,
            config,
        }
    }

    /// Run an agent's staged workflow from the beginning.
    pub async fn run(
        &self,
        agent: &str,
        task: &str,
        options: &ExecutionOptions,
    ) -> Result<StageRunSummary, StageError> {
        let profile = self
            .profiles
            .load_profile(agent)
            .map_err(|e| StageError::Execution(e.to_string()))?;

        if profile.stages.is_empty() {
            return Err(StageError::NoStages);
        }
        let mut seen = HashSet::new();
        for stage in &profile.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(StageError::DuplicateStageName(stage.name.clone()));
            }
        }

        let now = Utc::now();
        let checkpoint = CheckpointData {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            checksum: String::new(),
            run_id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            task: task.to_string(),
            mode: "stages".to_string(),
            stages: profile
                .stages
                .iter()
                .enumerate()
                .map(|(index, stage)| StageRecord {
                    name: stage.name.clone(),
                    description: stage.description.clone(),
                    index,
                    status: StageStatus::Queued,
                    retries: 0,
                    checkpoint: stage.checkpoint.unwrap_or(true),
                    result: None,
                    error: None,
                })
                .collect(),
            last_completed_stage_index: -1,
            previous_outputs: Vec::new(),
            shared_data: None,
            created_at: now,
            updated_at: now,
        };

        log::info!(
            "Starting stage run {} for '{}' ({} stages)",
            checkpoint.run_id,
            agent,
            profile.stages.len()
        );
        self.execute_stages(checkpoint, &profile.stages, options)
            .await
    }

    /// Resume a checkpointed run from the stage after the last completed
    /// one.
    pub async fn resume(
        &self,
        run_id: &str,
        options: &ExecutionOptions,
    ) -> Result<StageRunSummary, StageError> {
        let mut checkpoint = self.load_checkpoint(run_id).await?;

        let profile = self
            .profiles
            .load_profile(&checkpoint.agent)
            .map_err(|e| StageError::Execution(e.to_string()))?;
        if profile.stages.len() != checkpoint.stages.len() {
            return Err(StageError::CheckpointCorrupt(format!(
                "profile '{}' now has {} stages but the checkpoint recorded {}",
                checkpoint.agent,
                profile.stages.len(),
                checkpoint.stages.len()
            )));
        }

        // Interrupted or failed stages run again; completed ones are
        // skipped. previous_outputs is rebuilt from completed results so
        // later stages see exactly what they would have seen originally.
        for record in &mut checkpoint.stages {
            if matches!(record.status, StageStatus::Running | StageStatus::Error) {
                record.status = StageStatus::Queued;
                record.error = None;
            }
        }
        checkpoint.previous_outputs = checkpoint
            .stages
            .iter()
            .filter(|record| record.status == StageStatus::Completed)
            .filter_map(|record| record.result.as_ref().map(|r| r.content.clone()))
            .collect();

        log::info!(
            "Resuming run {} for '{}' from stage {}",
            checkpoint.run_id,
            checkpoint.agent,
            checkpoint.last_completed_stage_index + 1
        );
        self.execute_stages(checkpoint, &profile.stages, options)
            .await
    }

    /// Load and validate a checkpoint by run id.
    pub async fn load_checkpoint(&self, run_id: &str) -> Result<CheckpointData, StageError> {
        let path = self.checkpoint_path(run_id);
        if !path.exists() {
            return Err(StageError::CheckpointNotFound(run_id.to_string()));
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StageError::Io(e.to_string()))?;
        let checkpoint: CheckpointData = serde_json::from_str(&raw)
            .map_err(|e| StageError::CheckpointCorrupt(e.to_string()))?;

        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(StageError::CheckpointCorrupt(format!(
                "schema version {} is not supported",
                checkpoint.schema_version
            )));
        }
        if !checkpoint.verify() {
            return Err(StageError::CheckpointCorrupt(
                "checksum mismatch".to_string(),
            ));
        }
        if checkpoint.run_id != run_id {
            return Err(StageError::CheckpointCorrupt(format!(
                "checkpoint file for '{}' contains run id '{}'",
                run_id, checkpoint.run_id
            )));
        }
        Ok(checkpoint)
    }

    async fn execute_stages(
        &self,
        mut checkpoint: CheckpointData,
        specs: &[StageSpec],
        options: &ExecutionOptions,
    ) -> Result<StageRunSummary, StageError> {
        for index in 0..specs.len() {
            if checkpoint.stages[index].status == StageStatus::Completed {
                continue;
            }
            let spec = &specs[index];
            let stage_task = build_stage_task(spec, &checkpoint.task, &checkpoint.previous_outputs);

            checkpoint.stages[index].status = StageStatus::Running;
            let max_retries = spec.max_retries.unwrap_or(self.config.default_max_retries);
            let timeout_ms = spec.timeout.or(self.config.default_stage_timeout_ms);

            let mut stage_options = options.clone();
            stage_options.timeout_ms = timeout_ms;
            // Stage-level retries are counted here so they land in the
            // checkpoint; the executor runs each attempt once.
            stage_options.retry = Some(RetryPolicy {
                max_attempts: 1,
                initial_delay: 0,
                max_delay: 0,
                backoff_factor: 1.0,
                retryable_errors: Vec::new(),
            });

            let mut outcome = None;
            let mut last_error = String::new();
            let mut attempt = 0u32;
            while attempt <= max_retries {
                if attempt > 0 {
                    checkpoint.stages[index].retries += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.retry_delay_ms,
                    ))
                    .await;
                }
                attempt += 1;

                let context = match self
                    .context_manager
                    .create_context(
                        &checkpoint.agent,
                        &stage_task,
                        &ContextOptions {
                            session_id: None,
                            delegation_chain: Vec::new(),
                            shared_data: checkpoint.shared_data.clone(),
                            orchestration_disabled: false,
                        },
                    )
                    .await
                {
                    Ok(context) => context,
                    Err(err) => {
                        last_error = err.to_string();
                        continue;
                    }
                };

                match self.executor.execute(context, &stage_options).await {
                    Ok(result) => {
                        outcome = Some(result);
                        break;
                    }
                    Err(err) => {
                        log::warn!(
                            "Stage '{}' attempt {}/{} failed: {}",
                            spec.name,
                            attempt,
                            max_retries + 1,
                            err
                        );
                        last_error = err.to_string();
                    }
                }
            }

            match outcome {
                Some(result) => {
                    let memory_id = if spec.save_to_memory.unwrap_or(false) {
                        self.save_stage_memory(&checkpoint.agent, &spec.name, &result.response.content)
                            .await
                    } else {
                        None
                    };
                    checkpoint.previous_outputs.push(result.response.content.clone());
                    checkpoint.stages[index].status = StageStatus::Completed;
                    checkpoint.stages[index].result = Some(StageResult {
                        content: result.response.content,
                        tokens_used: result.response.tokens_used,
                        duration_ms: result.duration_ms,
                        memory_id,
                    });
                    log::info!(
                        "Stage '{}' completed ({}/{})",
                        spec.name,
                        index + 1,
                        specs.len()
                    );
                }
                None => {
                    checkpoint.stages[index].status = StageStatus::Error;
                    checkpoint.stages[index].error = Some(last_error.clone());
                    log::error!("Stage '{}' failed terminally: {}", spec.name, last_error);
                }
            }

            checkpoint.last_completed_stage_index = last_completed_index(&checkpoint.stages);
            checkpoint.updated_at = Utc::now();

            if self.config.checkpoints_enabled {
                self.save_checkpoint(&mut checkpoint).await?;
            }

            if checkpoint.stages[index].status == StageStatus::Error {
                break;
            }
        }

        let completed = checkpoint
            .stages
            .iter()
            .all(|record| record.status == StageStatus::Completed);
        Ok(StageRunSummary {
            run_id: checkpoint.run_id,
            agent: checkpoint.agent,
            task: checkpoint.task,
            stages: checkpoint.stages,
            completed,
            previous_outputs: checkpoint.previous_outputs,
        })
    }

    async fn save_stage_memory(&self, agent: &str, stage: &str, content: &str) -> Option<i64> {
        let memory = self.memory.as_ref()?;
        let metadata = MemoryMetadata::new(MemoryEntryType::Task, agent).with_tag(stage);
        match memory.add(content, metadata).await {
            Ok(id) => Some(id),
            Err(err) => {
                log::warn!("Cannot save stage '{}' output to memory: {}", stage, err);
                None
            }
        }
    }

    async fn save_checkpoint(&self, checkpoint: &mut CheckpointData) -> Result<(), StageError> {
        checkpoint.checksum = checkpoint.compute_checksum();
        let path = self.checkpoint_path(&checkpoint.run_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| StageError::Io(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StageError::Io(e.to_string()))?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StageError::Io(err.to_string()));
        }
        Ok(())
    }

    fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        // Run ids are UUIDs we minted ourselves, but sanitize anyway so a
        // hostile id cannot escape the checkpoint directory.
        let safe: String = run_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        self.config.checkpoint_dir.join(format!("{}.json", safe))
    }
}

/// Highest index whose status is `completed`, or -1 when none.
fn last_completed_index(stages: &[StageRecord]) -> i64 {
    stages
        .iter()
        .filter(|record| record.status == StageStatus::Completed)
        .map(|record| record.index as i64)
        .max()
        .unwrap_or(-1)
}

/// Synthesize the task text for one stage.
///
/// Sections appear in a fixed order; the optional ones are omitted when
/// the spec has nothing for them. Completed stages' outputs are appended
/// as context for this stage.
pub fn build_stage_task(spec: &StageSpec, original_task: &str, previous_outputs: &[String]) -> String {
    let mut task = String::new();
    task.push_str(&format!("# Stage: {}\n\n", spec.name));
    task.push_str(&format!("## Stage Description\n{}\n\n", spec.description));
    task.push_str(&format!("## Original Task\n{}\n", original_task));

    if !spec.key_questions.is_empty() {
        task.push_str("\n## Key Questions to Address\n");
        for question in &spec.key_questions {
            task.push_str(&format!("- {}\n", question));
        }
    }
    if !spec.outputs.is_empty() {
        task.push_str("\n## Expected Outputs\n");
        for output in &spec.outputs {
            task.push_str(&format!("- {}\n", output));
        }
    }
    if !previous_outputs.is_empty() {
        task.push_str("\n## Previous Stage Outputs\n");
        for (index, output) in previous_outputs.iter().enumerate() {
            task.push_str(&format!("\n### Output {}\n{}\n", index + 1, output));
        }
    }
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            description: format!("{} description", name),
            key_questions: Vec::new(),
            outputs: Vec::new(),
            timeout: None,
            max_retries: None,
            save_to_memory: None,
            checkpoint: None,
        }
    }

    fn record(index: usize, status: StageStatus) -> StageRecord {
        StageRecord {
            name: format!("s{}", index),
            description: String::new(),
            index,
            status,
            retries: 0,
            checkpoint: true,
            result: None,
            error: None,
        }
    }

    #[test]
    fn stage_task_contains_required_sections() {
        let mut stage = spec("plan");
        stage.key_questions = vec!["What changes?".to_string()];
        stage.outputs = vec!["A design doc".to_string()];

        let task = build_stage_task(&stage, "Ship login", &["earlier output".to_string()]);
        assert!(task.starts_with("# Stage: plan"));
        assert!(task.contains("## Stage Description\nplan description"));
        assert!(task.contains("## Original Task\nShip login"));
        assert!(task.contains("## Key Questions to Address\n- What changes?"));
        assert!(task.contains("## Expected Outputs\n- A design doc"));
        assert!(task.contains("## Previous Stage Outputs"));
        assert!(task.contains("earlier output"));
    }

    #[test]
    fn optional_sections_are_omitted() {
        let task = build_stage_task(&spec("implement"), "Ship login", &[]);
        assert!(!task.contains("Key Questions"));
        assert!(!task.contains("Expected Outputs"));
        assert!(!task.contains("Previous Stage Outputs"));
    }

    #[test]
    fn last_completed_is_max_completed_not_cursor() {
        let stages = vec![
            record(0, StageStatus::Completed),
            record(1, StageStatus::Error),
            record(2, StageStatus::Queued),
        ];
        assert_eq!(last_completed_index(&stages), 0);

        let none = vec![record(0, StageStatus::Queued)];
        assert_eq!(last_completed_index(&none), -1);

        let all = vec![
            record(0, StageStatus::Completed),
            record(1, StageStatus::Completed),
        ];
        assert_eq!(last_completed_index(&all), 1);
    }

    #[test]
    fn checksum_round_trip_detects_tampering() {
        let now = Utc::now();
        let mut checkpoint = CheckpointData {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            checksum: String::new(),
            run_id: "run-1".to_string(),
            agent: "backend".to_string(),
            task: "Ship login".to_string(),
            mode: "stages".to_string(),
            stages: vec![record(0, StageStatus::Completed)],
            last_completed_stage_index: 0,
            previous_outputs: vec!["done".to_string()],
            shared_data: None,
            created_at: now,
            updated_at: now,
        };
        checkpoint.checksum = checkpoint.compute_checksum();
        assert!(checkpoint.verify());

        checkpoint.task = "Tampered".to_string();
        assert!(!checkpoint.verify());
    }
}
