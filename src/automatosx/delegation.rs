//! Delegation directives, safety checks, and sequential dispatch.
//!
//! After a successful agent response the executor scans the content for
//! delegation directives. Five forms are recognized, keywords matched
//! case-insensitively:
//!
//! ```text
//! DELEGATE TO backend: implement the login endpoint
//! @frontend build the login form
//! Please ask qa to verify the login flow
//! I need writer to document the API
//! 請 backend 實作登入端點
//! ```
//!
//! A directive's task text runs to the next blank line, the next
//! directive, or the end of the response. Duplicate (agent, task) pairs
//! collapse to the first occurrence.
//!
//! Dispatch applies the delegation safety rules in order: depth limit
//! (taken from the *chain initiator's* profile), cycle rejection, session
//! join/create, then a fresh sub-context with the extended chain.
//! Deprecated per-profile whitelists are logged and ignored; safety
//! reduces to cycle + depth + timeout.

use crate::automatosx::context::{ContextOptions, ExecutionContext};
use crate::automatosx::executor::{AgentExecutor, ExecutionError, ExecutionOptions};
use crate::automatosx::paths::path_to_storage;
use crate::automatosx::profile::DEFAULT_MAX_DELEGATION_DEPTH;
use crate::automatosx::provider::{ExecutionResponse, FinishReason, TokenUsage};
use crate::automatosx::session::SessionStatus;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

lazy_static! {
    static ref DELEGATE_TO_RE: Regex =
        Regex::new(r"(?im)^[ \t]*DELEGATE[ \t]+TO[ \t]+([A-Za-z0-9_-]+):[ \t]*").unwrap();
    static ref AT_MENTION_RE: Regex =
        Regex::new(r"(?m)^[ \t]*@([A-Za-z0-9_-]+)[ \t]+").unwrap();
    static ref PLEASE_ASK_RE: Regex =
        Regex::new(r"(?i)Please[ \t]+ask[ \t]+([A-Za-z0-9_-]+)[ \t]+to[ \t]+").unwrap();
    static ref I_NEED_RE: Regex =
        Regex::new(r"(?i)I[ \t]+need[ \t]+([A-Za-z0-9_-]+)[ \t]+to[ \t]+").unwrap();
    static ref CHINESE_RE: Regex = Regex::new(r"請\s*([A-Za-z0-9_-]+)[ \t]*").unwrap();
    static ref BLANK_LINE_RE: Regex = Regex::new(r"\n[ \t]*\r?\n").unwrap();
}

/// Errors raised by delegation dispatch.
#[derive(Debug)]
pub enum DelegationError {
    /// The executor lacks the context manager, profile loader, or
    /// workspace manager required for delegation.
    NotConfigured,
    /// The target already appears in the delegation chain.
    Cycle { agent: String, chain: Vec<String> },
    /// The chain has reached the initiator's depth limit.
    MaxDepthExceeded { depth: usize, max_depth: usize },
    /// A delegation failed and the batch was configured to abort.
    ExecutionFailed(String),
    /// The in-batch dependency graph contains a cycle.
    DependencyCycle { agents: Vec<String> },
}

impl DelegationError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            DelegationError::NotConfigured => "DelegationNotConfigured",
            DelegationError::Cycle { .. } => "DelegationCycle",
            DelegationError::MaxDepthExceeded { .. } => "MaxDepthExceeded",
            DelegationError::ExecutionFailed(_) => "DelegationExecutionFailed",
            DelegationError::DependencyCycle { .. } => "DependencyCycle",
        }
    }
}

impl fmt::Display for DelegationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationError::NotConfigured => write!(
                f,
                "Delegation requires a context manager, profile loader, and workspace manager"
            ),
            DelegationError::Cycle { agent, chain } => write!(
                f,
                "Delegating to '{}' would close a cycle (chain: {})",
                agent,
                chain.join(" -> ")
            ),
            DelegationError::MaxDepthExceeded { depth, max_depth } => write!(
                f,
                "Delegation chain depth {} has reached the limit of {}",
                depth, max_depth
            ),
            DelegationError::ExecutionFailed(message) => {
                write!(f, "Delegation failed: {}", message)
            }
            DelegationError::DependencyCycle { agents } => write!(
                f,
                "Dependency cycle between delegated agents: {}",
                agents.join(", ")
            ),
        }
    }
}

impl Error for DelegationError {}

/// A directive parsed out of an agent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDelegation {
    pub to_agent: String,
    pub task: String,
}

/// A request to run one named sub-agent.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub from_agent: String,
    pub to_agent: String,
    pub task: String,
    pub session_id: Option<String>,
    /// The chain that led to `from_agent`; empty at the root.
    pub delegation_chain: Vec<String>,
    pub shared_data: Option<Value>,
}

/// Terminal state of one delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Success,
    Failure,
    /// Never ran because an in-batch dependency did not complete.
    Skipped,
}

/// Artifacts a delegated run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationOutputs {
    /// Workspace-relative files created or modified during the run.
    pub files: Vec<String>,
    /// Memory entries written during the run (stage pipelines populate
    /// this; plain delegations leave it empty).
    pub memory_ids: Vec<i64>,
    /// The delegated agent's workspace, in storage form.
    pub workspace_path: Option<String>,
}

/// Outcome of one delegation. Structurally complete even on failure: a
/// failed delegation carries a synthesized error response and empty
/// outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationResult {
    /// UUIDv4 identifying this delegation.
    pub delegation_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: DelegationStatus,
    pub response: ExecutionResponse,
    pub outputs: DelegationOutputs,
}

struct DirectiveMatch {
    start: usize,
    task_start: usize,
    name: String,
}

/// Scan a response for delegation directives.
///
/// Returns directives in order of first occurrence with duplicate
/// (agent, task) pairs removed.
///
/// # Example
///
/// ```rust
/// use automatosx::delegation::parse_delegations;
///
/// let parsed = parse_delegations(
///     "I'll split this up.\n\nDELEGATE TO backend: build the API\n@frontend build the UI",
/// );
/// assert_eq!(parsed.len(), 2);
/// assert_eq!(parsed[0].to_agent, "backend");
/// assert_eq!(parsed[0].task, "build the API");
/// assert_eq!(parsed[1].to_agent, "frontend");
/// ```
pub fn parse_delegations(content: &str) -> Vec<ParsedDelegation> {
    let mut matches: Vec<DirectiveMatch> = Vec::new();
    let patterns: [&Regex; 5] = [
        &DELEGATE_TO_RE,
        &AT_MENTION_RE,
        &PLEASE_ASK_RE,
        &I_NEED_RE,
        &CHINESE_RE,
    ];
    for pattern in patterns {
        for caps in pattern.captures_iter(content) {
            let whole = caps.get(0).expect("capture 0 always present");
            let name = caps.get(1).expect("directive captures a name");
            matches.push(DirectiveMatch {
                start: whole.start(),
                task_start: whole.end(),
                name: name.as_str().to_string(),
            });
        }
    }
    matches.sort_by_key(|m| m.start);

    let starts: Vec<usize> = matches.iter().map(|m| m.start).collect();
    let mut parsed: Vec<ParsedDelegation> = Vec::new();
    for m in &matches {
        // The task runs to the next blank line, the next directive, or
        // the end of the response, whichever comes first.
        let mut end = content.len();
        if let Some(blank) = BLANK_LINE_RE.find_at(content, m.task_start) {
            end = end.min(blank.start());
        }
        if let Some(&next) = starts.iter().find(|&&s| s > m.task_start) {
            end = end.min(next);
        }
        let task = content[m.task_start..end].trim();
        if task.is_empty() {
            continue;
        }
        let candidate = ParsedDelegation {
            to_agent: m.name.clone(),
            task: task.to_string(),
        };
        if !parsed.contains(&candidate) {
            parsed.push(candidate);
        }
    }
    parsed
}

fn synthesized_response(message: String) -> ExecutionResponse {
    ExecutionResponse {
        content: message,
        model: String::new(),
        tokens_used: TokenUsage::default(),
        latency_ms: 0,
        finish_reason: FinishReason::Error,
    }
}

pub(crate) fn skipped_result(request: &DelegationRequest, failed_dependency: &str) -> DelegationResult {
    let now = Utc::now();
    DelegationResult {
        delegation_id: Uuid::new_v4().to_string(),
        from_agent: request.from_agent.clone(),
        to_agent: request.to_agent.clone(),
        start_time: now,
        end_time: now,
        duration_ms: 0,
        status: DelegationStatus::Skipped,
        response: synthesized_response(format!(
            "Skipped: dependency '{}' did not complete",
            failed_dependency
        )),
        outputs: DelegationOutputs::default(),
    }
}

impl AgentExecutor {
    /// Run one named sub-agent, enforcing the delegation safety rules.
    ///
    /// Safety violations (missing collaborators, depth, cycles, a dead
    /// session) surface as errors before any sub-execution is attempted.
    /// Failures *during* the sub-run are captured into a
    /// [`DelegationResult`] with `status = failure` instead.
    pub async fn delegate_to_agent(
        self: &Arc<Self>,
        request: DelegationRequest,
        options: &ExecutionOptions,
    ) -> Result<DelegationResult, DelegationError> {
        let context_manager = self
            .context_manager
            .as_ref()
            .ok_or(DelegationError::NotConfigured)?;
        let profiles = self.profiles.as_ref().ok_or(DelegationError::NotConfigured)?;
        let workspaces = self
            .workspaces
            .as_ref()
            .ok_or(DelegationError::NotConfigured)?;

        // Depth limit belongs to the initiator of the chain.
        let initiator = request
            .delegation_chain
            .first()
            .cloned()
            .unwrap_or_else(|| request.from_agent.clone());
        let max_depth = match profiles.load_profile(&initiator) {
            Ok(profile) => profile.max_delegation_depth(),
            Err(err) => {
                log::warn!(
                    "Cannot load initiator profile '{}' ({}); using default depth",
                    initiator,
                    err
                );
                DEFAULT_MAX_DELEGATION_DEPTH
            }
        };
        if request.delegation_chain.len() >= max_depth {
            return Err(DelegationError::MaxDepthExceeded {
                depth: request.delegation_chain.len(),
                max_depth,
            });
        }

        if request
            .delegation_chain
            .iter()
            .any(|agent| agent == &request.to_agent)
        {
            return Err(DelegationError::Cycle {
                agent: request.to_agent.clone(),
                chain: request.delegation_chain.clone(),
            });
        }

        // With no session manager, delegation degrades to text-only mode
        // and whatever session id the caller passed rides along unused.
        let session_id = match &self.sessions {
            Some(sessions) => match &request.session_id {
                Some(id) => {
                    let session = sessions.get_session(id).await.ok_or_else(|| {
                        DelegationError::ExecutionFailed(format!("session '{}' not found", id))
                    })?;
                    if session.status != SessionStatus::Active {
                        return Err(DelegationError::ExecutionFailed(format!(
                            "session '{}' is not active",
                            id
                        )));
                    }
                    sessions
                        .add_agent(id, &request.to_agent)
                        .await
                        .map_err(|e| DelegationError::ExecutionFailed(e.to_string()))?;
                    Some(id.clone())
                }
                None => {
                    let session = sessions
                        .create_session(&request.task, &request.from_agent)
                        .await
                        .map_err(|e| DelegationError::ExecutionFailed(e.to_string()))?;
                    sessions
                        .add_agent(&session.id, &request.to_agent)
                        .await
                        .map_err(|e| DelegationError::ExecutionFailed(e.to_string()))?;
                    Some(session.id)
                }
            },
            None => request.session_id.clone(),
        };

        let mut chain = request.delegation_chain.clone();
        chain.push(request.from_agent.clone());

        let context = context_manager
            .create_context(
                &request.to_agent,
                &request.task,
                &ContextOptions {
                    session_id: session_id.clone(),
                    delegation_chain: chain,
                    shared_data: request.shared_data.clone(),
                    orchestration_disabled: false,
                },
            )
            .await
            .map_err(|e| DelegationError::ExecutionFailed(e.to_string()))?;

        let workspace = context.workspace.clone();
        let delegation_id = Uuid::new_v4().to_string();
        let start_time = Utc::now();
        let started = std::time::Instant::now();
        let fs_watermark = SystemTime::now();

        log::info!(
            "Delegation {}: '{}' -> '{}'",
            delegation_id,
            request.from_agent,
            request.to_agent
        );

        // Indirection breaks the execute -> delegate -> execute recursion.
        let outcome = Box::pin(self.execute(context, options)).await;
        let end_time = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => Ok(DelegationResult {
                delegation_id,
                from_agent: request.from_agent,
                to_agent: request.to_agent,
                start_time,
                end_time,
                duration_ms,
                status: DelegationStatus::Success,
                response: result.response,
                outputs: DelegationOutputs {
                    files: workspaces.files_modified_since(&workspace, fs_watermark),
                    memory_ids: Vec::new(),
                    workspace_path: Some(path_to_storage(&workspace)),
                },
            }),
            Err(err) => {
                log::warn!(
                    "Delegation {} to '{}' failed: {}",
                    delegation_id,
                    request.to_agent,
                    err
                );
                Ok(DelegationResult {
                    delegation_id,
                    from_agent: request.from_agent,
                    to_agent: request.to_agent,
                    start_time,
                    end_time,
                    duration_ms,
                    status: DelegationStatus::Failure,
                    response: synthesized_response(format!(
                        "Delegation failed: {} ({})",
                        err,
                        err.code()
                    )),
                    outputs: DelegationOutputs::default(),
                })
            }
        }
    }

    /// Dispatch a batch of parsed directives for a parent run.
    ///
    /// Batches of more than one directive go through the parallel
    /// scheduler when `parallel_enabled` is set; a single directive
    /// always takes the sequential path.
    pub async fn execute_delegations(
        self: &Arc<Self>,
        parsed: Vec<ParsedDelegation>,
        parent: &ExecutionContext,
        options: &ExecutionOptions,
    ) -> Result<Vec<DelegationResult>, DelegationError> {
        if parsed.is_empty() {
            return Ok(Vec::new());
        }
        if self.context_manager.is_none() || self.profiles.is_none() || self.workspaces.is_none() {
            return Err(DelegationError::NotConfigured);
        }

        let chain = parent
            .orchestration
            .as_ref()
            .map(|o| o.delegation_chain.clone())
            .unwrap_or_default();

        let requests: Vec<DelegationRequest> = parsed
            .into_iter()
            .map(|directive| DelegationRequest {
                from_agent: parent.profile.name.clone(),
                to_agent: directive.to_agent,
                task: directive.task,
                session_id: parent.session_id.clone(),
                delegation_chain: chain.clone(),
                shared_data: parent.shared_data.clone(),
            })
            .collect();

        if options.parallel_enabled && requests.len() > 1 {
            return crate::automatosx::scheduler::execute_parallel(self, requests, options).await;
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let to_agent = request.to_agent.clone();
            let result = self.delegate_to_agent(request, options).await?;
            let failed = result.status == DelegationStatus::Failure;
            let summary = result.response.content.clone();
            results.push(result);
            if failed && !options.default_continue() {
                return Err(DelegationError::ExecutionFailed(format!(
                    "delegation to '{}' failed: {}",
                    to_agent, summary
                )));
            }
        }
        Ok(results)
    }
}

/// Convenience conversion so executor callers can bubble delegation
/// failures without losing the code.
impl From<ExecutionError> for DelegationError {
    fn from(err: ExecutionError) -> Self {
        DelegationError::ExecutionFailed(err.to_string())
    }
}
