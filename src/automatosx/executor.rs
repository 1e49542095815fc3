//! Agent execution: retries, timeouts, cancellation, and prompt assembly.
//!
//! The executor turns an [`ExecutionContext`] into calls on the provider
//! handle the router assigned to it, wraps them in a retry policy with
//! exponential backoff, bounds the whole thing with an optional timeout
//! that fires the run's cancellation token, and finally scans the
//! response for delegation directives and dispatches them (see the
//! [`delegation`](crate::automatosx::delegation) and
//! [`scheduler`](crate::automatosx::scheduler) modules).
//!
//! Retry attempts deliberately re-invoke the *assigned* handle rather
//! than re-entering router selection: a transient `ETIMEDOUT` should be
//! retried against the same backend, while the router's penalty cooldown
//! governs which provider the *next* context is assigned.
//!
//! Prompt assembly is a pure function of the context: sections that exist
//! are concatenated in a fixed order (abilities, workflow stages, memory
//! context, orchestration capabilities, task) and absent sections are
//! omitted entirely.
//!
//! ```text
//!            ┌────────────── timeout (outer bound) ──────────────┐
//! execute →  │  retry: attempt 1 ── delay ── attempt 2 ── ...    │ → response
//!            └──── expiry fires the cancellation token ──────────┘
//!                                       ↓
//!                        parse directives → dispatch delegations
//! ```

use crate::automatosx::cancellation::CancellationToken;
use crate::automatosx::config::{ExecutionSection, RetryConfig};
use crate::automatosx::context::{ContextManager, ExecutionContext};
use crate::automatosx::delegation::{parse_delegations, DelegationError, DelegationResult};
use crate::automatosx::profile::ProfileLoader;
use crate::automatosx::provider::{
    ExecutionRequest, ExecutionResponse, FinishReason, Provider, ProviderError, StreamHandle,
    TokenUsage,
};
use crate::automatosx::session::SessionManager;
use crate::automatosx::workspace::WorkspaceManager;
use futures_util::StreamExt;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Errors raised by the executor.
#[derive(Debug)]
pub enum ExecutionError {
    /// The outer timeout expired; the cancellation token was fired.
    Timeout { timeout_ms: u64 },
    /// The run was cancelled from outside.
    Cancelled,
    /// Every retry attempt failed with a retryable error.
    RetryExhausted { attempts: u32, last_error: String },
    /// The provider failed with a non-retryable error.
    Provider(ProviderError),
    /// Delegation dispatch failed in a way that must surface.
    Delegation(DelegationError),
    /// The options are structurally invalid (e.g. a zero timeout).
    InvalidConfiguration(String),
}

impl ExecutionError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "ExecutionTimeout",
            ExecutionError::Cancelled => "ExecutionCancelled",
            ExecutionError::RetryExhausted { .. } => "RetryExhausted",
            ExecutionError::Provider(_) => "ProviderExecutionError",
            ExecutionError::Delegation(e) => e.code(),
            ExecutionError::InvalidConfiguration(_) => "ConfigError",
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Timeout { timeout_ms } => {
                write!(f, "Execution timed out after {} ms", timeout_ms)
            }
            ExecutionError::Cancelled => write!(f, "Execution was cancelled"),
            ExecutionError::RetryExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "All {} attempts failed; last error: {}",
                attempts, last_error
            ),
            ExecutionError::Provider(e) => write!(f, "{}", e),
            ExecutionError::Delegation(e) => write!(f, "{}", e),
            ExecutionError::InvalidConfiguration(message) => {
                write!(f, "Invalid execution options: {}", message)
            }
        }
    }
}

impl Error for ExecutionError {}

impl From<DelegationError> for ExecutionError {
    fn from(e: DelegationError) -> Self {
        ExecutionError::Delegation(e)
    }
}

/// Runtime retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay: u64,
    /// Multiplier applied per failed attempt.
    pub backoff_factor: f64,
    /// Case-insensitive substrings matched against message + code.
    pub retryable_errors: Vec<String>,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            backoff_factor: config.backoff_factor,
            retryable_errors: config.retryable_errors.clone(),
        }
    }
}

impl RetryPolicy {
    /// Whether an error's text matches any retryable pattern.
    pub fn is_retryable(&self, error_text: &str) -> bool {
        let lower = error_text.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    /// Backoff delay after the `attempt`-th failure (1-based):
    /// `min(initial * factor^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay as f64 * factor).min(self.max_delay as f64);
        Duration::from_millis(delay as u64)
    }
}

/// Streaming callbacks for live output.
///
/// Tokens arrive as a finite, non-restartable sequence; progress values
/// are forwarded monotonically non-decreasing even when the provider's
/// channel jitters.
#[derive(Clone, Default)]
pub struct StreamingSinks {
    pub on_token: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_progress: Option<Arc<dyn Fn(u8) + Send + Sync>>,
}

impl fmt::Debug for StreamingSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSinks")
            .field("on_token", &self.on_token.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Emit verbose progress logging.
    pub verbose: bool,
    /// Forward progress to the streaming sink when available.
    pub show_progress: bool,
    /// Retry policy; defaults to the config-driven policy.
    pub retry: Option<RetryPolicy>,
    /// Outer timeout in milliseconds. Zero is a configuration error.
    pub timeout_ms: Option<u64>,
    /// Parent cancellation token.
    pub cancellation_token: Option<CancellationToken>,
    /// Run multi-delegation batches through the parallel scheduler.
    pub parallel_enabled: bool,
    /// Concurrency bound for parallel delegation; defaults to
    /// `execution.maxConcurrentAgents`.
    pub max_concurrent_delegations: Option<usize>,
    /// Capture per-delegation failures instead of aborting the batch.
    /// Defaults to true via [`ExecutionOptions::default_continue`].
    pub continue_delegations_on_failure: Option<bool>,
    /// Streaming callbacks; streaming is used only when the provider
    /// advertises it too.
    pub streaming: Option<StreamingSinks>,
}

impl ExecutionOptions {
    /// Effective `continue_delegations_on_failure` (defaults to true).
    pub fn default_continue(&self) -> bool {
        self.continue_delegations_on_failure.unwrap_or(true)
    }
}

/// Outcome of a full agent run.
#[derive(Debug)]
pub struct ExecutionResult {
    /// The provider response.
    pub response: ExecutionResponse,
    /// Wall-clock duration of the whole run in milliseconds.
    pub duration_ms: u64,
    /// Results of any delegations the response requested, in directive
    /// order.
    pub delegations: Vec<DelegationResult>,
}

/// Runs agents end-to-end. See the module docs.
///
/// The delegation-related collaborators are optional: an executor without
/// them can run single agents but raises `DelegationNotConfigured` when a
/// response tries to delegate.
pub struct AgentExecutor {
    pub(crate) context_manager: Option<Arc<ContextManager>>,
    pub(crate) profiles: Option<Arc<ProfileLoader>>,
    pub(crate) workspaces: Option<Arc<WorkspaceManager>>,
    pub(crate) sessions: Option<Arc<SessionManager>>,
    pub(crate) defaults: ExecutionSection,
}

impl AgentExecutor {
    /// Create an executor that can run single agents.
    pub fn new() -> Self {
        Self {
            context_manager: None,
            profiles: None,
            workspaces: None,
            sessions: None,
            defaults: ExecutionSection::default(),
        }
    }

    /// Attach the context manager required for delegation (builder pattern).
    pub fn with_context_manager(mut self, manager: Arc<ContextManager>) -> Self {
        self.context_manager = Some(manager);
        self
    }

    /// Attach the profile loader required for delegation (builder pattern).
    pub fn with_profiles(mut self, profiles: Arc<ProfileLoader>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Attach the workspace manager required for delegation (builder pattern).
    pub fn with_workspaces(mut self, workspaces: Arc<WorkspaceManager>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    /// Attach a session manager; without one, delegation runs in
    /// text-only mode and never joins sessions (builder pattern).
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Override the config-driven execution defaults (builder pattern).
    pub fn with_defaults(mut self, defaults: ExecutionSection) -> Self {
        self.defaults = defaults;
        self
    }

    /// Run a single agent end-to-end: provider call with retry/timeout,
    /// then delegation dispatch for any directives in the response.
    pub async fn execute(
        self: &Arc<Self>,
        context: ExecutionContext,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();

        if options.timeout_ms == Some(0) {
            return Err(ExecutionError::InvalidConfiguration(
                "timeout must be positive".to_string(),
            ));
        }

        let run_token = match &options.cancellation_token {
            Some(parent) => parent.child(),
            None => CancellationToken::new(),
        };

        let prompt = build_prompt(&context);
        let request = ExecutionRequest {
            prompt,
            system_prompt: non_empty(&context.profile.system_prompt),
            model: context.profile.model.clone(),
            temperature: context.profile.temperature,
            max_tokens: context.profile.max_tokens,
            cancellation_token: Some(run_token.clone()),
        };

        if options.verbose {
            log::info!(
                "Executing agent '{}' ({} prompt chars)",
                context.profile.name,
                request.prompt.len()
            );
        }

        let retry = options
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::from(&self.defaults.default_retry));
        let timeout_ms = options.timeout_ms.or(self.defaults.default_timeout);

        let provider = context.provider.clone();
        let response = self
            .run_bounded(&provider, &request, &retry, timeout_ms, &run_token, options)
            .await?;

        let mut delegations = Vec::new();
        if context.orchestration.is_some() {
            let parsed = parse_delegations(&response.content);
            if !parsed.is_empty() {
                log::info!(
                    "Agent '{}' requested {} delegation(s)",
                    context.profile.name,
                    parsed.len()
                );
                delegations = self
                    .execute_delegations(parsed, &context, options)
                    .await
                    .map_err(ExecutionError::Delegation)?;
            }
        }

        Ok(ExecutionResult {
            response,
            duration_ms: started.elapsed().as_millis() as u64,
            delegations,
        })
    }

    /// Race the retry-wrapped provider call against timeout expiry and
    /// external cancellation. The timeout is the outer bound: it wins
    /// over any in-flight retry and fires the run token exactly once.
    async fn run_bounded(
        &self,
        provider: &Arc<dyn Provider>,
        request: &ExecutionRequest,
        retry: &RetryPolicy,
        timeout_ms: Option<u64>,
        run_token: &CancellationToken,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResponse, ExecutionError> {
        let parent = options.cancellation_token.clone();
        let parent_wait = async {
            match parent {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let work = self.run_with_retry(provider, request, retry, run_token, options);
        tokio::pin!(work);

        match timeout_ms {
            Some(timeout_ms) => {
                tokio::select! {
                    result = &mut work => result,
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                        run_token.cancel();
                        Err(ExecutionError::Timeout { timeout_ms })
                    }
                    _ = parent_wait => {
                        run_token.cancel();
                        Err(ExecutionError::Cancelled)
                    }
                }
            }
            None => {
                tokio::select! {
                    result = &mut work => result,
                    _ = parent_wait => {
                        run_token.cancel();
                        Err(ExecutionError::Cancelled)
                    }
                }
            }
        }
    }

    async fn run_with_retry(
        &self,
        provider: &Arc<dyn Provider>,
        request: &ExecutionRequest,
        retry: &RetryPolicy,
        run_token: &CancellationToken,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResponse, ExecutionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match run_provider_once(provider, request, options).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let text = err.match_text();
                    if !retry.is_retryable(&text) {
                        return Err(ExecutionError::Provider(err));
                    }
                    if attempt >= retry.max_attempts {
                        if retry.max_attempts == 1 {
                            return Err(ExecutionError::Provider(err));
                        }
                        return Err(ExecutionError::RetryExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    log::warn!(
                        "Attempt {}/{} failed ({}); retrying in {} ms",
                        attempt,
                        retry.max_attempts,
                        text,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = run_token.cancelled() => {
                            return Err(ExecutionError::Cancelled);
                        }
                    }
                }
            }
        }
    }
}

impl Default for AgentExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// One provider round-trip on the assigned handle. Streaming is selected
/// only when the caller asked for it *and* the provider advertises it;
/// every other case takes the buffered path.
async fn run_provider_once(
    provider: &Arc<dyn Provider>,
    request: &ExecutionRequest,
    options: &ExecutionOptions,
) -> Result<ExecutionResponse, ProviderError> {
    if let Some(sinks) = &options.streaming {
        if provider.capabilities().streaming {
            match provider.execute_streaming(request).await {
                Ok(Some(handle)) => {
                    return drain_stream(provider.as_ref(), handle, sinks).await;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!(
                        "Streaming setup on '{}' failed ({}); using buffered path",
                        provider.name(),
                        err
                    );
                }
            }
        }
    }
    provider.execute(request).await
}

fn non_empty(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

async fn drain_stream(
    provider: &dyn Provider,
    mut handle: StreamHandle,
    sinks: &StreamingSinks,
) -> Result<ExecutionResponse, ProviderError> {
    let started = Instant::now();

    if let Some(mut progress) = handle.progress.take() {
        let on_progress = sinks.on_progress.clone();
        tokio::spawn(async move {
            let mut last = 0u8;
            while let Some(percent) = progress.recv().await {
                let percent = percent.max(last);
                last = percent;
                if let Some(sink) = &on_progress {
                    sink(percent);
                }
            }
        });
    }

    let mut content = String::new();
    let mut finish_reason = FinishReason::Stop;
    while let Some(chunk) = handle.tokens.next().await {
        let chunk = chunk?;
        if !chunk.content.is_empty() {
            if let Some(sink) = &sinks.on_token {
                sink(&chunk.content);
            }
            content.push_str(&chunk.content);
        }
        if let Some(reason) = chunk.finish_reason {
            finish_reason = reason;
        }
    }

    Ok(ExecutionResponse {
        content,
        model: provider.name().to_string(),
        // Streaming adapters report usage out of band; the buffered path
        // is authoritative for token accounting.
        tokens_used: TokenUsage::default(),
        latency_ms: started.elapsed().as_millis() as u64,
        finish_reason,
    })
}

/// Cap on agent names listed verbatim in the orchestration prompt section.
const MAX_LISTED_AGENTS: usize = 10;

/// Assemble the full prompt from a context. Pure; sections that do not
/// apply are omitted, and no populated field is ever dropped silently.
pub fn build_prompt(context: &ExecutionContext) -> String {
    let mut prompt = String::new();

    if !context.abilities_text.is_empty() {
        prompt.push_str("# Your Abilities\n\n");
        prompt.push_str(&context.abilities_text);
        prompt.push_str("\n\n");
    }

    if !context.profile.stages.is_empty() {
        prompt.push_str("# Your Workflow Stages\n\n");
        for (index, stage) in context.profile.stages.iter().enumerate() {
            prompt.push_str(&format!("{}. {} - {}\n", index + 1, stage.name, stage.description));
            if !stage.key_questions.is_empty() {
                prompt.push_str("   Key questions:\n");
                for question in &stage.key_questions {
                    prompt.push_str(&format!("   - {}\n", question));
                }
            }
            if !stage.outputs.is_empty() {
                prompt.push_str("   Expected outputs:\n");
                for output in &stage.outputs {
                    prompt.push_str(&format!("   - {}\n", output));
                }
            }
        }
        prompt.push('\n');
    }

    if !context.memory_hits.is_empty() {
        prompt.push_str("# Relevant Context from Memory\n\n");
        for hit in &context.memory_hits {
            match hit.relevance {
                Some(relevance) => prompt.push_str(&format!(
                    "- {} (relevance: {}%)\n",
                    hit.content,
                    (relevance * 100.0).round() as u32
                )),
                None => prompt.push_str(&format!("- {}\n", hit.content)),
            }
        }
        prompt.push('\n');
    }

    if let Some(orchestration) = &context.orchestration {
        prompt.push_str("# Multi-Agent Orchestration Capabilities\n\n");
        prompt.push_str(
            "Evaluate whether you can complete the task yourself first; \
             delegate only work that genuinely needs another specialist.\n\n",
        );

        let listed: Vec<&str> = orchestration
            .available_agents
            .iter()
            .take(MAX_LISTED_AGENTS)
            .map(|s| s.as_str())
            .collect();
        let mut agents_line = listed.join(", ");
        if orchestration.available_agents.len() > MAX_LISTED_AGENTS {
            agents_line.push_str(&format!(
                ", …and {} more",
                orchestration.available_agents.len() - MAX_LISTED_AGENTS
            ));
        }
        prompt.push_str(&format!("Available agents: {}\n", agents_line));

        if let Some(session_id) = &context.session_id {
            prompt.push_str(&format!("Current session: {}\n", session_id));
        }
        if !orchestration.delegation_chain.is_empty() {
            prompt.push_str(&format!(
                "Delegation chain: {}\n",
                orchestration.delegation_chain.join(" -> ")
            ));
        }
        prompt.push_str(&format!(
            "Delegation depth: {} of {}\n\n",
            orchestration.delegation_chain.len(),
            orchestration.max_delegation_depth
        ));

        prompt.push_str(
            "To delegate, write one of:\n\
             DELEGATE TO <agent>: <task>\n\
             @<agent> <task>\n\n",
        );
    }

    prompt.push_str("# Task\n\n");
    prompt.push_str(&context.task);
    prompt
}
