use async_trait::async_trait;
use automatosx::context::{ExecutionContext, MemoryHit, Orchestration};
use automatosx::executor::{build_prompt, AgentExecutor, ExecutionError, ExecutionOptions, RetryPolicy, StreamingSinks};
use automatosx::profile::AgentProfile;
use automatosx::provider::{
    ExecutionRequest, ExecutionResponse, FinishReason, Provider, ProviderCapabilities,
    ProviderError, StreamHandle, TokenChunk, TokenUsage,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct ScriptedProvider {
    name: String,
    response: String,
    fail_first: usize,
    fail_message: String,
    delay_ms: u64,
    calls: AtomicUsize,
    seen_token: Mutex<Option<automatosx::cancellation::CancellationToken>>,
    streaming: bool,
}

impl ScriptedProvider {
    fn ok(response: &str) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".to_string(),
            response: response.to_string(),
            fail_first: 0,
            fail_message: String::new(),
            delay_ms: 0,
            calls: AtomicUsize::new(0),
            seen_token: Mutex::new(None),
            streaming: false,
        })
    }

    fn flaky(response: &str, fail_first: usize, fail_message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".to_string(),
            response: response.to_string(),
            fail_first,
            fail_message: fail_message.to_string(),
            delay_ms: 0,
            calls: AtomicUsize::new(0),
            seen_token: Mutex::new(None),
            streaming: false,
        })
    }

    fn slow(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".to_string(),
            response: "late".to_string(),
            fail_first: 0,
            fail_message: String::new(),
            delay_ms,
            calls: AtomicUsize::new(0),
            seen_token: Mutex::new(None),
            streaming: false,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: self.streaming,
            cancellation: true,
        }
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_token.lock().unwrap() = request.cancellation_token.clone();

        if self.delay_ms > 0 {
            let wait = tokio::time::sleep(Duration::from_millis(self.delay_ms));
            match &request.cancellation_token {
                Some(token) => {
                    tokio::select! {
                        _ = wait => {}
                        _ = token.cancelled() => {
                            return Err(ProviderError::new("cancelled by caller"));
                        }
                    }
                }
                None => wait.await,
            }
        }

        if call < self.fail_first {
            return Err(ProviderError::new(self.fail_message.clone()));
        }
        Ok(ExecutionResponse {
            content: self.response.clone(),
            model: self.name.clone(),
            tokens_used: TokenUsage::new(10, 20),
            latency_ms: self.delay_ms,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn execute_streaming(
        &self,
        _request: &ExecutionRequest,
    ) -> Result<Option<StreamHandle>, ProviderError> {
        if !self.streaming {
            return Ok(None);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Result<TokenChunk, ProviderError>> = vec![
            Ok(TokenChunk {
                content: "stream".to_string(),
                finish_reason: None,
            }),
            Ok(TokenChunk {
                content: "ed".to_string(),
                finish_reason: Some(FinishReason::Stop),
            }),
        ];
        Ok(Some(StreamHandle {
            tokens: Box::pin(futures_util::stream::iter(chunks)),
            progress: None,
        }))
    }

    async fn is_available(&self) -> bool {
        true
    }
}

fn profile(yaml: &str) -> Arc<AgentProfile> {
    Arc::new(serde_yaml::from_str(yaml).unwrap())
}

fn context(provider: Arc<dyn Provider>, task: &str) -> ExecutionContext {
    ExecutionContext {
        profile: profile("name: backend\n"),
        task: task.to_string(),
        abilities_text: String::new(),
        memory_hits: Vec::new(),
        provider,
        orchestration: None,
        session_id: None,
        workspace: PathBuf::from("/tmp/workspace"),
        shared_data: None,
    }
}

fn executor() -> Arc<AgentExecutor> {
    Arc::new(AgentExecutor::new())
}

fn retry(max_attempts: u32, initial: u64, max: u64, factor: f64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: initial,
        max_delay: max,
        backoff_factor: factor,
        retryable_errors: vec![
            "ECONNREFUSED".to_string(),
            "ETIMEDOUT".to_string(),
            "ENOTFOUND".to_string(),
            "rate_limit".to_string(),
            "overloaded".to_string(),
            "timeout".to_string(),
        ],
    }
}

#[tokio::test]
async fn simple_run_returns_the_provider_response() {
    let provider = ScriptedProvider::ok("hi");
    let executor = executor();

    let result = executor
        .execute(context(provider.clone(), "ping"), &ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.response.content, "hi");
    assert_eq!(result.response.tokens_used.total, 30);
    assert_eq!(result.response.finish_reason, FinishReason::Stop);
    assert!(result.delegations.is_empty());
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn retry_succeeds_on_third_attempt_with_backoff() {
    let provider = ScriptedProvider::flaky("recovered", 2, "ETIMEDOUT");
    let executor = executor();
    let options = ExecutionOptions {
        retry: Some(retry(3, 10, 100, 2.0)),
        ..Default::default()
    };

    let started = Instant::now();
    let result = executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
        .unwrap();

    assert_eq!(result.response.content, "recovered");
    assert_eq!(provider.calls(), 3);
    // Two backoff sleeps: 10 ms then 20 ms.
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn max_attempts_one_performs_exactly_one_call() {
    let provider = ScriptedProvider::flaky("never", 5, "ETIMEDOUT");
    let executor = executor();
    let options = ExecutionOptions {
        retry: Some(retry(1, 10, 100, 2.0)),
        ..Default::default()
    };

    let err = executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
        .unwrap_err();
    assert_eq!(provider.calls(), 1);
    assert!(matches!(err, ExecutionError::Provider(_)));
}

#[tokio::test]
async fn non_retryable_errors_propagate_immediately() {
    let provider = ScriptedProvider::flaky("never", 5, "invalid api key");
    let executor = executor();
    let options = ExecutionOptions {
        retry: Some(retry(3, 10, 100, 2.0)),
        ..Default::default()
    };

    let err = executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
        .unwrap_err();
    assert_eq!(provider.calls(), 1);
    assert!(matches!(err, ExecutionError::Provider(_)));
}

#[tokio::test]
async fn retry_exhaustion_reports_the_last_error() {
    let provider = ScriptedProvider::flaky("never", 5, "ETIMEDOUT");
    let executor = executor();
    let options = ExecutionOptions {
        retry: Some(retry(3, 1, 10, 2.0)),
        ..Default::default()
    };

    match executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
    {
        Err(ExecutionError::RetryExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("ETIMEDOUT"));
        }
        other => panic!("expected RetryExhausted, got {:?}", other.map(|r| r.response.content)),
    }
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn zero_timeout_is_a_configuration_error() {
    let provider = ScriptedProvider::ok("hi");
    let executor = executor();
    let options = ExecutionOptions {
        timeout_ms: Some(0),
        ..Default::default()
    };

    let err = executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidConfiguration(_)));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn timeout_cancels_the_inflight_request() {
    let provider = ScriptedProvider::slow(5_000);
    let executor = executor();
    let options = ExecutionOptions {
        timeout_ms: Some(50),
        ..Default::default()
    };

    let started = Instant::now();
    let err = executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::Timeout { timeout_ms: 50 }));
    assert!(started.elapsed() < Duration::from_secs(2));
    // The expired timeout fired the run's cancellation token, which the
    // provider received with the request.
    let token = provider.seen_token.lock().unwrap().clone().unwrap();
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn streaming_is_used_when_requested_and_advertised() {
    let provider = Arc::new(ScriptedProvider {
        name: "streamer".to_string(),
        response: "unused".to_string(),
        fail_first: 0,
        fail_message: String::new(),
        delay_ms: 0,
        calls: AtomicUsize::new(0),
        seen_token: Mutex::new(None),
        streaming: true,
    });
    let executor = executor();

    let tokens: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_tokens = tokens.clone();
    let options = ExecutionOptions {
        streaming: Some(StreamingSinks {
            on_token: Some(Arc::new(move |chunk: &str| {
                sink_tokens.lock().unwrap().push(chunk.to_string());
            })),
            on_progress: None,
        }),
        ..Default::default()
    };

    let result = executor
        .execute(context(provider.clone(), "ping"), &options)
        .await
        .unwrap();

    assert_eq!(result.response.content, "streamed");
    assert_eq!(
        tokens.lock().unwrap().clone(),
        vec!["stream".to_string(), "ed".to_string()]
    );
}

#[test]
fn prompt_sections_appear_in_order_with_agent_cap() {
    let provider: Arc<dyn Provider> = ScriptedProvider::ok("hi");
    let many_agents: Vec<String> = (0..12).map(|i| format!("agent-{:02}", i)).collect();

    let ctx = ExecutionContext {
        profile: profile(
            "name: backend\nsystemPrompt: Be concise.\nstages:\n  - name: plan\n    description: Outline the change\n    keyQuestions:\n      - What is risky?\n    outputs:\n      - A plan\n",
        ),
        task: "Ship the login page".to_string(),
        abilities_text: "## code-review\n\nLook for bugs.".to_string(),
        memory_hits: vec![MemoryHit {
            content: "Auth uses JWT".to_string(),
            relevance: Some(0.87),
        }],
        provider,
        orchestration: Some(Orchestration {
            available_agents: many_agents,
            delegation_chain: vec!["lead".to_string()],
            shared_workspace: PathBuf::from("/tmp/shared"),
            max_delegation_depth: 2,
        }),
        session_id: Some("11111111-2222-4333-8444-555555555555".to_string()),
        workspace: PathBuf::from("/tmp/workspace"),
        shared_data: None,
    };

    let prompt = build_prompt(&ctx);

    let abilities = prompt.find("# Your Abilities").unwrap();
    let stages = prompt.find("# Your Workflow Stages").unwrap();
    let memory = prompt.find("# Relevant Context from Memory").unwrap();
    let orchestration = prompt.find("# Multi-Agent Orchestration Capabilities").unwrap();
    let task = prompt.find("# Task").unwrap();
    assert!(abilities < stages && stages < memory && memory < orchestration && orchestration < task);

    assert!(prompt.contains("1. plan - Outline the change"));
    assert!(prompt.contains("- What is risky?"));
    assert!(prompt.contains("Auth uses JWT (relevance: 87%)"));
    assert!(prompt.contains("agent-09"));
    assert!(!prompt.contains("agent-10"));
    assert!(prompt.contains("…and 2 more"));
    assert!(prompt.contains("Current session: 11111111-2222-4333-8444-555555555555"));
    assert!(prompt.contains("Delegation chain: lead"));
    assert!(prompt.contains("Delegation depth: 1 of 2"));
    assert!(prompt.trim_end().ends_with("Ship the login page"));
}

#[test]
fn absent_prompt_sections_are_omitted() {
    let provider: Arc<dyn Provider> = ScriptedProvider::ok("hi");
    let prompt = build_prompt(&context(provider, "just the task"));
    assert!(!prompt.contains("# Your Abilities"));
    assert!(!prompt.contains("# Your Workflow Stages"));
    assert!(!prompt.contains("# Relevant Context from Memory"));
    assert!(!prompt.contains("# Multi-Agent Orchestration Capabilities"));
    assert!(prompt.starts_with("# Task"));
}
