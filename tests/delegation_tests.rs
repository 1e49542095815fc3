use async_trait::async_trait;
use automatosx::abilities::AbilitiesManager;
use automatosx::config::{Environment, WorkspaceSection};
use automatosx::context::{ContextManager, ContextOptions};
use automatosx::delegation::{DelegationError, DelegationRequest, DelegationStatus};
use automatosx::executor::{AgentExecutor, ExecutionError, ExecutionOptions};
use automatosx::profile::ProfileLoader;
use automatosx::provider::{
    ExecutionRequest, ExecutionResponse, FinishReason, Provider, ProviderError, TokenUsage,
};
use automatosx::router::{ProviderRouter, RouterConfig};
use automatosx::session::{SessionManager, SessionManagerConfig};
use automatosx::workspace::WorkspaceManager;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

enum Action {
    Respond(String),
    Fail(String),
}

struct RuleProvider {
    rules: Vec<(String, Action)>,
    prompts: Mutex<Vec<String>>,
}

impl RuleProvider {
    fn new(rules: Vec<(&str, Action)>) -> Arc<Self> {
        Arc::new(Self {
            rules: rules
                .into_iter()
                .map(|(needle, action)| (needle.to_string(), action))
                .collect(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn saw_prompt_containing(&self, needle: &str) -> bool {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.contains(needle))
    }
}

#[async_trait]
impl Provider for RuleProvider {
    fn name(&self) -> &str {
        "rule-provider"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, ProviderError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        for (needle, action) in &self.rules {
            if request.prompt.contains(needle.as_str()) {
                return match action {
                    Action::Respond(text) => Ok(ExecutionResponse {
                        content: text.clone(),
                        model: "rule-provider".to_string(),
                        tokens_used: TokenUsage::new(3, 7),
                        latency_ms: 1,
                        finish_reason: FinishReason::Stop,
                    }),
                    Action::Fail(message) => Err(ProviderError::new(message.clone())),
                };
            }
        }
        Ok(ExecutionResponse {
            content: "done".to_string(),
            model: "rule-provider".to_string(),
            tokens_used: TokenUsage::new(1, 1),
            latency_ms: 1,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn is_available(&self) -> bool {
        true
    }
}

struct Harness {
    _dir: TempDir,
    provider: Arc<RuleProvider>,
    executor: Arc<AgentExecutor>,
    context_manager: Arc<ContextManager>,
    sessions: Arc<SessionManager>,
}

fn harness(profiles: &[(&str, &str)], provider: Arc<RuleProvider>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::new(dir.path());
    std::fs::create_dir_all(env.agents_dir()).unwrap();
    for (name, yaml) in profiles {
        std::fs::write(env.agents_dir().join(format!("{}.yaml", name)), yaml).unwrap();
    }

    let router = Arc::new(ProviderRouter::new(RouterConfig::default()));
    router.register(provider.clone(), 1);

    let loader = Arc::new(ProfileLoader::new(env.clone()));
    let abilities = Arc::new(AbilitiesManager::new(env.clone()));
    let workspaces = Arc::new(WorkspaceManager::new(env.clone(), &WorkspaceSection::default()));
    let sessions = Arc::new(SessionManager::new(SessionManagerConfig::default()).unwrap());
    let context_manager = Arc::new(ContextManager::new(
        loader.clone(),
        abilities,
        None,
        workspaces.clone(),
        router.clone(),
    ));

    let executor = Arc::new(
        AgentExecutor::new()
            .with_context_manager(context_manager.clone())
            .with_profiles(loader)
            .with_workspaces(workspaces)
            .with_sessions(sessions.clone()),
    );

    Harness {
        _dir: dir,
        provider,
        executor,
        context_manager,
        sessions,
    }
}

#[tokio::test]
async fn delegation_runs_sub_agent_and_joins_a_session() {
    let provider = RuleProvider::new(vec![
        ("root-task", Action::Respond("DELEGATE TO backend: build the API".to_string())),
        ("build the API", Action::Respond("backend done".to_string())),
    ]);
    let h = harness(&[("lead", "name: lead\n"), ("backend", "name: backend\n")], provider);

    let context = h
        .context_manager
        .create_context("lead", "root-task", &ContextOptions::default())
        .await
        .unwrap();
    let result = h
        .executor
        .execute(context, &ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.delegations.len(), 1);
    let delegation = &result.delegations[0];
    assert_eq!(delegation.status, DelegationStatus::Success);
    assert_eq!(delegation.from_agent, "lead");
    assert_eq!(delegation.to_agent, "backend");
    assert_eq!(delegation.response.content, "backend done");
    assert!(delegation.outputs.workspace_path.is_some());
    assert!(delegation.duration_ms <= result.duration_ms);

    // A session was created for the delegation tree with both agents.
    let active = h.sessions.get_active_sessions().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].agents, vec!["lead".to_string(), "backend".to_string()]);
    assert_eq!(active[0].initiator, "lead");
}

#[tokio::test]
async fn depth_limit_comes_from_the_chain_initiator() {
    let provider = RuleProvider::new(vec![
        ("task-a", Action::Respond("DELEGATE TO b: task-b".to_string())),
        ("task-b", Action::Respond("DELEGATE TO c: task-c".to_string())),
    ]);
    let h = harness(
        &[
            ("a", "name: a\norchestration:\n  maxDelegationDepth: 1\n"),
            ("b", "name: b\n"),
            ("c", "name: c\n"),
        ],
        provider,
    );

    let context = h
        .context_manager
        .create_context("a", "task-a", &ContextOptions::default())
        .await
        .unwrap();
    let result = h
        .executor
        .execute(context, &ExecutionOptions::default())
        .await
        .unwrap();

    // a -> b succeeded structurally, but b's own delegation to c hit the
    // initiator's depth limit, so b's run is captured as a failure.
    assert_eq!(result.delegations.len(), 1);
    assert_eq!(result.delegations[0].to_agent, "b");
    assert_eq!(result.delegations[0].status, DelegationStatus::Failure);
    assert!(result.delegations[0]
        .response
        .content
        .contains("MaxDepthExceeded"));

    // c was never executed.
    assert!(!h.provider.saw_prompt_containing("task-c"));
}

#[tokio::test]
async fn depth_violation_rejects_before_any_execution() {
    let provider = RuleProvider::new(vec![]);
    let h = harness(
        &[
            ("a", "name: a\norchestration:\n  maxDelegationDepth: 1\n"),
            ("b", "name: b\n"),
            ("c", "name: c\n"),
        ],
        provider,
    );

    let before = h.provider.prompts.lock().unwrap().len();
    let err = h
        .executor
        .delegate_to_agent(
            DelegationRequest {
                from_agent: "b".to_string(),
                to_agent: "c".to_string(),
                task: "task-c".to_string(),
                session_id: None,
                delegation_chain: vec!["a".to_string()],
                shared_data: None,
            },
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DelegationError::MaxDepthExceeded {
            depth: 1,
            max_depth: 1
        }
    ));
    assert_eq!(h.provider.prompts.lock().unwrap().len(), before);
}

#[tokio::test]
async fn delegating_back_to_a_chain_member_is_a_cycle() {
    let provider = RuleProvider::new(vec![]);
    let h = harness(&[("a", "name: a\n"), ("b", "name: b\n")], provider);

    let err = h
        .executor
        .delegate_to_agent(
            DelegationRequest {
                from_agent: "b".to_string(),
                to_agent: "a".to_string(),
                task: "loop back".to_string(),
                session_id: None,
                delegation_chain: vec!["a".to_string()],
                shared_data: None,
            },
            &ExecutionOptions {
                // A generous depth so only the cycle check can reject.
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DelegationError::Cycle { .. }));
}

#[tokio::test]
async fn failed_delegations_are_captured_by_default() {
    let provider = RuleProvider::new(vec![
        (
            "root-task",
            Action::Respond(
                "DELEGATE TO backend: broken-task\nDELEGATE TO frontend: fine-task".to_string(),
            ),
        ),
        ("broken-task", Action::Fail("adapter crashed".to_string())),
        ("fine-task", Action::Respond("frontend done".to_string())),
    ]);
    let h = harness(
        &[
            ("lead", "name: lead\n"),
            ("backend", "name: backend\n"),
            ("frontend", "name: frontend\n"),
        ],
        provider,
    );

    let context = h
        .context_manager
        .create_context("lead", "root-task", &ContextOptions::default())
        .await
        .unwrap();
    let result = h
        .executor
        .execute(context, &ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(result.delegations.len(), 2);
    assert_eq!(result.delegations[0].status, DelegationStatus::Failure);
    assert!(result.delegations[0].outputs.files.is_empty());
    assert!(result.delegations[0].outputs.workspace_path.is_none());
    assert_eq!(result.delegations[1].status, DelegationStatus::Success);
    assert_eq!(result.delegations[1].response.content, "frontend done");
}

#[tokio::test]
async fn abort_on_failure_surfaces_and_stops_the_batch() {
    let provider = RuleProvider::new(vec![
        (
            "root-task",
            Action::Respond(
                "DELEGATE TO backend: broken-task\nDELEGATE TO frontend: fine-task".to_string(),
            ),
        ),
        ("broken-task", Action::Fail("adapter crashed".to_string())),
        ("fine-task", Action::Respond("frontend done".to_string())),
    ]);
    let h = harness(
        &[
            ("lead", "name: lead\n"),
            ("backend", "name: backend\n"),
            ("frontend", "name: frontend\n"),
        ],
        provider,
    );

    let context = h
        .context_manager
        .create_context("lead", "root-task", &ContextOptions::default())
        .await
        .unwrap();
    let err = h
        .executor
        .execute(
            context,
            &ExecutionOptions {
                continue_delegations_on_failure: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::Delegation(DelegationError::ExecutionFailed(_))
    ));
    // The second delegation never ran.
    assert!(!h.provider.saw_prompt_containing("fine-task"));
}

#[tokio::test]
async fn joining_a_finished_session_is_rejected() {
    let provider = RuleProvider::new(vec![]);
    let h = harness(&[("lead", "name: lead\n"), ("backend", "name: backend\n")], provider);

    let session = h.sessions.create_session("old work", "lead").await.unwrap();
    h.sessions.complete_session(&session.id).await.unwrap();

    let err = h
        .executor
        .delegate_to_agent(
            DelegationRequest {
                from_agent: "lead".to_string(),
                to_agent: "backend".to_string(),
                task: "late work".to_string(),
                session_id: Some(session.id.clone()),
                delegation_chain: Vec::new(),
                shared_data: None,
            },
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DelegationError::ExecutionFailed(_)));
}

#[tokio::test]
async fn joining_an_active_session_registers_the_target() {
    let provider = RuleProvider::new(vec![]);
    let h = harness(&[("lead", "name: lead\n"), ("backend", "name: backend\n")], provider);

    let session = h.sessions.create_session("shared work", "lead").await.unwrap();
    let result = h
        .executor
        .delegate_to_agent(
            DelegationRequest {
                from_agent: "lead".to_string(),
                to_agent: "backend".to_string(),
                task: "sub work".to_string(),
                session_id: Some(session.id.clone()),
                delegation_chain: Vec::new(),
                shared_data: None,
            },
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, DelegationStatus::Success);
    let session = h.sessions.get_session(&session.id).await.unwrap();
    assert!(session.agents.contains(&"backend".to_string()));
}

#[tokio::test]
async fn delegation_without_collaborators_is_not_configured() {
    let executor = Arc::new(AgentExecutor::new());

    let err = executor
        .delegate_to_agent(
            DelegationRequest {
                from_agent: "lead".to_string(),
                to_agent: "backend".to_string(),
                task: "anything".to_string(),
                session_id: None,
                delegation_chain: Vec::new(),
                shared_data: None,
            },
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DelegationError::NotConfigured));
}
