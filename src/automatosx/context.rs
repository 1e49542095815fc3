//! Per-run execution contexts and their assembly.
//!
//! An [`ExecutionContext`] is everything the executor needs to run one
//! agent once: the profile, the task, the assembled abilities text,
//! memory hits, a provider handle, and (when delegation is on) a fully
//! populated [`Orchestration`] block. Contexts are single-use and
//! immutable once handed to the executor.
//!
//! The orchestration block is all-or-nothing: either delegation is off
//! and the field is `None`, or every field in it is populated. Nothing in
//! the core ever partially fills it.

use crate::automatosx::abilities::{AbilitiesManager, AbilityError};
use crate::automatosx::memory::{MemoryManager, MemorySearchQuery};
use crate::automatosx::profile::{AgentProfile, ProfileError, ProfileLoader};
use crate::automatosx::provider::Provider;
use crate::automatosx::router::{ProviderRouter, RouterError};
use crate::automatosx::workspace::{WorkspaceError, WorkspaceManager};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors raised while assembling a context.
#[derive(Debug)]
pub enum ContextError {
    Profile(ProfileError),
    Ability(AbilityError),
    Provider(RouterError),
    Workspace(WorkspaceError),
}

impl ContextError {
    /// Machine-readable error code, delegated to the underlying error.
    pub fn code(&self) -> &'static str {
        match self {
            ContextError::Profile(e) => e.code(),
            ContextError::Ability(e) => e.code(),
            ContextError::Provider(e) => e.code(),
            ContextError::Workspace(e) => e.code(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Profile(e) => write!(f, "{}", e),
            ContextError::Ability(e) => write!(f, "{}", e),
            ContextError::Provider(e) => write!(f, "{}", e),
            ContextError::Workspace(e) => write!(f, "{}", e),
        }
    }
}

impl Error for ContextError {}

impl From<ProfileError> for ContextError {
    fn from(e: ProfileError) -> Self {
        ContextError::Profile(e)
    }
}

impl From<AbilityError> for ContextError {
    fn from(e: AbilityError) -> Self {
        ContextError::Ability(e)
    }
}

impl From<RouterError> for ContextError {
    fn from(e: RouterError) -> Self {
        ContextError::Provider(e)
    }
}

impl From<WorkspaceError> for ContextError {
    fn from(e: WorkspaceError) -> Self {
        ContextError::Workspace(e)
    }
}

/// A memory hit injected into the prompt.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    /// The stored content.
    pub content: String,
    /// Similarity in `[0, 1]` when the hit came from a scored search.
    pub relevance: Option<f64>,
}

/// Delegation metadata attached to a context.
///
/// Present if and only if multi-agent orchestration is enabled for the
/// run; every field is then populated.
#[derive(Debug, Clone)]
pub struct Orchestration {
    /// Names of all agents that can be delegated to.
    pub available_agents: Vec<String>,
    /// The delegation chain that led to this run, oldest first. Empty
    /// for a root run.
    pub delegation_chain: Vec<String>,
    /// Shared workspace directory for cross-agent artifacts.
    pub shared_workspace: PathBuf,
    /// Depth limit taken from the chain initiator's profile.
    pub max_delegation_depth: usize,
}

/// Everything needed to run one agent once.
pub struct ExecutionContext {
    /// The agent's immutable profile.
    pub profile: Arc<AgentProfile>,
    /// The task text for this run.
    pub task: String,
    /// Concatenated ability documents, empty when the profile lists none.
    pub abilities_text: String,
    /// Memory hits relevant to the task, most relevant first.
    pub memory_hits: Vec<MemoryHit>,
    /// The provider handle selected for this run.
    pub provider: Arc<dyn Provider>,
    /// Delegation metadata; `None` when orchestration is off.
    pub orchestration: Option<Orchestration>,
    /// Session this run belongs to, when joined.
    pub session_id: Option<String>,
    /// The agent's private workspace directory.
    pub workspace: PathBuf,
    /// Opaque data handed down by a delegating parent.
    pub shared_data: Option<Value>,
}

/// Options for [`ContextManager::create_context`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Session to associate with the run.
    pub session_id: Option<String>,
    /// Delegation chain so far; empty for a root run.
    pub delegation_chain: Vec<String>,
    /// Opaque data handed down by a delegating parent.
    pub shared_data: Option<Value>,
    /// Disable the orchestration block (single-agent mode).
    pub orchestration_disabled: bool,
}

/// Assembles [`ExecutionContext`]s from the process-wide singletons.
///
/// Construction order matters and is acyclic: the router, loaders, and
/// managers are all built before the context manager, which is itself
/// built before the executor. No component holds a back-reference.
pub struct ContextManager {
    profiles: Arc<ProfileLoader>,
    abilities: Arc<AbilitiesManager>,
    memory: Option<Arc<MemoryManager>>,
    workspaces: Arc<WorkspaceManager>,
    router: Arc<ProviderRouter>,
    memory_top_k: usize,
}

impl ContextManager {
    /// Wire up a context manager. `memory` is optional; without it,
    /// contexts simply carry no memory hits.
    pub fn new(
        profiles: Arc<ProfileLoader>,
        abilities: Arc<AbilitiesManager>,
        memory: Option<Arc<MemoryManager>>,
        workspaces: Arc<WorkspaceManager>,
        router: Arc<ProviderRouter>,
    ) -> Self {
        Self {
            profiles,
            abilities,
            memory,
            workspaces,
            router,
            memory_top_k: 5,
        }
    }

    /// Override how many memory hits are injected (builder pattern).
    pub fn with_memory_top_k(mut self, top_k: usize) -> Self {
        self.memory_top_k = top_k;
        self
    }

    /// Build a single-use context for one agent run.
    pub async fn create_context(
        &self,
        agent_name: &str,
        task: &str,
        options: &ContextOptions,
    ) -> Result<ExecutionContext, ContextError> {
        let profile = self.profiles.load_profile(agent_name)?;
        let abilities_text = self.abilities.get_abilities_text(&profile.abilities)?;
        let provider = self.router.select_provider().await?;
        let workspace = self.workspaces.get_workspace(agent_name)?;

        let memory_hits = self.lookup_memory(task).await;

        let orchestration = if options.orchestration_disabled {
            None
        } else {
            Some(self.build_orchestration(&profile, &options.delegation_chain)?)
        };

        Ok(ExecutionContext {
            profile,
            task: task.to_string(),
            abilities_text,
            memory_hits,
            provider,
            orchestration,
            session_id: options.session_id.clone(),
            workspace,
            shared_data: options.shared_data.clone(),
        })
    }

    fn build_orchestration(
        &self,
        profile: &AgentProfile,
        chain: &[String],
    ) -> Result<Orchestration, ContextError> {
        let available_agents: Vec<String> = self
            .profiles
            .list_agent_names()
            .into_iter()
            .filter(|name| name != &profile.name)
            .collect();

        // The depth limit belongs to the initiator of the chain, not the
        // agent currently running.
        let max_delegation_depth = match chain.first() {
            Some(initiator) => match self.profiles.load_profile(initiator) {
                Ok(root) => root.max_delegation_depth(),
                Err(err) => {
                    log::warn!(
                        "Cannot load chain initiator '{}' ({}); using this agent's depth",
                        initiator,
                        err
                    );
                    profile.max_delegation_depth()
                }
            },
            None => profile.max_delegation_depth(),
        };

        Ok(Orchestration {
            available_agents,
            delegation_chain: chain.to_vec(),
            shared_workspace: self.workspaces.prd_dir()?,
            max_delegation_depth,
        })
    }

    async fn lookup_memory(&self, task: &str) -> Vec<MemoryHit> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        match memory
            .search(MemorySearchQuery {
                text: task.to_string(),
                limit: self.memory_top_k,
                ..Default::default()
            })
            .await
        {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| MemoryHit {
                    content: hit.entry.content,
                    relevance: Some(hit.similarity),
                })
                .collect(),
            Err(err) => {
                // Memory is enrichment; a search failure degrades to an
                // unenriched prompt instead of failing the run.
                log::warn!("Memory lookup failed: {}", err);
                Vec::new()
            }
        }
    }
}
