//! Agent profiles and the profile loader.
//!
//! A profile is an immutable, named role configuration loaded from
//! `.automatosx/agents/<name>.yaml`. Profiles bundle a role, system
//! prompt, ability list, provider/model preferences, optional staged
//! workflow, and optional orchestration settings. Team files under
//! `.automatosx/teams/<name>.yaml` contribute shared defaults (abilities,
//! model preference) that are merged beneath the profile's own values.
//!
//! Agent-creation templates under `.automatosx/templates/` use
//! `{{VAR | default: value}}` placeholders; [`render_template`] performs
//! the substitution when the driver materializes a new profile.
//!
//! # Profile file
//!
//! ```yaml
//! name: backend
//! displayName: Backend Engineer
//! team: engineering
//! role: Implement server-side features
//! systemPrompt: You are a pragmatic backend engineer.
//! abilities:
//!   - code-review
//!   - api-design
//! stages:
//!   - name: plan
//!     description: Outline the change
//!   - name: implement
//!     description: Write the code
//! dependencies:
//!   - architect
//! orchestration:
//!   maxDelegationDepth: 2
//! ```

use crate::automatosx::cache::{CacheConfig, TtlCache};
use crate::automatosx::config::Environment;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

lazy_static! {
    static ref AGENT_NAME_RE: Regex = Regex::new(r"^[a-z][a-z0-9-]{1,49}$").unwrap();
    static ref TEMPLATE_VAR_RE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*(?:\|\s*default:\s*([^}]*?)\s*)?\}\}").unwrap();
}

/// Default delegation depth when a profile has no orchestration block.
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 2;

/// Errors raised while loading or validating profiles.
#[derive(Debug)]
pub enum ProfileError {
    /// The agent name does not match `^[a-z][a-z0-9-]{1,49}$`.
    InvalidAgentName(String),
    /// No profile file exists for the agent.
    NotFound(String),
    /// The YAML document could not be parsed.
    Parse { agent: String, message: String },
    /// Two stages in one profile share a name.
    DuplicateStageName { agent: String, stage: String },
    /// Filesystem failure while reading profile or team files.
    Io(String),
}

impl ProfileError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ProfileError::InvalidAgentName(_) => "InvalidAgentName",
            ProfileError::NotFound(_) => "AgentNotFound",
            ProfileError::Parse { .. } => "ProfileParseError",
            ProfileError::DuplicateStageName { .. } => "DuplicateStageName",
            ProfileError::Io(_) => "ProfileIoError",
        }
    }
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::InvalidAgentName(name) => {
                write!(f, "Invalid agent name '{}'", name)
            }
            ProfileError::NotFound(name) => write!(f, "Agent '{}' not found", name),
            ProfileError::Parse { agent, message } => {
                write!(f, "Cannot parse profile '{}': {}", agent, message)
            }
            ProfileError::DuplicateStageName { agent, stage } => {
                write!(f, "Profile '{}' declares stage '{}' twice", agent, stage)
            }
            ProfileError::Io(message) => write!(f, "Profile I/O error: {}", message),
        }
    }
}

impl Error for ProfileError {}

/// One step of a profile's staged workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    /// Stage name, unique within the profile.
    pub name: String,
    /// What the stage is meant to accomplish.
    #[serde(default)]
    pub description: String,
    /// Questions the agent should address during the stage.
    #[serde(default)]
    pub key_questions: Vec<String>,
    /// Artifacts the stage is expected to produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Per-stage timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Per-stage retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Whether the stage output is appended to long-term memory.
    #[serde(default)]
    pub save_to_memory: Option<bool>,
    /// Whether a checkpoint is written after the stage.
    #[serde(default)]
    pub checkpoint: Option<bool>,
}

/// Orchestration settings block of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSettings {
    /// Maximum delegation chain length rooted at this agent.
    #[serde(default = "default_max_depth")]
    pub max_delegation_depth: usize,
    /// Deprecated whitelist; parsed for compatibility, logged, never
    /// enforced.
    #[serde(default)]
    pub can_delegate_to: Option<Vec<String>>,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DELEGATION_DEPTH
}

/// An immutable agent role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    /// Unique agent name matching `^[a-z][a-z0-9-]{1,49}$`.
    pub name: String,
    /// Optional human-facing display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Optional team whose defaults are merged into this profile.
    #[serde(default)]
    pub team: Option<String>,
    /// One-line role description used in orchestration prompts.
    #[serde(default)]
    pub role: String,
    /// Longer free-form description.
    #[serde(default)]
    pub description: String,
    /// System prompt priming the provider.
    #[serde(default)]
    pub system_prompt: String,
    /// Ordered ability names injected into the prompt.
    #[serde(default)]
    pub abilities: Vec<String>,
    /// Preferred model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Token budget forwarded to the provider.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Optional staged workflow.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    /// Agents this one depends on inside a parallel delegation batch.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional orchestration settings.
    #[serde(default)]
    pub orchestration: Option<OrchestrationSettings>,
}

impl AgentProfile {
    /// Effective delegation depth limit for chains rooted at this agent.
    pub fn max_delegation_depth(&self) -> usize {
        self.orchestration
            .as_ref()
            .map(|o| o.max_delegation_depth)
            .unwrap_or(DEFAULT_MAX_DELEGATION_DEPTH)
    }

    /// Display name, falling back to the agent name.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Validate structural invariants: name shape and stage uniqueness.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if !AGENT_NAME_RE.is_match(&self.name) {
            return Err(ProfileError::InvalidAgentName(self.name.clone()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ProfileError::DuplicateStageName {
                    agent: self.name.clone(),
                    stage: stage.name.clone(),
                });
            }
        }
        if let Some(orchestration) = &self.orchestration {
            if let Some(whitelist) = &orchestration.can_delegate_to {
                log::debug!(
                    "Profile '{}' carries deprecated canDelegateTo whitelist ({} entries); not enforced",
                    self.name,
                    whitelist.len()
                );
            }
        }
        Ok(())
    }
}

/// Check a name against the agent-name rule without loading anything.
pub fn is_valid_agent_name(name: &str) -> bool {
    AGENT_NAME_RE.is_match(name)
}

/// Team defaults shared by several profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Abilities prepended to every member profile's list.
    #[serde(default)]
    pub shared_abilities: Vec<String>,
    /// Provider preference for members without their own.
    #[serde(default)]
    pub provider: Option<String>,
    /// Model preference for members without their own.
    #[serde(default)]
    pub model: Option<String>,
}

/// Substitute `{{VAR}}` and `{{VAR | default: value}}` placeholders.
///
/// Unknown variables without a default are replaced by the empty string.
///
/// # Example
///
/// ```rust
/// use std::collections::HashMap;
/// use automatosx::profile::render_template;
///
/// let mut vars = HashMap::new();
/// vars.insert("NAME".to_string(), "backend".to_string());
///
/// let out = render_template("name: {{NAME}}\nteam: {{TEAM | default: core}}", &vars);
/// assert_eq!(out, "name: backend\nteam: core");
/// ```
pub fn render_template(text: &str, vars: &HashMap<String, String>) -> String {
    TEMPLATE_VAR_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match vars.get(key) {
                Some(value) => value.clone(),
                None => caps
                    .get(2)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Loader for agent profiles and team defaults.
///
/// Profiles are cached with a TTL so repeated context assembly does not
/// re-read the filesystem; the cache is small because profiles are tiny.
pub struct ProfileLoader {
    env: Environment,
    profiles: TtlCache<String, Arc<AgentProfile>>,
    teams: TtlCache<String, Arc<TeamConfig>>,
}

impl ProfileLoader {
    /// Create a loader rooted at the given environment.
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            profiles: TtlCache::new(CacheConfig::default()),
            teams: TtlCache::new(CacheConfig::default()),
        }
    }

    /// Load a profile by agent name, applying team defaults and
    /// validating invariants.
    pub fn load_profile(&self, name: &str) -> Result<Arc<AgentProfile>, ProfileError> {
        if !AGENT_NAME_RE.is_match(name) {
            return Err(ProfileError::InvalidAgentName(name.to_string()));
        }
        if let Some(profile) = self.profiles.get(&name.to_string()) {
            return Ok(profile);
        }

        let path = self.env.agents_dir().join(format!("{}.yaml", name));
        if !path.exists() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| ProfileError::Io(e.to_string()))?;
        let mut profile: AgentProfile =
            serde_yaml::from_str(&raw).map_err(|e| ProfileError::Parse {
                agent: name.to_string(),
                message: e.to_string(),
            })?;

        if profile.name != name {
            return Err(ProfileError::Parse {
                agent: name.to_string(),
                message: format!(
                    "profile file {}.yaml declares name '{}'",
                    name, profile.name
                ),
            });
        }

        if let Some(team_name) = profile.team.clone() {
            if let Some(team) = self.load_team(&team_name) {
                merge_team_defaults(&mut profile, &team);
            }
        }

        profile.validate()?;

        let bytes = raw.len();
        let profile = Arc::new(profile);
        self.profiles.insert(name.to_string(), profile.clone(), bytes);
        Ok(profile)
    }

    /// Load every profile in the agents directory.
    ///
    /// Files that fail to load are skipped with a warning; a missing
    /// agents directory yields an empty list.
    pub fn get_all_profiles(&self) -> Vec<Arc<AgentProfile>> {
        let mut profiles = Vec::new();
        for name in self.list_agent_names() {
            match self.load_profile(&name) {
                Ok(profile) => profiles.push(profile),
                Err(err) => log::warn!("Skipping profile '{}': {}", name, err),
            }
        }
        profiles
    }

    /// Agent names derived from `*.yaml` files in the agents directory,
    /// sorted for deterministic ordering.
    pub fn list_agent_names(&self) -> Vec<String> {
        let dir = self.env.agents_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| s.to_string())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }

    /// Drop cached profiles so the next load re-reads the filesystem.
    pub fn invalidate(&self, name: &str) {
        self.profiles.invalidate(&name.to_string());
    }

    fn load_team(&self, team_name: &str) -> Option<Arc<TeamConfig>> {
        if let Some(team) = self.teams.get(&team_name.to_string()) {
            return Some(team);
        }
        let path = self.env.teams_dir().join(format!("{}.yaml", team_name));
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_yaml::from_str::<TeamConfig>(&raw) {
            Ok(team) => {
                let team = Arc::new(team);
                self.teams
                    .insert(team_name.to_string(), team.clone(), raw.len());
                Some(team)
            }
            Err(err) => {
                log::warn!("Cannot parse team '{}': {}", team_name, err);
                None
            }
        }
    }
}

fn merge_team_defaults(profile: &mut AgentProfile, team: &TeamConfig) {
    let mut merged: Vec<String> = Vec::new();
    for ability in team.shared_abilities.iter().chain(profile.abilities.iter()) {
        if !merged.iter().any(|a| a == ability) {
            merged.push(ability.clone());
        }
    }
    profile.abilities = merged;
    if profile.model.is_none() {
        profile.model = team.model.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_rule() {
        assert!(is_valid_agent_name("backend"));
        assert!(is_valid_agent_name("qa-2"));
        assert!(!is_valid_agent_name("Backend"));
        assert!(!is_valid_agent_name("a"));
        assert!(!is_valid_agent_name("9lives"));
        assert!(!is_valid_agent_name("has_underscore"));
    }

    #[test]
    fn duplicate_stage_names_rejected() {
        let profile: AgentProfile = serde_yaml::from_str(
            "name: backend\nstages:\n  - name: plan\n  - name: plan\n",
        )
        .unwrap();
        match profile.validate() {
            Err(ProfileError::DuplicateStageName { stage, .. }) => assert_eq!(stage, "plan"),
            other => panic!("expected duplicate stage error, got {:?}", other),
        }
    }

    #[test]
    fn template_rendering() {
        let mut vars = HashMap::new();
        vars.insert("AGENT_NAME".to_string(), "writer".to_string());

        let out = render_template(
            "name: {{AGENT_NAME}}\nrole: {{ROLE | default: General assistant}}\nteam: {{TEAM}}",
            &vars,
        );
        assert!(out.contains("name: writer"));
        assert!(out.contains("role: General assistant"));
        assert!(out.contains("team: \n") || out.ends_with("team: "));
    }

    #[test]
    fn default_depth_without_orchestration_block() {
        let profile: AgentProfile = serde_yaml::from_str("name: backend\n").unwrap();
        assert_eq!(profile.max_delegation_depth(), 2);

        let profile: AgentProfile =
            serde_yaml::from_str("name: backend\norchestration:\n  maxDelegationDepth: 4\n")
                .unwrap();
        assert_eq!(profile.max_delegation_depth(), 4);
    }

    #[test]
    fn loader_round_trip_with_team_merge() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(dir.path());
        std::fs::create_dir_all(env.agents_dir()).unwrap();
        std::fs::create_dir_all(env.teams_dir()).unwrap();

        std::fs::write(
            env.teams_dir().join("engineering.yaml"),
            "name: engineering\nsharedAbilities:\n  - code-review\nmodel: sonnet-large\n",
        )
        .unwrap();
        std::fs::write(
            env.agents_dir().join("backend.yaml"),
            "name: backend\nteam: engineering\nabilities:\n  - api-design\n",
        )
        .unwrap();

        let loader = ProfileLoader::new(env);
        let profile = loader.load_profile("backend").unwrap();
        assert_eq!(profile.abilities, vec!["code-review", "api-design"]);
        assert_eq!(profile.model.as_deref(), Some("sonnet-large"));

        assert!(matches!(
            loader.load_profile("missing"),
            Err(ProfileError::NotFound(_))
        ));
        assert!(matches!(
            loader.load_profile("Bad Name"),
            Err(ProfileError::InvalidAgentName(_))
        ));
    }
}
