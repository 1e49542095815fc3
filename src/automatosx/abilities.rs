//! Ability documents and their TTL-cached loader.
//!
//! An ability is a reusable markdown document injected into an agent's
//! prompt. Abilities live in `.automatosx/abilities/<name>.md` with an
//! optional built-in fallback directory for abilities shipped with the
//! tool itself. Names must match `^[A-Za-z0-9_-]+$` and files are capped
//! at 500 KiB so a runaway document cannot blow up the prompt.

use crate::automatosx::cache::{CacheConfig, TtlCache};
use crate::automatosx::config::Environment;
use lazy_static::lazy_static;
use regex::Regex;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

lazy_static! {
    static ref ABILITY_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Maximum ability file size in bytes (500 KiB).
pub const MAX_ABILITY_BYTES: u64 = 500 * 1024;

/// Errors raised by the abilities manager.
#[derive(Debug)]
pub enum AbilityError {
    /// The name does not match `^[A-Za-z0-9_-]+$`.
    InvalidAbilityName(String),
    /// No ability file exists in the project or built-in directory.
    NotFound(String),
    /// The file exceeds [`MAX_ABILITY_BYTES`].
    TooLarge { name: String, bytes: u64 },
    /// Filesystem failure.
    Io(String),
}

impl AbilityError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AbilityError::InvalidAbilityName(_) => "InvalidAbilityName",
            AbilityError::NotFound(_) => "AbilityNotFound",
            AbilityError::TooLarge { .. } => "AbilityTooLarge",
            AbilityError::Io(_) => "AbilityIoError",
        }
    }
}

impl fmt::Display for AbilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbilityError::InvalidAbilityName(name) => {
                write!(f, "Invalid ability name '{}'", name)
            }
            AbilityError::NotFound(name) => write!(f, "Ability '{}' not found", name),
            AbilityError::TooLarge { name, bytes } => write!(
                f,
                "Ability '{}' is {} bytes, over the {} byte limit",
                name, bytes, MAX_ABILITY_BYTES
            ),
            AbilityError::Io(message) => write!(f, "Ability I/O error: {}", message),
        }
    }
}

impl Error for AbilityError {}

/// A loaded ability document.
#[derive(Debug, Clone)]
pub struct Ability {
    /// Ability name (the file stem).
    pub name: String,
    /// Markdown body.
    pub content: String,
}

/// TTL-cached loader for ability markdown files.
///
/// Lookups try the project directory first, then the optional built-in
/// directory, so a project can shadow a shipped ability by name.
pub struct AbilitiesManager {
    env: Environment,
    builtin_dir: Option<PathBuf>,
    cache: TtlCache<String, Arc<Ability>>,
}

impl AbilitiesManager {
    /// Create a manager rooted at the given environment.
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            builtin_dir: None,
            cache: TtlCache::new(CacheConfig::default()),
        }
    }

    /// Add a fallback directory for built-in abilities (builder pattern).
    pub fn with_builtin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builtin_dir = Some(dir.into());
        self
    }

    /// Load one ability by name.
    pub fn load_ability(&self, name: &str) -> Result<Arc<Ability>, AbilityError> {
        if !ABILITY_NAME_RE.is_match(name) {
            return Err(AbilityError::InvalidAbilityName(name.to_string()));
        }
        if let Some(ability) = self.cache.get(&name.to_string()) {
            return Ok(ability);
        }

        let path = self
            .resolve(name)
            .ok_or_else(|| AbilityError::NotFound(name.to_string()))?;

        let metadata = std::fs::metadata(&path).map_err(|e| AbilityError::Io(e.to_string()))?;
        if metadata.len() > MAX_ABILITY_BYTES {
            return Err(AbilityError::TooLarge {
                name: name.to_string(),
                bytes: metadata.len(),
            });
        }

        let content = std::fs::read_to_string(&path).map_err(|e| AbilityError::Io(e.to_string()))?;
        let bytes = content.len();
        let ability = Arc::new(Ability {
            name: name.to_string(),
            content,
        });
        self.cache.insert(name.to_string(), ability.clone(), bytes);
        Ok(ability)
    }

    /// Load several abilities, preserving order.
    ///
    /// A missing ability fails the whole call; agents that reference an
    /// ability expect it to exist.
    pub fn load_abilities(&self, names: &[String]) -> Result<Vec<Arc<Ability>>, AbilityError> {
        names.iter().map(|name| self.load_ability(name)).collect()
    }

    /// Concatenate abilities into the prompt-injection text.
    ///
    /// Each ability is rendered under an `## <name>` heading. An empty
    /// name list yields an empty string.
    pub fn get_abilities_text(&self, names: &[String]) -> Result<String, AbilityError> {
        let abilities = self.load_abilities(names)?;
        let mut text = String::new();
        for ability in abilities {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&format!("## {}\n\n{}", ability.name, ability.content.trim_end()));
        }
        Ok(text)
    }

    /// Ability names available in the project and built-in directories.
    pub fn list_ability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut dirs = vec![self.env.abilities_dir()];
        if let Some(builtin) = &self.builtin_dir {
            dirs.push(builtin.clone());
        }
        for dir in dirs {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.filter_map(|e| e.ok()) {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("md") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            if !names.iter().any(|n| n == stem) {
                                names.push(stem.to_string());
                            }
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let project_path = self.env.abilities_dir().join(format!("{}.md", name));
        if project_path.exists() {
            return Some(project_path);
        }
        if let Some(builtin) = &self.builtin_dir {
            let builtin_path = builtin.join(format!("{}.md", name));
            if builtin_path.exists() {
                return Some(builtin_path);
            }
        }
        None
    }
}
