//! Priority-ordered provider routing with health tracking and fallback.
//!
//! The router owns every registered [`Provider`] handle, keeps them sorted
//! ascending by priority (lower number = preferred), and serves three
//! jobs:
//!
//! - **Selection** - concurrently probe `is_available()` on every
//!   provider, drop the ones under a penalty cooldown, and pick the first
//!   survivor in priority order.
//! - **Fallback** - when an execution fails and fallback is enabled, the
//!   failing provider is penalized and the next candidate is tried until
//!   the list is exhausted.
//! - **Health** - an optional background tick records per-provider
//!   availability, latency, and consecutive failures. A single failing
//!   probe never takes the loop down.
//!
//! ```text
//! ProviderRouter
//!   ├─ claude-cli   priority 1   [penalized until 12:00:41]
//!   ├─ gemini-cli   priority 2   available
//!   └─ openai-http  priority 3   available
//!         execute() → probes all → skips claude-cli → runs gemini-cli
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use automatosx::provider::{ExecutionRequest, Provider};
//! use automatosx::router::{ProviderRouter, RouterConfig};
//!
//! # async fn demo(primary: Arc<dyn Provider>, backup: Arc<dyn Provider>) {
//! let router = ProviderRouter::new_shared(RouterConfig::default());
//! router.register(primary, 1);
//! router.register(backup, 2);
//! router.start_health_loop();
//!
//! let response = router
//!     .execute(&ExecutionRequest {
//!         prompt: "ping".to_string(),
//!         ..Default::default()
//!     })
//!     .await
//!     .unwrap();
//! println!("{} answered via {}", response.content, response.model);
//! router.destroy();
//! # }
//! ```

use crate::automatosx::provider::{
    ExecutionRequest, ExecutionResponse, Provider, ProviderError, ProviderHealth,
};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Try the next candidate when a provider fails. When false, the
    /// first provider's error propagates unchanged.
    pub fallback_enabled: bool,
    /// Cooldown applied to a provider after any execution error.
    pub provider_cooldown_ms: u64,
    /// Interval of the background health loop. `0` disables the loop.
    pub health_check_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            provider_cooldown_ms: 60_000,
            health_check_interval_ms: 0,
        }
    }
}

/// Errors raised by the router.
#[derive(Debug)]
pub enum RouterError {
    /// No providers were ever registered.
    NoProvidersConfigured,
    /// Every registered provider is unavailable or under penalty.
    NoProvidersAvailable,
    /// Every candidate was tried and failed; carries the last error text.
    AllProvidersFailed { last_error: String },
    /// A single provider failed with fallback disabled.
    ProviderExecution {
        provider: String,
        source: ProviderError,
    },
    /// A health probe failed in a way worth surfacing.
    ProviderHealth { provider: String, message: String },
}

impl RouterError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::NoProvidersConfigured => "NoProvidersConfigured",
            RouterError::NoProvidersAvailable => "NoProvidersAvailable",
            RouterError::AllProvidersFailed { .. } => "AllProvidersFailed",
            RouterError::ProviderExecution { .. } => "ProviderExecutionError",
            RouterError::ProviderHealth { .. } => "ProviderHealthError",
        }
    }
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::NoProvidersConfigured => {
                write!(f, "No providers are configured")
            }
            RouterError::NoProvidersAvailable => {
                write!(f, "No providers are currently available")
            }
            RouterError::AllProvidersFailed { last_error } => {
                write!(f, "All providers failed; last error: {}", last_error)
            }
            RouterError::ProviderExecution { provider, source } => {
                write!(f, "Provider '{}' failed: {}", provider, source)
            }
            RouterError::ProviderHealth { provider, message } => {
                write!(f, "Health check for '{}' failed: {}", provider, message)
            }
        }
    }
}

impl Error for RouterError {}

struct RegisteredProvider {
    provider: Arc<dyn Provider>,
    priority: u32,
}

/// Fallback-aware provider router. See the module docs for the selection
/// algorithm.
pub struct ProviderRouter {
    config: RouterConfig,
    providers: RwLock<Vec<RegisteredProvider>>,
    penalties: Mutex<HashMap<String, Instant>>,
    health: RwLock<HashMap<String, ProviderHealth>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Mutex<Weak<ProviderRouter>>,
}

impl ProviderRouter {
    /// Create a router with no providers registered.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            providers: RwLock::new(Vec::new()),
            penalties: Mutex::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            health_task: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        }
    }

    /// Register a provider with its selection priority.
    ///
    /// Lower priority numbers are preferred. Registration is expected at
    /// startup, before the router is shared with the executor.
    pub fn register(&self, provider: Arc<dyn Provider>, priority: u32) {
        let mut providers = self.providers.write().unwrap();
        log::debug!(
            "Registering provider '{}' with priority {}",
            provider.name(),
            priority
        );
        providers.push(RegisteredProvider { provider, priority });
        providers.sort_by_key(|p| p.priority);
    }

    /// Number of registered providers.
    pub fn provider_count(&self) -> usize {
        self.providers.read().unwrap().len()
    }

    /// Select the preferred available, non-penalized provider.
    pub async fn select_provider(&self) -> Result<Arc<dyn Provider>, RouterError> {
        if self.provider_count() == 0 {
            return Err(RouterError::NoProvidersConfigured);
        }
        self.candidates()
            .await
            .into_iter()
            .next()
            .ok_or(RouterError::NoProvidersAvailable)
    }

    /// All available, non-penalized providers in priority order.
    pub async fn get_available_providers(&self) -> Vec<Arc<dyn Provider>> {
        self.candidates().await
    }

    /// Execute a request through the candidate chain.
    ///
    /// On success the serving provider's penalty (if any) is cleared. On
    /// failure the provider is penalized for the configured cooldown and,
    /// with fallback enabled, the next candidate is tried.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, RouterError> {
        if self.provider_count() == 0 {
            return Err(RouterError::NoProvidersConfigured);
        }

        let candidates = self.candidates().await;
        if candidates.is_empty() {
            return Err(RouterError::NoProvidersAvailable);
        }

        let mut last_error: Option<ProviderError> = None;
        for provider in candidates {
            let name = provider.name().to_string();
            match provider.execute(request).await {
                Ok(response) => {
                    self.clear_penalty(&name);
                    return Ok(response);
                }
                Err(err) => {
                    log::warn!("Provider '{}' failed: {}", name, err);
                    self.penalize(&name);
                    if !self.config.fallback_enabled {
                        return Err(RouterError::ProviderExecution {
                            provider: name,
                            source: err,
                        });
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Snapshot of the most recent health records, keyed by provider name.
    pub fn get_health_status(&self) -> HashMap<String, ProviderHealth> {
        self.health.read().unwrap().clone()
    }

    /// Whether a provider is currently under a penalty cooldown.
    pub fn is_penalized(&self, name: &str) -> bool {
        let mut penalties = self.penalties.lock().unwrap();
        match penalties.get(name) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                penalties.remove(name);
                false
            }
            None => false,
        }
    }

    /// Start the background health loop. No-op when the configured
    /// interval is zero or the loop is already running.
    ///
    /// Requires the router to be held in an [`Arc`]; call
    /// [`ProviderRouter::bind`] first (or construct via
    /// [`ProviderRouter::new_shared`]).
    pub fn start_health_loop(&self) {
        if self.config.health_check_interval_ms == 0 {
            return;
        }
        let mut task = self.health_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let Some(router) = self.self_ref.lock().unwrap().upgrade() else {
            log::warn!("Health loop requested on an unbound router; call bind() first");
            return;
        };
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                router.run_health_checks().await;
            }
        }));
    }

    /// Create a router already wrapped in an [`Arc`] and bound for the
    /// health loop.
    pub fn new_shared(config: RouterConfig) -> Arc<Self> {
        let router = Arc::new(Self::new(config));
        router.bind(&router);
        router
    }

    /// Record the owning [`Arc`] so the health loop can hold the router.
    pub fn bind(&self, this: &Arc<Self>) {
        *self.self_ref.lock().unwrap() = Arc::downgrade(this);
    }

    /// Stop the health loop. Idempotent.
    pub fn destroy(&self) {
        if let Some(task) = self.health_task.lock().unwrap().take() {
            task.abort();
            log::debug!("Provider health loop stopped");
        }
    }

    async fn run_health_checks(&self) {
        let providers: Vec<Arc<dyn Provider>> = {
            let guard = self.providers.read().unwrap();
            guard.iter().map(|p| p.provider.clone()).collect()
        };

        for provider in providers {
            let name = provider.name().to_string();
            // Probes run in their own task so a panicking adapter cannot
            // take the loop down.
            let probe = tokio::spawn(async move { provider.get_health().await });
            match probe.await {
                Ok(mut health) => {
                    let mut records = self.health.write().unwrap();
                    health.consecutive_failures = match records.get(&name) {
                        Some(prev) if !health.available => prev.consecutive_failures + 1,
                        None if !health.available => 1,
                        _ => 0,
                    };
                    records.insert(name, health);
                }
                Err(join_err) => {
                    log::warn!("Health probe for '{}' panicked: {}", name, join_err);
                }
            }
        }
    }

    async fn candidates(&self) -> Vec<Arc<dyn Provider>> {
        let providers: Vec<Arc<dyn Provider>> = {
            let guard = self.providers.read().unwrap();
            guard.iter().map(|p| p.provider.clone()).collect()
        };

        // Probe every provider concurrently; a probe failure (or panic)
        // counts as "not available" and never aborts selection.
        let probes: Vec<JoinHandle<(usize, bool)>> = providers
            .iter()
            .enumerate()
            .map(|(idx, provider)| {
                let provider = provider.clone();
                tokio::spawn(async move { (idx, provider.is_available().await) })
            })
            .collect();

        let mut availability = vec![false; providers.len()];
        for probe in probes {
            match probe.await {
                Ok((idx, available)) => availability[idx] = available,
                Err(join_err) => {
                    log::warn!("Availability probe panicked: {}", join_err);
                }
            }
        }

        providers
            .into_iter()
            .enumerate()
            .filter(|(idx, provider)| availability[*idx] && !self.is_penalized(provider.name()))
            .map(|(_, provider)| provider)
            .collect()
    }

    fn penalize(&self, name: &str) {
        let until = Instant::now() + Duration::from_millis(self.config.provider_cooldown_ms);
        self.penalties.lock().unwrap().insert(name.to_string(), until);
        log::info!(
            "Provider '{}' penalized for {} ms",
            name,
            self.config.provider_cooldown_ms
        );
    }

    fn clear_penalty(&self, name: &str) {
        if self.penalties.lock().unwrap().remove(name).is_some() {
            log::debug!("Penalty cleared for provider '{}'", name);
        }
    }
}

impl Drop for ProviderRouter {
    fn drop(&mut self) {
        self.destroy();
    }
}
