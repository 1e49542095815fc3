//! Shared primitives for pluggable LLM-like providers.
//!
//! The core interacts with concrete adapters (subprocess CLIs, HTTP
//! backends) exclusively through the [`Provider`] trait and the
//! lightweight data types in this module. The trait abstracts over the
//! vendor wire format while the supporting structs describe requests,
//! responses, token accounting, streaming chunks, and health probes.
//! Concrete adapters live outside the core; tests implement the trait
//! directly with mocks.
//!
//! # Example: a minimal provider
//!
//! ```rust
//! use async_trait::async_trait;
//! use automatosx::provider::{
//!     ExecutionRequest, ExecutionResponse, FinishReason, Provider, ProviderError, TokenUsage,
//! };
//!
//! struct EchoProvider;
//!
//! #[async_trait]
//! impl Provider for EchoProvider {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         request: &ExecutionRequest,
//!     ) -> Result<ExecutionResponse, ProviderError> {
//!         Ok(ExecutionResponse {
//!             content: request.prompt.clone(),
//!             model: "echo-1".to_string(),
//!             tokens_used: TokenUsage::new(1, 1),
//!             latency_ms: 0,
//!             finish_reason: FinishReason::Stop,
//!         })
//!     }
//!
//!     async fn is_available(&self) -> bool {
//!         true
//!     }
//! }
//! ```

use crate::automatosx::cancellation::CancellationToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::pin::Pin;

/// A single provider invocation.
///
/// Constructed by the executor from an assembled prompt. All tuning
/// fields are optional; providers fall back to their own defaults when a
/// field is absent. The cancellation token, when present, should be
/// propagated to the provider's transport so an expired timeout can abort
/// the in-flight call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// The fully assembled prompt text.
    pub prompt: String,
    /// Optional system prompt priming the provider.
    pub system_prompt: Option<String>,
    /// Preferred model identifier, e.g. `"sonnet-large"`.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens.
    pub max_tokens: Option<u32>,
    /// Cooperative cancellation handle.
    pub cancellation_token: Option<CancellationToken>,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub prompt: u32,
    /// Generated/output tokens billed by the provider.
    pub completion: u32,
    /// Convenience total equal to `prompt + completion`.
    pub total: u32,
}

impl TokenUsage {
    /// Build a usage record, computing the total.
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Natural end of generation.
    Stop,
    /// The token budget was exhausted.
    Length,
    /// The provider reported an error mid-generation.
    Error,
    /// The request was cancelled before completion.
    Cancelled,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A completed provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    /// The generated text.
    pub content: String,
    /// The model that actually served the request.
    pub model: String,
    /// Token accounting for this call.
    pub tokens_used: TokenUsage,
    /// Wall-clock latency of the provider call in milliseconds.
    pub latency_ms: u64,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// A chunk of content in a streaming response.
///
/// Each chunk carries a delta of the assistant's output. A chunk with an
/// empty `content` and a `finish_reason` terminates the stream.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    /// Incremental content delta. May be empty on the terminal chunk.
    pub content: String,
    /// Present only on the final chunk.
    pub finish_reason: Option<FinishReason>,
}

/// A finite, non-restartable sequence of streamed token chunks.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenChunk, ProviderError>> + Send>>;

/// Handle returned by a streaming-capable provider.
///
/// `tokens` yields content deltas; `progress` carries monotonically
/// non-decreasing percentages in `0..=100` on a separate channel so that
/// UI surfaces can render a bar without parsing chunks.
pub struct StreamHandle {
    /// The token chunk stream. Finite and non-restartable.
    pub tokens: TokenStream,
    /// Optional progress percentages, monotonically non-decreasing.
    pub progress: Option<tokio::sync::mpsc::Receiver<u8>>,
}

/// Runtime capability record advertised by a provider handle.
///
/// The executor selects streaming only when both the request asks for it
/// and the provider advertises it here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Whether [`Provider::execute_streaming`] yields a live stream.
    pub streaming: bool,
    /// Whether the provider honors [`ExecutionRequest::cancellation_token`].
    pub cancellation: bool,
}

/// Result of a health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Whether the provider answered the probe.
    pub available: bool,
    /// Probe latency, when measurable.
    pub latency_ms: Option<u64>,
    /// Consecutive failed probes as tracked by the router's health loop.
    pub consecutive_failures: u32,
    /// When the probe ran.
    pub last_checked: DateTime<Utc>,
}

impl ProviderHealth {
    /// Build a health record for a probe that just ran.
    pub fn observed(available: bool, latency_ms: Option<u64>) -> Self {
        Self {
            available,
            latency_ms,
            consecutive_failures: 0,
            last_checked: Utc::now(),
        }
    }
}

/// A structured provider failure.
///
/// `code` carries the machine-readable discriminator when the adapter has
/// one (e.g. `"rate_limit"`, `"ETIMEDOUT"`); retry policies match against
/// the concatenation of `message` and `code`.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// Human-readable description.
    pub message: String,
    /// Optional machine-readable code from the adapter.
    pub code: Option<String>,
}

impl ProviderError {
    /// Build an error from a message alone.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Build an error with a machine-readable code.
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// The text retry policies match against: message plus code.
    pub fn match_text(&self) -> String {
        match &self.code {
            Some(code) => format!("{} {}", self.message, code),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error for ProviderError {}

/// Trait-driven abstraction for a concrete provider adapter.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks. The abstraction deliberately excludes
/// conversation bookkeeping; contexts are assembled by the
/// [`ContextManager`](crate::automatosx::context::ContextManager) and
/// prompts by the executor.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name used in config and logs (e.g. `"claude-cli"`).
    fn name(&self) -> &str;

    /// Runtime capability record for this handle.
    ///
    /// Defaults to a buffered-only, non-cancellable adapter.
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    /// Run a full request/response call.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, ProviderError>;

    /// Request a streaming response.
    ///
    /// Adapters without streaming support inherit this default, which
    /// resolves to `Ok(None)`; the executor then falls back to the
    /// buffered path. A `Some(StreamHandle)` must yield chunks mirroring
    /// the incremental tokens produced upstream.
    async fn execute_streaming(
        &self,
        _request: &ExecutionRequest,
    ) -> Result<Option<StreamHandle>, ProviderError> {
        Ok(None)
    }

    /// Cheap availability probe used by the router's candidate filter.
    ///
    /// Must not panic; a probe failure is reported as `false`.
    async fn is_available(&self) -> bool;

    /// Detailed health probe used by the router's background loop.
    ///
    /// The default measures [`Provider::is_available`] latency.
    async fn get_health(&self) -> ProviderHealth {
        let started = std::time::Instant::now();
        let available = self.is_available().await;
        ProviderHealth::observed(available, Some(started.elapsed().as_millis() as u64))
    }
}
