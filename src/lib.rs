// src/lib.rs

// Import the top-level `automatosx` module.
pub mod automatosx;

// Re-exporting key items for easier external access.
pub use automatosx::abilities::AbilitiesManager;
pub use automatosx::config::{AutomatosXConfig, Environment};
pub use automatosx::context::{ContextManager, ExecutionContext};
pub use automatosx::executor::{AgentExecutor, ExecutionOptions};
pub use automatosx::memory::MemoryManager;
pub use automatosx::profile::{AgentProfile, ProfileLoader};
pub use automatosx::provider::{ExecutionRequest, ExecutionResponse, Provider};
pub use automatosx::router::ProviderRouter;
pub use automatosx::session::SessionManager;
pub use automatosx::stage::StageExecutionController;
pub use automatosx::workspace::WorkspaceManager;

// Flat module aliases so doc examples can say `automatosx::provider::...`
// without navigating through the whole hierarchy.
pub use automatosx::{
    abilities, cache, cancellation, config, context, delegation, executor, logging, memory, paths,
    profile, provider, rate_limiter, router, scheduler, session, stage, workspace,
};
