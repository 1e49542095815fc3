//! Cooperative cancellation primitive.
//!
//! Every long-running call in the core accepts a [`CancellationToken`].
//! Timeout expiry, parent cancellation, and upstream failures (when a
//! delegation batch runs with `continue_delegations_on_failure = false`)
//! all fire the token; providers are expected to propagate it to their
//! transport. Tokens are cheap to clone and may form parent/child trees:
//! cancelling a parent cancels every child, while a child can be cancelled
//! on its own without touching the parent.
//!
//! # Example
//!
//! ```rust
//! use automatosx::cancellation::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let token = CancellationToken::new();
//! let child = token.child();
//!
//! assert!(!child.is_cancelled());
//! token.cancel();
//! assert!(child.is_cancelled());
//! child.cancelled().await; // resolves immediately once fired
//! # }
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// A clonable, hierarchical cancellation flag.
///
/// Clones share the same underlying flag; use [`CancellationToken::child`]
/// to derive a token that observes the parent but can also be fired
/// independently.
#[derive(Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    parent: Option<Arc<CancellationToken>>,
}

impl CancellationToken {
    /// Create a fresh, un-fired token.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            parent: None,
        }
    }

    /// Derive a child token.
    ///
    /// The child reports cancelled when either it or any ancestor has been
    /// fired. Cancelling the child does not fire the parent.
    pub fn child(&self) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Report whether this token or any ancestor has been fired.
    pub fn is_cancelled(&self) -> bool {
        if *self.sender.borrow() {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Wait until the token fires.
    ///
    /// Resolves immediately when the token is already cancelled. Safe to
    /// call from any number of tasks concurrently.
    pub async fn cancelled(&self) {
        loop {
            let mut own = self.sender.subscribe();
            // Re-check after subscribing: a cancel that lands in between
            // would otherwise be missed by `changed()`.
            if self.is_cancelled() {
                return;
            }
            match &self.parent {
                Some(parent) => {
                    let parent = parent.clone();
                    tokio::select! {
                        _ = own.changed() => {}
                        _ = Box::pin(parent.cancelled()) => {}
                    }
                }
                None => {
                    if own.changed().await.is_err() {
                        // Sender is held by self, so this is unreachable in
                        // practice; treat a closed channel as cancellation.
                        return;
                    }
                }
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
