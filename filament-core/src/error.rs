//! Error types for the reactive engine.
//!
//! Most failure modes here are either fatal (reentrant mutation, which
//! panics with the error's display message) or signaled through sentinel
//! values (`Diffs::Reset`). The recoverable cases surface as `Result`s.

use thiserror::Error;

/// Errors raised by the reactive engine.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// An atom was mutated while effects were being flushed. The graph is
    /// mid-notification at that point, so the mutation cannot be ordered
    /// consistently. This is a programming error and is raised as a panic.
    #[error("cannot mutate atom '{0}' while effects are being flushed")]
    ReentrantMutation(String),

    /// A capture-frame introspection call was made outside of a computed
    /// or effect body.
    #[error("no capture frame is active; call this inside a computed or effect body")]
    NotCapturing,
}
