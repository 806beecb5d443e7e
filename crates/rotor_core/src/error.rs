//! Error types for the Rotor runtime.

use thiserror::Error;

use crate::objects::object::ClosureType;

/// All fatal conditions the runtime can hit.
///
/// There are no recoverable errors at this layer: the public entry points
/// report the diagnostic on stderr and exit the process (see [`fatal`]).
/// Internal `try_*` operations return `RotorError` so the conditions stay
/// unit-testable without spawning a process.
#[derive(Debug, Error)]
pub enum RotorError {
    /// The value stack grew past its fixed capacity.
    #[error("Stack overflow")]
    StackOverflow,

    /// A message arrived at a VM whose inbox is at capacity.
    #[error("Inbox full")]
    InboxFull,

    /// A receiver is blocked on an empty mailbox with no live peer left to
    /// send into it.
    #[error("No messages waiting")]
    NoMessagesWaiting,

    /// An allocation request did not fit even after a collection.
    #[error("Out of heap memory allocating {requested} bytes")]
    HeapExhausted {
        /// Payload size of the failed request, in bytes.
        requested: usize,
    },

    /// An operation met an object tag it has no rule for.
    #[error("unhandled object tag {ty:?} in {op}")]
    UnhandledTag {
        /// The operation that dispatched on the tag.
        op: &'static str,
        /// The offending tag.
        ty: ClosureType,
    },
}

/// Convenient `Result` alias for fallible runtime operations.
pub type RotorResult<T> = Result<T, RotorError>;

/// Report `err` on stderr and terminate the process.
///
/// The exit status is `-1`, matching the contract that generated programs
/// observe a non-zero status on any runtime failure.
pub fn fatal(err: RotorError) -> ! {
    eprintln!("{err}");
    std::process::exit(-1);
}
