//! Error taxonomy for the VM core
//!
//! Two families of failure:
//! - User-resolvable: the program itself signalled an error (`Unhandled`) or a
//!   foreign call raised one (`Foreign`). Reported with a human-actionable
//!   message and a stack trace.
//! - Unexpected: a VM invariant was violated (bad operand types, missing
//!   binding, stack underflow, ip out of bounds). Always a bug.
//!
//! Storage failures (`Store`) carry their own kinds so lock timeouts can be
//! told apart from genuine database errors.
//!
//! The machine's `run()` loop is the single catch point: any of these stops
//! only the current thread and marks the session broken. Sibling threads keep
//! running and may still resolve their own futures.

use thiserror::Error;

/// Errors raised while executing a thread
#[derive(Debug, Error)]
pub enum VmError {
    /// An explicit language-level error signal not caught by a handler
    #[error("unhandled signal: {0}")]
    Unhandled(String),

    /// An error raised inside a foreign/host call
    #[error("foreign call '{name}' failed: {message}")]
    Foreign {
        name: String,
        message: String,
        /// Host-side detail (e.g. a captured backtrace), when available
        detail: Option<String>,
    },

    /// A VM invariant violation - never expected at runtime
    #[error("vm invariant violated: {0}")]
    Unexpected(String),

    /// A failure in the persistence/coordination layer
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VmError {
    /// Whether this error is something the program author can act on,
    /// as opposed to a VM or infrastructure bug.
    pub fn is_user_resolvable(&self) -> bool {
        matches!(self, VmError::Unhandled(_) | VmError::Foreign { .. })
    }

    /// Shorthand for an `Unexpected` error with a formatted message
    pub fn unexpected(msg: impl Into<String>) -> Self {
        VmError::Unexpected(msg.into())
    }
}

/// Errors raised by a Controller backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// A lock on a session item could not be acquired within the bounded wait
    #[error("timed out waiting for lock on '{key}'")]
    LockTimeout { key: String },

    /// An item that must exist was not found
    #[error("missing session item '{key}'")]
    MissingItem { key: String },

    /// The executable was used before being set, or set twice
    #[error("{0}")]
    Session(String),

    /// A wire-format document could not be decoded
    #[error("malformed wire data: {0}")]
    Wire(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result alias used throughout the machine and controller layers
pub type VmResult<T> = Result<T, VmError>;
