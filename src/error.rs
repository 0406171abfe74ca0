//! Engine-wide error taxonomy.
//!
//! Every fallible operation in the engine returns [`SlsError`]. The variants
//! mirror the failure kinds a caller can meaningfully react to: bad
//! arguments or state, transient busyness, entities that disappeared
//! mid-operation, resource exhaustion, backend I/O failures, and malformed
//! wire traffic. Capture errors abort the running pass and return the
//! partition to `Available`; restore errors terminate the failing worker but
//! still release the restore barrier.

use miette::Diagnostic;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SlsError>;

/// Errors produced by partition, capture, restore, and backend operations.
#[derive(Debug, Error, Diagnostic)]
pub enum SlsError {
    /// Bad OID, wrong partition state, malformed record, or an otherwise
    /// invalid request.
    #[error("invalid: {what}")]
    #[diagnostic(code(aurora::invalid))]
    Invalid { what: String },

    /// A non-blocking state transition found the partition busy, or the
    /// module is exiting.
    #[error("busy: {what}")]
    #[diagnostic(
        code(aurora::busy),
        help("retry once the in-flight operation completes")
    )]
    Busy { what: String },

    /// The target process or partition went away between lookup and use.
    #[error("gone: {what}")]
    #[diagnostic(code(aurora::gone))]
    Gone { what: String },

    /// Allocation or buffer-pool exhaustion.
    #[error("out of resources: {what}")]
    #[diagnostic(code(aurora::nomem))]
    OutOfResources { what: String },

    /// Backend read or write failure.
    #[error("i/o failure: {source}")]
    #[diagnostic(code(aurora::io))]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A streaming peer sent a frame we cannot make sense of.
    #[error("protocol violation: {what}")]
    #[diagnostic(code(aurora::protocol))]
    Protocol { what: String },

    /// A record buffer did not start with the expected magic.
    #[error("record magic mismatch: expected {expected:#x}, found {found:#x}")]
    #[diagnostic(
        code(aurora::bad_magic),
        help("the artifact is corrupt or was produced by an incompatible version")
    )]
    BadMagic { expected: u32, found: u32 },

    /// A descriptor kind the restore path does not know how to revive.
    /// Unsupported descriptors are skipped at capture; at restore they are
    /// fatal.
    #[error("unsupported resource kind: {kind}")]
    #[diagnostic(code(aurora::unsupported))]
    Unsupported { kind: &'static str },
}

impl SlsError {
    pub fn invalid(what: impl Into<String>) -> Self {
        SlsError::Invalid { what: what.into() }
    }

    pub fn busy(what: impl Into<String>) -> Self {
        SlsError::Busy { what: what.into() }
    }

    pub fn gone(what: impl Into<String>) -> Self {
        SlsError::Gone { what: what.into() }
    }

    pub fn nomem(what: impl Into<String>) -> Self {
        SlsError::OutOfResources { what: what.into() }
    }

    pub fn protocol(what: impl Into<String>) -> Self {
        SlsError::Protocol { what: what.into() }
    }

    /// Whether the error is transient and a periodic daemon should keep
    /// going rather than exit.
    pub fn is_transient(&self) -> bool {
        matches!(self, SlsError::Busy { .. } | SlsError::Io { .. })
    }
}

impl Clone for SlsError {
    fn clone(&self) -> Self {
        match self {
            SlsError::Invalid { what } => SlsError::Invalid { what: what.clone() },
            SlsError::Busy { what } => SlsError::Busy { what: what.clone() },
            SlsError::Gone { what } => SlsError::Gone { what: what.clone() },
            SlsError::OutOfResources { what } => SlsError::OutOfResources { what: what.clone() },
            SlsError::Io { source } => SlsError::Io {
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            SlsError::Protocol { what } => SlsError::Protocol { what: what.clone() },
            SlsError::BadMagic { expected, found } => SlsError::BadMagic {
                expected: *expected,
                found: *found,
            },
            SlsError::Unsupported { kind } => SlsError::Unsupported { kind },
        }
    }
}
