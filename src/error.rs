use crate::transport::TransportError;
use thiserror::Error;

/// The error type for all debugger operations.
///
/// Every failure carries a two-line description: what was being attempted
/// and why it failed. The variants form a closed set of error classes so
/// callers can decide on retries without inspecting message text:
///
/// - [`Error::Link`] and [`Error::Transport`] are link-level faults. The
///   protocol layer already performed one silent reset-and-retry before
///   surfacing these; a caller may reset the link and retry the whole
///   operation.
/// - [`Error::Precondition`] and [`Error::FeatureUnavailable`] are usage
///   errors (device running, read protect enabled, revision lacks the
///   required hardware). Retrying without changing state is pointless.
/// - [`Error::Verify`] and [`Error::Timeout`] are fatal for the operation
///   that raised them. Destructive operations (flash erase/write) are
///   never retried automatically.
#[derive(Error, Debug)]
pub enum Error {
    /// The debug link misbehaved (bad acknowledge, collision, short frame).
    #[error("{what}\n{why}")]
    Link { what: &'static str, why: String },
    /// The operation is illegal in the current device state.
    #[error("{what}\n{why}")]
    Precondition { what: &'static str, why: String },
    /// A readback or CRC verification after a write did not match.
    #[error("{what}\n{why}")]
    Verify { what: &'static str, why: String },
    /// A bounded wait (erase busy flag, reset completion, response bytes)
    /// expired.
    #[error("{what}\n{why}")]
    Timeout { what: &'static str, why: String },
    /// The connected silicon revision does not implement the required
    /// debug feature.
    #[error("{what}\n{why}")]
    FeatureUnavailable { what: &'static str, why: String },
    /// An error in the underlying byte transport.
    #[error("Transport failure")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn link(what: &'static str, why: impl Into<String>) -> Self {
        Error::Link {
            what,
            why: why.into(),
        }
    }

    pub(crate) fn precondition(what: &'static str, why: impl Into<String>) -> Self {
        Error::Precondition {
            what,
            why: why.into(),
        }
    }

    pub(crate) fn verify(what: &'static str, why: impl Into<String>) -> Self {
        Error::Verify {
            what,
            why: why.into(),
        }
    }

    pub(crate) fn timeout(what: &'static str, why: impl Into<String>) -> Self {
        Error::Timeout {
            what,
            why: why.into(),
        }
    }

    pub(crate) fn feature_unavailable(what: &'static str, why: impl Into<String>) -> Self {
        Error::FeatureUnavailable {
            what,
            why: why.into(),
        }
    }

    /// Whether a link reset followed by a retry of the operation has a
    /// chance of succeeding.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Link { .. } | Error::Transport(_) | Error::Timeout { .. }
        )
    }
}
