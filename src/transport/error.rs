//! Transport error types

use crate::relay::RelayUpdateReason;

/// Classification of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection reset, unreachable edge, DNS failure
    Network,
    /// Request timed out
    Timeout,
    /// Token or app credentials rejected
    AuthFailed,
    /// Same user logged in elsewhere
    DuplicateLogin,
    /// Room member limit reached
    RoomFull,
    /// Stream id already published by someone else
    StreamIdConflict,
    /// Requested stream does not exist
    StreamNotFound,
    /// CDN relay failure with its reason
    Relay(RelayUpdateReason),
    /// Server rejected the request with a specific code
    Rejected(i32),
}

impl TransportErrorKind {
    /// Transient failures are retried with backoff, everything else is fatal
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportErrorKind::Network | TransportErrorKind::Timeout)
    }
}

/// Error returned by a [`super::Transport`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
