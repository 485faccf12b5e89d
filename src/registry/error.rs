//! Registry error types
//!
//! Error types for stream id claims.

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Stream id already claimed by another publish channel
    StreamIdInUse(String),
    /// Stream id is not claimed by the releasing channel
    ClaimMismatch(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::StreamIdInUse(id) => write!(f, "Stream id already in use: {}", id),
            RegistryError::ClaimMismatch(id) => {
                write!(f, "Stream id not claimed by this channel: {}", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
