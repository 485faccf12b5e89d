//! Error types
//!
//! Synchronous rejections are returned as [`Error`]. Asynchronous failures are
//! reported through events or [`crate::Completion`]s and carry the integer
//! code from [`codes`], which is the same code space the event sink receives.

use crate::registry::RegistryError;
use crate::transport::{TransportError, TransportErrorKind};

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Integer error codes shared with the event sink
pub mod codes {
    /// No error
    pub const SUCCESS: i32 = 0;

    /// Generic invalid parameter
    pub const INVALID_PARAMETER: i32 = 1_000_001;
    /// Identifier empty, too long or containing illegal characters
    pub const INVALID_ID: i32 = 1_000_002;
    /// Stream extra info exceeds the allowed length
    pub const EXTRA_INFO_TOO_LONG: i32 = 1_000_003;
    /// Operation is not allowed in the entity's current state
    pub const INVALID_STATE: i32 = 1_000_004;
    /// Operation cancelled because the entity was stopped or destroyed
    pub const CANCELLED: i32 = 1_000_005;
    /// Capability not supported by the platform collaborator
    pub const UNSUPPORTED: i32 = 1_000_006;

    /// Room join already in progress with another identity
    pub const ROOM_ALREADY_JOINING: i32 = 1_002_001;
    /// Room already connected with another identity
    pub const ROOM_ALREADY_JOINED: i32 = 1_002_002;
    /// Not logged into any room
    pub const ROOM_NOT_LOGGED_IN: i32 = 1_002_003;
    /// Authentication rejected by the server
    pub const ROOM_AUTH_FAILED: i32 = 1_002_004;
    /// Same user logged in elsewhere, this session was kicked out
    pub const ROOM_KICKED_OUT: i32 = 1_002_005;
    /// Room is full
    pub const ROOM_MEMBER_LIMIT: i32 = 1_002_006;
    /// Connection interrupted, reconnecting
    pub const NETWORK_INTERRUPTED: i32 = 1_002_030;
    /// Retries exhausted on a transient failure
    pub const NETWORK_TIMEOUT: i32 = 1_002_031;

    /// Stream id already used by another publisher
    pub const PUBLISH_STREAM_ID_CONFLICT: i32 = 1_003_001;
    /// Channel already publishing a different stream id
    pub const PUBLISH_CHANNEL_BUSY: i32 = 1_003_002;
    /// Stream is not being published by this client
    pub const PUBLISH_NOT_PUBLISHING: i32 = 1_003_003;
    /// Publish rejected by the server
    pub const PUBLISH_SERVER_REJECTED: i32 = 1_003_004;

    /// Play rejected by the server or stream missing
    pub const PLAY_STREAM_NOT_FOUND: i32 = 1_004_001;
    /// Play stream not active
    pub const PLAY_NOT_PLAYING: i32 = 1_004_002;

    /// Duplicate input stream id in a mixer task
    pub const MIXER_DUPLICATE_INPUT: i32 = 1_005_001;
    /// Input layout outside the output canvas
    pub const MIXER_LAYOUT_OUT_OF_BOUNDS: i32 = 1_005_002;
    /// Watermark layout outside the encode resolution
    pub const MIXER_WATERMARK_OUT_OF_BOUNDS: i32 = 1_005_003;
    /// Bitrate or fps changed after the task started
    pub const MIXER_IMMUTABLE_CONFIG: i32 = 1_005_004;
    /// Task id already started
    pub const MIXER_TASK_EXISTS: i32 = 1_005_005;
    /// Task id not found
    pub const MIXER_TASK_NOT_FOUND: i32 = 1_005_006;
    /// Input or output list empty
    pub const MIXER_EMPTY_LIST: i32 = 1_005_007;
    /// Sound level slot id reused across inputs
    pub const MIXER_DUPLICATE_SOUND_LEVEL_ID: i32 = 1_005_008;
    /// Mixer rejected by the server
    pub const MIXER_SERVER_REJECTED: i32 = 1_005_009;

    /// CDN relay rejected
    pub const RELAY_FAILED: i32 = 1_006_001;

    /// Media player pool exhausted
    pub const MEDIA_PLAYER_POOL_EXHAUSTED: i32 = 1_008_001;
    /// Resource not loaded yet
    pub const MEDIA_PLAYER_RESOURCE_NOT_READY: i32 = 1_008_002;
    /// Resource failed to load
    pub const MEDIA_PLAYER_LOAD_FAILED: i32 = 1_008_003;
    /// Seek target past the end of the resource
    pub const MEDIA_PLAYER_SEEK_OUT_OF_RANGE: i32 = 1_008_004;
    /// Player handle no longer valid
    pub const MEDIA_PLAYER_DESTROYED: i32 = 1_008_005;

    /// Transport failure with no finer classification
    pub const TRANSPORT_FAILURE: i32 = 1_009_001;
}

/// Main error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    InvalidId { field: &'static str, reason: String },

    #[error("extra info is {len} bytes, limit is {limit}")]
    ExtraInfoTooLong { len: usize, limit: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("room {0} is already joining with another user")]
    AlreadyJoining(String),

    #[error("room {0} is already joined with another user")]
    AlreadyJoined(String),

    #[error("not logged into any room")]
    NotLoggedIn,

    #[error("stream id {0} is already in use")]
    StreamIdInUse(String),

    #[error("channel is already publishing stream {0}")]
    ChannelBusy(String),

    #[error("stream {0} is not being published")]
    NotPublishing(String),

    #[error("stream {0} is not being played")]
    NotPlaying(String),

    #[error("duplicate mixer input stream {0}")]
    MixerDuplicateInput(String),

    #[error("mixer input {0} lies outside the output canvas")]
    MixerLayoutOutOfBounds(String),

    #[error("watermark layout lies outside the encode resolution")]
    WatermarkOutOfBounds,

    #[error("mixer {0} cannot change after the task started")]
    MixerImmutableConfig(&'static str),

    #[error("mixer task {0} already started")]
    MixerTaskExists(String),

    #[error("mixer task {0} not found")]
    MixerTaskNotFound(String),

    #[error("mixer {0} list is empty")]
    MixerEmptyList(&'static str),

    #[error("duplicate sound level id {0}")]
    MixerDuplicateSoundLevelId(u32),

    #[error("media player pool exhausted ({0} instances live)")]
    PoolExhausted(usize),

    #[error("media resource not ready")]
    ResourceNotReady,

    #[error("media resource failed to load: {0}")]
    LoadFailed(String),

    #[error("seek to {target_ms} ms is past the end ({duration_ms} ms)")]
    SeekOutOfRange { target_ms: u64, duration_ms: u64 },

    #[error("media player destroyed")]
    PlayerDestroyed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("not supported on this platform")]
    Unsupported,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    /// Integer code reported to the event sink
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidId { .. } => codes::INVALID_ID,
            Error::ExtraInfoTooLong { .. } => codes::EXTRA_INFO_TOO_LONG,
            Error::InvalidParameter(_) => codes::INVALID_PARAMETER,
            Error::InvalidState(_) => codes::INVALID_STATE,
            Error::AlreadyJoining(_) => codes::ROOM_ALREADY_JOINING,
            Error::AlreadyJoined(_) => codes::ROOM_ALREADY_JOINED,
            Error::NotLoggedIn => codes::ROOM_NOT_LOGGED_IN,
            Error::StreamIdInUse(_) => codes::PUBLISH_STREAM_ID_CONFLICT,
            Error::ChannelBusy(_) => codes::PUBLISH_CHANNEL_BUSY,
            Error::NotPublishing(_) => codes::PUBLISH_NOT_PUBLISHING,
            Error::NotPlaying(_) => codes::PLAY_NOT_PLAYING,
            Error::MixerDuplicateInput(_) => codes::MIXER_DUPLICATE_INPUT,
            Error::MixerLayoutOutOfBounds(_) => codes::MIXER_LAYOUT_OUT_OF_BOUNDS,
            Error::WatermarkOutOfBounds => codes::MIXER_WATERMARK_OUT_OF_BOUNDS,
            Error::MixerImmutableConfig(_) => codes::MIXER_IMMUTABLE_CONFIG,
            Error::MixerTaskExists(_) => codes::MIXER_TASK_EXISTS,
            Error::MixerTaskNotFound(_) => codes::MIXER_TASK_NOT_FOUND,
            Error::MixerEmptyList(_) => codes::MIXER_EMPTY_LIST,
            Error::MixerDuplicateSoundLevelId(_) => codes::MIXER_DUPLICATE_SOUND_LEVEL_ID,
            Error::PoolExhausted(_) => codes::MEDIA_PLAYER_POOL_EXHAUSTED,
            Error::ResourceNotReady => codes::MEDIA_PLAYER_RESOURCE_NOT_READY,
            Error::LoadFailed(_) => codes::MEDIA_PLAYER_LOAD_FAILED,
            Error::SeekOutOfRange { .. } => codes::MEDIA_PLAYER_SEEK_OUT_OF_RANGE,
            Error::PlayerDestroyed => codes::MEDIA_PLAYER_DESTROYED,
            Error::Cancelled => codes::CANCELLED,
            Error::Unsupported => codes::UNSUPPORTED,
            Error::Transport(e) => e.code(),
        }
    }

    /// Whether the error is a transient network failure
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(e) if e.kind.is_transient())
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::StreamIdInUse(id) => Error::StreamIdInUse(id),
            RegistryError::ClaimMismatch(id) => Error::NotPublishing(id),
        }
    }
}

impl TransportError {
    /// Integer code reported to the event sink
    pub fn code(&self) -> i32 {
        match self.kind {
            TransportErrorKind::Network | TransportErrorKind::Timeout => codes::NETWORK_INTERRUPTED,
            TransportErrorKind::AuthFailed => codes::ROOM_AUTH_FAILED,
            TransportErrorKind::DuplicateLogin => codes::ROOM_KICKED_OUT,
            TransportErrorKind::RoomFull => codes::ROOM_MEMBER_LIMIT,
            TransportErrorKind::StreamIdConflict => codes::PUBLISH_STREAM_ID_CONFLICT,
            TransportErrorKind::StreamNotFound => codes::PLAY_STREAM_NOT_FOUND,
            TransportErrorKind::Relay(_) => codes::RELAY_FAILED,
            TransportErrorKind::Rejected(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayUpdateReason;

    #[test]
    fn test_codes_are_distinct_per_class() {
        assert_eq!(Error::NotLoggedIn.code(), codes::ROOM_NOT_LOGGED_IN);
        assert_eq!(Error::ResourceNotReady.code(), codes::MEDIA_PLAYER_RESOURCE_NOT_READY);
        assert_ne!(
            Error::StreamIdInUse("s".into()).code(),
            Error::ChannelBusy("s".into()).code()
        );
    }

    #[test]
    fn test_transport_error_classification() {
        let transient = Error::from(TransportError::new(TransportErrorKind::Network, "reset"));
        assert!(transient.is_transient());
        assert_eq!(transient.code(), codes::NETWORK_INTERRUPTED);

        let fatal = Error::from(TransportError::new(TransportErrorKind::DuplicateLogin, "kicked"));
        assert!(!fatal.is_transient());
        assert_eq!(fatal.code(), codes::ROOM_KICKED_OUT);

        let relay = TransportError::new(
            TransportErrorKind::Relay(RelayUpdateReason::HandshakeFailed),
            "handshake",
        );
        assert_eq!(relay.code(), codes::RELAY_FAILED);
    }

    #[test]
    fn test_registry_error_conversion() {
        let err: Error = RegistryError::StreamIdInUse("s1".into()).into();
        assert!(matches!(err, Error::StreamIdInUse(ref id) if id == "s1"));
    }
}
