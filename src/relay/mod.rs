//! CDN relay bookkeeping
//!
//! A relay forwards an already-ingested stream (a publish channel or a mixer
//! output) to a third-party CDN endpoint. Each target URL runs its own
//! `NoRelay → RelayRequesting → Relaying` state machine.

pub mod table;

use serde::{Deserialize, Serialize};

pub use table::{AddOutcome, RelayEntry, RelayTable};

/// CDN endpoint plus its auth parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CdnConfig {
    pub url: String,
    pub auth_param: String,
}

impl CdnConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_param: String::new(),
        }
    }

    pub fn with_auth(mut self, auth_param: impl Into<String>) -> Self {
        self.auth_param = auth_param.into();
        self
    }
}

/// Relay state for one target URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RelayCdnState {
    #[default]
    NoRelay,
    RelayRequesting,
    Relaying,
}

/// Why a relay changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RelayUpdateReason {
    #[default]
    None,
    ServerError,
    HandshakeFailed,
    AccessPointError,
    CreateStreamFailed,
    BadName,
    /// The CDN closed the connection
    CdnServerDisconnected,
    /// Closed locally
    Disconnected,
}

/// Snapshot of one relay, as delivered to the event sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCdnInfo {
    pub url: String,
    pub state: RelayCdnState,
    pub update_reason: RelayUpdateReason,
    /// Unix time of the last transition, in milliseconds
    pub state_time_ms: u64,
}

/// Targets that look like URLs are relays; anything else is a stream id
pub fn is_relay_target(target: &str) -> bool {
    target.contains("://")
}
