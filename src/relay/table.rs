//! Per-owner table of relay targets

use std::time::{SystemTime, UNIX_EPOCH};

use super::{CdnConfig, RelayCdnInfo, RelayCdnState, RelayUpdateReason};

/// One relay target with its current state
#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub config: CdnConfig,
    pub state: RelayCdnState,
    pub reason: RelayUpdateReason,
    pub state_time_ms: u64,
}

impl RelayEntry {
    fn new(config: CdnConfig) -> Self {
        Self {
            config,
            state: RelayCdnState::RelayRequesting,
            reason: RelayUpdateReason::None,
            state_time_ms: now_millis(),
        }
    }

    pub fn info(&self) -> RelayCdnInfo {
        RelayCdnInfo {
            url: self.config.url.clone(),
            state: self.state,
            update_reason: self.reason,
            state_time_ms: self.state_time_ms,
        }
    }
}

/// What `begin_add` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A handshake must be issued
    Started,
    /// Target already requesting or relaying, nothing to send
    AlreadyActive(RelayCdnState),
}

/// Relay targets of one stream, in insertion order
#[derive(Debug, Default)]
pub struct RelayTable {
    entries: Vec<RelayEntry>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target, or report that it is already active
    pub fn begin_add(&mut self, config: CdnConfig) -> AddOutcome {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.config.url == config.url) {
            if entry.state != RelayCdnState::NoRelay {
                return AddOutcome::AlreadyActive(entry.state);
            }
            *entry = RelayEntry::new(config);
            return AddOutcome::Started;
        }

        self.entries.push(RelayEntry::new(config));
        AddOutcome::Started
    }

    /// Move a target to a new state. Returns false if nothing changed.
    pub fn transition(&mut self, url: &str, state: RelayCdnState, reason: RelayUpdateReason) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.config.url == url) else {
            return false;
        };

        if entry.state == state && entry.reason == reason {
            return false;
        }

        entry.state = state;
        entry.reason = reason;
        entry.state_time_ms = now_millis();
        true
    }

    /// Drop a target, returning its final snapshot in `NoRelay`
    pub fn remove(&mut self, url: &str) -> Option<RelayCdnInfo> {
        let index = self.entries.iter().position(|e| e.config.url == url)?;
        let mut entry = self.entries.remove(index);
        entry.state = RelayCdnState::NoRelay;
        entry.reason = RelayUpdateReason::Disconnected;
        entry.state_time_ms = now_millis();
        Some(entry.info())
    }

    /// Stop every relay, returning their final snapshots
    pub fn teardown(&mut self) -> Vec<RelayCdnInfo> {
        self.entries
            .drain(..)
            .filter(|e| e.state != RelayCdnState::NoRelay)
            .map(|mut e| {
                e.state = RelayCdnState::NoRelay;
                e.reason = RelayUpdateReason::Disconnected;
                e.state_time_ms = now_millis();
                e.info()
            })
            .collect()
    }

    pub fn get(&self, url: &str) -> Option<&RelayEntry> {
        self.entries.iter().find(|e| e.config.url == url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    /// Snapshot of every target
    pub fn infos(&self) -> Vec<RelayCdnInfo> {
        self.entries.iter().map(RelayEntry::info).collect()
    }

    pub fn active_urls(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.state != RelayCdnState::NoRelay)
            .map(|e| e.config.url.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_twice_is_noop() {
        let mut table = RelayTable::new();
        assert_eq!(table.begin_add(CdnConfig::new("rtmp://x")), AddOutcome::Started);
        assert!(table.transition("rtmp://x", RelayCdnState::Relaying, RelayUpdateReason::None));

        assert_eq!(
            table.begin_add(CdnConfig::new("rtmp://x")),
            AddOutcome::AlreadyActive(RelayCdnState::Relaying)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_failed_target_can_be_retried() {
        let mut table = RelayTable::new();
        table.begin_add(CdnConfig::new("rtmp://x"));
        table.transition("rtmp://x", RelayCdnState::NoRelay, RelayUpdateReason::HandshakeFailed);

        assert_eq!(table.begin_add(CdnConfig::new("rtmp://x")), AddOutcome::Started);
        assert_eq!(table.get("rtmp://x").map(|e| e.state), Some(RelayCdnState::RelayRequesting));
    }

    #[test]
    fn test_remove_missing_is_none() {
        let mut table = RelayTable::new();
        assert!(table.remove("rtmp://missing").is_none());
    }

    #[test]
    fn test_teardown_reports_disconnected() {
        let mut table = RelayTable::new();
        table.begin_add(CdnConfig::new("rtmp://a"));
        table.begin_add(CdnConfig::new("rtmp://b"));
        table.transition("rtmp://a", RelayCdnState::Relaying, RelayUpdateReason::None);

        let infos = table.teardown();
        assert_eq!(infos.len(), 2);
        assert!(infos
            .iter()
            .all(|i| i.state == RelayCdnState::NoRelay && i.update_reason == RelayUpdateReason::Disconnected));
        assert!(table.is_empty());
    }

    #[test]
    fn test_transition_unchanged_returns_false() {
        let mut table = RelayTable::new();
        table.begin_add(CdnConfig::new("rtmp://a"));
        assert!(!table.transition(
            "rtmp://a",
            RelayCdnState::RelayRequesting,
            RelayUpdateReason::None
        ));
        assert!(!table.transition("rtmp://zzz", RelayCdnState::Relaying, RelayUpdateReason::None));
    }
}
