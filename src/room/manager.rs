//! Room connection manager
//!
//! One state machine per joined room:
//!
//! ```text
//! Disconnected ──join──► Connecting ──login ok──► Connected
//!       ▲                   │  ▲                     │
//!       │   fatal / leave   │  └──── network lost ───┘
//!       └───────────────────┴─────────────────────────┘
//! ```
//!
//! A login loop runs while a room is `Connecting`. Transient failures are
//! retried with backoff; fatal ones end in `Disconnected` with the server's
//! error code. Membership deltas for a room are emitted as one batch per
//! server notification or login.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::engine::EngineContext;
use crate::error::{codes, Error, Result};
use crate::event::{EngineEvent, ExtendedData, RoomEvent, UpdateType};
use crate::retry::Backoff;
use crate::transport::{Connectivity, ControlMessage, ControlReply, ServerPush, TransportError};

use super::types::{RoomConfig, RoomSnapshot, RoomState, StreamInfo, User};

/// Room lifecycle changes other managers react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomSignal {
    /// Room reached `Connected`, on first login or after a reconnect
    Connected(String),
    /// Connected room lost its connection and is reconnecting
    Interrupted(String),
    /// Room left or failed fatally
    Closed { room_id: String, error_code: i32 },
}

struct RoomEntry {
    user: User,
    config: RoomConfig,
    state: RoomState,
    generation: u64,
    users: Vec<User>,
    streams: Vec<StreamInfo>,
    task: Option<JoinHandle<()>>,
    wake: Arc<Notify>,
}

impl RoomEntry {
    /// Replace the caches with a server snapshot, returning the deltas
    fn apply_snapshot(&mut self, room_id: &str, snapshot: RoomSnapshot) -> Vec<EngineEvent> {
        let own_id = self.user.user_id.clone();
        let users: Vec<User> = snapshot
            .users
            .into_iter()
            .filter(|u| u.user_id != own_id)
            .collect();

        let users_gone: Vec<User> = self
            .users
            .iter()
            .filter(|old| !users.iter().any(|u| u.user_id == old.user_id))
            .cloned()
            .collect();
        let users_new: Vec<User> = users
            .iter()
            .filter(|u| !self.users.iter().any(|old| old.user_id == u.user_id))
            .cloned()
            .collect();
        let streams_gone: Vec<StreamInfo> = self
            .streams
            .iter()
            .filter(|old| !snapshot.streams.iter().any(|s| s.stream_id == old.stream_id))
            .cloned()
            .collect();
        let streams_new: Vec<StreamInfo> = snapshot
            .streams
            .iter()
            .filter(|s| !self.streams.iter().any(|old| old.stream_id == s.stream_id))
            .cloned()
            .collect();

        self.users = users;
        self.streams = snapshot.streams;

        let mut events = Vec::new();
        if self.config.is_user_status_notify {
            push_user_update(&mut events, room_id, UpdateType::Delete, users_gone);
            push_user_update(&mut events, room_id, UpdateType::Add, users_new);
        }
        push_stream_update(&mut events, room_id, UpdateType::Delete, streams_gone);
        push_stream_update(&mut events, room_id, UpdateType::Add, streams_new);
        events
    }

    fn apply_user_update(&mut self, update: UpdateType, users: &[User]) -> Vec<User> {
        let mut changed = Vec::new();
        for user in users {
            if user.user_id == self.user.user_id {
                continue;
            }
            let index = self.users.iter().position(|u| u.user_id == user.user_id);
            match (update, index) {
                (UpdateType::Add, None) => {
                    self.users.push(user.clone());
                    changed.push(user.clone());
                }
                (UpdateType::Delete, Some(i)) => {
                    changed.push(self.users.remove(i));
                }
                _ => {}
            }
        }
        changed
    }

    fn apply_stream_update(&mut self, update: UpdateType, streams: &[StreamInfo]) -> Vec<StreamInfo> {
        let mut changed = Vec::new();
        for stream in streams {
            let index = self.streams.iter().position(|s| s.stream_id == stream.stream_id);
            match (update, index) {
                (UpdateType::Add, None) => {
                    self.streams.push(stream.clone());
                    changed.push(stream.clone());
                }
                (UpdateType::Delete, Some(i)) => {
                    changed.push(self.streams.remove(i));
                }
                _ => {}
            }
        }
        changed
    }

    fn apply_extra_info(&mut self, streams: &[StreamInfo]) -> Vec<StreamInfo> {
        let mut changed = Vec::new();
        for update in streams {
            if let Some(stream) = self.streams.iter_mut().find(|s| s.stream_id == update.stream_id) {
                if stream.extra_info != update.extra_info {
                    stream.extra_info = update.extra_info.clone();
                    changed.push(stream.clone());
                }
            }
        }
        changed
    }
}

fn push_user_update(events: &mut Vec<EngineEvent>, room_id: &str, update_type: UpdateType, users: Vec<User>) {
    if !users.is_empty() {
        events.push(
            RoomEvent::UserUpdate {
                room_id: room_id.to_string(),
                update_type,
                users,
            }
            .into(),
        );
    }
}

fn push_stream_update(
    events: &mut Vec<EngineEvent>,
    room_id: &str,
    update_type: UpdateType,
    streams: Vec<StreamInfo>,
) {
    if !streams.is_empty() {
        events.push(
            RoomEvent::StreamUpdate {
                room_id: room_id.to_string(),
                update_type,
                streams,
            }
            .into(),
        );
    }
}

fn state_event(room_id: &str, state: RoomState, error_code: i32, extended_data: ExtendedData) -> EngineEvent {
    RoomEvent::StateUpdate {
        room_id: room_id.to_string(),
        state,
        error_code,
        extended_data,
    }
    .into()
}

/// Owns the state machines of every joined room
pub struct RoomManager {
    ctx: Arc<EngineContext>,
    rooms: Mutex<HashMap<String, RoomEntry>>,
    next_generation: AtomicU64,
    signals: mpsc::UnboundedSender<RoomSignal>,
}

impl RoomManager {
    /// Create a manager and the receiver for its lifecycle signals
    pub(crate) fn new(ctx: Arc<EngineContext>) -> (Arc<Self>, mpsc::UnboundedReceiver<RoomSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            ctx,
            rooms: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            signals: tx,
        });
        (manager, rx)
    }

    /// Join a room
    ///
    /// Joining again with the same user is a no-op. A different user gets
    /// `AlreadyJoining` while the room is connecting and `AlreadyJoined` once
    /// it is connected.
    pub fn join(self: &Arc<Self>, room_id: &str, user: User, config: RoomConfig) -> Result<()> {
        let limits = &self.ctx.config.limits;
        limits.check_room_id(room_id)?;
        limits.check_user_id(&user.user_id)?;
        limits.check_user_name(&user.user_name)?;

        let mut rooms = self.rooms.lock();
        if let Some(entry) = rooms.get(room_id) {
            if entry.user == user {
                tracing::debug!(room = %room_id, user = %user.user_id, state = ?entry.state, "Join ignored, already joining");
                return Ok(());
            }
            return Err(match entry.state {
                RoomState::Connected => Error::AlreadyJoined(room_id.to_string()),
                _ => Error::AlreadyJoining(room_id.to_string()),
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let wake = Arc::new(Notify::new());
        tracing::info!(room = %room_id, user = %user.user_id, "Joining room");

        self.ctx.registry.set_room_state(room_id, RoomState::Connecting);
        self.ctx
            .emit(state_event(room_id, RoomState::Connecting, codes::SUCCESS, ExtendedData::new()));

        let task = self.spawn_login(room_id, generation, wake.clone());
        rooms.insert(
            room_id.to_string(),
            RoomEntry {
                user,
                config,
                state: RoomState::Connecting,
                generation,
                users: Vec::new(),
                streams: Vec::new(),
                task: Some(task),
                wake,
            },
        );
        Ok(())
    }

    /// Leave a room. Leaving a room that is not joined is a no-op.
    pub fn leave(&self, room_id: &str) {
        let Some(entry) = self.rooms.lock().remove(room_id) else {
            tracing::debug!(room = %room_id, "Leave ignored, room not joined");
            return;
        };

        if let Some(task) = entry.task {
            task.abort();
        }
        self.ctx.registry.remove_room(room_id);
        self.ctx
            .emit(state_event(room_id, RoomState::Disconnected, codes::SUCCESS, ExtendedData::new()));
        let _ = self.signals.send(RoomSignal::Closed {
            room_id: room_id.to_string(),
            error_code: codes::SUCCESS,
        });

        tracing::info!(room = %room_id, users = entry.users.len(), streams = entry.streams.len(), "Left room");

        let transport = self.ctx.transport.clone();
        let room_id = room_id.to_string();
        self.ctx.spawn(async move {
            let logout = ControlMessage::Logout {
                room_id: room_id.clone(),
            };
            if let Err(e) = transport.send_control(logout).await {
                tracing::debug!(room = %room_id, error = %e, "Logout not acknowledged");
            }
            transport.disconnect(&room_id).await;
        });
    }

    /// Leave every room
    pub fn leave_all(&self) {
        let room_ids: Vec<String> = self.rooms.lock().keys().cloned().collect();
        for room_id in room_ids {
            self.leave(&room_id);
        }
    }

    pub fn state(&self, room_id: &str) -> RoomState {
        self.rooms
            .lock()
            .get(room_id)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// Remote users currently known in a room
    pub fn users(&self, room_id: &str) -> Vec<User> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|e| e.users.clone())
            .unwrap_or_default()
    }

    /// Remote streams currently known in a room
    pub fn streams(&self, room_id: &str) -> Vec<StreamInfo> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|e| e.streams.clone())
            .unwrap_or_default()
    }

    pub(crate) fn on_connectivity(self: &Arc<Self>, connectivity: Connectivity) {
        let mut rooms = self.rooms.lock();
        match connectivity {
            Connectivity::Lost => {
                for (room_id, entry) in rooms.iter_mut() {
                    if entry.state != RoomState::Connected {
                        continue;
                    }
                    entry.state = RoomState::Connecting;
                    entry.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(room = %room_id, "Connection lost, reconnecting");

                    self.ctx.registry.set_room_state(room_id, RoomState::Connecting);
                    self.ctx.emit(state_event(
                        room_id,
                        RoomState::Connecting,
                        codes::NETWORK_INTERRUPTED,
                        ExtendedData::new(),
                    ));
                    let _ = self.signals.send(RoomSignal::Interrupted(room_id.clone()));
                    entry.task = Some(self.spawn_login(room_id, entry.generation, entry.wake.clone()));
                }
            }
            Connectivity::Connected => {
                for (room_id, entry) in rooms.iter() {
                    if entry.state == RoomState::Connecting {
                        tracing::debug!(room = %room_id, "Network back, retrying login now");
                        entry.wake.notify_one();
                    }
                }
            }
        }
    }

    /// Handle a room-scoped server push. Returns false if the push is not
    /// about rooms.
    pub(crate) fn handle_push(self: &Arc<Self>, push: &ServerPush) -> bool {
        match push {
            ServerPush::UserUpdate {
                room_id,
                update,
                users,
            } => {
                self.with_connected(room_id, |entry| {
                    let changed = entry.apply_user_update(*update, users);
                    let mut events = Vec::new();
                    if entry.config.is_user_status_notify {
                        push_user_update(&mut events, room_id, *update, changed);
                    }
                    events
                });
            }
            ServerPush::StreamUpdate {
                room_id,
                update,
                streams,
            } => {
                self.with_connected(room_id, |entry| {
                    let changed = entry.apply_stream_update(*update, streams);
                    let mut events = Vec::new();
                    push_stream_update(&mut events, room_id, *update, changed);
                    events
                });
            }
            ServerPush::StreamExtraInfoUpdate { room_id, streams } => {
                self.with_connected(room_id, |entry| {
                    let changed = entry.apply_extra_info(streams);
                    if changed.is_empty() {
                        return Vec::new();
                    }
                    vec![RoomEvent::StreamExtraInfoUpdate {
                        room_id: room_id.clone(),
                        streams: changed,
                    }
                    .into()]
                });
            }
            ServerPush::KickedOut { room_id, reason } => {
                let generation = self.rooms.lock().get(room_id).map(|e| e.generation);
                if let Some(generation) = generation {
                    let code = TransportError::new(*reason, "kicked out").code();
                    tracing::warn!(room = %room_id, reason = ?reason, "Kicked out of room");
                    self.fail(room_id, generation, code, ExtendedData::new());
                }
            }
            ServerPush::BroadcastMessage { room_id, messages } => {
                self.with_connected(room_id, |_| {
                    vec![RoomEvent::BroadcastMessage {
                        room_id: room_id.clone(),
                        messages: messages.clone(),
                    }
                    .into()]
                });
            }
            ServerPush::BarrageMessage { room_id, messages } => {
                self.with_connected(room_id, |_| {
                    vec![RoomEvent::BarrageMessage {
                        room_id: room_id.clone(),
                        messages: messages.clone(),
                    }
                    .into()]
                });
            }
            ServerPush::CustomCommand {
                room_id,
                command,
                from_user,
            } => {
                self.with_connected(room_id, |_| {
                    vec![RoomEvent::CustomCommand {
                        room_id: room_id.clone(),
                        command: command.clone(),
                        from_user: from_user.clone(),
                    }
                    .into()]
                });
            }
            _ => return false,
        }
        true
    }

    /// Run `f` on a connected room and emit its events as one batch
    fn with_connected<F>(&self, room_id: &str, f: F)
    where
        F: FnOnce(&mut RoomEntry) -> Vec<EngineEvent>,
    {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(room_id) {
            Some(entry) if entry.state == RoomState::Connected => {
                let events = f(entry);
                self.ctx.events.emit_batch(events);
            }
            _ => {
                // Reconnect snapshots cover anything dropped here
                tracing::debug!(room = %room_id, "Push ignored, room not connected");
            }
        }
    }

    fn spawn_login(self: &Arc<Self>, room_id: &str, generation: u64, wake: Arc<Notify>) -> JoinHandle<()> {
        let this = self.clone();
        let room_id = room_id.to_string();
        self.ctx
            .spawn(async move { this.login_loop(room_id, generation, wake).await })
    }

    async fn login_loop(self: Arc<Self>, room_id: String, generation: u64, wake: Arc<Notify>) {
        let mut backoff = Backoff::new(self.ctx.config.retry.clone());

        loop {
            let request = {
                let rooms = self.rooms.lock();
                match rooms.get(&room_id) {
                    Some(entry) if entry.generation == generation => ControlMessage::Login {
                        room_id: room_id.clone(),
                        user: entry.user.clone(),
                        token: entry.config.token.clone(),
                        max_member_count: entry.config.max_member_count,
                        user_status_notify: entry.config.is_user_status_notify,
                    },
                    _ => return,
                }
            };

            match self.login_once(&room_id, request).await {
                Ok(snapshot) => {
                    self.on_logged_in(&room_id, generation, snapshot);
                    return;
                }
                Err(err) if err.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            room = %room_id,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Login failed, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = wake.notified() => {}
                        }
                    }
                    None => {
                        let mut data = ExtendedData::new();
                        data.insert("attempts".into(), json!(backoff.attempt()));
                        self.fail(&room_id, generation, codes::NETWORK_TIMEOUT, data);
                        return;
                    }
                },
                Err(err) => {
                    let mut data = ExtendedData::new();
                    data.insert("reason".into(), json!(err.message));
                    self.fail(&room_id, generation, err.code(), data);
                    return;
                }
            }
        }
    }

    async fn login_once(&self, room_id: &str, request: ControlMessage) -> std::result::Result<RoomSnapshot, TransportError> {
        self.ctx.transport.connect(room_id).await?;
        match self.ctx.transport.send_control(request).await? {
            ControlReply::LoggedIn(snapshot) => Ok(snapshot),
            other => {
                tracing::debug!(room = %room_id, reply = ?other, "Login acknowledged without snapshot");
                Ok(RoomSnapshot::default())
            }
        }
    }

    fn on_logged_in(&self, room_id: &str, generation: u64, snapshot: RoomSnapshot) {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room_id) else {
            return;
        };
        if entry.generation != generation || entry.state != RoomState::Connecting {
            tracing::debug!(room = %room_id, "Stale login result dropped");
            return;
        }

        entry.state = RoomState::Connected;
        entry.task = None;

        let mut batch = vec![state_event(
            room_id,
            RoomState::Connected,
            codes::SUCCESS,
            ExtendedData::new(),
        )];
        batch.extend(entry.apply_snapshot(room_id, snapshot));

        self.ctx.registry.set_room_state(room_id, RoomState::Connected);
        self.ctx.events.emit_batch(batch);
        let _ = self.signals.send(RoomSignal::Connected(room_id.to_string()));

        tracing::info!(
            room = %room_id,
            users = entry.users.len(),
            streams = entry.streams.len(),
            "Room connected"
        );
    }

    /// Terminal failure: drop the room and report `Disconnected`
    fn fail(&self, room_id: &str, generation: u64, error_code: i32, extended_data: ExtendedData) {
        {
            let mut rooms = self.rooms.lock();
            match rooms.get(room_id) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            // A running login loop notices the missing entry and exits
            rooms.remove(room_id);
            self.ctx.registry.remove_room(room_id);
            self.ctx
                .emit(state_event(room_id, RoomState::Disconnected, error_code, extended_data));
        }

        tracing::warn!(room = %room_id, error_code = error_code, "Room disconnected");
        let _ = self.signals.send(RoomSignal::Closed {
            room_id: room_id.to_string(),
            error_code,
        });

        let transport = self.ctx.transport.clone();
        let room_id = room_id.to_string();
        self.ctx.spawn(async move { transport.disconnect(&room_id).await });
    }
}
