//! Mixer task orchestrator
//!
//! Each started task gets a worker that owns its server requests. Start,
//! updates and stop are queued to that worker and run one at a time in call
//! order, so an update is only committed once the server acknowledged it and
//! no two compositions are ever in flight for the same task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::completion::{Completer, Completion};
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::event::MixerEvent;
use crate::relay::{is_relay_target, CdnConfig, RelayCdnInfo, RelayCdnState, RelayTable, RelayUpdateReason};
use crate::transport::{ControlMessage, ServerPush};

use super::task::MixerTask;
use super::validate::{check_frozen, validate_task};

enum MixerCommand {
    Update {
        task: MixerTask,
        done: Completer<()>,
    },
    Stop {
        done: Completer<()>,
    },
}

struct TaskEntry {
    /// Configuration the server last acknowledged, or the one being started
    committed: MixerTask,
    running: bool,
    generation: u64,
    relays: RelayTable,
    commands: mpsc::UnboundedSender<MixerCommand>,
}

impl TaskEntry {
    fn relay_event(&self, extra: Vec<RelayCdnInfo>) -> Option<MixerEvent> {
        let mut infos = self.relays.infos();
        infos.extend(extra);
        if infos.is_empty() {
            return None;
        }
        Some(MixerEvent::RelayCdnStateUpdate {
            task_id: self.committed.task_id().to_string(),
            infos,
        })
    }

    /// Start relaying to the URL outputs of `outputs` not yet relayed
    fn add_relays(&mut self, task: &MixerTask) -> bool {
        let mut changed = false;
        for output in task.outputs.iter().filter(|o| is_relay_target(&o.target)) {
            self.relays.begin_add(CdnConfig::new(output.target.clone()));
            changed |= self
                .relays
                .transition(&output.target, RelayCdnState::Relaying, RelayUpdateReason::None);
        }
        changed
    }
}

/// Owns every mixer task
pub struct MixerOrchestrator {
    ctx: Arc<EngineContext>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    next_generation: AtomicU64,
}

impl MixerOrchestrator {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tasks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Validate and start a task. Resolves once the server accepted it.
    pub fn start_mixer_task(self: &Arc<Self>, task: MixerTask) -> Result<Completion<()>> {
        validate_task(&task, &self.ctx.config.limits)?;

        let mut tasks = self.tasks.lock();
        let task_id = task.task_id().to_string();
        if tasks.contains_key(&task_id) {
            return Err(Error::MixerTaskExists(task_id));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        tasks.insert(
            task_id.clone(),
            TaskEntry {
                committed: task.clone(),
                running: false,
                generation,
                relays: RelayTable::new(),
                commands: tx,
            },
        );
        drop(tasks);

        tracing::info!(
            task = %task_id,
            inputs = task.inputs.len(),
            outputs = task.outputs.len(),
            "Mixer task starting"
        );

        let (completer, completion) = Completion::channel();
        let this = self.clone();
        self.ctx
            .spawn(async move { this.run_worker(task, generation, completer, rx).await });
        Ok(completion)
    }

    /// Replace the inputs, outputs, watermark or background of a task
    ///
    /// Encode settings are frozen once a task is started. The update takes
    /// effect when the server acknowledges it.
    pub fn update_mixer_task(&self, task: MixerTask) -> Result<Completion<()>> {
        validate_task(&task, &self.ctx.config.limits)?;

        let tasks = self.tasks.lock();
        let entry = tasks
            .get(task.task_id())
            .ok_or_else(|| Error::MixerTaskNotFound(task.task_id().to_string()))?;
        check_frozen(&entry.committed, &task)?;

        let (done, completion) = Completion::channel();
        if let Err(mpsc::error::SendError(command)) = entry.commands.send(MixerCommand::Update { task, done }) {
            if let MixerCommand::Update { done, .. } = command {
                done.complete(Err(Error::Cancelled));
            }
        }
        Ok(completion)
    }

    /// Stop a task and tear down its relays
    pub fn stop_mixer_task(&self, task_id: &str) -> Result<Completion<()>> {
        let entry = self
            .tasks
            .lock()
            .remove(task_id)
            .ok_or_else(|| Error::MixerTaskNotFound(task_id.to_string()))?;

        tracing::info!(task = %task_id, "Mixer task stopping");

        let mut relays = entry.relays;
        let infos = relays.teardown();
        if !infos.is_empty() {
            self.ctx.emit(MixerEvent::RelayCdnStateUpdate {
                task_id: task_id.to_string(),
                infos,
            });
        }

        let (done, completion) = Completion::channel();
        if let Err(mpsc::error::SendError(MixerCommand::Stop { done })) =
            entry.commands.send(MixerCommand::Stop { done })
        {
            // Worker already gone, nothing left on the server
            done.complete(Ok(()));
        }
        Ok(completion)
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        for task_id in ids {
            if let Err(e) = self.stop_mixer_task(&task_id) {
                tracing::debug!(task = %task_id, error = %e, "Mixer stop skipped");
            }
        }
    }

    /// Configuration the server last acknowledged
    pub fn task(&self, task_id: &str) -> Option<MixerTask> {
        self.tasks.lock().get(task_id).map(|e| e.committed.clone())
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tasks.lock().get(task_id).map_or(false, |e| e.running)
    }

    /// Handle a mixer-scoped server push. Returns false if the push is not
    /// about mixing.
    pub(crate) fn handle_push(&self, push: &ServerPush) -> bool {
        match push {
            ServerPush::MixerRelayStateChanged {
                task_id,
                url,
                state,
                reason,
            } => {
                let mut tasks = self.tasks.lock();
                if let Some(entry) = tasks.get_mut(task_id) {
                    if entry.relays.transition(url, *state, *reason) {
                        tracing::info!(task = %task_id, url = %url, state = ?state, reason = ?reason, "Mixer relay state changed");
                        if let Some(event) = entry.relay_event(Vec::new()) {
                            self.ctx.emit(event);
                        }
                    }
                }
            }
            ServerPush::MixerSoundLevels { task_id, levels } => {
                let tasks = self.tasks.lock();
                let Some(entry) = tasks.get(task_id).filter(|e| e.running && e.committed.sound_level) else {
                    return true;
                };

                let slots: HashMap<u32, f32> = levels
                    .iter()
                    .filter_map(|(stream_id, level)| {
                        entry
                            .committed
                            .inputs
                            .iter()
                            .find(|i| &i.stream_id == stream_id)
                            .and_then(|i| i.sound_level_id)
                            .map(|slot| (slot, *level))
                    })
                    .collect();
                self.ctx.emit(MixerEvent::SoundLevelUpdate {
                    task_id: task_id.clone(),
                    levels: slots,
                });
            }
            _ => return false,
        }
        true
    }

    fn is_current(&self, task_id: &str, generation: u64) -> bool {
        self.tasks
            .lock()
            .get(task_id)
            .map_or(false, |e| e.generation == generation)
    }

    async fn run_worker(
        self: Arc<Self>,
        task: MixerTask,
        generation: u64,
        start_done: Completer<()>,
        mut commands: mpsc::UnboundedReceiver<MixerCommand>,
    ) {
        let task_id = task.task_id().to_string();
        let result = self
            .ctx
            .transport
            .send_control(ControlMessage::StartMixer(task.clone()))
            .await;
        let started = result.is_ok();

        match result {
            Ok(_) => {
                if self.on_started(&task_id, generation, &task) {
                    start_done.complete(Ok(()));
                } else {
                    // Stopped while starting; the queued stop cleans up
                    start_done.complete(Err(Error::Cancelled));
                }
            }
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "Mixer task failed to start");
                let mut tasks = self.tasks.lock();
                if tasks.get(&task_id).map(|e| e.generation) == Some(generation) {
                    tasks.remove(&task_id);
                }
                drop(tasks);
                start_done.complete(Err(e.into()));
            }
        }

        while let Some(command) = commands.recv().await {
            match command {
                MixerCommand::Update { task, done } => {
                    if !started || !self.is_current(&task_id, generation) {
                        done.complete(Err(Error::Cancelled));
                        continue;
                    }
                    let result = self
                        .ctx
                        .transport
                        .send_control(ControlMessage::UpdateMixer(task.clone()))
                        .await;
                    match result {
                        Ok(_) => {
                            self.commit_update(&task_id, generation, task);
                            done.complete(Ok(()));
                        }
                        Err(e) => {
                            tracing::warn!(task = %task_id, error = %e, "Mixer update rejected");
                            done.complete(Err(e.into()));
                        }
                    }
                }
                MixerCommand::Stop { done } => {
                    let result = if started {
                        self.ctx
                            .transport
                            .send_control(ControlMessage::StopMixer {
                                task_id: task_id.clone(),
                            })
                            .await
                            .map(|_| ())
                            .map_err(Error::from)
                    } else {
                        Ok(())
                    };
                    done.complete(result);
                    return;
                }
            }
        }
    }

    fn on_started(&self, task_id: &str, generation: u64, task: &MixerTask) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get_mut(task_id).filter(|e| e.generation == generation) else {
            return false;
        };

        entry.running = true;
        tracing::info!(task = %task_id, "Mixer task running");
        if entry.add_relays(task) {
            if let Some(event) = entry.relay_event(Vec::new()) {
                self.ctx.emit(event);
            }
        }
        true
    }

    fn commit_update(&self, task_id: &str, generation: u64, task: MixerTask) {
        let mut tasks = self.tasks.lock();
        let Some(entry) = tasks.get_mut(task_id).filter(|e| e.generation == generation) else {
            return;
        };

        let removed: Vec<RelayCdnInfo> = entry
            .committed
            .outputs
            .iter()
            .filter(|old| !task.outputs.iter().any(|o| o.target == old.target))
            .filter_map(|old| entry.relays.remove(&old.target))
            .collect();
        let added = entry.add_relays(&task);

        tracing::debug!(task = %task_id, inputs = task.inputs.len(), "Mixer update committed");
        entry.committed = task;

        if added || !removed.is_empty() {
            if let Some(event) = entry.relay_event(removed) {
                self.ctx.emit(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::event::{EngineEvent, EventCategory};
    use crate::media::{Rect, Size};
    use crate::mixer::{MixerInput, MixerInputContentType, MixerOutput, MixerVideoConfig};
    use crate::test_helpers::{drain, expect_silence, next_event, settle, MockTransport};
    use crate::transport::TransportErrorKind;

    fn setup() -> (Arc<MockTransport>, Arc<MixerOrchestrator>, UnboundedReceiver<EngineEvent>) {
        let transport = MockTransport::new();
        let ctx = EngineContext::for_test(transport.clone(), EngineConfig::default());
        let (_, events) = ctx.events.subscribe_category(EventCategory::Mixer);
        (transport, MixerOrchestrator::new(ctx), events)
    }

    fn task(outputs: &[&str]) -> MixerTask {
        let mut task = MixerTask::new("mix-1");
        task.set_video_config(MixerVideoConfig::new(Size::new(640, 360), 15, 800))
            .set_input_list(vec![
                MixerInput::new("a", MixerInputContentType::Video, Rect::new(0, 0, 320, 360))
                    .with_sound_level_id(1),
                MixerInput::new("b", MixerInputContentType::Video, Rect::new(320, 0, 320, 360))
                    .with_sound_level_id(2),
            ])
            .set_output_list(outputs.iter().map(|o| MixerOutput::new(*o)).collect());
        task
    }

    fn relay_states(event: EngineEvent) -> Vec<(String, RelayCdnState)> {
        match event {
            EngineEvent::Mixer(MixerEvent::RelayCdnStateUpdate { infos, .. }) => {
                infos.into_iter().map(|i| (i.url, i.state)).collect()
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_relays_url_outputs() {
        let (transport, mixer, mut events) = setup();
        mixer
            .start_mixer_task(task(&["rtmp://cdn/mix", "mixed-stream"]))
            .unwrap()
            .await
            .unwrap();

        assert!(mixer.is_running("mix-1"));
        assert_eq!(transport.count("start_mixer"), 1);
        assert_eq!(
            relay_states(next_event(&mut events).await),
            vec![("rtmp://cdn/mix".to_string(), RelayCdnState::Relaying)]
        );
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_and_duplicate() {
        let (transport, mixer, _events) = setup();
        let mut bad = task(&["out"]);
        bad.inputs[1].stream_id = "a".into();
        assert!(matches!(
            mixer.start_mixer_task(bad),
            Err(Error::MixerDuplicateInput(_))
        ));
        assert_eq!(transport.count("start_mixer"), 0);

        let _started = mixer.start_mixer_task(task(&["out"])).unwrap();
        assert!(matches!(
            mixer.start_mixer_task(task(&["out"])),
            Err(Error::MixerTaskExists(_))
        ));
    }

    #[tokio::test]
    async fn test_encode_settings_frozen_after_start() {
        let (transport, mixer, _events) = setup();
        mixer.start_mixer_task(task(&["out"])).unwrap().await.unwrap();

        let mut update = task(&["out"]);
        update.video_config.bitrate = 1500;
        assert!(matches!(
            mixer.update_mixer_task(update),
            Err(Error::MixerImmutableConfig("video bitrate"))
        ));

        let mut update = task(&["out"]);
        update.inputs.truncate(1);
        update.set_background_image_url("https://bg");
        mixer.update_mixer_task(update).unwrap().await.unwrap();

        let committed = mixer.task("mix-1").unwrap();
        assert_eq!(committed.inputs.len(), 1);
        assert_eq!(committed.background_image_url.as_deref(), Some("https://bg"));
        assert_eq!(transport.count("update_mixer"), 1);

        assert!(matches!(
            mixer.update_mixer_task(MixerTask::new("other")),
            Err(Error::MixerEmptyList(_))
        ));
    }

    #[tokio::test]
    async fn test_updates_are_serialized_and_committed_on_ack() {
        let (transport, mixer, _events) = setup();
        mixer.start_mixer_task(task(&["out"])).unwrap().await.unwrap();
        transport.hold("update_mixer");

        let mut first = task(&["out"]);
        first.inputs.truncate(1);
        let mut second = task(&["out"]);
        second.set_background_image_url("https://bg");

        let first_done = mixer.update_mixer_task(first).unwrap();
        let second_done = mixer.update_mixer_task(second).unwrap();
        settle().await;

        // Only one update in flight, nothing committed yet
        assert_eq!(transport.count("update_mixer"), 1);
        assert_eq!(mixer.task("mix-1").unwrap().inputs.len(), 2);

        transport.release("update_mixer");
        first_done.await.unwrap();
        assert_eq!(mixer.task("mix-1").unwrap().inputs.len(), 1);

        transport.release("update_mixer");
        second_done.await.unwrap();
        let committed = mixer.task("mix-1").unwrap();
        assert_eq!(committed.inputs.len(), 2);
        assert_eq!(committed.background_image_url.as_deref(), Some("https://bg"));
        assert_eq!(transport.count("update_mixer"), 2);
    }

    #[tokio::test]
    async fn test_update_swaps_relays() {
        let (_transport, mixer, mut events) = setup();
        mixer
            .start_mixer_task(task(&["rtmp://a"]))
            .unwrap()
            .await
            .unwrap();
        drain(&mut events);

        mixer
            .update_mixer_task(task(&["rtmp://b"]))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(
            relay_states(next_event(&mut events).await),
            vec![
                ("rtmp://b".to_string(), RelayCdnState::Relaying),
                ("rtmp://a".to_string(), RelayCdnState::NoRelay)
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_tears_down_relays() {
        let (transport, mixer, mut events) = setup();
        mixer
            .start_mixer_task(task(&["rtmp://cdn/mix"]))
            .unwrap()
            .await
            .unwrap();
        next_event(&mut events).await;

        mixer.stop_mixer_task("mix-1").unwrap().await.unwrap();
        assert_eq!(
            relay_states(next_event(&mut events).await),
            vec![("rtmp://cdn/mix".to_string(), RelayCdnState::NoRelay)]
        );
        assert_eq!(transport.count("stop_mixer"), 1);
        assert!(!mixer.is_running("mix-1"));

        assert!(matches!(
            mixer.stop_mixer_task("mix-1"),
            Err(Error::MixerTaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_while_starting() {
        let (transport, mixer, mut events) = setup();
        transport.hold("start_mixer");

        let started = mixer.start_mixer_task(task(&["rtmp://cdn/mix"])).unwrap();
        settle().await;
        let stopped = mixer.stop_mixer_task("mix-1").unwrap();

        transport.release("start_mixer");
        assert!(matches!(started.await, Err(Error::Cancelled)));
        stopped.await.unwrap();

        // The late start ack is answered with exactly one stop
        assert_eq!(transport.count("stop_mixer"), 1);
        expect_silence(&mut events, Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_start_failure_frees_task_id() {
        let (transport, mixer, _events) = setup();
        transport.fail_next("start_mixer", 1, TransportErrorKind::Rejected(42));

        let result = mixer.start_mixer_task(task(&["out"])).unwrap().await;
        assert_eq!(result.unwrap_err().code(), 42);
        assert!(mixer.task("mix-1").is_none());

        mixer.start_mixer_task(task(&["out"])).unwrap().await.unwrap();
        assert!(mixer.is_running("mix-1"));
    }

    #[tokio::test]
    async fn test_sound_levels_keyed_by_slot() {
        let (_transport, mixer, mut events) = setup();
        let mut t = task(&["out"]);
        t.enable_sound_level(true);
        mixer.start_mixer_task(t).unwrap().await.unwrap();

        mixer.handle_push(&ServerPush::MixerSoundLevels {
            task_id: "mix-1".into(),
            levels: vec![("a".into(), 0.5), ("b".into(), 0.25), ("ghost".into(), 1.0)],
        });

        match next_event(&mut events).await {
            EngineEvent::Mixer(MixerEvent::SoundLevelUpdate { task_id, levels }) => {
                assert_eq!(task_id, "mix-1");
                assert_eq!(levels, HashMap::from([(1, 0.5), (2, 0.25)]));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_push_updates_state() {
        let (_transport, mixer, mut events) = setup();
        mixer
            .start_mixer_task(task(&["rtmp://cdn/mix"]))
            .unwrap()
            .await
            .unwrap();
        next_event(&mut events).await;

        mixer.handle_push(&ServerPush::MixerRelayStateChanged {
            task_id: "mix-1".into(),
            url: "rtmp://cdn/mix".into(),
            state: RelayCdnState::NoRelay,
            reason: RelayUpdateReason::CdnServerDisconnected,
        });
        assert_eq!(
            relay_states(next_event(&mut events).await),
            vec![("rtmp://cdn/mix".to_string(), RelayCdnState::NoRelay)]
        );
    }
}
