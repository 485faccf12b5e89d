//! Shared test helpers

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::event::EngineEvent;

pub use crate::transport::mock::{MockTransport, RecordingRenderer};

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Next event, failing the test if none arrives within a minute of runtime time
pub async fn next_event(rx: &mut UnboundedReceiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Assert that nothing is emitted for `window`
pub async fn expect_silence(rx: &mut UnboundedReceiver<EngineEvent>, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Drain whatever is already queued
pub fn drain(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
