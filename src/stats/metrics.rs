//! Statistics and quality metrics for publish and play streams

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Five-level quality score derived from network metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StreamQualityLevel {
    Excellent,
    Good,
    Medium,
    Bad,
    Die,
}

impl StreamQualityLevel {
    /// Score a stream from round-trip time and packet loss (0.0 ~ 1.0)
    pub fn from_network(rtt_ms: u32, packet_loss: f64) -> Self {
        if rtt_ms <= 100 && packet_loss <= 0.01 {
            StreamQualityLevel::Excellent
        } else if rtt_ms <= 200 && packet_loss <= 0.05 {
            StreamQualityLevel::Good
        } else if rtt_ms <= 400 && packet_loss <= 0.10 {
            StreamQualityLevel::Medium
        } else if rtt_ms <= 800 && packet_loss <= 0.30 {
            StreamQualityLevel::Bad
        } else {
            StreamQualityLevel::Die
        }
    }
}

/// Uplink condition measured by the transport for a publish channel
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkSample {
    pub rtt_ms: u32,
    /// 0.0 ~ 1.0
    pub packet_loss: f64,
    /// Achievable send rate in kbps
    pub available_kbps: u32,
}

impl NetworkSample {
    pub fn new(rtt_ms: u32, packet_loss: f64, available_kbps: u32) -> Self {
        Self {
            rtt_ms,
            packet_loss,
            available_kbps,
        }
    }
}

/// Downlink metrics measured by the media engine for a play stream
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DownlinkSample {
    pub video_recv_fps: f64,
    pub video_decode_fps: f64,
    pub video_render_fps: f64,
    pub video_kbps: f64,
    pub audio_recv_fps: f64,
    pub audio_decode_fps: f64,
    pub audio_render_fps: f64,
    pub audio_kbps: f64,
    pub rtt_ms: u32,
    pub packet_loss: f64,
    /// Delay after the data is received locally
    pub delay_ms: u32,
    pub is_hardware_decode: bool,
}

/// Published stream quality snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PublishStreamQuality {
    pub video_capture_fps: f64,
    pub video_encode_fps: f64,
    pub video_send_fps: f64,
    pub video_kbps: f64,
    pub audio_capture_fps: f64,
    pub audio_send_fps: f64,
    pub audio_kbps: f64,
    pub rtt_ms: u32,
    pub packet_loss: f64,
    pub level: StreamQualityLevel,
    pub is_hardware_encode: bool,
}

/// Played stream quality snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayStreamQuality {
    pub video_recv_fps: f64,
    pub video_decode_fps: f64,
    pub video_render_fps: f64,
    pub video_kbps: f64,
    pub audio_recv_fps: f64,
    pub audio_decode_fps: f64,
    pub audio_render_fps: f64,
    pub audio_kbps: f64,
    pub rtt_ms: u32,
    pub packet_loss: f64,
    pub level: StreamQualityLevel,
    /// End-to-end delay in milliseconds
    pub delay_ms: u32,
    pub is_hardware_decode: bool,
}

impl PlayStreamQuality {
    pub fn from_sample(sample: &DownlinkSample) -> Self {
        // The level accounts for local buffering on top of the network path.
        let effective_rtt = sample.rtt_ms.saturating_add(sample.delay_ms / 2);
        Self {
            video_recv_fps: sample.video_recv_fps,
            video_decode_fps: sample.video_decode_fps,
            video_render_fps: sample.video_render_fps,
            video_kbps: sample.video_kbps,
            audio_recv_fps: sample.audio_recv_fps,
            audio_decode_fps: sample.audio_decode_fps,
            audio_render_fps: sample.audio_render_fps,
            audio_kbps: sample.audio_kbps,
            rtt_ms: sample.rtt_ms,
            packet_loss: sample.packet_loss,
            level: StreamQualityLevel::from_network(effective_rtt, sample.packet_loss),
            delay_ms: sample.delay_ms,
            is_hardware_decode: sample.is_hardware_decode,
        }
    }
}

/// Frame and byte counter drained once per report window
#[derive(Debug, Clone, Default)]
pub struct RateMeter {
    frames: u64,
    bytes: u64,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bytes: usize) {
        self.frames += 1;
        self.bytes += bytes as u64;
    }

    /// Frames per second and kbps over `window`, then reset
    pub fn drain(&mut self, window: Duration) -> (f64, f64) {
        let secs = window.as_secs_f64();
        let rates = if secs > 0.0 {
            (
                self.frames as f64 / secs,
                (self.bytes * 8) as f64 / 1000.0 / secs,
            )
        } else {
            (0.0, 0.0)
        };
        self.frames = 0;
        self.bytes = 0;
        rates
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Counters kept per publish channel between quality reports
#[derive(Debug, Clone, Default)]
pub struct PublishCounters {
    pub video_captured: RateMeter,
    pub video_encoded: RateMeter,
    pub video_sent: RateMeter,
    pub audio_captured: RateMeter,
    pub audio_sent: RateMeter,
}

impl PublishCounters {
    /// Build a snapshot from the counters and the latest uplink sample
    pub fn snapshot(
        &mut self,
        window: Duration,
        network: &NetworkSample,
        is_hardware_encode: bool,
    ) -> PublishStreamQuality {
        let (video_capture_fps, _) = self.video_captured.drain(window);
        let (video_encode_fps, _) = self.video_encoded.drain(window);
        let (video_send_fps, video_kbps) = self.video_sent.drain(window);
        let (audio_capture_fps, _) = self.audio_captured.drain(window);
        let (audio_send_fps, audio_kbps) = self.audio_sent.drain(window);

        PublishStreamQuality {
            video_capture_fps,
            video_encode_fps,
            video_send_fps,
            video_kbps,
            audio_capture_fps,
            audio_send_fps,
            audio_kbps,
            rtt_ms: network.rtt_ms,
            packet_loss: network.packet_loss,
            level: StreamQualityLevel::from_network(network.rtt_ms, network.packet_loss),
            is_hardware_encode,
        }
    }
}
