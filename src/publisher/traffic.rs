//! Traffic control
//!
//! The governor keeps a ladder of quality steps ordered from the configured
//! targets down to the cheapest setting. Frame rate is lowered first, then
//! resolution, then audio bitrate, each only when its property flag is set.
//!
//! On every uplink sample the governor picks the best step whose bitrate fits
//! the usable budget. It degrades straight to that step but recovers one
//! step per sample, so a steadily improving network yields a non-decreasing
//! quality that never exceeds the targets.
//!
//! Steps whose video bitrate falls below the configured floor are never used.
//! When even the cheapest usable step does not fit, the channel enters floor
//! mode and applies [`MinVideoBitrateMode`]: video is suspended or throttled
//! to 2 fps while audio keeps flowing.

use std::collections::VecDeque;

use crate::media::Size;
use crate::stats::NetworkSample;

use super::config::{
    AudioConfig, MinVideoBitrateMode, TrafficControlPolicy, TrafficControlProperty, VideoConfig,
};

/// Lowest frame rate adaptive fps steps down to
const MIN_ADAPTIVE_FPS: u32 = 5;

/// Frame rate cap in ultra-low-fps floor mode
pub const ULTRA_LOW_FPS: u32 = 2;

/// Resolution scale factors tried by adaptive resolution
const RESOLUTION_SCALES: [f64; 3] = [1.0, 0.75, 0.5];

/// Lowest audio bitrate in kbps
const MIN_AUDIO_BITRATE: u32 = 16;

/// Round-trip time above which the budget is discounted
const RTT_PENALTY_THRESHOLD_MS: u32 = 300;

/// One rung of the quality ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityStep {
    pub fps: u32,
    pub resolution: Size,
    /// kbps
    pub video_bitrate: u32,
    /// kbps
    pub audio_bitrate: u32,
}

impl QualityStep {
    pub fn required_kbps(&self) -> u32 {
        self.video_bitrate.saturating_add(self.audio_bitrate)
    }
}

/// Encoder settings currently in force
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeDecision {
    /// 0 when video is suspended
    pub fps: u32,
    pub resolution: Size,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    /// Budget is below the minimum video bitrate
    pub below_floor: bool,
}

impl EncodeDecision {
    pub fn video_suspended(&self) -> bool {
        self.fps == 0
    }
}

/// Usable send rate in kbps after loss and latency discounts
pub fn budget_kbps(sample: &NetworkSample) -> u32 {
    let loss = sample.packet_loss.clamp(0.0, 1.0);
    let rtt_factor = if sample.rtt_ms <= RTT_PENALTY_THRESHOLD_MS {
        1.0
    } else {
        (RTT_PENALTY_THRESHOLD_MS as f64 / sample.rtt_ms as f64).max(0.5)
    };
    (sample.available_kbps as f64 * (1.0 - loss) * rtt_factor) as u32
}

/// Build the ladder for a configuration, best step first
pub fn build_ladder(
    video: &VideoConfig,
    audio: &AudioConfig,
    property: TrafficControlProperty,
) -> Vec<QualityStep> {
    let target_fps = video.fps.max(1);

    let mut fps_levels = vec![target_fps];
    if property.contains(TrafficControlProperty::ADAPTIVE_FPS) {
        let three_quarters = (target_fps as u64 * 3 / 4) as u32;
        for fps in [three_quarters, target_fps / 2, target_fps / 3, MIN_ADAPTIVE_FPS] {
            let last = fps_levels[fps_levels.len() - 1];
            if fps >= MIN_ADAPTIVE_FPS && fps < last {
                fps_levels.push(fps);
            }
        }
    }

    let scales: &[f64] = if property.contains(TrafficControlProperty::ADAPTIVE_RESOLUTION) {
        &RESOLUTION_SCALES
    } else {
        &RESOLUTION_SCALES[..1]
    };

    let mut audio_levels = vec![audio.bitrate];
    if property.contains(TrafficControlProperty::ADAPTIVE_AUDIO_BITRATE) {
        let mut bitrate = audio.bitrate;
        while bitrate > MIN_AUDIO_BITRATE {
            bitrate = (bitrate / 2).max(MIN_AUDIO_BITRATE);
            audio_levels.push(bitrate);
        }
    }

    let step = |fps: u32, scale: f64, audio_bitrate: u32| {
        let resolution = if scale >= 1.0 {
            video.encode_resolution
        } else {
            video.encode_resolution.scaled(scale)
        };
        let ratio = fps as f64 / target_fps as f64 * scale * scale;
        QualityStep {
            fps,
            resolution,
            video_bitrate: ((video.bitrate as f64 * ratio).round() as u32).max(1),
            audio_bitrate,
        }
    };

    let min_fps = fps_levels[fps_levels.len() - 1];
    let min_scale = scales[scales.len() - 1];

    let mut ladder: Vec<QualityStep> = fps_levels
        .iter()
        .map(|&fps| step(fps, 1.0, audio.bitrate))
        .collect();
    ladder.extend(scales[1..].iter().map(|&scale| step(min_fps, scale, audio.bitrate)));
    ladder.extend(
        audio_levels[1..]
            .iter()
            .map(|&bitrate| step(min_fps, min_scale, bitrate)),
    );
    ladder
}

/// Drops frames so the sent rate stays at or below the allowed fps
///
/// Admission times follow a grid spaced by the frame interval, with a
/// quarter-interval tolerance for capture jitter. Independently of the grid,
/// no 1000 ms window ever holds more than `fps` admitted frames.
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
    next_due_ms: Option<f64>,
    /// Admitted timestamps of the last second
    recent: VecDeque<u64>,
}

impl FrameGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, timestamp_ms: u64, fps: u32) -> bool {
        if fps == 0 {
            return false;
        }

        let interval = 1000.0 / fps as f64;
        let ts = timestamp_ms as f64;
        let due = match self.next_due_ms {
            // Timestamps went backwards, the source restarted
            Some(due) if ts + 2.0 * interval < due => {
                self.recent.clear();
                ts
            }
            Some(due) => due,
            None => ts,
        };

        if ts + interval / 4.0 < due {
            return false;
        }

        while self
            .recent
            .front()
            .is_some_and(|&front| front > timestamp_ms || timestamp_ms - front >= 1000)
        {
            self.recent.pop_front();
        }
        if self.recent.len() >= fps as usize {
            return false;
        }

        let base = if ts - due >= interval { ts } else { due };
        self.next_due_ms = Some(base + interval);
        self.recent.push_back(timestamp_ms);
        true
    }

    pub fn reset(&mut self) {
        self.next_due_ms = None;
        self.recent.clear();
    }
}

/// Adaptive quality governor of one publish channel
#[derive(Debug, Clone)]
pub struct TrafficGovernor {
    video: VideoConfig,
    audio: AudioConfig,
    policy: TrafficControlPolicy,
    ladder: Vec<QualityStep>,
    /// Steps at or above the video bitrate floor; index `usable` is floor mode
    usable: usize,
    current: usize,
    video_bitrate: u32,
    gate: FrameGate,
}

impl TrafficGovernor {
    pub fn new(video: VideoConfig, audio: AudioConfig, policy: TrafficControlPolicy) -> Self {
        let mut governor = Self {
            video,
            audio,
            policy,
            ladder: Vec::new(),
            usable: 1,
            current: 0,
            video_bitrate: video.bitrate,
            gate: FrameGate::new(),
        };
        governor.rebuild();
        governor.reset();
        governor
    }

    pub fn set_video_config(&mut self, video: VideoConfig) {
        self.video = video;
        self.rebuild();
    }

    pub fn set_audio_config(&mut self, audio: AudioConfig) {
        self.audio = audio;
        self.rebuild();
    }

    pub fn set_policy(&mut self, policy: TrafficControlPolicy) {
        self.policy = policy;
        self.rebuild();
    }

    pub fn policy(&self) -> TrafficControlPolicy {
        self.policy
    }

    /// Rebuild the ladder, keeping a degraded channel at no more than its
    /// current cost until the network says otherwise
    fn rebuild(&mut self) {
        let degraded = if self.ladder.is_empty() || self.current == 0 || !self.policy.enabled {
            None
        } else if self.in_floor_mode() {
            Some(None)
        } else {
            Some(Some(self.step().required_kbps()))
        };

        let property = if self.policy.enabled {
            self.policy.property
        } else {
            TrafficControlProperty::BASIC
        };
        self.ladder = build_ladder(&self.video, &self.audio, property);
        let floor = self.policy.min_video_bitrate;
        self.usable = self
            .ladder
            .iter()
            .rposition(|s| s.video_bitrate >= floor)
            .map_or(1, |i| i + 1);

        self.current = match degraded {
            None => 0,
            Some(cost) => cost
                .and_then(|cost| {
                    self.ladder[..self.usable]
                        .iter()
                        .position(|s| s.required_kbps() <= cost)
                })
                .unwrap_or(self.cheapest()),
        };
        self.video_bitrate = if self.in_floor_mode() {
            floor
        } else {
            self.step().video_bitrate
        };
    }

    /// Where the governor goes when no usable step fits the budget
    fn cheapest(&self) -> usize {
        if self.policy.min_video_bitrate > 0 {
            self.usable
        } else {
            self.usable - 1
        }
    }

    /// Back to the configured targets
    pub fn reset(&mut self) {
        self.current = 0;
        self.video_bitrate = self.ladder[0].video_bitrate;
        self.gate.reset();
    }

    /// Feed an uplink sample. Returns true if the encode decision changed.
    pub fn update(&mut self, sample: &NetworkSample) -> bool {
        if !self.policy.enabled {
            return false;
        }

        let before = self.decision();
        let budget = budget_kbps(sample);
        let floor = self.policy.min_video_bitrate;

        let target = match self.ladder[..self.usable]
            .iter()
            .position(|s| s.required_kbps() <= budget)
        {
            Some(index) => index,
            None => self.cheapest(),
        };

        if target > self.current {
            self.current = target;
        } else if target < self.current {
            self.current -= 1;
        }

        let step = self.step();
        self.video_bitrate = if self.in_floor_mode() {
            floor
        } else {
            step.video_bitrate
                .min(budget.saturating_sub(step.audio_bitrate).max(floor))
                .max(1)
        };

        let after = self.decision();
        if before != after {
            tracing::debug!(
                budget_kbps = budget,
                fps = after.fps,
                width = after.resolution.width,
                height = after.resolution.height,
                video_kbps = after.video_bitrate,
                audio_kbps = after.audio_bitrate,
                below_floor = after.below_floor,
                "Traffic control adjusted"
            );
        }
        before != after
    }

    fn in_floor_mode(&self) -> bool {
        self.current >= self.usable
    }

    fn step(&self) -> &QualityStep {
        &self.ladder[self.current.min(self.usable - 1)]
    }

    /// Ladder position, 0 = configured targets
    pub fn level(&self) -> usize {
        self.current
    }

    pub fn decision(&self) -> EncodeDecision {
        let step = self.step();
        let below_floor = self.in_floor_mode();
        let fps = if below_floor {
            match self.policy.min_video_bitrate_mode {
                MinVideoBitrateMode::NoVideo => 0,
                MinVideoBitrateMode::UltraLowFps => ULTRA_LOW_FPS.min(step.fps),
            }
        } else {
            step.fps
        };

        EncodeDecision {
            fps,
            resolution: step.resolution,
            video_bitrate: self.video_bitrate,
            audio_bitrate: step.audio_bitrate,
            below_floor,
        }
    }

    /// Whether a captured frame with this timestamp should be encoded
    pub fn admit_video(&mut self, timestamp_ms: u64) -> bool {
        let fps = self.decision().fps;
        self.gate.admit(timestamp_ms, fps)
    }
}
