//! Mixer task validation
//!
//! Everything here runs synchronously at the call boundary, before any
//! request reaches the server.

use std::collections::HashSet;

use crate::engine::IdLimits;
use crate::error::{Error, Result};

use super::task::{MixerInputContentType, MixerTask};

/// Check a task before it is started or applied as an update
pub fn validate_task(task: &MixerTask, limits: &IdLimits) -> Result<()> {
    limits.check_mixer_task_id(task.task_id())?;

    if task.inputs.is_empty() {
        return Err(Error::MixerEmptyList("input"));
    }
    if task.outputs.is_empty() {
        return Err(Error::MixerEmptyList("output"));
    }

    let video = &task.video_config;
    if video.fps == 0 || video.bitrate == 0 || video.resolution.is_empty() {
        return Err(Error::InvalidParameter(format!("mixer video config {:?}", video)));
    }
    if task.audio_config.bitrate == 0 {
        return Err(Error::InvalidParameter("mixer audio bitrate is 0".into()));
    }

    let mut seen = HashSet::new();
    for input in &task.inputs {
        limits.check_stream_id(&input.stream_id)?;
        if !seen.insert(input.stream_id.as_str()) {
            return Err(Error::MixerDuplicateInput(input.stream_id.clone()));
        }
        // Audio-only inputs have no place on the canvas
        if input.content_type == MixerInputContentType::Video
            && !input.layout.fits_within(video.resolution)
        {
            return Err(Error::MixerLayoutOutOfBounds(input.stream_id.clone()));
        }
    }

    let mut targets = HashSet::new();
    for output in &task.outputs {
        if output.target.is_empty() || !targets.insert(output.target.as_str()) {
            return Err(Error::InvalidParameter(format!("mixer output {:?}", output.target)));
        }
    }

    if let Some(watermark) = &task.watermark {
        if !watermark.layout.fits_within(video.resolution) {
            return Err(Error::WatermarkOutOfBounds);
        }
    }

    if task.sound_level {
        let mut slots = HashSet::new();
        for id in task.inputs.iter().filter_map(|i| i.sound_level_id) {
            if !slots.insert(id) {
                return Err(Error::MixerDuplicateSoundLevelId(id));
            }
        }
    }

    Ok(())
}

/// Reject updates touching the encode settings of a started task
pub fn check_frozen(running: &MixerTask, update: &MixerTask) -> Result<()> {
    let (old, new) = (&running.video_config, &update.video_config);
    if old.bitrate != new.bitrate {
        return Err(Error::MixerImmutableConfig("video bitrate"));
    }
    if old.fps != new.fps {
        return Err(Error::MixerImmutableConfig("video fps"));
    }
    if old.resolution != new.resolution {
        return Err(Error::MixerImmutableConfig("video resolution"));
    }
    if running.audio_config != update.audio_config {
        return Err(Error::MixerImmutableConfig("audio config"));
    }
    Ok(())
}
