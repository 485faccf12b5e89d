//! Stream statistics
//!
//! Frame/byte meters and the quality snapshots delivered while a stream is
//! publishing or playing.

pub mod metrics;

pub use metrics::{
    DownlinkSample, NetworkSample, PlayStreamQuality, PublishCounters, PublishStreamQuality,
    RateMeter, StreamQualityLevel,
};
