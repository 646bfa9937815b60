//! # Motion Detection Engine
//!
//! This library turns a stream of video frames into a compact list of timestamps at which
//! significant scene motion occurred. Each frame is segmented against an adaptive per-pixel
//! background model, the foreground is counted, gated by a fixed threshold and finally coalesced
//! into at most one event per second of video.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use mdet::prelude::v1::*;
//! ```
//!
//! Frames are supplied through the [`FrameSource`](source::FrameSource) trait, and the whole
//! pipeline is driven by [`MotionEngine`](engine::MotionEngine).

pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod gate;
pub mod mask;
pub mod segment;
pub mod source;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            background::BackgroundModel,
            config::{DedupPolicy, DetectorConfig, FrameErrorPolicy, ModelConfig},
            engine::{detect_motion, EngineStats, MotionEngine},
            error::DetectError,
            events::{EventCoalescer, MotionEvent},
            frame::{Frame, FrameShape},
            gate::MotionGate,
            mask::{ActivityScorer, ForegroundMask},
            segment::ForegroundSegmenter,
            source::{FrameSource, IterSource},
        };
        pub use anyhow::{anyhow, Error, Result};
    }
}
