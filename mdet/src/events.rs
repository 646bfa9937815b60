//! # Motion events

use crate::config::DedupPolicy;
use crate::error::DetectError;
use std::collections::BTreeSet;

/// Single motion event.
///
/// Field names are part of the output format consumed by storage and review tools.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct MotionEvent {
    /// Whole seconds since the start of the stream, rounded down.
    pub timestamp: u64,
    pub description: String,
}

/// Convert a frame index to whole seconds since stream start.
pub fn timestamp_for(frame_index: u64, fps: f64) -> u64 {
    (frame_index as f64 / fps).floor() as u64
}

/// Collapses per-frame motion decisions into a sparse event list.
pub struct EventCoalescer {
    fps: f64,
    description: String,
    dedup: DedupPolicy,
    last: Option<u64>,
    seen: BTreeSet<u64>,
    events: Vec<MotionEvent>,
}

impl EventCoalescer {
    /// Create a new coalescer.
    ///
    /// # Arguments
    ///
    /// * `fps` - framerate of the stream, must be finite and positive.
    /// * `description` - text attached to every event.
    /// * `dedup` - which repeated timestamps are suppressed.
    pub fn new(
        fps: f64,
        description: impl Into<String>,
        dedup: DedupPolicy,
    ) -> Result<Self, DetectError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(DetectError::InvalidFrameRate(Some(fps)));
        }

        Ok(Self {
            fps,
            description: description.into(),
            dedup,
            last: None,
            seen: BTreeSet::new(),
            events: vec![],
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Timestamp of the most recently emitted event.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.last
    }

    /// Process the motion decision of a single frame.
    ///
    /// Returns the newly emitted event, if the frame produced one.
    pub fn observe(&mut self, frame_index: u64, is_motion: bool) -> Option<&MotionEvent> {
        if !is_motion {
            return None;
        }

        self.observe_timestamp(timestamp_for(frame_index, self.fps))
    }

    /// Record motion at an already computed timestamp.
    pub fn observe_timestamp(&mut self, timestamp: u64) -> Option<&MotionEvent> {
        if self.last == Some(timestamp) {
            return None;
        }

        if self.dedup == DedupPolicy::Unique && !self.seen.insert(timestamp) {
            return None;
        }

        self.last = Some(timestamp);
        self.events.push(MotionEvent {
            timestamp,
            description: self.description.clone(),
        });

        self.events.last()
    }

    /// Events emitted so far.
    pub fn events(&self) -> &[MotionEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<MotionEvent> {
        self.events
    }
}
