//! Motion gating module

/// Fixed significance threshold on the activity score.
///
/// A frame counts as motion when strictly more than `threshold` pixels changed. The threshold
/// only has to reject sensor noise scattered across the frame, since the background model
/// already normalises every pixel against its own history. It depends on resolution, so it is
/// configuration rather than a constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionGate {
    threshold: u64,
}

impl Default for MotionGate {
    fn default() -> Self {
        Self { threshold: 5000 }
    }
}

impl MotionGate {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn is_motion(&self, score: u64) -> bool {
        score > self.threshold
    }
}
