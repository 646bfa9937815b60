//! # Detector configuration

use crate::background::MAX_COMPONENTS;
use crate::error::DetectError;

/// Hyperparameters of the per-pixel Gaussian mixture.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ModelConfig {
    /// Number of frames the adaptive learning rate averages over.
    pub history: usize,
    /// Gaussian components tracked per pixel.
    pub components: usize,
    /// Squared distance (in variances) under which a sample is background.
    pub var_threshold: f32,
    /// Squared distance (in variances) under which a sample updates a component.
    pub var_threshold_gen: f32,
    pub var_init: f32,
    pub var_min: f32,
    pub var_max: f32,
    /// Portion of the weight mass that is considered background.
    pub background_ratio: f32,
    /// Pruning strength for weak components.
    pub complexity_reduction: f32,
    pub detect_shadows: bool,
    /// Darkest brightness ratio still considered a shadow.
    pub shadow_tau: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            history: 500,
            components: 5,
            var_threshold: 16.0,
            var_threshold_gen: 9.0,
            var_init: 15.0,
            var_min: 4.0,
            var_max: 75.0,
            background_ratio: 0.9,
            complexity_reduction: 0.05,
            detect_shadows: true,
            shadow_tau: 0.5,
        }
    }
}

impl ModelConfig {
    pub fn history(self, history: usize) -> Self {
        Self { history, ..self }
    }

    pub fn components(self, components: usize) -> Self {
        Self { components, ..self }
    }

    pub fn var_threshold(self, var_threshold: f32) -> Self {
        Self {
            var_threshold,
            ..self
        }
    }

    pub fn detect_shadows(self, detect_shadows: bool) -> Self {
        Self {
            detect_shadows,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        let positive = |name: &str, v: f32| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(DetectError::Config(format!("{name} must be positive, got {v}")))
            }
        };

        if self.history == 0 {
            return Err(DetectError::Config("history must be at least 1".into()));
        }

        if !(1..=MAX_COMPONENTS).contains(&self.components) {
            return Err(DetectError::Config(format!(
                "component count must be in 1..={MAX_COMPONENTS}, got {}",
                self.components
            )));
        }

        positive("var_threshold", self.var_threshold)?;
        positive("var_threshold_gen", self.var_threshold_gen)?;
        positive("var_init", self.var_init)?;
        positive("var_min", self.var_min)?;
        positive("var_max", self.var_max)?;

        if self.var_min > self.var_max {
            return Err(DetectError::Config(format!(
                "var_min ({}) exceeds var_max ({})",
                self.var_min, self.var_max
            )));
        }

        if !(self.background_ratio > 0.0 && self.background_ratio <= 1.0) {
            return Err(DetectError::Config(format!(
                "background_ratio must be in (0, 1], got {}",
                self.background_ratio
            )));
        }

        if !(self.complexity_reduction >= 0.0 && self.complexity_reduction < 1.0) {
            return Err(DetectError::Config(format!(
                "complexity_reduction must be in [0, 1), got {}",
                self.complexity_reduction
            )));
        }

        if !(self.shadow_tau > 0.0 && self.shadow_tau < 1.0) {
            return Err(DetectError::Config(format!(
                "shadow_tau must be in (0, 1), got {}",
                self.shadow_tau
            )));
        }

        Ok(())
    }
}

/// How repeated timestamps are suppressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DedupPolicy {
    /// Only compare against the immediately preceding event.
    #[default]
    Previous,
    /// Never emit a timestamp twice.
    Unique,
}

/// What to do when a single frame cannot be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FrameErrorPolicy {
    /// Stop processing and report the failure.
    #[default]
    Abort,
    /// Count the frame towards the timeline but leave the model untouched.
    Skip,
}

/// Complete engine configuration.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DetectorConfig {
    /// Foreground pixel count that must be exceeded for a frame to count as motion.
    pub threshold: u64,
    /// Explicit model learning rate in `(0, 1]`. `None` adapts it to the number of frames seen.
    pub learning_rate: Option<f32>,
    pub model: ModelConfig,
    /// Whether shadow pixels add to the activity score.
    pub count_shadows: bool,
    /// Worker threads for segmentation. 0 uses the global pool, 1 runs sequentially.
    pub threads: usize,
    pub description: String,
    /// Framerate to assume when the source reports an invalid one. `None` rejects the stream.
    pub fps_fallback: Option<f64>,
    pub dedup: DedupPolicy,
    pub frame_errors: FrameErrorPolicy,
    /// Consecutive unreadable frames tolerated under `FrameErrorPolicy::Skip`.
    pub max_skipped_frames: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 5000,
            learning_rate: None,
            model: Default::default(),
            count_shadows: true,
            threads: 0,
            description: "motion detected".into(),
            fps_fallback: None,
            dedup: Default::default(),
            frame_errors: Default::default(),
            max_skipped_frames: 16,
        }
    }
}

impl DetectorConfig {
    pub fn threshold(self, threshold: u64) -> Self {
        Self { threshold, ..self }
    }

    pub fn learning_rate(self, learning_rate: Option<f32>) -> Self {
        Self {
            learning_rate,
            ..self
        }
    }

    pub fn model(self, model: ModelConfig) -> Self {
        Self { model, ..self }
    }

    pub fn count_shadows(self, count_shadows: bool) -> Self {
        Self {
            count_shadows,
            ..self
        }
    }

    pub fn threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }

    pub fn description(self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self
        }
    }

    pub fn fps_fallback(self, fps_fallback: Option<f64>) -> Self {
        Self {
            fps_fallback,
            ..self
        }
    }

    pub fn dedup(self, dedup: DedupPolicy) -> Self {
        Self { dedup, ..self }
    }

    pub fn frame_errors(self, frame_errors: FrameErrorPolicy) -> Self {
        Self {
            frame_errors,
            ..self
        }
    }

    pub fn max_skipped_frames(self, max_skipped_frames: usize) -> Self {
        Self {
            max_skipped_frames,
            ..self
        }
    }

    /// Check every option for consistency.
    pub fn validate(&self) -> Result<(), DetectError> {
        if let Some(rate) = self.learning_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(DetectError::Config(format!(
                    "learning_rate must be in (0, 1], got {rate}"
                )));
            }
        }

        if let Some(fps) = self.fps_fallback {
            if !valid_framerate(fps) {
                return Err(DetectError::Config(format!(
                    "fps_fallback must be positive, got {fps}"
                )));
            }
        }

        self.model.validate()
    }
}

fn valid_framerate(fps: f64) -> bool {
    fps.is_finite() && fps > 0.0
}

/// Pick the framerate used for timestamps.
///
/// A finite positive `reported` rate always wins. Otherwise `fallback` is used if configured,
/// and the stream is rejected if not.
pub fn resolve_framerate(reported: Option<f64>, fallback: Option<f64>) -> Result<f64, DetectError> {
    match (reported, fallback) {
        (Some(fps), _) if valid_framerate(fps) => Ok(fps),
        (reported, Some(fallback)) if valid_framerate(fallback) => {
            log::warn!("Invalid frame rate {reported:?}, assuming {fallback} fps");
            Ok(fallback)
        }
        (reported, _) => Err(DetectError::InvalidFrameRate(reported)),
    }
}
