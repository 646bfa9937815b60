//! # Foreground segmentation

use crate::background::{BackgroundModel, SegmentStats};
use crate::config::ModelConfig;
use crate::error::DetectError;
use crate::frame::{Frame, FrameShape};
use crate::mask::ForegroundMask;

/// Where per-row work is executed.
enum Workers {
    Sequential,
    Global,
    Pool(rayon::ThreadPool),
}

/// Compares frames against the background model.
///
/// The segmenter is the sole owner of the model. It is created from the first frame's shape and
/// every later frame has to match it. All rows of a frame are joined before `segment` returns, so
/// frames are always applied to the model strictly in order.
pub struct ForegroundSegmenter {
    config: ModelConfig,
    learning_rate: Option<f32>,
    model: Option<BackgroundModel>,
    mask: ForegroundMask,
    workers: Workers,
}

impl ForegroundSegmenter {
    /// Create a new segmenter.
    ///
    /// # Arguments
    ///
    /// * `config` - background model hyperparameters.
    /// * `learning_rate` - explicit learning rate, `None` for adaptive.
    /// * `threads` - 0 for the global rayon pool, 1 for sequential, otherwise a dedicated pool.
    pub fn new(
        config: ModelConfig,
        learning_rate: Option<f32>,
        threads: usize,
    ) -> Result<Self, DetectError> {
        let workers = match threads {
            0 => Workers::Global,
            1 => Workers::Sequential,
            n => Workers::Pool(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("mdet-segment-{i}"))
                    .build()?,
            ),
        };

        Ok(Self {
            config,
            learning_rate,
            model: None,
            mask: ForegroundMask::default(),
            workers,
        })
    }

    /// Shape the model was initialised with, if any frame has been seen.
    pub fn shape(&self) -> Option<FrameShape> {
        self.model.as_ref().map(BackgroundModel::shape)
    }

    pub fn model(&self) -> Option<&BackgroundModel> {
        self.model.as_ref()
    }

    /// Mask of the most recently segmented frame.
    pub fn mask(&self) -> &ForegroundMask {
        &self.mask
    }

    /// Segment the frame and update the model.
    ///
    /// # Arguments
    ///
    /// * `frame` - next frame of the stream.
    /// * `index` - index of the frame in the stream, for error reporting.
    pub fn segment(
        &mut self,
        frame: &Frame,
        index: u64,
    ) -> Result<(&ForegroundMask, SegmentStats), DetectError> {
        let config = self.config;
        let model = self
            .model
            .get_or_insert_with(|| BackgroundModel::new(frame.shape(), config));

        if model.shape() != frame.shape() {
            return Err(DetectError::DimensionMismatch {
                index,
                expected: model.shape(),
                found: frame.shape(),
            });
        }

        let rate = self.learning_rate;
        let mask = &mut self.mask;

        let stats = match &self.workers {
            Workers::Sequential => model.observe_and_segment(frame, rate, mask, false),
            Workers::Global => model.observe_and_segment(frame, rate, mask, true),
            Workers::Pool(pool) => {
                pool.install(|| model.observe_and_segment(frame, rate, mask, true))
            }
        }?;

        Ok((&self.mask, stats))
    }
}
