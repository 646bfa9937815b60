//! # Motion detection engine
//!
//! The engine owns one instance of every pipeline stage and walks the stream frame by frame:
//! segment, score, gate, coalesce. One engine is constructed per video and discarded afterwards.

use crate::config::{resolve_framerate, DetectorConfig, FrameErrorPolicy};
use crate::error::DetectError;
use crate::events::{EventCoalescer, MotionEvent};
use crate::frame::Frame;
use crate::gate::MotionGate;
use crate::mask::{ActivityScorer, ForegroundMask};
use crate::segment::ForegroundSegmenter;
use crate::source::FrameSource;
use log::*;
use std::time::{Duration, Instant};

/// Counters accumulated while processing a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Frames that went through the model.
    pub frames: u64,
    /// Frames whose activity score passed the gate.
    pub motion_frames: u64,
    /// Frames that could not be read and were skipped.
    pub skipped_frames: u64,
    /// Pixel states that were reinitialised after turning non-finite.
    pub reset_pixels: u64,
    /// Total time spent in segmentation.
    pub segment_time: Duration,
}

/// Frame-by-frame motion detector.
pub struct MotionEngine {
    config: DetectorConfig,
    segmenter: ForegroundSegmenter,
    scorer: ActivityScorer,
    gate: MotionGate,
    coalescer: EventCoalescer,
    frame_index: u64,
    last_score: Option<u64>,
    stats: EngineStats,
}

impl MotionEngine {
    /// Create a new engine.
    ///
    /// The configuration and framerate are validated up front, so a stream that cannot be
    /// timestamped is rejected before any frame is read.
    ///
    /// # Arguments
    ///
    /// * `config` - detector configuration.
    /// * `fps` - framerate reported by the source.
    pub fn new(config: DetectorConfig, fps: Option<f64>) -> Result<Self, DetectError> {
        config.validate()?;

        let fps = resolve_framerate(fps, config.fps_fallback)?;

        Ok(Self {
            segmenter: ForegroundSegmenter::new(
                config.model,
                config.learning_rate,
                config.threads,
            )?,
            scorer: ActivityScorer::new(config.count_shadows),
            gate: MotionGate::new(config.threshold),
            coalescer: EventCoalescer::new(fps, config.description.clone(), config.dedup)?,
            frame_index: 0,
            last_score: None,
            stats: Default::default(),
            config,
        })
    }

    /// Create a new engine using the framerate of the given source.
    pub fn for_source(
        config: DetectorConfig,
        source: &(impl FrameSource + ?Sized),
    ) -> Result<Self, DetectError> {
        Self::new(config, source.get_framerate())
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Framerate used for timestamps.
    pub fn fps(&self) -> f64 {
        self.coalescer.fps()
    }

    /// Index the next frame will be assigned.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Activity score of the last processed frame.
    pub fn last_score(&self) -> Option<u64> {
        self.last_score
    }

    /// Foreground mask of the last processed frame.
    pub fn mask(&self) -> &ForegroundMask {
        self.segmenter.mask()
    }

    pub fn segmenter(&self) -> &ForegroundSegmenter {
        &self.segmenter
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Events emitted so far. Valid even if processing stops early.
    pub fn events(&self) -> &[MotionEvent] {
        self.coalescer.events()
    }

    /// Process the next frame of the stream.
    ///
    /// Returns the event emitted by this frame, if any.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Option<&MotionEvent>, DetectError> {
        let index = self.frame_index;

        let start = Instant::now();
        let (mask, seg_stats) = self.segmenter.segment(frame, index)?;
        let score = self.scorer.score(mask);
        self.stats.segment_time += start.elapsed();

        if seg_stats.reset_pixels > 0 {
            warn!(
                "Frame {index}: reset {} pixels with non-finite model state",
                seg_stats.reset_pixels
            );
        }

        let is_motion = self.gate.is_motion(score);

        self.frame_index += 1;
        self.last_score = Some(score);
        self.stats.frames += 1;
        self.stats.reset_pixels += seg_stats.reset_pixels;
        self.stats.motion_frames += is_motion as u64;

        let event = self.coalescer.observe(index, is_motion);

        if let Some(event) = event {
            debug!(
                "Motion at {}s (frame {index}, score {score})",
                event.timestamp
            );
        }

        Ok(event)
    }

    /// Account for a frame that could not be read.
    ///
    /// The frame still occupies its slot on the timeline, but the model is left untouched.
    pub fn skip_frame(&mut self) {
        self.frame_index += 1;
        self.stats.skipped_frames += 1;
    }

    /// Walk the source until it is exhausted or `max_frames` frames were consumed.
    ///
    /// Read failures are handled according to the configured `FrameErrorPolicy`.
    pub fn run(
        &mut self,
        source: &mut (impl FrameSource + ?Sized),
        max_frames: Option<u64>,
    ) -> Result<(), DetectError> {
        self.run_with(source, max_frames, |_| {})
    }

    /// Same as [`run`](Self::run), but calls `on_frame` after every processed frame.
    pub fn run_with(
        &mut self,
        source: &mut (impl FrameSource + ?Sized),
        max_frames: Option<u64>,
        mut on_frame: impl FnMut(&Self),
    ) -> Result<(), DetectError> {
        let mut consecutive_errors = 0;

        while max_frames.map(|m| self.frame_index < m).unwrap_or(true) {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    self.process_frame(&frame)?;
                    on_frame(self);
                }
                Ok(None) => break,
                Err(e) => match self.config.frame_errors {
                    FrameErrorPolicy::Abort => {
                        return Err(DetectError::Source {
                            index: self.frame_index,
                            source: e.into(),
                        })
                    }
                    FrameErrorPolicy::Skip => {
                        consecutive_errors += 1;

                        if consecutive_errors > self.config.max_skipped_frames {
                            return Err(DetectError::TooManySkipped {
                                index: self.frame_index,
                                count: consecutive_errors,
                            });
                        }

                        warn!("Skipping unreadable frame {}: {e}", self.frame_index);
                        self.skip_frame();
                    }
                },
            }
        }

        Ok(())
    }

    /// Finish processing and return the event list.
    pub fn finish(self) -> Vec<MotionEvent> {
        info!(
            "Processed {} frames ({} with motion, {} skipped), {} events",
            self.stats.frames,
            self.stats.motion_frames,
            self.stats.skipped_frames,
            self.coalescer.events().len()
        );

        self.coalescer.into_events()
    }
}

/// Detect motion in the whole source.
///
/// Returns an empty list if the stream contains no motion, and an error if it could not be
/// analysed.
pub fn detect_motion(
    source: &mut (impl FrameSource + ?Sized),
    config: DetectorConfig,
) -> Result<Vec<MotionEvent>, DetectError> {
    let mut engine = MotionEngine::for_source(config, &*source)?;
    engine.run(source, None)?;
    Ok(engine.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupPolicy, ModelConfig};
    use crate::frame::FrameShape;
    use crate::source::IterSource;
    use anyhow::anyhow;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const W: usize = 160;
    const H: usize = 120;

    fn shape() -> FrameShape {
        FrameShape::gray(W, H)
    }

    fn scene() -> Frame {
        Frame::from_fn(shape(), |x, y, _| (40 + (x + y) % 30) as u8).unwrap()
    }

    /// Scene with the first `count` pixels (row-major) brightened.
    fn with_changed_pixels(count: usize) -> Frame {
        let base = scene();
        let data = base
            .as_slice()
            .iter()
            .enumerate()
            .map(|(i, &v)| if i < count { 230 } else { v })
            .collect();
        Frame::new(shape(), data).unwrap()
    }

    /// Scene with a bright square at given position.
    fn with_block(bx: usize, by: usize, size: usize) -> Frame {
        let base = scene();
        Frame::from_fn(shape(), |x, y, _| {
            if (bx..bx + size).contains(&x) && (by..by + size).contains(&y) {
                240
            } else {
                base.pixel(x, y)[0]
            }
        })
        .unwrap()
    }

    fn run(frames: Vec<Frame>, fps: Option<f64>, config: DetectorConfig) -> Result<Vec<u64>, DetectError> {
        let mut source = IterSource::new(frames, fps);
        detect_motion(&mut source, config).map(|e| e.into_iter().map(|e| e.timestamp).collect())
    }

    #[test]
    fn quiet_stream() {
        let frames = vec![scene(); 40];
        let events = run(frames, Some(10.0), DetectorConfig::default().threshold(10)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn sensor_noise_is_not_motion() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = scene();

        let frames = (0..60)
            .map(|_| {
                Frame::from_fn(shape(), |x, y, _| {
                    (base.pixel(x, y)[0] as i32 + rng.gen_range(-2..=2)) as u8
                })
                .unwrap()
            })
            .collect();

        let config = DetectorConfig::default().threshold(W as u64 * H as u64 / 100);
        assert!(run(frames, Some(10.0), config).unwrap().is_empty());
    }

    #[test]
    fn single_spike() {
        let mut frames = vec![scene(); 5];
        frames.push(with_block(20, 20, 80));
        frames.extend(vec![scene(); 10]);

        let events = run(frames, Some(2.0), DetectorConfig::default()).unwrap();
        assert_eq!(events, [2]);
    }

    #[test]
    fn threshold_boundary() {
        let threshold = 1000;
        let config = DetectorConfig::default().threshold(threshold);

        let mut engine = MotionEngine::new(config.clone(), Some(1.0)).unwrap();
        for _ in 0..5 {
            engine.process_frame(&scene()).unwrap();
        }
        assert!(engine
            .process_frame(&with_changed_pixels(threshold as usize))
            .unwrap()
            .is_none());
        assert_eq!(engine.last_score(), Some(threshold));
        assert!(engine.events().is_empty());

        let mut engine = MotionEngine::new(config, Some(1.0)).unwrap();
        for _ in 0..5 {
            engine.process_frame(&scene()).unwrap();
        }
        let event = engine
            .process_frame(&with_changed_pixels(threshold as usize + 1))
            .unwrap()
            .cloned();
        assert_eq!(engine.last_score(), Some(threshold + 1));
        assert_eq!(event.map(|e| e.timestamp), Some(5));
    }

    #[test]
    fn sustained_motion_spans_two_seconds() {
        // Frame 0 is learnt as background, frames 1..=9 each show the block in a new spot.
        let mut frames = vec![scene()];
        frames.extend((0..9).map(|i| with_block(i * 16, 40, 16)));

        let config = DetectorConfig::default().threshold(200);
        let events = run(frames, Some(5.0), config).unwrap();
        assert_eq!(events, [0, 1]);
    }

    #[test]
    fn deterministic() {
        let mut frames = vec![scene(); 3];
        for i in 0..30 {
            frames.push(with_block((i * 7) % 140, (i * 3) % 100, 20));
            if i % 4 == 0 {
                frames.push(scene());
            }
        }

        let config = DetectorConfig::default().threshold(100);
        let a = run(frames.clone(), Some(3.0), config.clone()).unwrap();
        let b = run(frames, Some(3.0), config.threads(2)).unwrap();

        assert!(!a.is_empty());
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rejects_missing_framerate() {
        for fps in [Some(0.0), Some(-5.0), Some(f64::NAN), None] {
            assert!(matches!(
                run(vec![scene(); 3], fps, Default::default()),
                Err(DetectError::InvalidFrameRate(_))
            ));
        }
    }

    #[test]
    fn framerate_fallback() {
        let mut frames = vec![scene(); 40];
        frames.push(with_block(0, 0, 100));

        let config = DetectorConfig::default().fps_fallback(Some(30.0));
        assert_eq!(run(frames, Some(0.0), config).unwrap(), [1]);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = DetectorConfig::default().learning_rate(Some(0.0));
        assert!(matches!(
            MotionEngine::new(config, Some(25.0)),
            Err(DetectError::Config(_))
        ));
    }

    #[test]
    fn dimension_change_is_fatal() {
        let frames = vec![
            scene(),
            scene(),
            Frame::filled(FrameShape::gray(W / 2, H), 0).unwrap(),
        ];

        match run(frames, Some(25.0), Default::default()) {
            Err(e @ DetectError::DimensionMismatch { index: 2, .. }) => assert!(e.is_config()),
            r => panic!("unexpected result {r:?}"),
        }
    }

    struct FlakySource {
        frames: Vec<anyhow::Result<Frame>>,
    }

    impl FrameSource for FlakySource {
        fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
            if self.frames.is_empty() {
                Ok(None)
            } else {
                self.frames.remove(0).map(Some)
            }
        }

        fn get_framerate(&self) -> Option<f64> {
            Some(1.0)
        }
    }

    fn flaky(bad: &[usize], motion_at: usize) -> FlakySource {
        FlakySource {
            frames: (0..8)
                .map(|i| {
                    if bad.contains(&i) {
                        Err(anyhow!("corrupt frame"))
                    } else if i == motion_at {
                        Ok(with_block(10, 10, 90))
                    } else {
                        Ok(scene())
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn abort_on_unreadable_frame() {
        let mut source = flaky(&[3], 6);

        match detect_motion(&mut source, Default::default()) {
            Err(DetectError::Source { index: 3, .. }) => {}
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn skip_unreadable_frame() {
        let config = DetectorConfig::default().frame_errors(FrameErrorPolicy::Skip);

        let mut source = flaky(&[3], 6);
        let mut engine = MotionEngine::for_source(config.clone(), &source).unwrap();
        engine.run(&mut source, None).unwrap();

        // The skipped frame keeps its slot, so the motion stays at second 6.
        assert_eq!(engine.stats().skipped_frames, 1);
        assert_eq!(engine.stats().frames, 7);
        assert_eq!(
            engine.finish().iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            [6]
        );

        let mut source = flaky(&[2, 3, 4], 6);
        match detect_motion(&mut source, config.max_skipped_frames(2)) {
            Err(DetectError::TooManySkipped { index: 4, count: 3 }) => {}
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn stop_early_keeps_partial_events() {
        let mut frames = vec![scene(); 4];
        frames.push(with_block(0, 0, 100));
        frames.extend(vec![scene(); 4]);
        frames.push(with_block(50, 10, 100));

        let mut source = IterSource::new(frames, Some(1.0));
        let mut engine = MotionEngine::for_source(Default::default(), &source).unwrap();
        let mut seen = vec![];
        engine
            .run_with(&mut source, Some(6), |e| seen.push(e.last_score()))
            .unwrap();

        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(Option::is_some));
        assert_eq!(engine.frame_index(), 6);
        assert_eq!(engine.finish().len(), 1);
    }

    #[test]
    fn unique_dedup_policy() {
        let config = DetectorConfig::default().dedup(DedupPolicy::Unique);
        let mut engine = MotionEngine::new(config, Some(1.0)).unwrap();

        engine.process_frame(&scene()).unwrap();
        assert!(engine.process_frame(&with_block(0, 0, 100)).unwrap().is_some());
        assert_eq!(engine.events().len(), 1);
        assert_eq!(engine.config().dedup, DedupPolicy::Unique);
    }

    #[test]
    fn explicit_learning_rate_absorbs_parked_object() {
        // A fast model learns a parked object as background within a few frames.
        let config = DetectorConfig::default()
            .threshold(1000)
            .learning_rate(Some(0.3))
            .model(ModelConfig::default().history(10));
        let mut engine = MotionEngine::new(config, Some(1.0)).unwrap();

        for _ in 0..5 {
            engine.process_frame(&scene()).unwrap();
        }

        let parked = with_block(30, 30, 60);
        let scores = (0..10)
            .map(|_| {
                engine.process_frame(&parked).unwrap();
                engine.last_score().unwrap()
            })
            .collect::<Vec<_>>();

        assert!(scores[0] > 1000);
        assert_eq!(*scores.last().unwrap(), 0);
        assert_eq!(engine.events().len(), 1);
    }
}
