//! # Adaptive background model
//!
//! Every pixel is described by a small mixture of Gaussians, kept sorted by weight. Components
//! holding most of the weight mass describe the background, the rest are recent or rare
//! appearances that may or may not become background over time. The model is updated online with
//! an exponential forgetting factor, so gradual illumination drift and periodic clutter are
//! absorbed while new objects stand out.

use crate::config::ModelConfig;
use crate::error::DetectError;
use crate::frame::{Frame, FrameShape};
use crate::mask::{ForegroundMask, MASK_BACKGROUND, MASK_FOREGROUND, MASK_SHADOW};
use anyhow::Result;
use nalgebra as na;
use rayon::prelude::*;

/// Largest number of Gaussian components tracked per pixel.
pub const MAX_COMPONENTS: usize = 8;

/// Pixel sample, unused channels are left at zero.
type Sample = na::Vector4<f32>;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Gaussian {
    weight: f32,
    variance: f32,
    mean: Sample,
}

impl Gaussian {
    fn seeded(mean: Sample, variance: f32, weight: f32) -> Self {
        Self {
            weight,
            variance,
            mean,
        }
    }

    fn is_finite(&self) -> bool {
        self.weight.is_finite() && self.variance.is_finite() && self.mean.iter().all(|v| v.is_finite())
    }
}

/// Outcome of a single model update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Pixels whose state turned non-finite and was reinitialised.
    pub reset_pixels: u64,
}

/// Per-pixel Gaussian mixture background model.
///
/// State is a flat array with `components` slots per pixel, plus the number of slots in use for
/// each pixel.
pub struct BackgroundModel {
    config: ModelConfig,
    shape: FrameShape,
    gmm: Vec<Gaussian>,
    used: Vec<u8>,
    frames: u64,
}

impl BackgroundModel {
    /// Create a new model without any observations.
    ///
    /// # Arguments
    ///
    /// * `shape` - shape of every frame that will be observed.
    /// * `config` - mixture hyperparameters.
    pub fn new(shape: FrameShape, config: ModelConfig) -> Self {
        let components = config.components.clamp(1, MAX_COMPONENTS);
        let config = ModelConfig {
            components,
            ..config
        };

        Self {
            config,
            shape,
            gmm: vec![Gaussian::default(); shape.pixels() * components],
            used: vec![0; shape.pixels()],
            frames: 0,
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of frames the model has observed.
    pub fn frames_observed(&self) -> u64 {
        self.frames
    }

    /// Number of live components at given pixel.
    pub fn components_at(&self, x: usize, y: usize) -> usize {
        self.used[y * self.shape.width + x] as usize
    }

    /// Learning rate that applies to the next observed frame.
    ///
    /// Without an explicit rate, the model averages over all frames seen so far, up to `history`
    /// frames.
    pub fn learning_rate(&self, explicit: Option<f32>) -> f32 {
        explicit.unwrap_or_else(|| {
            let n = (self.frames + 1).saturating_mul(2);
            1.0 / std::cmp::min(n, self.config.history as u64) as f32
        })
    }

    /// Classify every pixel of the frame and adapt the model to it.
    ///
    /// This is not idempotent. Frames must be supplied in stream order.
    ///
    /// # Arguments
    ///
    /// * `frame` - next frame of the stream.
    /// * `learning_rate` - explicit rate, or `None` for the adaptive one.
    /// * `mask` - output mask, resized if needed.
    /// * `parallel` - split rows across the current rayon pool.
    pub fn observe_and_segment(
        &mut self,
        frame: &Frame,
        learning_rate: Option<f32>,
        mask: &mut ForegroundMask,
        parallel: bool,
    ) -> Result<SegmentStats, DetectError> {
        if frame.shape() != self.shape {
            return Err(DetectError::DimensionMismatch {
                index: self.frames,
                expected: self.shape,
                found: frame.shape(),
            });
        }

        let params = PixelParams::new(&self.config, self.learning_rate(learning_rate));
        self.frames += 1;

        let FrameShape {
            width,
            height,
            channels,
        } = self.shape;
        let stride = self.shape.stride();
        let slots = width * self.config.components;

        mask.reset(width, height);

        let reset_pixels: u64 = if parallel {
            frame
                .as_slice()
                .par_chunks_exact(stride)
                .zip(self.gmm.par_chunks_exact_mut(slots))
                .zip(self.used.par_chunks_exact_mut(width))
                .zip(mask.as_mut_slice().par_chunks_exact_mut(width))
                .map(|(((samples, gmm), used), out)| {
                    params.update_row(channels, samples, gmm, used, out)
                })
                .sum()
        } else {
            frame
                .as_slice()
                .chunks_exact(stride)
                .zip(self.gmm.chunks_exact_mut(slots))
                .zip(self.used.chunks_exact_mut(width))
                .zip(mask.as_mut_slice().chunks_exact_mut(width))
                .map(|(((samples, gmm), used), out)| {
                    params.update_row(channels, samples, gmm, used, out)
                })
                .sum()
        };

        Ok(SegmentStats { reset_pixels })
    }

    /// Render the current background estimate.
    ///
    /// Each pixel is the weighted mean of the components that make up the background portion of
    /// its mixture. Pixels without observations are black.
    pub fn background_image(&self) -> Result<Frame> {
        let k = self.config.components;
        let channels = self.shape.channels;
        let mut data = Vec::with_capacity(self.shape.len());

        for (modes, &used) in self.gmm.chunks_exact(k).zip(&self.used) {
            let mut total = 0.0f32;
            let mut acc = Sample::zeros();

            for g in &modes[..used as usize] {
                acc += g.mean * g.weight;
                total += g.weight;
                if total > self.config.background_ratio {
                    break;
                }
            }

            let mean = if total > 0.0 { acc / total } else { acc };

            data.extend(
                mean.iter()
                    .take(channels)
                    .map(|v| v.round().clamp(0.0, 255.0) as u8),
            );
        }

        Frame::new(self.shape, data)
    }
}

/// Per-frame constants of the pixel update.
#[derive(Clone, Copy, Debug)]
struct PixelParams {
    alpha: f32,
    alpha1: f32,
    prune: f32,
    var_threshold: f32,
    var_threshold_gen: f32,
    var_init: f32,
    var_min: f32,
    var_max: f32,
    background_ratio: f32,
    detect_shadows: bool,
    shadow_tau: f32,
}

impl PixelParams {
    fn new(config: &ModelConfig, alpha: f32) -> Self {
        Self {
            alpha,
            alpha1: 1.0 - alpha,
            prune: -alpha * config.complexity_reduction,
            var_threshold: config.var_threshold,
            var_threshold_gen: config.var_threshold_gen,
            var_init: config.var_init,
            var_min: config.var_min,
            var_max: config.var_max,
            background_ratio: config.background_ratio,
            detect_shadows: config.detect_shadows,
            shadow_tau: config.shadow_tau,
        }
    }

    /// Update a single row of pixels. Returns the number of pixels that had to be reset.
    fn update_row(
        &self,
        channels: usize,
        samples: &[u8],
        gmm: &mut [Gaussian],
        used: &mut [u8],
        out: &mut [u8],
    ) -> u64 {
        let k = gmm.len() / used.len();

        samples
            .chunks_exact(channels)
            .zip(gmm.chunks_exact_mut(k))
            .zip(used.iter_mut())
            .zip(out.iter_mut())
            .map(|(((px, modes), used), out)| {
                let mut sample = Sample::zeros();
                sample
                    .iter_mut()
                    .zip(px)
                    .for_each(|(s, &v)| *s = v as f32);

                let (value, reset) = self.update_pixel(sample, modes, used);
                *out = value;
                reset as u64
            })
            .sum()
    }

    /// Classify a sample and fold it into the pixel's mixture.
    ///
    /// Returns the mask value and whether the pixel state had to be reset.
    fn update_pixel(&self, x: Sample, modes: &mut [Gaussian], used: &mut u8) -> (u8, bool) {
        let n = *used as usize;

        // Nothing is known about the pixel yet, so it is background by definition.
        if n == 0 {
            modes[0] = Gaussian::seeded(x, self.var_init, 1.0);
            *used = 1;
            return (MASK_BACKGROUND, false);
        }

        let mut background = false;
        let mut fits = false;
        let mut total = 0.0f32;

        for m in 0..n {
            let mut weight = self.alpha1 * modes[m].weight + self.prune;
            let mut slot = m;

            if !fits {
                let g = &mut modes[m];
                let diff = x - g.mean;
                let dist2 = diff.norm_squared();

                if total < self.background_ratio && dist2 < self.var_threshold * g.variance {
                    background = true;
                }

                if dist2 < self.var_threshold_gen * g.variance {
                    fits = true;
                    weight += self.alpha;

                    let k = (self.alpha / weight).min(1.0);
                    g.mean += diff * k;
                    g.variance =
                        (g.variance + k * (dist2 - g.variance)).clamp(self.var_min, self.var_max);

                    // Keep components sorted by weight.
                    while slot > 0 && weight >= modes[slot - 1].weight {
                        modes.swap(slot, slot - 1);
                        slot -= 1;
                    }
                }
            }

            if weight < -self.prune {
                weight = 0.0;
            }

            modes[slot].weight = weight;
            total += weight;
        }

        if modes[..n].iter().any(|g| !g.is_finite()) || !total.is_finite() {
            modes[0] = Gaussian::seeded(x, self.var_init, 1.0);
            *used = 1;
            return (MASK_BACKGROUND, true);
        }

        // Pruned components are always at the tail.
        let mut alive = modes[..n].iter().take_while(|g| g.weight > 0.0).count();

        if total > 0.0 {
            let inv = 1.0 / total;
            modes[..alive].iter_mut().for_each(|g| g.weight *= inv);
        }

        let mut inserted = None;

        if !fits {
            let mut slot = if alive == modes.len() {
                alive - 1
            } else {
                alive += 1;
                alive - 1
            };

            if alive == 1 {
                modes[slot] = Gaussian::seeded(x, self.var_init, 1.0);
            } else {
                modes[..slot]
                    .iter_mut()
                    .for_each(|g| g.weight *= self.alpha1);
                modes[slot] = Gaussian::seeded(x, self.var_init, self.alpha);

                while slot > 0 && self.alpha >= modes[slot - 1].weight {
                    modes.swap(slot, slot - 1);
                    slot -= 1;
                }

                alive = modes[..alive].iter().take_while(|g| g.weight > 0.0).count();

                // Replacing the weakest component drops its weight from the mixture.
                let total: f32 = modes[..alive].iter().map(|g| g.weight).sum();
                let inv = 1.0 / total;
                modes[..alive].iter_mut().for_each(|g| g.weight *= inv);
            }

            inserted = Some(slot);
        }

        *used = alive as u8;

        let value = if background {
            MASK_BACKGROUND
        } else if self.detect_shadows && self.is_shadow(x, &modes[..alive], inserted) {
            MASK_SHADOW
        } else {
            MASK_FOREGROUND
        };

        (value, false)
    }

    /// Check whether the sample is a darker version of a background component.
    ///
    /// The component created from this very sample, if any, is not considered.
    fn is_shadow(&self, x: Sample, modes: &[Gaussian], inserted: Option<usize>) -> bool {
        let mut total = 0.0;

        for (i, g) in modes.iter().enumerate() {
            if Some(i) == inserted {
                continue;
            }

            let num = g.mean.dot(&x);
            let den = g.mean.norm_squared();

            if den == 0.0 {
                return false;
            }

            if num <= den && num >= self.shadow_tau * den {
                let a = num / den;
                let dist2a = (g.mean * a - x).norm_squared();

                if dist2a < self.var_threshold * g.variance * a * a {
                    return true;
                }
            }

            total += g.weight;
            if total > self.background_ratio {
                return false;
            }
        }

        false
    }
}
