//! # Video frames

use anyhow::{ensure, Result};

/// Largest number of interleaved channels a frame may carry.
pub const MAX_CHANNELS: usize = 4;

/// Dimensions of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct FrameShape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl FrameShape {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Create a single channel shape.
    pub fn gray(width: usize, height: usize) -> Self {
        Self::new(width, height, 1)
    }

    /// Number of pixels in the frame.
    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    /// Number of samples (bytes) in the frame.
    ///
    /// This is the same as `pixels() * channels`
    pub fn len(&self) -> usize {
        self.pixels() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples in a single row.
    pub fn stride(&self) -> usize {
        self.width * self.channels
    }
}

impl std::fmt::Display for FrameShape {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Single immutable video frame.
///
/// Samples are stored interleaved in row-major order:
///
/// `frame[0,0].c0, frame[0,0].c1, ... frame[1,0].c0, ... frame[W,H].cN`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    shape: FrameShape,
    data: Vec<u8>,
}

impl Frame {
    /// Create a new frame from raw interleaved samples.
    ///
    /// # Arguments
    ///
    /// * `shape` - dimensions of the frame.
    /// * `data` - samples, `shape.len()` bytes long.
    pub fn new(shape: FrameShape, data: Vec<u8>) -> Result<Self> {
        ensure!(
            shape.width > 0 && shape.height > 0,
            "frame must not be empty ({shape})"
        );
        ensure!(
            (1..=MAX_CHANNELS).contains(&shape.channels),
            "unsupported channel count {}",
            shape.channels
        );
        ensure!(
            data.len() == shape.len(),
            "frame data is {} bytes, expected {} for {shape}",
            data.len(),
            shape.len()
        );

        Ok(Self { shape, data })
    }

    /// Create a frame where every sample has the same value.
    pub fn filled(shape: FrameShape, value: u8) -> Result<Self> {
        Self::new(shape, vec![value; shape.len()])
    }

    /// Create a frame by evaluating `f(x, y, channel)` for every sample.
    pub fn from_fn(shape: FrameShape, mut f: impl FnMut(usize, usize, usize) -> u8) -> Result<Self> {
        let mut data = Vec::with_capacity(shape.len());

        for y in 0..shape.height {
            for x in 0..shape.width {
                for c in 0..shape.channels {
                    data.push(f(x, y, c));
                }
            }
        }

        Self::new(shape, data)
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn width(&self) -> usize {
        self.shape.width
    }

    pub fn height(&self) -> usize {
        self.shape.height
    }

    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Get the samples of a single row.
    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.shape.stride();
        &self.data[y * stride..(y + 1) * stride]
    }

    /// Get all channels of a single pixel.
    pub fn pixel(&self, x: usize, y: usize) -> &[u8] {
        let c = self.shape.channels;
        let start = (y * self.shape.width + x) * c;
        &self.data[start..start + c]
    }

    /// Iterate the rows of the frame.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.data.chunks_exact(self.shape.stride())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_lengths() {
        let shape = FrameShape::gray(4, 3);
        assert!(Frame::new(shape, vec![0; 11]).is_err());
        assert!(Frame::new(shape, vec![0; 12]).is_ok());
        assert!(Frame::new(FrameShape::new(4, 3, 5), vec![0; 60]).is_err());
        assert!(Frame::new(FrameShape::gray(0, 3), vec![]).is_err());
    }

    #[test]
    fn from_fn_layout() {
        let frame = Frame::from_fn(FrameShape::new(3, 2, 2), |x, y, c| (x + 10 * y + 100 * c) as u8)
            .unwrap();

        assert_eq!(frame.pixel(2, 1), &[12, 112]);
        assert_eq!(frame.row(1), &[10, 110, 11, 111, 12, 112]);
        assert_eq!(frame.rows().count(), 2);
    }
}
