//! # Foreground masks and activity scoring

use std::io::Write;

/// Mask value of an unchanged pixel.
pub const MASK_BACKGROUND: u8 = 0;
/// Mask value of a pixel that only darkened relative to the background.
pub const MASK_SHADOW: u8 = 127;
/// Mask value of a changed pixel.
pub const MASK_FOREGROUND: u8 = 255;

/// Per-pixel classification of a single frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForegroundMask {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl ForegroundMask {
    /// Create a new, all background mask.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![MASK_BACKGROUND; width * height],
        }
    }

    /// Get width and height of the mask.
    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Resize the mask, clearing it if the dimensions change.
    pub fn reset(&mut self, width: usize, height: usize) {
        if (width, height) != self.dim() {
            *self = Self::new(width, height);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Get the mask value at given coordinates.
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Count pixels that have the given mask value.
    pub fn count(&self, value: u8) -> u64 {
        self.data.iter().filter(|&&v| v == value).count() as u64
    }

    /// Write the mask as a binary greyscale PGM image.
    pub fn write_pgm(&self, mut out: impl Write) -> std::io::Result<()> {
        write!(out, "P5\n{} {}\n255\n", self.width, self.height)?;
        out.write_all(&self.data)
    }
}

/// Reduces a mask to the number of changed pixels.
#[derive(Clone, Copy, Debug)]
pub struct ActivityScorer {
    count_shadows: bool,
}

impl Default for ActivityScorer {
    fn default() -> Self {
        Self {
            count_shadows: true,
        }
    }
}

impl ActivityScorer {
    pub fn new(count_shadows: bool) -> Self {
        Self { count_shadows }
    }

    /// Count foreground pixels in the mask.
    ///
    /// Shadow pixels are included when the scorer counts shadows, which makes the score equal
    /// to the number of non-zero mask entries.
    pub fn score(&self, mask: &ForegroundMask) -> u64 {
        let counted = |&v: &u8| match v {
            MASK_BACKGROUND => false,
            MASK_SHADOW => self.count_shadows,
            _ => true,
        };

        mask.as_slice().iter().filter(|&v| counted(v)).count() as u64
    }
}
