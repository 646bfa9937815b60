//! # Frame sources

use crate::frame::{Frame, FrameShape};
use anyhow::Result;

/// Ordered, finite supply of video frames.
pub trait FrameSource {
    /// Read the next frame in the stream.
    ///
    /// Frames must be returned in index order. `Ok(None)` is returned once the stream is
    /// exhausted, which is a normal terminal condition. `Err` signals that the current frame
    /// could not be read or decoded; the caller decides whether to skip it or stop.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Get the framerate of the stream.
    ///
    /// This will return `Some(framerate)` if it is known. On raw frame sequences it may
    /// not be known. In such cases, `None` is returned.
    fn get_framerate(&self) -> Option<f64>;

    /// Get the shape of the frames, if known before the first frame is read.
    fn get_shape(&self) -> Option<FrameShape> {
        None
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn get_framerate(&self) -> Option<f64> {
        (**self).get_framerate()
    }

    fn get_shape(&self) -> Option<FrameShape> {
        (**self).get_shape()
    }
}

/// Frame source backed by an iterator.
///
/// Useful for synthetic streams and for embedding the engine behind a custom decoder.
pub struct IterSource<I> {
    frames: I,
    fps: Option<f64>,
}

impl<I: Iterator<Item = Frame>> IterSource<I> {
    /// Create a new iterator source.
    ///
    /// # Arguments
    ///
    /// * `frames` - anything that yields frames in order.
    /// * `fps` - nominal framerate of the stream.
    pub fn new(frames: impl IntoIterator<IntoIter = I>, fps: Option<f64>) -> Self {
        Self {
            frames: frames.into_iter(),
            fps,
        }
    }
}

impl<I: Iterator<Item = Frame>> FrameSource for IterSource<I> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.next())
    }

    fn get_framerate(&self) -> Option<f64> {
        self.fps
    }
}
