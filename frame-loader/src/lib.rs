//! Common `FrameSource` instance loader.

use anyhow::{anyhow, Result};
use log::*;
use mdet::prelude::v1::{Frame, FrameShape, FrameSource};
use std::io::{BufReader, Read};
use std::net::{TcpListener, TcpStream};
use std::path::Path;

pub mod pgm;
pub mod y4m;

pub use pgm::PgmSequence;
pub use y4m::Y4mSource;

/// Largest frame, in bytes, a source will allocate for.
pub const MAX_FRAME_BYTES: usize = 1 << 28;

/// Options applied when opening a source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceOptions {
    /// Produce 3 channel Y/Cb/Cr frames instead of luma only, where the input has chroma.
    pub color: bool,
    /// Framerate to report instead of whatever the input declares.
    pub fps: Option<f64>,
}

/// Create a frame source depending on the input.
///
/// If the input is a directory, it will be interpreted as a sequence of `.pgm` frames.
///
/// Otherwise the input is read as a YUV4MPEG2 stream, where `-` stands for standard input and
/// `tcp://` will be interpreted as a TCP network stream rather than a regular file.
pub fn create_source(input: &str, options: &SourceOptions) -> Result<Box<dyn FrameSource + Send>> {
    let source: Box<dyn FrameSource + Send> = if Path::new(input).is_dir() {
        Box::new(PgmSequence::open(input)?)
    } else {
        let reader = BufReader::new(open_file(input)?);
        Box::new(Y4mSource::new(reader, options.color)?)
    };

    info!(
        "Opened {input}: {} at {:?} fps",
        source
            .get_shape()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown shape".into()),
        source.get_framerate()
    );

    Ok(match options.fps {
        Some(fps) => Box::new(WithFramerate { source, fps }),
        None => source,
    })
}

/// Open a file or an input stream.
pub fn open_file(input: &str) -> Result<Box<dyn Read + Send>> {
    if input == "-" {
        Ok(Box::new(std::io::stdin()))
    } else if let Some(input) = input.strip_prefix("tcp://") {
        let (addr, port) = input
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid format"))?;
        let port: u16 = str::parse(port)?;

        let stream = if addr == "@" {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            info!("Waiting for a stream on port {port}");
            let (sock, addr) = listener.accept()?;
            info!("Accept {addr}");
            sock
        } else {
            info!("Connecting to {input}");
            TcpStream::connect(input)?
        };

        Ok(Box::new(stream))
    } else {
        std::fs::File::open(input)
            .map(|i| Box::new(i) as _)
            .map_err(|e| anyhow!("Could not open {input}: {e}"))
    }
}

/// Source wrapper that overrides the reported framerate.
pub struct WithFramerate<S> {
    source: S,
    fps: f64,
}

impl<S> WithFramerate<S> {
    pub fn new(source: S, fps: f64) -> Self {
        Self { source, fps }
    }
}

impl<S: FrameSource> FrameSource for WithFramerate<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.source.next_frame()
    }

    fn get_framerate(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn get_shape(&self) -> Option<FrameShape> {
        self.source.get_shape()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdet::prelude::v1::IterSource;

    #[test]
    fn framerate_override() {
        let frame = Frame::filled(FrameShape::gray(2, 2), 9).unwrap();
        let mut source = WithFramerate::new(IterSource::new(vec![frame.clone()], None), 12.5);

        assert_eq!(source.get_framerate(), Some(12.5));
        assert_eq!(source.next_frame().unwrap(), Some(frame));
        assert_eq!(source.next_frame().unwrap(), None);
    }

    #[test]
    fn missing_file() {
        assert!(create_source("/nonexistent/video.y4m", &Default::default()).is_err());
        assert!(open_file("tcp://localhost").is_err());
    }
}
