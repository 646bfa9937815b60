//! YUV4MPEG2 stream reader.
//!
//! The stream starts with a single header line, e.g. `YUV4MPEG2 W640 H480 F30000:1001 C420jpeg`,
//! followed by frames, each introduced by a `FRAME` line and followed by raw planes.

use crate::MAX_FRAME_BYTES;
use anyhow::{anyhow, bail, ensure, Result};
use log::*;
use mdet::prelude::v1::{Frame, FrameShape, FrameSource};
use std::io::{BufRead, ErrorKind, Read};

const MAGIC: &str = "YUV4MPEG2";
const FRAME_MAGIC: &[u8] = b"FRAME";
const MAX_LINE: u64 = 4096;

/// Chroma layout of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Colorspace {
    C420,
    C422,
    C444,
    C444Alpha,
    Mono,
}

impl Colorspace {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "420jpeg" | "420paldv" | "420mpeg2" | "420" => Ok(Self::C420),
            "422" => Ok(Self::C422),
            "444" => Ok(Self::C444),
            "444alpha" => Ok(Self::C444Alpha),
            "mono" => Ok(Self::Mono),
            _ => Err(anyhow!("unsupported colorspace C{tag}")),
        }
    }

    /// Horizontal and vertical chroma subsampling factors.
    fn subsampling(self) -> Option<(usize, usize)> {
        match self {
            Self::C420 => Some((2, 2)),
            Self::C422 => Some((2, 1)),
            Self::C444 | Self::C444Alpha => Some((1, 1)),
            Self::Mono => None,
        }
    }
}

/// Parsed stream header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Y4mHeader {
    pub width: usize,
    pub height: usize,
    pub fps: Option<f64>,
    pub colorspace: Colorspace,
}

impl Y4mHeader {
    /// Parse the header line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_ascii_whitespace();

        ensure!(tokens.next() == Some(MAGIC), "not a YUV4MPEG2 stream");

        let mut width = None;
        let mut height = None;
        let mut fps = None;
        let mut colorspace = Colorspace::C420;

        for token in tokens {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();

            match tag {
                Some('W') => width = Some(value.parse::<usize>()?),
                Some('H') => height = Some(value.parse::<usize>()?),
                Some('F') => {
                    let (num, den) = value
                        .split_once(':')
                        .ok_or_else(|| anyhow!("invalid frame rate {value}"))?;
                    let (num, den) = (num.parse::<u64>()?, den.parse::<u64>()?);
                    // F0:0 marks an unknown rate.
                    fps = (num > 0 && den > 0).then(|| num as f64 / den as f64);
                }
                Some('C') => colorspace = Colorspace::parse(value)?,
                // Interlacing, aspect ratio and extensions do not matter here.
                _ => {}
            }
        }

        let width = width.ok_or_else(|| anyhow!("missing width"))?;
        let height = height.ok_or_else(|| anyhow!("missing height"))?;
        ensure!(width > 0 && height > 0, "empty frames ({width}x{height})");

        let header = Self {
            width,
            height,
            fps,
            colorspace,
        };

        header.frame_len()?;

        Ok(header)
    }

    fn chroma_dim(&self) -> Option<(usize, usize)> {
        self.colorspace
            .subsampling()
            .map(|(sx, sy)| (div_ceil(self.width, sx), div_ceil(self.height, sy)))
    }

    /// Size of a single frame's planes in bytes.
    ///
    /// Fails if the frame would be larger than [`MAX_FRAME_BYTES`].
    pub fn frame_len(&self) -> Result<usize> {
        let too_large = || anyhow!("{}x{} frames are too large", self.width, self.height);

        let luma = self.width.checked_mul(self.height).ok_or_else(too_large)?;
        let chroma = match self.chroma_dim() {
            Some((w, h)) => w
                .checked_mul(h)
                .and_then(|p| p.checked_mul(2))
                .ok_or_else(too_large)?,
            None => 0,
        };
        let alpha = if self.colorspace == Colorspace::C444Alpha {
            luma
        } else {
            0
        };

        let len = luma
            .checked_add(chroma)
            .and_then(|l| l.checked_add(alpha))
            .filter(|&l| l <= MAX_FRAME_BYTES)
            .ok_or_else(too_large)?;

        Ok(len)
    }
}

/// Frame source reading a YUV4MPEG2 stream.
pub struct Y4mSource<R> {
    reader: R,
    header: Y4mHeader,
    color: bool,
    planes: Vec<u8>,
    line: Vec<u8>,
    done: bool,
}

impl<R: BufRead> Y4mSource<R> {
    /// Read the stream header and create a new source.
    ///
    /// # Arguments
    ///
    /// * `reader` - buffered stream positioned at the header.
    /// * `color` - produce Y/Cb/Cr frames instead of luma only.
    pub fn new(mut reader: R, color: bool) -> Result<Self> {
        let mut line = vec![];
        read_line(&mut reader, &mut line)?;
        ensure!(line.ends_with(b"\n"), "truncated YUV4MPEG2 header");

        let header = Y4mHeader::parse(std::str::from_utf8(&line)?.trim_end())?;

        if color && header.colorspace == Colorspace::Mono {
            warn!("Monochrome stream, colour frames are not available");
        }

        Ok(Self {
            reader,
            planes: vec![0; header.frame_len()?],
            header,
            color,
            line,
            done: false,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }

    fn shape(&self) -> FrameShape {
        let channels = match (self.color, self.header.colorspace) {
            (true, cs) if cs != Colorspace::Mono => 3,
            _ => 1,
        };

        FrameShape::new(self.header.width, self.header.height, channels)
    }

    fn build_frame(&self) -> Result<Frame> {
        let Y4mHeader { width, height, .. } = self.header;
        let luma = &self.planes[..width * height];
        let shape = self.shape();

        match (shape.channels, self.header.colorspace.subsampling(), self.header.chroma_dim()) {
            (3, Some((sx, sy)), Some((cw, ch))) => {
                let cb = &self.planes[width * height..][..cw * ch];
                let cr = &self.planes[width * height + cw * ch..][..cw * ch];

                Frame::from_fn(shape, |x, y, c| {
                    let chroma = (y / sy) * cw + x / sx;
                    match c {
                        0 => luma[y * width + x],
                        1 => cb[chroma],
                        _ => cr[chroma],
                    }
                })
            }
            _ => Frame::new(shape, luma.to_vec()),
        }
    }
}

impl<R: BufRead> Y4mSource<R> {
    /// Read the planes of the current frame. Returns `false` if the stream ended midway.
    fn read_planes(&mut self) -> Result<bool> {
        match self.reader.read_exact(&mut self.planes) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!("Truncated frame at end of stream");
                self.done = true;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: BufRead> FrameSource for Y4mSource<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }

        read_line(&mut self.reader, &mut self.line)?;

        if self.line.is_empty() {
            self.done = true;
            return Ok(None);
        }

        if !self.line.ends_with(b"\n") {
            self.done = true;

            if self.line.len() as u64 >= MAX_LINE {
                bail!("frame header exceeds {MAX_LINE} bytes");
            }

            warn!("Truncated frame header at end of stream");
            return Ok(None);
        }

        let marker_ok = self.line.starts_with(FRAME_MAGIC);

        // The planes are consumed even after a bad marker, so the next call starts at the
        // following frame.
        if !self.read_planes()? {
            return Ok(None);
        }

        if !marker_ok {
            bail!(
                "expected FRAME marker, got {:?}",
                String::from_utf8_lossy(&self.line).trim_end()
            );
        }

        self.build_frame().map(Some)
    }

    fn get_framerate(&self) -> Option<f64> {
        self.header.fps
    }

    fn get_shape(&self) -> Option<FrameShape> {
        Some(self.shape())
    }
}

/// Read a single line of bounded length.
fn read_line(reader: &mut impl BufRead, line: &mut Vec<u8>) -> Result<()> {
    line.clear();
    Read::take(&mut *reader, MAX_LINE).read_until(b'\n', line)?;
    Ok(())
}

fn div_ceil(a: usize, b: usize) -> usize {
    a / b + (a % b != 0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(header: &str, frames: &[Vec<u8>]) -> Cursor<Vec<u8>> {
        let mut data = format!("{header}\n").into_bytes();
        for frame in frames {
            data.extend_from_slice(b"FRAME\n");
            data.extend_from_slice(frame);
        }
        Cursor::new(data)
    }

    #[test]
    fn header_fields() {
        let header = Y4mHeader::parse("YUV4MPEG2 W640 H480 F30000:1001 Ip A1:1 C420jpeg XYSCSS=420JPEG")
            .unwrap();

        assert_eq!((header.width, header.height), (640, 480));
        assert!((header.fps.unwrap() - 29.97).abs() < 0.001);
        assert_eq!(header.colorspace, Colorspace::C420);
        assert_eq!(header.frame_len().unwrap(), 640 * 480 * 3 / 2);

        let header = Y4mHeader::parse("YUV4MPEG2 W5 H3 F0:0 C422").unwrap();
        assert_eq!(header.fps, None);
        assert_eq!(header.frame_len().unwrap(), 15 + 2 * 3 * 3);

        assert!(Y4mHeader::parse("YUV4MPEG W5 H3").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W5").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W5 H3 C420p10").is_err());
    }

    #[test]
    fn luma_frames() {
        let frames = [vec![1; 6], vec![2; 6]];
        let mut source = Y4mSource::new(stream("YUV4MPEG2 W2 H3 F25:1 Cmono", &frames), false).unwrap();

        assert_eq!(source.get_framerate(), Some(25.0));
        assert_eq!(source.get_shape(), Some(FrameShape::gray(2, 3)));

        assert_eq!(source.next_frame().unwrap().unwrap().as_slice(), &[1; 6]);
        assert_eq!(source.next_frame().unwrap().unwrap().as_slice(), &[2; 6]);
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn chroma_is_dropped_by_default() {
        // 4x2 luma, 2x1 chroma planes.
        let frame = [vec![10; 8], vec![100, 101], vec![200, 201]].concat();
        let mut source = Y4mSource::new(stream("YUV4MPEG2 W4 H2 F10:1", &[frame]), false).unwrap();

        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.shape(), FrameShape::gray(4, 2));
        assert_eq!(frame.as_slice(), &[10; 8]);
    }

    #[test]
    fn colour_frames_sample_chroma() {
        let luma = (0..8).collect::<Vec<u8>>();
        let frame = [luma, vec![100, 101], vec![200, 201]].concat();
        let mut source = Y4mSource::new(stream("YUV4MPEG2 W4 H2 F10:1 C420mpeg2", &[frame]), true).unwrap();

        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.shape(), FrameShape::new(4, 2, 3));
        assert_eq!(frame.pixel(0, 0), &[0, 100, 200]);
        assert_eq!(frame.pixel(3, 1), &[7, 101, 201]);
        assert_eq!(frame.pixel(2, 0), &[2, 101, 201]);
    }

    #[test]
    fn truncated_frame_ends_stream() {
        let mut data = stream("YUV4MPEG2 W2 H2 F1:1 Cmono", &[vec![5; 4]]).into_inner();
        data.extend_from_slice(b"FRAME\n\x01\x02");

        let mut source = Y4mSource::new(Cursor::new(data), false).unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn bad_frame_marker() {
        let mut data = stream("YUV4MPEG2 W2 H2 F1:1 Cmono", &[]).into_inner();
        data.extend_from_slice(b"FRAMX\n\x01\x02\x03\x04");

        let mut source = Y4mSource::new(Cursor::new(data), false).unwrap();
        assert!(source.next_frame().is_err());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn bad_frame_marker_costs_one_frame() {
        // Raster bytes full of newlines must not be mistaken for frame headers.
        let mut data = stream("YUV4MPEG2 W2 H2 F1:1 Cmono", &[vec![1; 4]]).into_inner();
        data.extend_from_slice(b"FRAXE\n\n\n\n\n");
        data.extend_from_slice(b"FRAME\n\x07\x07\x07\x07");

        let mut source = Y4mSource::new(Cursor::new(data), false).unwrap();
        assert_eq!(source.next_frame().unwrap().unwrap().as_slice(), &[1; 4]);
        assert!(source.next_frame().is_err());
        assert_eq!(source.next_frame().unwrap().unwrap().as_slice(), &[7; 4]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn skip_policy_keeps_timeline() {
        use mdet::prelude::v1::{DetectorConfig, FrameErrorPolicy, MotionEngine};

        let (w, h) = (64, 64);
        let quiet = vec![20u8; w * h];
        let busy = vec![220u8; w * h];

        let mut data = format!("YUV4MPEG2 W{w} H{h} F1:1 Cmono\n").into_bytes();
        for i in 0..6 {
            data.extend_from_slice(if i == 1 { b"FRAMX\n" } else { b"FRAME\n" });
            // Newlines inside the raster of the corrupt frame.
            let raster = match i {
                1 => vec![b'\n'; w * h],
                4 => busy.clone(),
                _ => quiet.clone(),
            };
            data.extend_from_slice(&raster);
        }

        let mut source = Y4mSource::new(Cursor::new(data), false).unwrap();
        let config = DetectorConfig::default()
            .threshold(1000)
            .frame_errors(FrameErrorPolicy::Skip);
        let mut engine = MotionEngine::for_source(config, &source).unwrap();
        engine.run(&mut source, None).unwrap();

        assert_eq!(engine.stats().skipped_frames, 1);
        assert_eq!(engine.stats().frames, 5);
        assert_eq!(
            engine.finish().iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            [4]
        );
    }

    #[test]
    fn overlong_frame_header() {
        let mut data = stream("YUV4MPEG2 W2 H2 F1:1 Cmono", &[]).into_inner();
        data.extend_from_slice(b"FRAME ");
        data.extend(std::iter::repeat(b'X').take(MAX_LINE as usize));
        data.extend_from_slice(b"\n\x01\x02\x03\x04");

        let mut source = Y4mSource::new(Cursor::new(data), false).unwrap();
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn rejects_oversized_frames() {
        assert!(Y4mHeader::parse("YUV4MPEG2 W4294967296 H4294967296 F1:1").is_err());
        assert!(Y4mHeader::parse(&format!("YUV4MPEG2 W{} H1 F1:1 Cmono", usize::MAX)).is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W100000 H100000 F1:1 Cmono").is_err());
        assert!(Y4mHeader::parse("YUV4MPEG2 W7680 H4320 F1:1 C444alpha").is_ok());
    }

    #[test]
    fn rejects_non_y4m() {
        assert!(Y4mSource::new(Cursor::new(b"P5\n2 2\n255\n".to_vec()), false).is_err());
        assert!(Y4mSource::new(Cursor::new(vec![]), false).is_err());
    }
}
