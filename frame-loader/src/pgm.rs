//! Directory of binary PGM frames.

use crate::MAX_FRAME_BYTES;
use anyhow::{anyhow, ensure, Context, Result};
use log::*;
use mdet::prelude::v1::{Frame, FrameShape, FrameSource};
use std::path::{Path, PathBuf};

/// Parse a binary (`P5`) greymap with at most 8 bits per sample.
///
/// Samples are rescaled to the full `0..=255` range if `maxval` is lower than 255.
pub fn parse_pgm(data: &[u8]) -> Result<Frame> {
    let mut pos = 0;

    let magic = next_token(data, &mut pos)?;
    ensure!(magic == b"P5", "not a binary PGM file");

    let width = parse_number(next_token(data, &mut pos)?)?;
    let height = parse_number(next_token(data, &mut pos)?)?;
    let maxval = parse_number(next_token(data, &mut pos)?)?;

    ensure!(width > 0 && height > 0, "empty image ({width}x{height})");
    ensure!(
        (1..=255).contains(&maxval),
        "unsupported maxval {maxval}"
    );

    // Exactly one whitespace character separates the header from the raster.
    let raster = data
        .get(pos + 1..)
        .ok_or_else(|| anyhow!("missing raster"))?;
    let len = width
        .checked_mul(height)
        .filter(|&l| l <= MAX_FRAME_BYTES)
        .ok_or_else(|| anyhow!("{width}x{height} image is too large"))?;

    ensure!(
        raster.len() >= len,
        "raster too short ({} of {len} bytes)",
        raster.len()
    );

    let raster = &raster[..len];

    let data = if maxval == 255 {
        raster.to_vec()
    } else {
        raster
            .iter()
            .map(|&v| ((v.min(maxval as u8) as usize * 255 + maxval / 2) / maxval) as u8)
            .collect()
    };

    Frame::new(FrameShape::gray(width, height), data)
}

fn next_token<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    loop {
        match data.get(*pos) {
            Some(b'#') => {
                while !matches!(data.get(*pos), None | Some(b'\n')) {
                    *pos += 1;
                }
            }
            Some(c) if c.is_ascii_whitespace() => *pos += 1,
            Some(_) => break,
            None => return Err(anyhow!("truncated PGM header")),
        }
    }

    let start = *pos;

    while matches!(data.get(*pos), Some(c) if !c.is_ascii_whitespace() && *c != b'#') {
        *pos += 1;
    }

    Ok(&data[start..*pos])
}

fn parse_number(token: &[u8]) -> Result<usize> {
    std::str::from_utf8(token)?
        .parse()
        .map_err(|e| anyhow!("invalid PGM header field: {e}"))
}

/// Frame source reading `*.pgm` files of a directory in lexical order.
pub struct PgmSequence {
    files: std::vec::IntoIter<PathBuf>,
    shape: Option<FrameShape>,
}

impl PgmSequence {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let mut files = std::fs::read_dir(dir)
            .with_context(|| format!("could not list {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |e| e == "pgm"))
            .collect::<Vec<_>>();

        files.sort();

        info!("Found {} PGM frames in {}", files.len(), dir.display());

        // Peek at the first frame for the reported shape.
        let shape = files
            .first()
            .and_then(|p| std::fs::read(p).ok())
            .and_then(|d| parse_pgm(&d).ok())
            .map(|f| f.shape());

        Ok(Self {
            files: files.into_iter(),
            shape,
        })
    }

    /// Number of frames left in the sequence.
    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

impl FrameSource for PgmSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let path = match self.files.next() {
            Some(path) => path,
            None => return Ok(None),
        };

        let data =
            std::fs::read(&path).with_context(|| format!("could not read {}", path.display()))?;

        parse_pgm(&data)
            .with_context(|| format!("malformed frame {}", path.display()))
            .map(Some)
    }

    fn get_framerate(&self) -> Option<f64> {
        None
    }

    fn get_shape(&self) -> Option<FrameShape> {
        self.shape
    }
}
