//! Decoded-frame container and pixel helpers.
//!
//! Uploaded frames arrive as encoded JPEG/PNG bytes; everything downstream
//! (backends, pose solving) works on tightly packed RGB8.

use anyhow::{anyhow, Context, Result};

/// Tightly packed RGB8 frame. `data.len() == width * height * 3`.
#[derive(Clone, Debug)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl RgbFrame {
    /// Wrap an existing RGB buffer, validating its length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Decode an uploaded JPEG or PNG image into RGB8.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).context("failed to decode uploaded image")?;
        let rgb = decoded.to_rgb8();
        let (width, height) = (rgb.width(), rgb.height());
        Self::from_rgb(rgb.into_raw(), width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Nearest-neighbor resize. Model inputs are small enough that
    /// interpolation quality does not change detection outcomes.
    pub fn resize(&self, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("resize target must be non-zero"));
        }
        let mut out = vec![0u8; rgb_len(width, height)?];
        let (src_w, src_h) = (self.width as usize, self.height as usize);
        let (dst_w, dst_h) = (width as usize, height as usize);
        for y in 0..dst_h {
            let src_y = (y * src_h / dst_h).min(src_h - 1);
            for x in 0..dst_w {
                let src_x = (x * src_w / dst_w).min(src_w - 1);
                let src = (src_y * src_w + src_x) * 3;
                let dst = (y * dst_w + x) * 3;
                out[dst..dst + 3].copy_from_slice(&self.data[src..src + 3]);
            }
        }
        Self::from_rgb(out, width, height)
    }

    /// Rectangular crop, clamped to the frame bounds.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("crop size must be non-zero"));
        }
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        let mut out = vec![0u8; rgb_len(width, height)?];
        let src_w = self.width as usize;
        for row in 0..height as usize {
            let src = ((y as usize + row) * src_w + x as usize) * 3;
            let dst = row * width as usize * 3;
            let len = width as usize * 3;
            out[dst..dst + len].copy_from_slice(&self.data[src..src + len]);
        }
        Self::from_rgb(out, width, height)
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
