//! Raster codec used to decode capture bytes and encode the final image

use crate::{Error, Result};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;

/// Channels per pixel in every raw buffer the core handles (RGBA, 8 bits each)
pub const CHANNELS: u8 = 4;

/// An uncompressed pixel buffer tagged with its geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl RawImage {
    /// Number of bytes `width * height * channels` describes
    pub fn expected_len(width: u32, height: u32, channels: u8) -> usize {
        width as usize * height as usize * channels as usize
    }

    pub fn is_consistent(&self) -> bool {
        self.buffer.len() == Self::expected_len(self.width, self.height, self.channels)
    }
}

/// Decode/encode collaborator
pub trait Codec: Send + Sync {
    /// Decode engine capture bytes into an RGBA raw buffer
    fn decode_to_raw(&self, bytes: &[u8]) -> Result<RawImage>;

    /// Encode a raw buffer into the final output format
    fn encode_raw(&self, raw: RawImage) -> Result<Vec<u8>>;
}

/// PNG codec backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct PngCodec;

impl Codec for PngCodec {
    fn decode_to_raw(&self, bytes: &[u8]) -> Result<RawImage> {
        let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map_err(|e| Error::CodecError(format!("Failed to decode PNG: {}", e)))?;
        let rgba = decoded.into_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(RawImage {
            buffer: rgba.into_raw(),
            width,
            height,
            channels: CHANNELS,
        })
    }

    fn encode_raw(&self, raw: RawImage) -> Result<Vec<u8>> {
        if raw.channels != CHANNELS {
            return Err(Error::CodecError(format!(
                "Unsupported channel count {}",
                raw.channels
            )));
        }
        if !raw.is_consistent() {
            return Err(Error::CodecError(format!(
                "Buffer of {} bytes does not describe a {}x{} RGBA image",
                raw.buffer.len(),
                raw.width,
                raw.height
            )));
        }

        let img = RgbaImage::from_raw(raw.width, raw.height, raw.buffer)
            .ok_or_else(|| Error::CodecError("Raw buffer size mismatch".into()))?;

        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| Error::CodecError(format!("Failed to encode PNG: {}", e)))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RawImage {
        let mut buffer = Vec::with_capacity(RawImage::expected_len(width, height, CHANNELS));
        for y in 0..height {
            for x in 0..width {
                buffer.extend_from_slice(&[x as u8, y as u8, (x ^ y) as u8, 255]);
            }
        }
        RawImage {
            buffer,
            width,
            height,
            channels: CHANNELS,
        }
    }

    #[test]
    fn png_preserves_pixels() {
        let raw = gradient(17, 9);
        let png = PngCodec.encode_raw(raw.clone()).unwrap();
        assert_eq!(&png[0..8], b"\x89PNG\r\n\x1a\n");
        let back = PngCodec.decode_to_raw(&png).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn encode_rejects_short_buffer() {
        let mut raw = gradient(4, 4);
        raw.buffer.truncate(10);
        assert!(matches!(PngCodec.encode_raw(raw), Err(Error::CodecError(_))));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PngCodec.decode_to_raw(b"not a png").is_err());
    }
}
