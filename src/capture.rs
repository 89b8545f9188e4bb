//! Chunked capture planning and stitching
//!
//! The engine rasterizes at most `max_tiles` tiles of `tile_size`×`tile_size`
//! pixels per capture call. Surfaces taller than that are captured as a
//! sequence of full-width horizontal chunks, top to bottom, decoded to raw
//! RGBA and concatenated before the final encode.

use crate::cancel::CancelSignal;
use crate::codec::{Codec, RawImage, CHANNELS};
use crate::engine::{CaptureOptions, ClipRegion, Session};
use crate::history::History;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Per-call capture area limit of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureLimits {
    pub tile_size: u32,
    pub max_tiles: u32,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            tile_size: 256,
            max_tiles: 1024,
        }
    }
}

impl CaptureLimits {
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || self.max_tiles == 0 {
            return Err(Error::ConfigError(
                "capture tile_size and max_tiles must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One horizontal slice of the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub y: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturePlan {
    pub width: u32,
    pub height: u32,
    pub tiles_per_row: u32,
    pub tiles_per_column: u32,
    pub max_chunk_height: u32,
    pub chunks: Vec<Chunk>,
}

impl CapturePlan {
    pub fn is_single_shot(&self) -> bool {
        self.chunks.len() == 1
    }
}

/// Partition a `width`×`height` surface into capturable chunks.
///
/// Every chunk but the last is exactly `max_chunk_height` tall.
pub fn plan(width: u32, height: u32, limits: &CaptureLimits) -> Result<CapturePlan> {
    limits.validate()?;
    if width == 0 || height == 0 {
        return Err(Error::InvalidOptions(format!(
            "cannot capture an empty {}x{} surface",
            width, height
        )));
    }

    let tiles_per_row = width.div_ceil(limits.tile_size);
    let tiles_per_column = limits.max_tiles / tiles_per_row;
    if tiles_per_column == 0 {
        return Err(Error::CaptureFailed {
            chunk: None,
            message: format!(
                "a {}px wide row needs {} tiles but one capture allows {}",
                width, tiles_per_row, limits.max_tiles
            ),
        });
    }
    let max_chunk_height = tiles_per_column.saturating_mul(limits.tile_size);

    let mut chunks = Vec::with_capacity(height.div_ceil(max_chunk_height) as usize);
    let mut y = 0;
    while y < height {
        let chunk_height = max_chunk_height.min(height - y);
        chunks.push(Chunk {
            index: chunks.len(),
            y,
            height: chunk_height,
        });
        y += chunk_height;
    }

    Ok(CapturePlan {
        width,
        height,
        tiles_per_row,
        tiles_per_column,
        max_chunk_height,
        chunks,
    })
}

/// Accumulates decoded chunks, in plan order, into one raw buffer
pub struct Stitcher<'a> {
    plan: &'a CapturePlan,
    buffer: Vec<u8>,
    next: usize,
}

impl<'a> Stitcher<'a> {
    pub fn new(plan: &'a CapturePlan) -> Self {
        Self {
            plan,
            buffer: Vec::with_capacity(RawImage::expected_len(plan.width, plan.height, CHANNELS)),
            next: 0,
        }
    }

    /// Append the next chunk; its geometry must match the plan exactly.
    pub fn push(&mut self, raw: RawImage) -> Result<()> {
        let chunk = self.plan.chunks.get(self.next).ok_or_else(|| {
            Error::InvalidState(format!(
                "received chunk {} but the plan has {}",
                self.next,
                self.plan.chunks.len()
            ))
        })?;
        if raw.width != self.plan.width || raw.height != chunk.height || raw.channels != CHANNELS {
            return Err(Error::capture(
                chunk.index,
                format!(
                    "decoded {}x{}x{} but expected {}x{}x{}",
                    raw.width, raw.height, raw.channels, self.plan.width, chunk.height, CHANNELS
                ),
            ));
        }
        if !raw.is_consistent() {
            return Err(Error::capture(
                chunk.index,
                format!("decoded buffer holds {} bytes", raw.buffer.len()),
            ));
        }
        self.buffer.extend_from_slice(&raw.buffer);
        self.next += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<RawImage> {
        let expected = RawImage::expected_len(self.plan.width, self.plan.height, CHANNELS);
        if self.next != self.plan.chunks.len() || self.buffer.len() != expected {
            return Err(Error::InvalidState(format!(
                "stitched {} of {} chunks into {} bytes, expected {}",
                self.next,
                self.plan.chunks.len(),
                self.buffer.len(),
                expected
            )));
        }
        Ok(RawImage {
            buffer: self.buffer,
            width: self.plan.width,
            height: self.plan.height,
            channels: CHANNELS,
        })
    }
}

/// Stitch already-decoded chunks
pub fn stitch(plan: &CapturePlan, chunks: Vec<RawImage>) -> Result<RawImage> {
    let mut stitcher = Stitcher::new(plan);
    for raw in chunks {
        stitcher.push(raw)?;
    }
    stitcher.finish()
}

/// Capture the sized surface of `session` according to `plan` and return the
/// final encoded image.
///
/// `cancel` is checked after every capture, decode and encode; a raised signal
/// wins over that step's own outcome.
pub async fn capture_surface(
    session: &mut dyn Session,
    codec: Arc<dyn Codec>,
    plan: &CapturePlan,
    omit_background: bool,
    cancel: &CancelSignal,
    history: &mut History,
) -> Result<Vec<u8>> {
    if plan.is_single_shot() {
        history.record("capture:single");
        let captured = session
            .capture(&CaptureOptions {
                clip: None,
                omit_background,
            })
            .await;
        cancel.check()?;
        return captured.map_err(|e| Error::capture(0, e.to_string()));
    }

    history.record_with(
        "capture:chunked",
        json!({ "chunks": plan.chunks.len(), "maxChunkHeight": plan.max_chunk_height }),
    );
    let mut stitcher = Stitcher::new(plan);
    for chunk in &plan.chunks {
        let clip = ClipRegion {
            x: 0,
            y: chunk.y,
            width: plan.width,
            height: chunk.height,
        };
        let captured = session
            .capture(&CaptureOptions {
                clip: Some(clip),
                omit_background,
            })
            .await;
        cancel.check()?;
        let bytes = captured.map_err(|e| Error::capture(chunk.index, e.to_string()))?;
        history.record_with(
            "capture:chunk",
            json!({ "index": chunk.index, "y": chunk.y, "height": chunk.height }),
        );

        let decoder = codec.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.decode_to_raw(&bytes))
            .await
            .map_err(|e| Error::capture(chunk.index, format!("decode task failed: {}", e)))?;
        cancel.check()?;
        stitcher.push(decoded.map_err(|e| Error::capture(chunk.index, e.to_string()))?)?;
    }

    let raw = stitcher.finish()?;
    history.record("capture:stitched");
    let encoded = tokio::task::spawn_blocking(move || codec.encode_raw(raw))
        .await
        .map_err(|e| Error::CodecError(format!("encode task failed: {}", e)))?;
    cancel.check()?;
    encoded
}
