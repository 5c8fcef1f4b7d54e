//! Tile geometry, byte accumulation and the byte <-> tensor conversions.
//!
//! Tiles travel as pixel-interleaved bytes (`RGBRGB…`, row-major) and are
//! handed to inference as channel-planar `(3, H, W)` float tensors with
//! samples in `[0.0, 1.0]`.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ndarray::Array3;

pub const CHANNELS: usize = 3;

/// Channel-planar `(3, H, W)` tile tensor.
pub type Tensor = Array3<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub width: usize,
    pub height: usize,
}

impl TileGeometry {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Full-width horizontal strip for an image of the given size.
    ///
    /// The strip height is the largest divisor of `image_height` whose area
    /// fits in `max_tile_pixels`, never less than one row. Strips are
    /// contiguous in the row-major byte stream, so upscaled strips
    /// concatenate back into the upscaled image.
    pub fn strip(image_width: usize, image_height: usize, max_tile_pixels: usize) -> Self {
        let budget_rows = (max_tile_pixels / image_width.max(1)).max(1);
        let rows = (1..=image_height.min(budget_rows))
            .rev()
            .find(|rows| image_height % rows == 0)
            .unwrap_or(1);
        Self::new(image_width, rows)
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    pub fn byte_len(&self) -> usize {
        self.pixels() * CHANNELS
    }

    pub fn scaled(&self, factor: usize) -> Self {
        Self::new(self.width * factor, self.height * factor)
    }

    pub fn tensor_shape(&self) -> [usize; 3] {
        [CHANNELS, self.height, self.width]
    }
}

impl std::fmt::Display for TileGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

pub fn normalize(sample: u8) -> f32 {
    sample as f32 / 255.0
}

/// Scale to `[0, 255]`, round to nearest and saturate.
pub fn quantize(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Upper bound on the bytes reserved up front; larger tiles grow as data arrives.
const PREALLOCATE_LIMIT: usize = 1 << 20;

/// Byte accumulator for exactly one tile.
///
/// Chunk boundaries are irrelevant: bytes are taken up to the remaining
/// capacity and whatever is left in the chunk stays there for the next tile.
#[derive(Debug)]
pub struct TileBuffer {
    geometry: TileGeometry,
    pixels: Vec<u8>,
}

impl TileBuffer {
    pub fn new(geometry: TileGeometry) -> Self {
        Self {
            geometry,
            pixels: Vec::with_capacity(geometry.byte_len().min(PREALLOCATE_LIMIT)),
        }
    }

    pub fn geometry(&self) -> TileGeometry {
        self.geometry
    }

    pub fn filled(&self) -> usize {
        self.pixels.len()
    }

    pub fn remaining(&self) -> usize {
        self.geometry.byte_len() - self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Consume bytes from `chunk` until the tile is full or the chunk runs dry.
    ///
    /// Returns the normalized tensor and resets to empty exactly when the
    /// tile reaches capacity. The chunk is advanced past the consumed bytes.
    ///
    /// A zero-area buffer never yields a tile.
    pub fn append<B: Buf>(&mut self, chunk: &mut B) -> Option<Tensor> {
        if self.geometry.byte_len() == 0 {
            return None;
        }
        while self.remaining() > 0 && chunk.has_remaining() {
            let available = chunk.chunk();
            let take = self.remaining().min(available.len());
            self.pixels.extend_from_slice(&available[..take]);
            chunk.advance(take);
        }

        if self.remaining() > 0 {
            return None;
        }

        let tensor = interleaved_to_planar(&self.pixels, self.geometry);
        self.pixels.clear();
        Some(tensor)
    }
}

fn interleaved_to_planar(pixels: &[u8], geometry: TileGeometry) -> Tensor {
    let width = geometry.width;
    Array3::from_shape_fn(
        (CHANNELS, geometry.height, width),
        |(channel, y, x)| normalize(pixels[(y * width + x) * CHANNELS + channel]),
    )
}

/// Converts upscaled tensors back to pixel-interleaved output bytes.
#[derive(Debug, Clone, Copy)]
pub struct TileEncoder {
    output: TileGeometry,
}

impl TileEncoder {
    pub fn new(input: TileGeometry, scale: usize) -> Self {
        Self {
            output: input.scaled(scale),
        }
    }

    pub fn output_geometry(&self) -> TileGeometry {
        self.output
    }

    pub fn encode(&self, tensor: &Tensor) -> Result<Bytes> {
        let expected = self.output.tensor_shape();
        if tensor.shape() != &expected[..] {
            bail!(
                "upscaled tile has shape {:?}, expected {:?}",
                tensor.shape(),
                expected
            );
        }

        let mut out = BytesMut::with_capacity(self.output.byte_len());
        for y in 0..self.output.height {
            for x in 0..self.output.width {
                for channel in 0..CHANNELS {
                    out.put_u8(quantize(tensor[[channel, y, x]]));
                }
            }
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_strip_uses_largest_fitting_divisor() {
        assert_eq!(TileGeometry::strip(128, 128, 128 * 128), TileGeometry::new(128, 128));
        assert_eq!(TileGeometry::strip(100, 120, 4000), TileGeometry::new(100, 40));
        assert_eq!(TileGeometry::strip(100, 120, 3500), TileGeometry::new(100, 30));
    }

    #[test]
    fn test_strip_falls_back_to_single_row() {
        assert_eq!(TileGeometry::strip(10, 7, 60), TileGeometry::new(10, 1));
        assert_eq!(TileGeometry::strip(5000, 4, 16), TileGeometry::new(5000, 1));
    }

    #[test]
    fn test_append_partial_chunk_returns_none() {
        let mut tile = TileBuffer::new(TileGeometry::new(2, 2));
        let data = gradient(5);
        let mut chunk = &data[..];

        assert!(tile.append(&mut chunk).is_none());
        assert_eq!(tile.filled(), 5);
        assert_eq!(tile.remaining(), 7);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_append_never_takes_more_than_capacity() {
        let mut tile = TileBuffer::new(TileGeometry::new(2, 1));
        let data = gradient(10);
        let mut chunk = &data[..];

        let tensor = tile.append(&mut chunk).expect("tile should complete");
        assert_eq!(tensor.shape(), &[3, 1, 2]);
        assert_eq!(chunk.len(), 4);
        assert!(tile.is_empty());
    }

    #[test]
    fn test_zero_area_buffer_yields_nothing() {
        let mut tile = TileBuffer::new(TileGeometry::new(0, 3));
        let data = gradient(6);
        let mut chunk = &data[..];

        assert!(tile.append(&mut chunk).is_none());
        assert_eq!(chunk.len(), 6);
    }

    #[test]
    fn test_huge_tile_does_not_reserve_its_full_size() {
        let tile = TileBuffer::new(TileGeometry::new(1 << 30, 1 << 10));
        assert_eq!(tile.remaining(), (1usize << 40) * CHANNELS);
        assert!(tile.is_empty());
    }

    #[test]
    fn test_single_chunk_can_complete_many_tiles() {
        let geometry = TileGeometry::new(1, 1);
        let mut tile = TileBuffer::new(geometry);
        let data = gradient(3 * 4 + 2);
        let mut chunk = &data[..];

        let mut completed = 0;
        while !chunk.is_empty() {
            if tile.append(&mut chunk).is_some() {
                completed += 1;
            }
        }

        assert_eq!(completed, 4);
        assert_eq!(tile.filled(), 2);
    }

    #[test]
    fn test_tensor_is_channel_planar_and_normalized() {
        let mut tile = TileBuffer::new(TileGeometry::new(2, 1));
        let data = [255u8, 0, 51, 0, 255, 102];
        let mut chunk = &data[..];
        let tensor = tile.append(&mut chunk).expect("tile should complete");

        assert_eq!(tensor[[0, 0, 0]], 1.0);
        assert_eq!(tensor[[1, 0, 0]], 0.0);
        assert!((tensor[[2, 0, 0]] - 0.2).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 1]], 0.0);
        assert_eq!(tensor[[1, 0, 1]], 1.0);
        assert!((tensor[[2, 0, 1]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_byte_at_a_time_matches_single_chunk() {
        let geometry = TileGeometry::new(3, 2);
        let data = gradient(geometry.byte_len());

        let mut whole = TileBuffer::new(geometry);
        let expected = whole.append(&mut &data[..]).expect("whole tile");

        let mut split = TileBuffer::new(geometry);
        let mut result = None;
        for byte in &data {
            let mut one = std::slice::from_ref(byte);
            result = split.append(&mut one);
        }

        assert_eq!(result.expect("split tile"), expected);
    }

    #[test]
    fn test_quantize_roundtrip_within_one() {
        for value in 0..=255u8 {
            let restored = quantize(normalize(value));
            assert!(
                (restored as i16 - value as i16).abs() <= 1,
                "value {value} came back as {restored}"
            );
        }
    }

    #[test]
    fn test_quantize_saturates_and_rounds() {
        assert_eq!(quantize(1.7), 255);
        assert_eq!(quantize(-0.3), 0);
        assert_eq!(quantize(0.5), 128);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_encode_writes_interleaved_bytes() {
        let encoder = TileEncoder::new(TileGeometry::new(1, 1), 2);
        let mut tensor = Tensor::zeros((3, 2, 2));
        tensor[[0, 0, 0]] = 1.0;
        tensor[[1, 0, 1]] = 0.5;
        tensor[[2, 1, 1]] = 2.0;

        let bytes = encoder.encode(&tensor).expect("encode");
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..3], &[255, 0, 0]);
        assert_eq!(&bytes[3..6], &[0, 128, 0]);
        assert_eq!(&bytes[6..9], &[0, 0, 0]);
        assert_eq!(&bytes[9..12], &[0, 0, 255]);
    }

    #[test]
    fn test_encode_rejects_wrong_shape() {
        let encoder = TileEncoder::new(TileGeometry::new(2, 2), 4);
        let tensor = Tensor::zeros((3, 4, 4));
        let err = encoder.encode(&tensor).unwrap_err();
        assert!(err.to_string().contains("expected [3, 8, 8]"));
    }
}
