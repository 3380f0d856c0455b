//! Perceptual difference hash (dHash) of door frames
//!
//! The frame is decoded, reduced to grayscale and resampled to a 9x8 grid.
//! Each of the 64 bits records whether a pixel is brighter than its right
//! neighbour. The hash is rendered as 16 lowercase hex characters.

use image::imageops::FilterType;

const GRID_WIDTH: u32 = 9;
const GRID_HEIGHT: u32 = 8;

/// Hash produced for input that could not be decoded.
///
/// A decodable frame with no left-to-right brightness drop anywhere (a flat
/// colour, or brightness that only rises) also hashes to all zeros. Such a
/// frame carries no usable signal either, so it is treated the same way:
/// it is never matched and cannot be enrolled as a reference.
pub const SENTINEL: &str = "0000000000000000";

/// Compute the difference hash of an encoded image.
///
/// Undecodable input yields [`SENTINEL`] instead of an error.
pub fn compute(bytes: &[u8]) -> String {
    let img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            tracing::debug!(error = %e, len = bytes.len(), "fingerprint_decode_failed");
            return SENTINEL.to_string();
        }
    };

    let grid = img.grayscale().resize_exact(GRID_WIDTH, GRID_HEIGHT, FilterType::Triangle).to_luma8();

    let mut bits: u64 = 0;
    for y in 0..GRID_HEIGHT {
        for x in 0..GRID_WIDTH - 1 {
            let left = grid.get_pixel(x, y).0[0];
            let right = grid.get_pixel(x + 1, y).0[0];
            bits <<= 1;
            if left > right {
                bits |= 1;
            }
        }
    }
    format!("{bits:016x}")
}

/// `true` for the hash of an undecodable frame
#[inline]
pub fn is_sentinel(hash: &str) -> bool {
    hash == SENTINEL
}

/// Similarity in `[0, 1]`: one minus the normalised Hamming distance.
///
/// Hashes of different length, empty hashes and malformed hex score 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (Ok(a), Ok(b)) = (hex::decode(a), hex::decode(b)) else {
        return 0.0;
    };
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let differing: u32 = a.iter().zip(&b).map(|(x, y)| (x ^ y).count_ones()).sum();
    let width = (a.len() * 8) as f64;
    1.0 - differing as f64 / width
}
