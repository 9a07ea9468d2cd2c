//! Perceptual hashing (DCT pHash).
//!
//! The image is reduced to 32x32 grayscale, transformed with a 2-D DCT-II and
//! the top-left 8x8 low-frequency block is thresholded against its median.
//! Bits are packed row-major, first coefficient in the most significant bit,
//! and rendered as 16 lowercase hex digits.

use std::f64::consts::PI;

use image::imageops::{self, FilterType};

use crate::error::{MarketError, MarketResult};

const SAMPLE: usize = 32;
const LOW_FREQ: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHash(pub u64);

impl ImageHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parses a stored fingerprint. Anything other than 16 hex digits is
    /// rejected.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(arr)))
    }

    pub fn distance(&self, other: &ImageHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl std::fmt::Display for ImageHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fingerprints raw image bytes. Fails with `Decode` when the bytes are not an
/// image in a supported format.
pub fn phash(bytes: &[u8]) -> MarketResult<ImageHash> {
    let img = image::load_from_memory(bytes).map_err(|e| MarketError::Decode(e.to_string()))?;
    let gray = img.to_luma8();
    let small = imageops::resize(&gray, SAMPLE as u32, SAMPLE as u32, FilterType::Lanczos3);

    let mut pixels = [[0.0f64; SAMPLE]; SAMPLE];
    for (x, y, p) in small.enumerate_pixels() {
        pixels[y as usize][x as usize] = p.0[0] as f64;
    }

    let coeffs = dct_2d(&pixels);
    let mut low = Vec::with_capacity(LOW_FREQ * LOW_FREQ);
    for row in coeffs.iter().take(LOW_FREQ) {
        low.extend_from_slice(&row[..LOW_FREQ]);
    }
    let med = median(&low);

    let bits = low
        .iter()
        .fold(0u64, |acc, c| (acc << 1) | u64::from(*c > med));
    Ok(ImageHash(bits))
}

fn cos_table() -> Vec<[f64; SAMPLE]> {
    let n = SAMPLE as f64;
    (0..SAMPLE)
        .map(|k| {
            let mut row = [0.0; SAMPLE];
            for (i, v) in row.iter_mut().enumerate() {
                *v = (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos();
            }
            row
        })
        .collect()
}

// Unnormalized DCT-II along columns then rows. Scaling is irrelevant to the
// median comparison so the conventional factor of 2 is omitted.
fn dct_2d(input: &[[f64; SAMPLE]; SAMPLE]) -> [[f64; SAMPLE]; SAMPLE] {
    let table = cos_table();
    let mut cols = [[0.0f64; SAMPLE]; SAMPLE];
    for x in 0..SAMPLE {
        for (k, t) in table.iter().enumerate() {
            cols[k][x] = (0..SAMPLE).map(|y| input[y][x] * t[y]).sum();
        }
    }
    let mut out = [[0.0f64; SAMPLE]; SAMPLE];
    for (row_out, row_in) in out.iter_mut().zip(cols.iter()) {
        for (k, t) in table.iter().enumerate() {
            row_out[k] = row_in.iter().zip(t.iter()).map(|(a, b)| a * b).sum();
        }
    }
    out
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
    use std::io::Cursor;

    /// Deterministic textured PNG; `shift` brightens every pixel.
    pub(crate) fn noise_png(seed: u64, shift: u8) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let img = GrayImage::from_fn(64, 64, |_, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            Luma([((state >> 33) % 200) as u8 + shift])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img)
            .write_to(&mut buf, ImageOutputFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_error_on_garbage() {
        let err = phash(b"definitely not an image").unwrap_err();
        assert!(matches!(err, MarketError::Decode(_)));
    }

    #[test]
    fn test_deterministic() {
        let png = noise_png(1, 0);
        assert_eq!(phash(&png).unwrap(), phash(&png).unwrap());
    }

    #[test]
    fn test_similar_images_are_close() {
        let a = phash(&noise_png(7, 0)).unwrap();
        let b = phash(&noise_png(7, 3)).unwrap();
        assert!(a.distance(&b) <= 5, "distance {}", a.distance(&b));
    }

    #[test]
    fn test_different_images_are_far() {
        let a = phash(&noise_png(7, 0)).unwrap();
        let b = phash(&noise_png(99, 0)).unwrap();
        assert!(a.distance(&b) > 5, "distance {}", a.distance(&b));
    }

    #[test]
    fn test_distance_symmetric_and_reflexive() {
        let a = ImageHash(0xdead_beef_0000_ffff);
        let b = ImageHash(0x0123_4567_89ab_cdef);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), 0);
    }

    #[test]
    fn test_hex_format() {
        let h = ImageHash(0x00ff_0000_0000_0001);
        assert_eq!(h.to_hex(), "00ff000000000001");
        assert_eq!(ImageHash::from_hex("00ff000000000001"), Some(h));
        assert_eq!(ImageHash::from_hex("xyz"), None);
        assert_eq!(ImageHash::from_hex("00ff"), None);
    }

    #[test]
    fn test_median_even_count() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}
