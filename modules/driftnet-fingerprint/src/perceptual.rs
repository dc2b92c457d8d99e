//! Perceptual image digests: three independent 64-bit families over the
//! decoded luminance, robust in different ways to re-encoding, cropping and
//! watermarking.
//!
//! - `phash` — DCT low-frequency structure (primary, most robust)
//! - `dhash` — horizontal gradient direction
//! - `ahash` — mean-luminance threshold
//!
//! Digests are rendered as 16-char lowercase hex so they can be persisted
//! and compared as plain strings.

use std::collections::BTreeMap;

use image::imageops::FilterType;
use image::GrayImage;

use driftnet_common::DriftnetError;

pub const FAMILY_PHASH: &str = "phash";
pub const FAMILY_DHASH: &str = "dhash";
pub const FAMILY_AHASH: &str = "ahash";

/// Comparison order for the cascade: primary family first, then fallbacks.
pub const FAMILY_PRIORITY: [&str; 3] = [FAMILY_PHASH, FAMILY_DHASH, FAMILY_AHASH];

/// Compute all perceptual digest families for an image-like byte buffer.
/// Undecodable bytes are an error; callers degrade to exact-digest-only.
pub fn perceptual_digests(bytes: &[u8]) -> Result<BTreeMap<String, String>, DriftnetError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| DriftnetError::Fingerprint(format!("undecodable media: {e}")))?;
    let gray = img.to_luma8();

    let mut out = BTreeMap::new();
    out.insert(FAMILY_PHASH.to_string(), format!("{:016x}", phash(&gray)));
    out.insert(FAMILY_DHASH.to_string(), format!("{:016x}", dhash(&gray)));
    out.insert(FAMILY_AHASH.to_string(), format!("{:016x}", ahash(&gray)));
    Ok(out)
}

/// Mean-threshold hash: 8×8 downsample, one bit per pixel above the mean.
fn ahash(gray: &GrayImage) -> u64 {
    let small = image::imageops::resize(gray, 8, 8, FilterType::Triangle);
    let pixels: Vec<u64> = small.pixels().map(|p| u64::from(p.0[0])).collect();
    let mean = pixels.iter().sum::<u64>() / pixels.len() as u64;

    let mut bits = 0u64;
    for &p in &pixels {
        bits = (bits << 1) | u64::from(p > mean);
    }
    bits
}

/// Gradient hash: 9×8 downsample, one bit per horizontal neighbor pair.
fn dhash(gray: &GrayImage) -> u64 {
    let small = image::imageops::resize(gray, 9, 8, FilterType::Triangle);
    let mut bits = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y).0[0];
            let right = small.get_pixel(x + 1, y).0[0];
            bits = (bits << 1) | u64::from(right > left);
        }
    }
    bits
}

const PHASH_INPUT: usize = 32;
const PHASH_BLOCK: usize = 8;

/// DCT hash: 32×32 downsample, 2D DCT-II, threshold the low-frequency 8×8
/// block against the mean of its AC coefficients.
fn phash(gray: &GrayImage) -> u64 {
    let small = image::imageops::resize(
        gray,
        PHASH_INPUT as u32,
        PHASH_INPUT as u32,
        FilterType::Triangle,
    );
    let mut matrix = [[0f64; PHASH_INPUT]; PHASH_INPUT];
    for y in 0..PHASH_INPUT {
        for x in 0..PHASH_INPUT {
            matrix[y][x] = f64::from(small.get_pixel(x as u32, y as u32).0[0]);
        }
    }

    let coeffs = dct_2d(&matrix);

    // Mean over the 8×8 low-frequency block, excluding the DC term which
    // would otherwise dominate.
    let mut sum = 0.0;
    for (v, row) in coeffs.iter().enumerate().take(PHASH_BLOCK) {
        for (u, &c) in row.iter().enumerate().take(PHASH_BLOCK) {
            if u != 0 || v != 0 {
                sum += c;
            }
        }
    }
    let mean = sum / ((PHASH_BLOCK * PHASH_BLOCK - 1) as f64);

    let mut bits = 0u64;
    for row in coeffs.iter().take(PHASH_BLOCK) {
        for &c in row.iter().take(PHASH_BLOCK) {
            bits = (bits << 1) | u64::from(c > mean);
        }
    }
    bits
}

/// Separable 2D DCT-II over a 32×32 block. N is small enough that the naive
/// O(N³) transform is a non-issue next to the resize.
fn dct_2d(input: &[[f64; PHASH_INPUT]; PHASH_INPUT]) -> [[f64; PHASH_INPUT]; PHASH_INPUT] {
    let n = PHASH_INPUT;
    let mut rows = [[0f64; PHASH_INPUT]; PHASH_INPUT];
    for y in 0..n {
        for u in 0..n {
            let mut sum = 0.0;
            for x in 0..n {
                sum += input[y][x]
                    * (std::f64::consts::PI * (2.0 * x as f64 + 1.0) * u as f64 / (2.0 * n as f64))
                        .cos();
            }
            rows[y][u] = sum;
        }
    }
    let mut out = [[0f64; PHASH_INPUT]; PHASH_INPUT];
    for u in 0..n {
        for v in 0..n {
            let mut sum = 0.0;
            for y in 0..n {
                sum += rows[y][u]
                    * (std::f64::consts::PI * (2.0 * y as f64 + 1.0) * v as f64 / (2.0 * n as f64))
                        .cos();
            }
            out[v][u] = sum;
        }
    }
    out
}
