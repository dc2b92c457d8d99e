//! Exact and combined content digests, plus Hamming distance over hex
//! digests for the perceptual families.

use sha2::{Digest, Sha256};

/// sha256 over raw bytes, lowercase hex.
pub fn exact_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest for a combined (multi-media) record: sha256 over the sorted,
/// concatenated per-item exact digests. Sorting makes the digest independent
/// of media order, so the same album re-posted in a different order still
/// matches.
pub fn combined_digest<I, S>(item_digests: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut digests: Vec<String> = item_digests
        .into_iter()
        .map(|d| d.as_ref().to_string())
        .collect();
    digests.sort();
    hex::encode(Sha256::digest(digests.concat().as_bytes()))
}

/// Bitwise Hamming distance between two equal-length hex digests.
/// `None` if the lengths differ or either side contains a non-hex character.
pub fn hamming(a: &str, b: &str) -> Option<u32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dist = 0u32;
    for (ca, cb) in a.chars().zip(b.chars()) {
        let na = ca.to_digit(16)?;
        let nb = cb.to_digit(16)?;
        dist += (na ^ nb).count_ones();
    }
    Some(dist)
}
