//! Fingerprints for duplicate detection: exact content digests, perceptual
//! image digests, and the text cleaning/segmentation/similarity pass used by
//! the text tier of the cascade.

pub mod digest;
pub mod perceptual;
pub mod text;

pub use digest::{combined_digest, exact_digest, hamming};
pub use perceptual::{perceptual_digests, FAMILY_AHASH, FAMILY_DHASH, FAMILY_PHASH, FAMILY_PRIORITY};
pub use text::{
    clean, core_content, effective_text, jaccard, lcs_ratio, similarity_cleaned, text_similarity,
    tokenize,
};
