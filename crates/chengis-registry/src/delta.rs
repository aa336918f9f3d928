//! Block-level delta diffing for large artifacts.
//!
//! Fixed 4 KiB blocks compared between two whole artifacts, the same
//! fixed-window-over-a-byte-stream shape as an HTTP range-fetch, just
//! applied to whole in-memory buffers instead of byte ranges over the
//! wire.

pub const BLOCK_SIZE: usize = 4096;
pub const DELTA_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// The blocks of `new` that differ from `base` at the same offset, plus
/// the reconstructed artifact's total length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub target_len: usize,
    pub changed_blocks: Vec<(usize, Vec<u8>)>,
}

/// Diff `new` against `base` in fixed `BLOCK_SIZE` windows. A block is
/// "changed" if it differs from the byte range at the same offset in
/// `base`, or if `base` doesn't extend that far.
pub fn compute_delta(base: &[u8], new: &[u8]) -> Delta {
    let block_count = new.len().div_ceil(BLOCK_SIZE);
    let mut changed_blocks = Vec::new();

    for index in 0..block_count {
        let start = index * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(new.len());
        let new_block = &new[start..end];
        let base_block = base.get(start..end.min(base.len()));
        if base_block != Some(new_block) {
            changed_blocks.push((index, new_block.to_vec()));
        }
    }

    Delta { target_len: new.len(), changed_blocks }
}

/// Reconstruct the original artifact byte-for-byte from `base` and the
/// blocks `delta` says changed.
pub fn apply_delta(base: &[u8], delta: &Delta) -> Vec<u8> {
    let mut out = vec![0u8; delta.target_len];
    let copy_len = base.len().min(delta.target_len);
    out[..copy_len].copy_from_slice(&base[..copy_len]);

    for (index, bytes) in &delta.changed_blocks {
        let start = index * BLOCK_SIZE;
        let end = (start + bytes.len()).min(out.len());
        out[start..end].copy_from_slice(&bytes[..end - start]);
    }

    out
}

/// How a new artifact version was stored relative to a prior one.
#[derive(Debug, Clone)]
pub enum StoredArtifact {
    Full(Vec<u8>),
    Delta { base_ref: String, delta: Delta },
}

/// Decide whether to store `content` as a full copy or as a delta against
/// `previous`. Delta encoding only kicks in once the prior artifact is at
/// least [`DELTA_THRESHOLD_BYTES`]; smaller artifacts aren't worth the
/// bookkeeping and fall back to a full copy.
pub fn store_artifact(previous: Option<(&str, &[u8])>, content: &[u8]) -> StoredArtifact {
    if let Some((base_ref, base_bytes)) = previous {
        if base_bytes.len() as u64 >= DELTA_THRESHOLD_BYTES {
            return StoredArtifact::Delta { base_ref: base_ref.to_string(), delta: compute_delta(base_bytes, content) };
        }
    }
    StoredArtifact::Full(content.to_vec())
}
