//! Shard routing
//!
//! Every file belongs to exactly one of `2^shard_bits` shards, determined by
//! a hash of its routing key. The hash must be stable across processes,
//! workers, and re-implementations:
//!
//! ```text
//! consistent_hash(value, n_bits) =
//!     u64::from_be_bytes(SHA-256(value)[0..8]) & ((1 << n_bits) - 1)
//! ```
//!
//! [`shard_assignment`] partitions the shard space over a fixed pod count:
//! contiguous blocks, with the remainder round-robined to the lowest pod
//! ordinals. The blocks are a total partition — every shard is owned by
//! exactly one pod.

use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Stable mapping `value -> shard_id` in `[0, 2^n_bits)`.
///
/// `n_bits` must be in `[1, 32]`.
pub fn consistent_hash(value: &str, n_bits: u8) -> Result<u32> {
    if !(1..=32).contains(&n_bits) {
        return Err(CoreError::Config(format!(
            "n_bits must be in [1, 32], got {n_bits}"
        )));
    }
    let digest = Sha256::digest(value.as_bytes());
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(first8);
    let mask = (1u64 << n_bits) - 1;
    Ok((hash & mask) as u32)
}

/// The contiguous block of shards owned by `pod_ordinal` out of `pod_count`.
///
/// The shard space `[0, 2^n_bits)` is split into `pod_count` contiguous
/// blocks of size `floor(total / pod_count)`, and the remainder is handed
/// one-per-pod to the lowest ordinals.
pub fn shard_assignment(pod_ordinal: u32, pod_count: u32, n_bits: u8) -> Result<Vec<u32>> {
    if !(1..=32).contains(&n_bits) {
        return Err(CoreError::Config(format!(
            "n_bits must be in [1, 32], got {n_bits}"
        )));
    }
    if pod_count == 0 {
        return Err(CoreError::Config("pod_count must be positive".into()));
    }
    if pod_ordinal >= pod_count {
        return Err(CoreError::Config(format!(
            "pod_ordinal {pod_ordinal} out of range for pod_count {pod_count}"
        )));
    }

    let total = 1u64 << n_bits;
    let pods = u64::from(pod_count);
    let ordinal = u64::from(pod_ordinal);
    let base = total / pods;
    let remainder = total % pods;

    let size = base + u64::from(ordinal < remainder);
    let start = ordinal * base + ordinal.min(remainder);

    Ok((start..start + size).map(|s| s as u32).collect())
}

/// Format a shard id as zero-padded hex, `ceil(shard_bits / 4)` digits wide.
///
/// Used in archive object keys: `<day>/<shard_hex>/<container_id>.des`.
pub fn shard_hex(shard_id: u32, shard_bits: u8) -> String {
    let width = usize::from(shard_bits).div_ceil(4);
    format!("{shard_id:0width$x}")
}
