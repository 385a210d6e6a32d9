//! Order-independent hashing of manifest contents.
//!
//! Manifest hashes are persisted in state rows and compared across processes
//! and restarts, so they must not depend on the per-process seed of
//! `std::collections::hash_map::DefaultHasher`.

use sha2::{Digest, Sha256};

const COMBINE_PRIME: i32 = 251;

/// Returns a stable 32-bit hash of a string.
///
/// The value is the first four bytes of the SHA-256 digest read big-endian.
#[must_use]
pub fn stable_hash(value: &str) -> i32 {
    let digest = Sha256::digest(value.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Computes a hash of a collection that does not depend on iteration order.
///
/// Empty collections hash to `0` and a single item hashes to its own value.
/// Otherwise item hashes are sorted and folded as `acc * 251 + h` with
/// wrapping arithmetic.
///
/// # Example
///
/// ```rust
/// use recon_core::hash::unordered_hash;
///
/// assert_eq!(unordered_hash(["a", "b"]), unordered_hash(["b", "a"]));
/// ```
#[must_use]
pub fn unordered_hash<I, S>(items: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hashes: Vec<i32> = items
        .into_iter()
        .map(|item| stable_hash(item.as_ref()))
        .collect();

    match hashes.len() {
        0 => 0,
        1 => hashes[0],
        _ => {
            hashes.sort_unstable();
            hashes
                .into_iter()
                .fold(0_i32, |acc, h| acc.wrapping_mul(COMBINE_PRIME).wrapping_add(h))
        }
    }
}
