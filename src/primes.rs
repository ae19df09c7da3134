//! Prime-number utilities shared by the engine and the coupling layer.
//!
//! Everything here is deterministic and stable across processes: hashes use
//! FNV-1a rather than `DefaultHasher`, whose output is not guaranteed to be
//! stable between Rust releases and therefore unsuitable for persisted
//! fingerprints.

use std::collections::BTreeSet;

/// The first 64 primes. Resonance keys sample from this table so that a key
/// depends on nothing but the observed text.
pub const PRIME_TABLE: [u64; 64] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191,
    193, 197, 199, 211, 223, 227, 229, 233, 239, 241, 251, 257, 263, 269, 271, 277, 281, 283, 293,
    307, 311,
];

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Trial-division primality check.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i.saturating_mul(i) <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// 64-bit FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    fnv1a_seeded(FNV_OFFSET, bytes)
}

/// FNV-1a continuing from an existing state, so several inputs can be folded
/// into one hash.
pub fn fnv1a_seeded(seed: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(seed, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Fold a list of primes into a single stable hash.
pub fn hash_primes(primes: &[u64]) -> u64 {
    primes
        .iter()
        .fold(FNV_OFFSET, |hash, p| fnv1a_seeded(hash, &p.to_le_bytes()))
}

/// Jaccard overlap `|a ∩ b| / |a ∪ b|`. Two empty sets have overlap 0.
pub fn jaccard(a: &[u64], b: &[u64]) -> f64 {
    let a: BTreeSet<u64> = a.iter().copied().collect();
    let b: BTreeSet<u64> = b.iter().copied().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Intersection preserving the order of `a`.
pub fn intersect_ordered(a: &[u64], b: &[u64]) -> Vec<u64> {
    a.iter().copied().filter(|p| b.contains(p)).collect()
}

/// Validate a body-prime list: non-empty, all prime, no duplicates.
pub fn validate_body_primes(primes: &[u64]) -> Result<(), String> {
    if primes.is_empty() {
        return Err("body primes must not be empty".into());
    }
    let mut seen = BTreeSet::new();
    for p in primes {
        if !is_prime(*p) {
            return Err(format!("{p} is not prime"));
        }
        if !seen.insert(*p) {
            return Err(format!("{p} appears more than once"));
        }
    }
    Ok(())
}
