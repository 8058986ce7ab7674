//! 64-bit key hashing.
//!
//! Every record persists the full hash of its key, and reopened maps compare
//! stored hashes against freshly computed ones. The algorithm is therefore
//! pinned here rather than delegated to a hasher crate whose output may change
//! between versions: MurmurHash3 (x64/128 variant, first word, seed 0).

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// Hashes `key` to a 64-bit value.
///
/// Deterministic across runs, builds and platforms. Bucket selection uses the
/// low bits; records store the value in full for chain filtering and rehash
/// assignment.
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    let mut blocks = key.chunks_exact(16);
    for block in blocks.by_ref() {
        let mut k1 = u64::from_le_bytes(block[..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(block[8..].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    if tail.len() > 8 {
        let mut k2: u64 = 0;
        for (i, &b) in tail[8..].iter().enumerate() {
            k2 |= (b as u64) << (i * 8);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        let mut k1: u64 = 0;
        for (i, &b) in tail[..tail.len().min(8)].iter().enumerate() {
            k1 |= (b as u64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= key.len() as u64;
    h2 ^= key.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1.wrapping_add(h2)
}

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        for key in [&b""[..], b"a", b"hello world", &[0u8; 64], &[0xffu8; 23]] {
            assert_eq!(hash_key(key), hash_key(key));
        }
    }

    #[test]
    fn test_empty_key() {
        // With seed 0 every mixing input is zero, so the x64/128 variant
        // hashes the empty string to zero.
        assert_eq!(hash_key(b""), 0);
    }

    #[test]
    fn test_distinct_inputs_differ() {
        assert_ne!(hash_key(b"a"), hash_key(b"b"));
        assert_ne!(hash_key(b"ab"), hash_key(b"ba"));
        assert_ne!(hash_key(b"key"), hash_key(b"key\0"));
        assert_ne!(hash_key(&[0u8; 16]), hash_key(&[0u8; 17]));
    }

    #[test]
    fn test_distribution() {
        // Sequential keys must spread evenly over power-of-two buckets.
        let num_buckets = 1024u64;
        let n = 10_000u64;
        let mut counts = vec![0u32; num_buckets as usize];
        for i in 0..n {
            let h = hash_key(&i.to_le_bytes());
            counts[(h & (num_buckets - 1)) as usize] += 1;
        }

        let expected = n as f64 / num_buckets as f64;
        let max = *counts.iter().max().unwrap() as f64;
        assert!(
            max / expected < 3.0,
            "distribution too skewed: max={max}, expected={expected}"
        );
    }
}
