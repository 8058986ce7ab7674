use parking_lot::Mutex;

/// A fixed, power-of-two array of monitors guarding partitions of the hash
/// space.
///
/// The stripe for a hash is selected from its low bits — the same bits that
/// select its bucket — so every record of one bucket maps to one monitor, and
/// a bucket shares its monitor with its rehash partner (`idx + oldLen` has
/// the same low bits modulo the stripe count). Both properties require the
/// stripe count to never exceed the table length; the engine clamps it at
/// open time and the table never shrinks.
pub(crate) struct LockStripe {
    locks: Box<[Mutex<()>]>,
    mask: u64,
}

impl LockStripe {
    /// `count` must be a power of two.
    pub fn new(count: usize) -> Self {
        debug_assert!(count.is_power_of_two());
        let locks: Box<[Mutex<()>]> = (0..count).map(|_| Mutex::new(())).collect();
        LockStripe {
            locks,
            mask: count as u64 - 1,
        }
    }

    /// The monitor guarding the bucket this hash maps to.
    pub fn for_hash(&self, hash: u64) -> &Mutex<()> {
        &self.locks[(hash & self.mask) as usize]
    }

    /// The monitor guarding bucket `idx`. Identical to [`for_hash`] for every
    /// hash that maps to this bucket.
    ///
    /// [`for_hash`]: Self::for_hash
    pub fn for_index(&self, idx: u64) -> &Mutex<()> {
        &self.locks[(idx & self.mask) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_hash_same_monitor() {
        let stripe = LockStripe::new(16);
        let h = 0xdead_beef_u64;
        assert!(std::ptr::eq(stripe.for_hash(h), stripe.for_hash(h)));
        // Hashes differing only in high bits share a monitor.
        assert!(std::ptr::eq(stripe.for_hash(3), stripe.for_hash(3 | (1 << 40))));
        assert!(!std::ptr::eq(stripe.for_hash(3), stripe.for_hash(4)));
    }

    #[test]
    fn test_partner_bucket_shares_monitor() {
        // With stripes <= table length, bucket idx and idx + oldLen collapse
        // onto the same monitor during a split.
        let stripe = LockStripe::new(16);
        for table_len in [16u64, 32, 64] {
            for idx in 0..16 {
                assert!(std::ptr::eq(
                    stripe.for_index(idx),
                    stripe.for_index(idx + table_len)
                ));
            }
        }
    }

    #[test]
    fn test_hash_and_index_agree() {
        let stripe = LockStripe::new(8);
        let table_mask = 63; // 64 buckets
        for h in [0u64, 1, 7, 8, 63, 64, 0xffff_ffff] {
            assert!(std::ptr::eq(stripe.for_hash(h), stripe.for_index(h & table_mask)));
        }
    }
}
