use std::io::{Error, ErrorKind};
use std::path::Path;

use crate::chainmap::ChainMap;
use crate::error::Result;

/// Builder type for opening a [`ChainMap`] with non-default configuration.
///
/// The builder owns tuning knobs such as the starting bucket-table size, the
/// load factor that triggers a table doubling, and the lock stripe width.
/// Each builder instance is consumed by a single call to [`open`](Self::open).
pub struct ChainMapBuilder {
    initial_primary_file_length: u64,
    load_rehash_threshold: f64,
    lock_stripe_count: usize,
}

impl Default for ChainMapBuilder {
    fn default() -> Self {
        Self {
            initial_primary_file_length: 0, // 0: the engine picks a small table
            load_rehash_threshold: 0.75,
            lock_stripe_count: 256,
        }
    }
}

impl ChainMapBuilder {
    /// Sets the starting size of the bucket-table file in bytes, rounded up
    /// to the next power of two. Each bucket occupies eight bytes, so the
    /// initial bucket count is this value divided by eight.
    ///
    /// Only consulted when creating a fresh map; an existing map keeps the
    /// table length recorded in its header.
    pub fn with_initial_primary_file_length(mut self, len: u64) -> Self {
        self.initial_primary_file_length = len;
        self
    }

    /// Sets the load factor (`entries / buckets`) above which mutating
    /// operations start doubling the table. Must lie in `(0, 1]`.
    pub fn with_load_rehash_threshold(mut self, threshold: f64) -> Self {
        self.load_rehash_threshold = threshold;
        self
    }

    /// Sets the number of lock stripes, rounded up to the next power of two.
    ///
    /// The effective count is additionally capped by the initial bucket
    /// count, so that a bucket and its rehash partner always share a monitor.
    pub fn with_lock_stripe_count(mut self, count: usize) -> Self {
        self.lock_stripe_count = count;
        self
    }

    /// Consumes the builder and opens (or creates) the map stored in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid, the files cannot
    /// be created or mapped, or the stored header is corrupt.
    pub fn open(self, dir: impl AsRef<Path>) -> Result<ChainMap> {
        if !(self.load_rehash_threshold > 0.0 && self.load_rehash_threshold <= 1.0) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "load rehash threshold {} outside (0, 1]",
                    self.load_rehash_threshold
                ),
            )
            .into());
        }
        if self.lock_stripe_count == 0 {
            return Err(
                Error::new(ErrorKind::InvalidInput, "lock stripe count must be positive").into(),
            );
        }
        ChainMap::open_with(
            dir.as_ref(),
            self.initial_primary_file_length,
            self.load_rehash_threshold,
            self.lock_stripe_count.next_power_of_two(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_open() {
        let dir = tempfile::tempdir().unwrap();
        let map = ChainMapBuilder::default().open(dir.path()).unwrap();
        assert_eq!(map.len(), 0);
        assert!(map.table_length().is_power_of_two());
    }

    #[test]
    fn test_initial_length_rounds_to_power_of_two() {
        let dir = tempfile::tempdir().unwrap();
        let map = ChainMapBuilder::default()
            .with_initial_primary_file_length(100) // rounds up to 128 = 16 buckets
            .open(dir.path())
            .unwrap();
        assert_eq!(map.table_length(), 16);
    }

    #[test]
    fn test_invalid_threshold() {
        for threshold in [0.0, -1.0, 1.5] {
            let dir = tempfile::tempdir().unwrap();
            ChainMapBuilder::default()
                .with_load_rehash_threshold(threshold)
                .open(dir.path())
                .unwrap_err();
        }
    }

    #[test]
    fn test_zero_stripe_count() {
        let dir = tempfile::tempdir().unwrap();
        ChainMapBuilder::default()
            .with_lock_stripe_count(0)
            .open(dir.path())
            .unwrap_err();
    }

    #[test]
    fn test_stripe_count_rounds_up() {
        let dir = tempfile::tempdir().unwrap();
        let map = ChainMapBuilder::default()
            .with_lock_stripe_count(100)
            .open(dir.path())
            .unwrap();
        map.put(b"k", b"v").unwrap();
        assert_eq!(map.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
