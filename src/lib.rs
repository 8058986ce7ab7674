//! Persistent, concurrent key-value maps backed by memory-mapped files.
//!
//! The `chainmap` crate stores a hash map from opaque byte strings to opaque
//! byte strings in two files: a fixed-width bucket table indexed by key hash
//! and an append-only record file whose variable-size nodes form per-bucket
//! collision chains. Readers and writers from many threads coordinate through
//! striped locks, the table doubles incrementally as the load factor grows,
//! and a cleanly closed map reopens with its exact contents.
//!
//! Typical usage opens a [`ChainMap`] (or a [`TypedChainMap`] for serde
//! keys and values) against a base directory and calls the usual map
//! operations on it.
//!
//! ```
//! use chainmap::ChainMap;
//!
//! # fn main() -> chainmap::Result<()> {
//! # let dir = tempfile::tempdir().unwrap();
//! let map = ChainMap::open(dir.path())?;
//! map.put(b"apple", b"1")?;
//! map.put(b"banana", b"2")?;
//! assert_eq!(map.get(b"banana")?, Some(b"2".to_vec()));
//! assert_eq!(map.get(b"cherry")?, None);
//! assert_eq!(map.len(), 2);
//! # Ok(())
//! # }
//! ```

mod builder;
pub use builder::ChainMapBuilder;

mod chainmap;
pub use chainmap::{ChainMap, ChainMapIter};

mod error;
pub use error::{ChainMapError, Result};

mod hasher;
mod mapper;
mod record;
mod stripe;

mod typed;
pub use typed::{TypedChainMap, TypedChainMapIter};
