use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{ChainMapError, Result};
use crate::hasher::hash_key;
use crate::mapper::FileMapper;
use crate::record::RecordNode;
use crate::stripe::LockStripe;

const PRIMARY_FILE: &str = "primary";
const SECONDARY_FILE: &str = "secondary";

const PRIMARY_SLOT_LEN: u64 = 8;

/// Reserved prefix of the secondary file; records start past it.
const SECONDARY_HEADER_LEN: u64 = 64;
const HDR_SIZE: u64 = 0;
const HDR_TABLE_LENGTH: u64 = 8;
const HDR_WRITE_POS: u64 = 16;
const HDR_REHASH_COMPLETE: u64 = 24;

/// Bucket count on a fresh map when no initial primary length is configured.
const DEFAULT_TABLE_LENGTH: u64 = 256;
const MIN_SECONDARY_LEN: u64 = 1 << 16;

/// Layout of the packed table state word.
///
/// The table length, the rehash-active flag and the rehash claim cursor share
/// one atomic: an operation then always observes a consistent (length, flag)
/// pair — a torn view could route a mutation to a bucket nobody has split —
/// and a cursor claim can never be applied to a later table generation,
/// because the claim and the generation are read by one atomic add.
///
/// ```text
/// bit  0        rehash-active flag
/// bits 1..32    table length (buckets)
/// bits 32..64   next old-table bucket to claim for splitting
/// ```
const CURSOR_SHIFT: u32 = 32;
const TABLE_LEN_MASK: u64 = (1 << 31) - 1;

fn pack_state(table_len: u64, rehashing: bool) -> u64 {
    debug_assert!(table_len <= TABLE_LEN_MASK);
    (table_len << 1) | rehashing as u64
}

/// Returns `(table_len, old_len)`; `old_len` is 0 when the table is steady.
fn unpack_state(state: u64) -> (u64, u64) {
    let table_len = (state >> 1) & TABLE_LEN_MASK;
    let old_len = if state & 1 == 1 { table_len >> 1 } else { 0 };
    (table_len, old_len)
}

/// A persistent, concurrent hash map from byte strings to byte strings.
///
/// Storage is two memory-mapped files inside a base directory: `primary`
/// holds one 8-byte slot per bucket (the offset of its chain head, 0 when
/// empty) and `secondary` holds a small header followed by variable-size
/// record nodes forming per-bucket collision chains. Records are append-only;
/// updates write a fresh node and relink the chain, leaving the old node as
/// unreachable garbage.
///
/// All operations take `&self` and may be called from many threads; each one
/// holds at most one of a fixed set of stripe monitors, selected by the low
/// bits of the key hash. When the load factor passes the configured
/// threshold the table doubles, and every subsequent mutation splits one old
/// bucket's chain into its two successors until the rehash completes.
///
/// Durability is best-effort through the page cache: a map that is dropped or
/// [`close`](Self::close)d cleanly reopens with its exact contents, but there
/// is no write-ahead log and no fsync protocol.
///
/// ```
/// use chainmap::ChainMap;
///
/// # fn main() -> chainmap::Result<()> {
/// # let dir = tempfile::tempdir().unwrap();
/// let map = ChainMap::open(dir.path())?;
/// assert_eq!(map.put(b"apple", b"red")?, None);
/// assert_eq!(map.get(b"apple")?, Some(b"red".to_vec()));
/// assert_eq!(map.remove(b"apple")?, Some(b"red".to_vec()));
/// assert_eq!(map.len(), 0);
/// # Ok(())
/// # }
/// ```
impl std::fmt::Debug for ChainMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainMap").field("dir", &self.dir).finish()
    }
}

pub struct ChainMap {
    dir: PathBuf,
    primary: FileMapper,
    secondary: FileMapper,
    stripes: LockStripe,
    load_rehash_threshold: f64,

    // In-memory mirrors of the secondary header; each slot is rewritten when
    // its counter changes and again on flush/close.
    size: AtomicU64,
    write_pos: AtomicU64,
    state: AtomicU64,
    rehash_complete: AtomicU64,

    /// Serializes table doubling.
    rehash_begin: Mutex<()>,
    poisoned: AtomicBool,
}

impl ChainMap {
    /// Opens (or creates) the map stored in `dir` with default configuration.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        crate::ChainMapBuilder::default().open(dir)
    }

    pub(crate) fn open_with(
        dir: &Path,
        initial_primary_file_length: u64,
        load_rehash_threshold: f64,
        lock_stripe_count: usize,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let initial_primary = if initial_primary_file_length == 0 {
            DEFAULT_TABLE_LENGTH * PRIMARY_SLOT_LEN
        } else {
            // Rounded up to a power of two, never smaller than one slot.
            initial_primary_file_length
                .next_power_of_two()
                .max(PRIMARY_SLOT_LEN)
        };
        let primary = FileMapper::open(&dir.join(PRIMARY_FILE), initial_primary)?;
        let secondary = FileMapper::open(&dir.join(SECONDARY_FILE), MIN_SECONDARY_LEN)?;

        let size = secondary.get_u64(HDR_SIZE)?;
        let mut table_len = secondary.get_u64(HDR_TABLE_LENGTH)?;
        let mut write_pos = secondary.get_u64(HDR_WRITE_POS)?;
        let mut rehash_complete = secondary.get_u64(HDR_REHASH_COMPLETE)?;

        // First open (or a map that never reached a header write): derive the
        // table length from the primary file and start records past the
        // header.
        if table_len == 0 {
            table_len = primary.len() / PRIMARY_SLOT_LEN;
        }
        if write_pos == 0 {
            write_pos = SECONDARY_HEADER_LEN;
        }

        if !table_len.is_power_of_two() {
            return Err(ChainMapError::Corruption(format!(
                "table length {table_len} is not a power of two"
            )));
        }
        if write_pos < SECONDARY_HEADER_LEN || write_pos > secondary.len() {
            return Err(ChainMapError::Corruption(format!(
                "secondary write position {write_pos} outside file of {} bytes",
                secondary.len()
            )));
        }
        let old_len = table_len / 2;
        if rehash_complete > old_len {
            return Err(ChainMapError::Corruption(format!(
                "rehash progress {rehash_complete} exceeds old table length {old_len}"
            )));
        }
        if rehash_complete == old_len {
            // Every bucket was split but the header clear never landed; the
            // table is effectively steady.
            rehash_complete = 0;
        }
        let rehashing = rehash_complete > 0;
        // A crash between the doubling and its header write can leave the
        // bucket table shorter than the header claims.
        if primary.len() < table_len * PRIMARY_SLOT_LEN {
            primary.grow(table_len * PRIMARY_SLOT_LEN)?;
        }

        let stripe_count = lock_stripe_count.min(table_len as usize);
        let map = ChainMap {
            dir: dir.to_path_buf(),
            primary,
            secondary,
            stripes: LockStripe::new(stripe_count),
            load_rehash_threshold,
            size: AtomicU64::new(size),
            write_pos: AtomicU64::new(write_pos),
            // On a mid-rehash reopen, claims resume at the first bucket the
            // previous run had not completed.
            state: AtomicU64::new(
                pack_state(table_len, rehashing) | (rehash_complete << CURSOR_SHIFT),
            ),
            rehash_complete: AtomicU64::new(rehash_complete),
            rehash_begin: Mutex::new(()),
            poisoned: AtomicBool::new(false),
        };
        map.write_header()?;

        if rehashing {
            // Finish the interrupted split before accepting operations.
            tracing::info!(
                table_length = table_len,
                resumed_at = rehash_complete,
                "resuming interrupted rehash"
            );
            while map.step_rehash()? {}
        }

        tracing::info!(
            path = %map.dir.display(),
            entries = map.len(),
            table_length = map.table_length(),
            "opened map"
        );
        Ok(map)
    }

    /// Number of entries currently mapped.
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of buckets.
    pub fn table_length(&self) -> u64 {
        unpack_state(self.state.load(Ordering::Acquire)).0
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        let hash = hash_key(key);
        let _guard = self.stripes.for_hash(hash).lock();

        let (table_len, old_len) = unpack_state(self.state.load(Ordering::Acquire));
        let idx = hash & (table_len - 1);
        if let Some(val) = self.find_in_bucket(idx, hash, key)? {
            return Ok(Some(val));
        }
        // Mid-rehash this bucket may not have been split yet, in which case
        // the record is still chained under its pre-doubling bucket. Reads
        // never split; they just look in both places.
        if old_len != 0 {
            let src = hash & (old_len - 1);
            if src != idx {
                return self.find_in_bucket(src, hash, key);
            }
        }
        Ok(None)
    }

    /// Inserts or overwrites the mapping for `key` and returns the previous
    /// value, if any.
    ///
    /// Space for the new record is reserved before the stripe lock is taken;
    /// a put that turns out to overwrite strands the replaced record and, in
    /// the rare racy case, nothing else ever points at the reservation. Both
    /// become unreachable garbage, which this format accepts.
    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        self.advance_rehash()?;

        let hash = hash_key(key);
        let mut node = RecordNode::new(hash, key.to_vec(), val.to_vec());
        let insert_pos = self.allocate(node.size())?;

        let _guard = self.stripes.for_hash(hash).lock();
        let table_len = self.split_own_bucket(hash)?;
        let idx = hash & (table_len - 1);
        let slot = idx * PRIMARY_SLOT_LEN;

        let head = self.primary.get_u64(slot)?;
        if head == 0 {
            node.write(&self.secondary, insert_pos)?;
            self.primary.put_u64(slot, insert_pos)?;
            self.add_size(1)?;
            return Ok(None);
        }

        let mut prev: Option<RecordNode> = None;
        let mut cur = self.record_at(head)?;
        loop {
            if cur.key_equals(hash, key) {
                // Value replace: splice a fresh node in where the old one was.
                node.next = cur.next;
                node.write(&self.secondary, insert_pos)?;
                match prev.as_mut() {
                    None => self.primary.put_u64(slot, insert_pos)?,
                    Some(p) => p.set_next(&self.secondary, insert_pos)?,
                }
                return Ok(Some(cur.val));
            }
            if cur.next != 0 {
                let next = self.record_at(cur.next)?;
                prev = Some(cur);
                cur = next;
            } else {
                node.write(&self.secondary, insert_pos)?;
                cur.set_next(&self.secondary, insert_pos)?;
                self.add_size(1)?;
                return Ok(None);
            }
        }
    }

    /// Inserts the mapping only when `key` is absent. Returns the existing
    /// value otherwise.
    pub fn put_if_absent(&self, key: &[u8], val: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        self.advance_rehash()?;

        let hash = hash_key(key);
        let _guard = self.stripes.for_hash(hash).lock();
        let table_len = self.split_own_bucket(hash)?;
        let idx = hash & (table_len - 1);
        let slot = idx * PRIMARY_SLOT_LEN;

        let head = self.primary.get_u64(slot)?;
        if head == 0 {
            let mut node = RecordNode::new(hash, key.to_vec(), val.to_vec());
            let insert_pos = self.allocate(node.size())?;
            node.write(&self.secondary, insert_pos)?;
            self.primary.put_u64(slot, insert_pos)?;
            self.add_size(1)?;
            return Ok(None);
        }

        let mut cur = self.record_at(head)?;
        loop {
            if cur.key_equals(hash, key) {
                return Ok(Some(cur.val));
            }
            if cur.next != 0 {
                cur = self.record_at(cur.next)?;
            } else {
                let mut node = RecordNode::new(hash, key.to_vec(), val.to_vec());
                let insert_pos = self.allocate(node.size())?;
                node.write(&self.secondary, insert_pos)?;
                cur.set_next(&self.secondary, insert_pos)?;
                self.add_size(1)?;
                return Ok(None);
            }
        }
    }

    /// Removes the mapping for `key` and returns its value, if any.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        self.advance_rehash()?;

        let hash = hash_key(key);
        let _guard = self.stripes.for_hash(hash).lock();
        let table_len = self.split_own_bucket(hash)?;
        let idx = hash & (table_len - 1);
        let slot = idx * PRIMARY_SLOT_LEN;

        let head = self.primary.get_u64(slot)?;
        if head == 0 {
            return Ok(None);
        }

        let mut prev: Option<RecordNode> = None;
        let mut cur = self.record_at(head)?;
        loop {
            if cur.key_equals(hash, key) {
                match prev.as_mut() {
                    None => self.primary.put_u64(slot, cur.next)?,
                    Some(p) => p.set_next(&self.secondary, cur.next)?,
                }
                self.sub_size(1)?;
                return Ok(Some(cur.val));
            }
            if cur.next == 0 {
                return Ok(None);
            }
            let next = self.record_at(cur.next)?;
            prev = Some(cur);
            cur = next;
        }
    }

    /// Removes the mapping only when it currently equals `val`. Returns
    /// whether a removal happened.
    pub fn remove_if_equals(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        self.check_poisoned()?;
        self.advance_rehash()?;

        let hash = hash_key(key);
        let _guard = self.stripes.for_hash(hash).lock();
        let table_len = self.split_own_bucket(hash)?;
        let idx = hash & (table_len - 1);
        let slot = idx * PRIMARY_SLOT_LEN;

        let head = self.primary.get_u64(slot)?;
        if head == 0 {
            return Ok(false);
        }

        let mut prev: Option<RecordNode> = None;
        let mut cur = self.record_at(head)?;
        loop {
            if cur.key_equals(hash, key) && cur.val == val {
                match prev.as_mut() {
                    None => self.primary.put_u64(slot, cur.next)?,
                    Some(p) => p.set_next(&self.secondary, cur.next)?,
                }
                self.sub_size(1)?;
                return Ok(true);
            }
            if cur.next == 0 {
                return Ok(false);
            }
            let next = self.record_at(cur.next)?;
            prev = Some(cur);
            cur = next;
        }
    }

    /// Replaces the value for `key` only when a mapping exists. Returns the
    /// previous value, if any. Nothing is allocated for absent keys.
    pub fn replace(&self, key: &[u8], val: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_poisoned()?;
        self.advance_rehash()?;

        let hash = hash_key(key);
        let _guard = self.stripes.for_hash(hash).lock();
        let table_len = self.split_own_bucket(hash)?;
        let idx = hash & (table_len - 1);
        let slot = idx * PRIMARY_SLOT_LEN;

        let head = self.primary.get_u64(slot)?;
        if head == 0 {
            return Ok(None);
        }

        let mut prev: Option<RecordNode> = None;
        let mut cur = self.record_at(head)?;
        loop {
            if cur.key_equals(hash, key) {
                let mut node = RecordNode::new(hash, key.to_vec(), val.to_vec());
                node.next = cur.next;
                let insert_pos = self.allocate(node.size())?;
                node.write(&self.secondary, insert_pos)?;
                match prev.as_mut() {
                    None => self.primary.put_u64(slot, insert_pos)?,
                    Some(p) => p.set_next(&self.secondary, insert_pos)?,
                }
                return Ok(Some(cur.val));
            }
            if cur.next == 0 {
                return Ok(None);
            }
            let next = self.record_at(cur.next)?;
            prev = Some(cur);
            cur = next;
        }
    }

    /// Replaces the value for `key` only when it currently equals `old_val`.
    /// Returns whether the replacement happened.
    pub fn replace_if_equals(&self, key: &[u8], old_val: &[u8], new_val: &[u8]) -> Result<bool> {
        self.check_poisoned()?;
        self.advance_rehash()?;

        let hash = hash_key(key);
        let _guard = self.stripes.for_hash(hash).lock();
        let table_len = self.split_own_bucket(hash)?;
        let idx = hash & (table_len - 1);
        let slot = idx * PRIMARY_SLOT_LEN;

        let head = self.primary.get_u64(slot)?;
        if head == 0 {
            return Ok(false);
        }

        let mut prev: Option<RecordNode> = None;
        let mut cur = self.record_at(head)?;
        loop {
            if cur.key_equals(hash, key) && cur.val == old_val {
                let mut node = RecordNode::new(hash, key.to_vec(), new_val.to_vec());
                node.next = cur.next;
                let insert_pos = self.allocate(node.size())?;
                node.write(&self.secondary, insert_pos)?;
                match prev.as_mut() {
                    None => self.primary.put_u64(slot, insert_pos)?,
                    Some(p) => p.set_next(&self.secondary, insert_pos)?,
                }
                return Ok(true);
            }
            if cur.next == 0 {
                return Ok(false);
            }
            let next = self.record_at(cur.next)?;
            prev = Some(cur);
            cur = next;
        }
    }

    /// Returns an iterator over all entries.
    ///
    /// The iterator takes no locks; run it only while no mutation is in
    /// flight. Records are never rewritten in place, so each produced pair
    /// was valid at some earlier moment even when this is violated.
    pub fn iter(&self) -> ChainMapIter<'_> {
        ChainMapIter {
            map: self,
            table_len: self.table_length(),
            next_idx: 0,
            next_pos: 0,
            started: false,
            finished: false,
        }
    }

    /// Writes the header back and syncs both files to disk.
    pub fn flush(&self) -> Result<()> {
        self.write_header()?;
        self.primary.flush()?;
        self.secondary.flush()
    }

    /// Flushes and unmaps the files.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    /// Closes the map and deletes its two files.
    pub fn delete(self) -> Result<()> {
        let primary = self.dir.join(PRIMARY_FILE);
        let secondary = self.dir.join(SECONDARY_FILE);
        drop(self);
        fs::remove_file(primary)?;
        fs::remove_file(secondary)?;
        Ok(())
    }

    fn find_in_bucket(&self, idx: u64, hash: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut pos = self.primary.get_u64(idx * PRIMARY_SLOT_LEN)?;
        while pos != 0 {
            let node = self.record_at(pos)?;
            if node.key_equals(hash, key) {
                return Ok(Some(node.val));
            }
            pos = node.next;
        }
        Ok(None)
    }

    /// Reads the record at `pos` after validating that it lies inside the
    /// allocated region of the secondary file.
    fn record_at(&self, pos: u64) -> Result<RecordNode> {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        if pos < SECONDARY_HEADER_LEN || pos >= write_pos {
            self.poisoned.store(true, Ordering::Release);
            return Err(ChainMapError::Corruption(format!(
                "chain pointer {pos} outside record region [{SECONDARY_HEADER_LEN}, {write_pos})"
            )));
        }
        RecordNode::read(&self.secondary, pos)
    }

    /// Reserves `len` bytes of the secondary file, growing it when the bump
    /// cursor passes the mapped length. Runs outside any stripe lock; the
    /// reserved region stays unreachable until a chain pointer to it is
    /// published under one.
    fn allocate(&self, len: u64) -> Result<u64> {
        let pos = self.write_pos.fetch_add(len, Ordering::AcqRel);
        let end = pos + len;
        if end > self.secondary.len() {
            self.secondary
                .grow(end.next_power_of_two().max(MIN_SECONDARY_LEN))?;
            tracing::debug!(len = self.secondary.len(), "grew secondary file");
        }
        self.secondary.put_u64(HDR_WRITE_POS, end)?;
        Ok(pos)
    }

    fn add_size(&self, n: u64) -> Result<()> {
        let new = self.size.fetch_add(n, Ordering::AcqRel) + n;
        self.secondary.put_u64(HDR_SIZE, new)
    }

    fn sub_size(&self, n: u64) -> Result<()> {
        let new = self.size.fetch_sub(n, Ordering::AcqRel) - n;
        self.secondary.put_u64(HDR_SIZE, new)
    }

    fn load(&self) -> f64 {
        self.len() as f64 / self.table_length() as f64
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(ChainMapError::Corruption(
                "map refused: an earlier operation detected corruption".into(),
            ));
        }
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let (table_len, old_len) = unpack_state(self.state.load(Ordering::Acquire));
        self.secondary
            .put_u64(HDR_SIZE, self.size.load(Ordering::Acquire))?;
        self.secondary.put_u64(HDR_TABLE_LENGTH, table_len)?;
        self.secondary
            .put_u64(HDR_WRITE_POS, self.write_pos.load(Ordering::Acquire))?;
        let complete = if old_len != 0 {
            self.rehash_complete.load(Ordering::Acquire)
        } else {
            0
        };
        self.secondary.put_u64(HDR_REHASH_COMPLETE, complete)
    }

    // ---- incremental rehash ----------------------------------------------

    /// Amortized rehash participation, called by every mutating operation
    /// before it takes its stripe lock: perform one bucket's worth of split
    /// work, or start a doubling when the load factor demands one.
    fn advance_rehash(&self) -> Result<()> {
        let (table_len, old_len) = unpack_state(self.state.load(Ordering::Acquire));
        if old_len != 0 {
            self.step_rehash()?;
        } else if self.load() > self.load_rehash_threshold {
            self.begin_rehash(table_len)?;
            self.step_rehash()?;
        }
        Ok(())
    }

    /// Doubles the table: grows the primary file (new slots are zero-filled)
    /// and publishes the new length with the rehash flag set.
    fn begin_rehash(&self, expected_len: u64) -> Result<()> {
        let _guard = self.rehash_begin.lock();
        // Another mutator may have started or even finished a doubling while
        // we waited for the lock.
        let (table_len, old_len) = unpack_state(self.state.load(Ordering::Acquire));
        if old_len != 0 || table_len != expected_len || self.load() <= self.load_rehash_threshold {
            return Ok(());
        }

        let new_len = table_len * 2;
        self.primary.grow(new_len * PRIMARY_SLOT_LEN)?;
        self.rehash_complete.store(0, Ordering::Release);
        // Publishing the packed state resets the claim cursor to zero.
        self.state.store(pack_state(new_len, true), Ordering::Release);
        self.secondary.put_u64(HDR_TABLE_LENGTH, new_len)?;
        tracing::info!(
            old_length = table_len,
            new_length = new_len,
            entries = self.len(),
            "table doubling started"
        );
        Ok(())
    }

    /// Claims the next unsplit bucket and splits it. Returns false when no
    /// rehash is active or every bucket has already been claimed.
    ///
    /// Only cursor-claimed splits advance `rehash_complete`; buckets a
    /// mutator splits out of turn via [`split_own_bucket`] are re-claimed
    /// here as no-ops, so the counter reaches the old length exactly once.
    fn step_rehash(&self) -> Result<bool> {
        // One atomic add yields both the claim and the generation it belongs
        // to. A bump observed against a steady table is discarded; the next
        // doubling resets the cursor bits.
        let prior = self.state.fetch_add(1 << CURSOR_SHIFT, Ordering::AcqRel);
        let (_, old_len) = unpack_state(prior);
        if old_len == 0 {
            return Ok(false);
        }
        let idx = prior >> CURSOR_SHIFT;
        if idx >= old_len {
            return Ok(false);
        }
        {
            let _guard = self.stripes.for_index(idx).lock();
            self.split_bucket(idx, old_len)?;
        }
        let done = self.rehash_complete.fetch_add(1, Ordering::AcqRel) + 1;
        self.secondary.put_u64(HDR_REHASH_COMPLETE, done)?;
        if done == old_len {
            self.rehash_complete.store(0, Ordering::Release);
            self.state
                .store(pack_state(old_len * 2, false), Ordering::Release);
            self.secondary.put_u64(HDR_REHASH_COMPLETE, 0)?;
            tracing::info!(table_length = old_len * 2, "rehash complete");
        }
        Ok(true)
    }

    /// Restores the bucket invariant for this hash before a mutation while a
    /// rehash is in flight: the chain a mutator is about to edit must already
    /// live under the doubled table. Must be called under the stripe lock for
    /// `hash`; returns the table length to index with.
    fn split_own_bucket(&self, hash: u64) -> Result<u64> {
        let (table_len, old_len) = unpack_state(self.state.load(Ordering::Acquire));
        if old_len != 0 {
            self.split_bucket(hash & (old_len - 1), old_len)?;
        }
        Ok(table_len)
    }

    /// Splits bucket `idx`'s chain between `idx` and `idx + old_len` against
    /// the doubled table, rewriting next pointers only. The caller must hold
    /// the stripe monitor for `idx`, which also guards the partner bucket.
    ///
    /// Safe to repeat for an already-split bucket: every record then lands on
    /// the keep side, and the partner slot — only written when something
    /// moves — is left alone.
    fn split_bucket(&self, idx: u64, old_len: u64) -> Result<()> {
        let head = self.primary.get_u64(idx * PRIMARY_SLOT_LEN)?;
        if head == 0 {
            return Ok(());
        }
        let new_mask = old_len * 2 - 1;
        let move_idx = idx + old_len;

        let mut keep = Vec::new();
        let mut moved = Vec::new();
        let mut pos = head;
        while pos != 0 {
            let node = self.record_at(pos)?;
            let target = node.hash & new_mask;
            pos = node.next;
            if target == idx {
                keep.push(node);
            } else if target == move_idx {
                moved.push(node);
            } else {
                self.poisoned.store(true, Ordering::Release);
                return Err(ChainMapError::Corruption(format!(
                    "record at {} maps to bucket {target} while splitting {idx} (table length {})",
                    node.pos,
                    old_len * 2
                )));
            }
        }

        let keep_head = self.relink(&mut keep)?;
        self.primary.put_u64(idx * PRIMARY_SLOT_LEN, keep_head)?;
        if !moved.is_empty() {
            let move_head = self.relink(&mut moved)?;
            self.primary
                .put_u64(move_idx * PRIMARY_SLOT_LEN, move_head)?;
        }
        Ok(())
    }

    /// Points each node at its successor and terminates the chain. Returns
    /// the head position, or 0 for an empty list.
    fn relink(&self, nodes: &mut [RecordNode]) -> Result<u64> {
        for i in 0..nodes.len() {
            let next = if i + 1 < nodes.len() { nodes[i + 1].pos } else { 0 };
            nodes[i].set_next(&self.secondary, next)?;
        }
        Ok(nodes.first().map_or(0, |n| n.pos))
    }
}

impl Drop for ChainMap {
    fn drop(&mut self) {
        // Best-effort: a cleanly dropped map must reopen with exact contents.
        let _ = self.write_header();
        let _ = self.primary.flush();
        let _ = self.secondary.flush();
    }
}

/// Iterator over all `(key, value)` entries of a [`ChainMap`].
///
/// Walks the bucket table in index order and each chain in link order.
/// Created by [`ChainMap::iter`]; see the concurrency caveat there.
pub struct ChainMapIter<'a> {
    map: &'a ChainMap,
    table_len: u64,
    next_idx: u64,
    next_pos: u64,
    started: bool,
    finished: bool,
}

impl ChainMapIter<'_> {
    /// Positions `next_pos` at the head of the first non-empty bucket at or
    /// after `next_idx`.
    fn seek_bucket(&mut self) -> Result<()> {
        self.finished = true;
        while self.next_idx < self.table_len {
            let pos = self.map.primary.get_u64(self.next_idx * PRIMARY_SLOT_LEN)?;
            if pos != 0 {
                self.next_pos = pos;
                self.finished = false;
                return Ok(());
            }
            self.next_idx += 1;
        }
        Ok(())
    }

    fn advance(&mut self, node: &RecordNode) -> Result<()> {
        if node.next != 0 {
            self.next_pos = node.next;
            return Ok(());
        }
        self.next_idx += 1;
        self.seek_bucket()
    }
}

impl Iterator for ChainMapIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if let Err(e) = self.seek_bucket() {
                return Some(Err(e));
            }
        }
        if self.finished {
            return None;
        }
        let node = match self.map.record_at(self.next_pos) {
            Ok(node) => node,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        if let Err(e) = self.advance(&node) {
            self.finished = true;
            return Some(Err(e));
        }
        Some(Ok((node.key, node.val)))
    }
}

#[cfg(test)]
impl ChainMap {
    /// Drives an in-flight rehash to completion. Rehashing only advances with
    /// mutations, so tests that stop writing mid-rehash drain it explicitly
    /// before checking invariants.
    pub(crate) fn finish_pending_rehash(&self) {
        while self.step_rehash().unwrap() {}
    }

    /// Walks every chain and asserts the structural invariants: containment
    /// of chain pointers, per-bucket hash residue, no cycles, key uniqueness
    /// and the size law. Requires a steady table.
    pub(crate) fn check_invariants(&self) {
        let (table_len, old_len) = unpack_state(self.state.load(Ordering::Acquire));
        assert_eq!(old_len, 0, "invariant check requires a steady table");
        let mask = table_len - 1;
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let max_records = write_pos / crate::record::RECORD_FIXED_LEN;

        let mut count = 0u64;
        for idx in 0..table_len {
            let mut keys = std::collections::HashSet::new();
            let mut steps = 0u64;
            let mut pos = self.primary.get_u64(idx * PRIMARY_SLOT_LEN).unwrap();
            while pos != 0 {
                assert!(
                    pos >= SECONDARY_HEADER_LEN && pos < write_pos,
                    "chain pointer {pos} out of range in bucket {idx}"
                );
                let node = RecordNode::read(&self.secondary, pos).unwrap();
                assert_eq!(node.hash & mask, idx, "record hashed to wrong bucket");
                assert!(keys.insert(node.key.clone()), "duplicate key in bucket {idx}");
                steps += 1;
                assert!(steps <= max_records, "cycle in bucket {idx}");
                count += 1;
                pos = node.next;
            }
        }
        assert_eq!(count, self.len(), "size does not match reachable records");
    }
}
