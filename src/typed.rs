use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::chainmap::{ChainMap, ChainMapIter};
use crate::error::{ChainMapError, Result};

/// Typed view over a byte-level [`ChainMap`].
///
/// Keys and values are encoded with MessagePack via `serde`. Lookups compare
/// encoded key bytes, not decoded values, so any type whose encoding is
/// deterministic (which holds for `rmp-serde` output of a given value) works
/// as a key. The conditional operations compare encoded value bytes the same
/// way.
///
/// Every call forwards to the underlying byte map and inherits its
/// concurrency and persistence behavior.
pub struct TypedChainMap<K, V> {
    inner: ChainMap,
    phantom: PhantomData<(K, V)>,
}

impl<K, V> TypedChainMap<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned,
{
    /// Wraps a byte-level map.
    pub fn new(inner: ChainMap) -> Self {
        TypedChainMap {
            inner,
            phantom: PhantomData,
        }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = encode(key)?;
        decode_opt(self.inner.get(&key)?)
    }

    /// Inserts or overwrites; returns the previous value, if any.
    pub fn put(&self, key: &K, val: &V) -> Result<Option<V>> {
        let key = encode(key)?;
        let val = encode(val)?;
        decode_opt(self.inner.put(&key, &val)?)
    }

    pub fn put_if_absent(&self, key: &K, val: &V) -> Result<Option<V>> {
        let key = encode(key)?;
        let val = encode(val)?;
        decode_opt(self.inner.put_if_absent(&key, &val)?)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let key = encode(key)?;
        decode_opt(self.inner.remove(&key)?)
    }

    pub fn remove_if_equals(&self, key: &K, val: &V) -> Result<bool> {
        let key = encode(key)?;
        let val = encode(val)?;
        self.inner.remove_if_equals(&key, &val)
    }

    pub fn replace(&self, key: &K, val: &V) -> Result<Option<V>> {
        let key = encode(key)?;
        let val = encode(val)?;
        decode_opt(self.inner.replace(&key, &val)?)
    }

    pub fn replace_if_equals(&self, key: &K, old_val: &V, new_val: &V) -> Result<bool> {
        let key = encode(key)?;
        let old_val = encode(old_val)?;
        let new_val = encode(new_val)?;
        self.inner.replace_if_equals(&key, &old_val, &new_val)
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over decoded entries. See [`ChainMap::iter`] for the
    /// concurrency caveat.
    pub fn iter(&self) -> TypedChainMapIter<'_, K, V>
    where
        K: DeserializeOwned,
    {
        TypedChainMapIter {
            inner: self.inner.iter(),
            phantom: PhantomData,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    pub fn delete(self) -> Result<()> {
        self.inner.delete()
    }

    /// Returns the underlying byte map.
    pub fn into_inner(self) -> ChainMap {
        self.inner
    }
}

/// Iterator over decoded `(K, V)` entries of a [`TypedChainMap`].
pub struct TypedChainMapIter<'a, K, V> {
    inner: ChainMapIter<'a>,
    phantom: PhantomData<(K, V)>,
}

impl<K, V> Iterator for TypedChainMapIter<'_, K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, val) = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        Some(decode(&key).and_then(|k| decode(&val).map(|v| (k, v))))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| ChainMapError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| ChainMapError::Serialization(e.to_string()))
}

fn decode_opt<T: DeserializeOwned>(data: Option<Vec<u8>>) -> Result<Option<T>> {
    match data {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}
