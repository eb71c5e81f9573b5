use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::mem;
use std::sync::{Mutex, MutexGuard};

use crate::raw::chain::ChainTable;
use crate::raw::{check_unmodified, Geometry};

const DEFAULT_CAPACITY: usize = 11;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// A chained hash table with value-equality keys and a table-wide lock.
///
/// Every operation takes `&self` and holds a single mutex for its duration,
/// so a shared `SyncTable` can be used from many threads without external
/// locking. Reads hand out owned values (`V: Clone`); callers wanting cheap
/// shared values store an `Arc<T>`.
///
/// This is the legacy configuration of the engine: the bucket array may
/// have any positive length, indexing is by modulo of the raw hash with no
/// diffusion step, and growth goes to `2n + 1` buckets. At the historical
/// capacity ceiling growth stops silently and lookups degrade to chain
/// scans rather than failing.
///
/// The lock is not re-entrant: callbacks passed to [`for_each`],
/// [`retain`], [`update`] and friends must not touch the table, or the
/// calling thread deadlocks.
///
/// [`for_each`]: SyncTable::for_each
/// [`retain`]: SyncTable::retain
/// [`update`]: SyncTable::update
///
/// # Examples
///
/// ```
/// use loquat::SyncTable;
///
/// let table = SyncTable::new();
/// table.insert("alpha", 1);
/// table.insert("beta", 2);
///
/// assert_eq!(table.get(&"alpha"), Some(1));
/// assert_eq!(table.len(), 2);
/// ```
pub struct SyncTable<K, V, S = RandomState> {
    core: Mutex<ChainTable<K, V>>,
    hasher: S,
}

/// A builder for a [`SyncTable`].
///
/// # Examples
///
/// ```
/// use loquat::SyncTable;
/// use std::collections::hash_map::RandomState;
///
/// let table: SyncTable<String, u32> = SyncTable::builder()
///     // Set the initial capacity.
///     .capacity(128)
///     // Set the load factor.
///     .load_factor(0.9)
///     // Set the hasher.
///     .hasher(RandomState::new())
///     // Construct the table.
///     .build();
/// ```
pub struct SyncTableBuilder<K, V, S = RandomState> {
    capacity: usize,
    load_factor: f32,
    hasher: S,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> SyncTableBuilder<K, V> {
    /// Set the hash builder used to hash keys.
    pub fn hasher<S>(self, hasher: S) -> SyncTableBuilder<K, V, S> {
        SyncTableBuilder {
            capacity: self.capacity,
            load_factor: self.load_factor,
            hasher,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> SyncTableBuilder<K, V, S> {
    /// Set the initial capacity of the table. Any positive length is kept
    /// as-is; it is not rounded to a power of two.
    pub fn capacity(self, capacity: usize) -> SyncTableBuilder<K, V, S> {
        SyncTableBuilder { capacity, ..self }
    }

    /// Set the load factor.
    ///
    /// # Panics
    ///
    /// `build` panics if the load factor is not positive and finite.
    pub fn load_factor(self, load_factor: f32) -> SyncTableBuilder<K, V, S> {
        SyncTableBuilder { load_factor, ..self }
    }

    /// Construct the table.
    pub fn build(self) -> SyncTable<K, V, S> {
        SyncTable {
            core: Mutex::new(ChainTable::new(
                Geometry::Legacy,
                self.capacity,
                self.load_factor,
            )),
            hasher: self.hasher,
        }
    }
}

impl<K, V> SyncTable<K, V> {
    /// Creates an empty `SyncTable` with the default capacity (11) and load
    /// factor (0.75).
    pub fn new() -> SyncTable<K, V> {
        SyncTable::builder().build()
    }

    /// Creates an empty `SyncTable` with the given bucket count.
    pub fn with_capacity(capacity: usize) -> SyncTable<K, V> {
        SyncTable::builder().capacity(capacity).build()
    }

    /// Returns a builder for a `SyncTable`.
    pub fn builder() -> SyncTableBuilder<K, V> {
        SyncTableBuilder {
            capacity: DEFAULT_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            hasher: RandomState::new(),
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> SyncTable<K, V, S> {
    /// Creates an empty `SyncTable` using `hasher` to hash keys.
    pub fn with_hasher(hasher: S) -> SyncTable<K, V, S> {
        SyncTable::with_capacity_and_hasher(DEFAULT_CAPACITY, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> SyncTable<K, V, S> {
        SyncTable {
            core: Mutex::new(ChainTable::new(
                Geometry::Legacy,
                capacity,
                DEFAULT_LOAD_FACTOR,
            )),
            hasher,
        }
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, ChainTable<K, V>> {
        self.core.lock().unwrap()
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.core().len
    }

    /// Returns `true` if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of buckets.
    pub fn capacity(&self) -> usize {
        self.core().capacity()
    }

    /// Removes every entry. Keeps the current capacity.
    pub fn clear(&self) {
        self.core().clear();
    }

    /// Returns `true` if any entry's value compares equal to `value`.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let core = self.core();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                if node.value == *value {
                    return true;
                }
                cur = node.next.as_deref();
            }
        }
        false
    }

    /// Calls `f` for every entry, under the lock.
    ///
    /// `f` must not touch the table; the lock is not re-entrant.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let core = self.core();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                f(&node.key, &node.value);
                cur = node.next.as_deref();
            }
        }
    }

    /// Replaces every value with the result of `f`, in place.
    ///
    /// `f` must not touch the table; the lock is not re-entrant.
    pub fn replace_all(&self, mut f: impl FnMut(&K, &mut V)) {
        let mut core = self.core();
        for head in core.buckets.iter_mut() {
            let mut cur = head.as_deref_mut();
            while let Some(node) = cur {
                f(&node.key, &mut node.value);
                cur = node.next.as_deref_mut();
            }
        }
    }

    /// Keeps only the entries for which `f` returns `true`.
    ///
    /// `f` must not touch the table; the lock is not re-entrant.
    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) {
        self.core().retain(f);
    }

    /// An iterator yielding owned `(K, V)` clones.
    ///
    /// The iterator locks the table per step, not for its whole lifetime,
    /// so the table stays usable while iterating. It is fail-fast: if the
    /// table is structurally modified between steps, the next step panics
    /// rather than yield possibly-corrupt data. This detection is a
    /// best-effort debugging aid, not a synchronization mechanism.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        let expected = self.core().mod_count;
        Iter {
            table: self,
            bucket: 0,
            depth: 0,
            expected,
            last: None,
        }
    }

    /// An iterator over owned clones of the keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    /// An iterator over owned clones of the values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }

    /// A traversal cursor over the bucket range that can be split in half
    /// for bulk traversal.
    ///
    /// Unlike [`iter`](SyncTable::iter), the cursor validates the
    /// structural counter once, at exhaustion: a bulk traversal that raced
    /// a structural modification panics at the end rather than mid-way.
    pub fn split_iter(&self) -> SplitIter<'_, K, V, S> {
        let core = self.core();
        SplitIter {
            table: self,
            bucket: 0,
            depth: 0,
            fence: core.capacity(),
            expected: core.mod_count,
            done: false,
        }
    }
}

impl<K, V, S> SyncTable<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hasher.hash_one(key)
    }

    /// Returns `true` if the table contains the key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.core().find(hash, |k| k.borrow() == key).is_some()
    }

    /// Returns a clone of the value for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hash = self.hash(key);
        self.core()
            .find(hash, |k| k.borrow() == key)
            .map(|node| node.value.clone())
    }

    /// Returns clones of the stored key and value for `key`.
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q> + Clone,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hash = self.hash(key);
        self.core()
            .find(hash, |k| k.borrow() == key)
            .map(|node| (node.key.clone(), node.value.clone()))
    }

    /// Inserts the pair, returning the previous value if the key was
    /// present. Replacing a value is not a structural modification.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let hash = self.hash(&key);
        self.core().insert(hash, key, value, |a, b| a == b)
    }

    /// Inserts the pair only if the key is absent.
    ///
    /// On an occupied key, returns the current value and hands the
    /// not-inserted one back.
    pub fn try_insert(&self, key: K, value: V) -> Result<(), OccupiedError<V>>
    where
        V: Clone,
    {
        let hash = self.hash(&key);
        let mut core = self.core();
        if let Some(node) = core.find(hash, |k| *k == key) {
            return Err(OccupiedError {
                current: node.value.clone(),
                not_inserted: value,
            });
        }
        core.insert(hash, key, value, |a, b| a == b);
        Ok(())
    }

    /// Returns a clone of the value for `key`, inserting `value` first if
    /// the key is absent.
    pub fn get_or_insert(&self, key: K, value: V) -> V
    where
        V: Clone,
    {
        self.get_or_insert_with(key, || value)
    }

    /// Returns a clone of the value for `key`, inserting the result of `f`
    /// first if the key is absent.
    ///
    /// `f` must not touch the table; the lock is not re-entrant.
    pub fn get_or_insert_with(&self, key: K, f: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        let hash = self.hash(&key);
        let mut core = self.core();
        if let Some(node) = core.find(hash, |k| *k == key) {
            return node.value.clone();
        }
        let value = f();
        let result = value.clone();
        core.insert(hash, key, value, |a, b| a == b);
        result
    }

    /// Replaces the value for an existing key with `f(current)`, returning
    /// a clone of the new value. Absent keys are left absent.
    ///
    /// `f` must not touch the table; the lock is not re-entrant.
    pub fn update<Q>(&self, key: &Q, f: impl FnOnce(&V) -> V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hash = self.hash(key);
        let mut core = self.core();
        let node = core.find_mut(hash, |k| k.borrow() == key)?;
        node.value = f(&node.value);
        Some(node.value.clone())
    }

    /// Like [`update`](SyncTable::update), but inserts `value` if the key
    /// is absent. Returns a clone of the value left in the table.
    pub fn update_or_insert(&self, key: K, update: impl FnOnce(&V) -> V, value: V) -> V
    where
        V: Clone,
    {
        let hash = self.hash(&key);
        let mut core = self.core();
        if let Some(node) = core.find_mut(hash, |k| *k == key) {
            node.value = update(&node.value);
            return node.value.clone();
        }
        let result = value.clone();
        core.insert(hash, key, value, |a, b| a == b);
        result
    }

    /// Replaces the value for an existing key, returning the old value.
    /// Absent keys are left absent.
    pub fn replace<Q>(&self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let mut core = self.core();
        let node = core.find_mut(hash, |k| k.borrow() == key)?;
        Some(mem::replace(&mut node.value, value))
    }

    /// Removes the entry for `key`, returning its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.core()
            .remove(hash, |k| k.borrow() == key)
            .map(|node| node.value)
    }

    /// Removes the entry for `key`, returning the stored key and value.
    pub fn remove_entry<Q>(&self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.core()
            .remove(hash, |k| k.borrow() == key)
            .map(|node| (node.key, node.value))
    }

    /// Inserts every pair from `iter`, replacing values for keys already
    /// present.
    pub fn insert_all(&self, iter: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl<K, V> Default for SyncTable<K, V> {
    fn default() -> SyncTable<K, V> {
        SyncTable::new()
    }
}

impl<K, V, S> fmt::Debug for SyncTable<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        let mut map = f.debug_map();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                map.entry(&node.key, &node.value);
                cur = node.next.as_deref();
            }
        }
        map.finish()
    }
}

impl<K, V, S> Clone for SyncTable<K, V, S>
where
    K: Clone + Hash + Eq,
    V: Clone,
    S: Clone + BuildHasher,
{
    fn clone(&self) -> SyncTable<K, V, S> {
        let core = self.core();
        let mut new = ChainTable::new(Geometry::Legacy, core.capacity(), core.load_factor());
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                // The hasher is cloned with its seeds, so cached hashes
                // carry over.
                new.insert(node.hash, node.key.clone(), node.value.clone(), |a, b| a == b);
                cur = node.next.as_deref();
            }
        }
        SyncTable {
            core: Mutex::new(new),
            hasher: self.hasher.clone(),
        }
    }
}

/// Compares entry sets. Locks both tables, in argument order; comparing
/// two tables from two threads in opposite orders at once can deadlock.
impl<K, V, S> PartialEq for SyncTable<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &SyncTable<K, V, S>) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let a = self.core();
        let b = other.core();
        if a.len != b.len {
            return false;
        }
        for head in a.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                let hash = other.hasher.hash_one(&node.key);
                match b.find(hash, |k| *k == node.key) {
                    Some(found) if found.value == node.value => {}
                    _ => return false,
                }
                cur = node.next.as_deref();
            }
        }
        true
    }
}

impl<K, V, S> Eq for SyncTable<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Extend<(K, V)> for SyncTable<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncTable<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> SyncTable<K, V, S> {
        let iter = iter.into_iter();
        let table = SyncTable::with_capacity_and_hasher(iter.size_hint().0, S::default());
        table.insert_all(iter);
        table
    }
}

/// The error returned by [`SyncTable::try_insert`] when the key is already
/// present.
#[derive(Debug, PartialEq, Eq)]
pub struct OccupiedError<V> {
    /// A clone of the value already in the table.
    pub current: V,
    /// The value that was not inserted.
    pub not_inserted: V,
}

// Walks the cursor to the next occupied position, leaving it one past the
// returned position.
fn advance<K, V>(core: &ChainTable<K, V>, bucket: &mut usize, depth: &mut usize) -> Option<(usize, usize)> {
    loop {
        if *bucket >= core.capacity() {
            return None;
        }
        if core.node_at(*bucket, *depth).is_some() {
            let position = (*bucket, *depth);
            *depth += 1;
            return Some(position);
        }
        *bucket += 1;
        *depth = 0;
    }
}

/// A fail-fast iterator over `(K, V)` clones. See [`SyncTable::iter`].
pub struct Iter<'a, K, V, S> {
    table: &'a SyncTable<K, V, S>,
    bucket: usize,
    depth: usize,
    expected: u64,
    last: Option<(usize, usize)>,
}

impl<K, V, S> Iter<'_, K, V, S> {
    /// Removes the entry this iterator most recently yielded, returning its
    /// value.
    ///
    /// The iterator adopts the structural counter after the removal, so
    /// deleting the element just returned does not trip the fail-fast
    /// check. Returns `None` if nothing has been yielded since the last
    /// removal.
    pub fn remove_current(&mut self) -> Option<V> {
        let (bucket, depth) = self.last.take()?;
        let mut core = self.table.core();
        check_unmodified(core.mod_count, self.expected);
        let node = core.remove_at(bucket, depth);
        self.expected = core.mod_count;
        self.depth = depth;
        Some(node.value)
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let core = self.table.core();
        check_unmodified(core.mod_count, self.expected);
        let (bucket, depth) = advance(&core, &mut self.bucket, &mut self.depth)?;
        self.last = Some((bucket, depth));
        let node = core.node_at(bucket, depth).unwrap();
        Some((node.key.clone(), node.value.clone()))
    }
}

/// A fail-fast iterator over key clones. See [`SyncTable::keys`].
pub struct Keys<'a, K, V, S> {
    inner: Iter<'a, K, V, S>,
}

impl<K, V, S> Iterator for Keys<'_, K, V, S>
where
    K: Clone,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        let core = self.inner.table.core();
        check_unmodified(core.mod_count, self.inner.expected);
        let (bucket, depth) = advance(&core, &mut self.inner.bucket, &mut self.inner.depth)?;
        self.inner.last = Some((bucket, depth));
        Some(core.node_at(bucket, depth).unwrap().key.clone())
    }
}

/// A fail-fast iterator over value clones. See [`SyncTable::values`].
pub struct Values<'a, K, V, S> {
    inner: Iter<'a, K, V, S>,
}

impl<K, V, S> Iterator for Values<'_, K, V, S>
where
    V: Clone,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let core = self.inner.table.core();
        check_unmodified(core.mod_count, self.inner.expected);
        let (bucket, depth) = advance(&core, &mut self.inner.bucket, &mut self.inner.depth)?;
        self.inner.last = Some((bucket, depth));
        Some(core.node_at(bucket, depth).unwrap().value.clone())
    }
}

/// A split-capable traversal cursor over a [`SyncTable`].
///
/// `split` halves the remaining bucket range. The cursor validates the
/// structural counter once, at exhaustion, rather than before every
/// element: entries observed before that point may predate a racing
/// modification.
pub struct SplitIter<'a, K, V, S> {
    table: &'a SyncTable<K, V, S>,
    bucket: usize,
    depth: usize,
    fence: usize,
    expected: u64,
    done: bool,
}

impl<'a, K, V, S> SplitIter<'a, K, V, S> {
    /// Splits the remaining range in half, returning a cursor over the back
    /// half. Returns `None` once the range is too small to split.
    pub fn split(&mut self) -> Option<SplitIter<'a, K, V, S>> {
        if self.fence - self.bucket < 2 {
            return None;
        }
        let mid = self.bucket + (self.fence - self.bucket) / 2;
        let back = SplitIter {
            table: self.table,
            bucket: mid,
            depth: 0,
            fence: self.fence,
            expected: self.expected,
            done: false,
        };
        self.fence = mid;
        Some(back)
    }
}

impl<K, V, S> Iterator for SplitIter<'_, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.done {
            return None;
        }
        let core = self.table.core();
        loop {
            if self.bucket >= self.fence {
                self.done = true;
                check_unmodified(core.mod_count, self.expected);
                return None;
            }
            match core.node_at(self.bucket, self.depth) {
                Some(node) => {
                    self.depth += 1;
                    return Some((node.key.clone(), node.value.clone()));
                }
                None => {
                    self.bucket += 1;
                    self.depth = 0;
                }
            }
        }
    }
}

impl<'a, K, V, S> IntoIterator for &'a SyncTable<K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Iter<'a, K, V, S> {
        self.iter()
    }
}

impl<K, V, S> IntoIterator for SyncTable<K, V, S> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> IntoIter<K, V> {
        IntoIter {
            core: self.core.into_inner().unwrap(),
            bucket: 0,
        }
    }
}

/// An owning iterator over a consumed [`SyncTable`].
pub struct IntoIter<K, V> {
    core: ChainTable<K, V>,
    bucket: usize,
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if self.bucket >= self.core.capacity() {
                return None;
            }
            match self.core.buckets[self.bucket].take() {
                Some(mut node) => {
                    self.core.buckets[self.bucket] = node.next.take();
                    return Some((node.key, node.value));
                }
                None => self.bucket += 1,
            }
        }
    }
}
