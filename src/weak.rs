use std::cell::{RefCell, RefMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use crate::raw::chain::ChainTable;
use crate::raw::{check_unmodified, identity_hash, Geometry};

const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;

// Addresses of key cells whose last strong handle has dropped, waiting to
// be swept out of the table.
type PendingQueue = Mutex<Vec<usize>>;

// The shared allocation behind a `KeyHandle`. Dropping the last strong
// handle runs `Drop` here, which notifies every map the key was inserted
// into.
struct KeyCell<K> {
    watchers: Mutex<Vec<Weak<PendingQueue>>>,
    key: K,
}

impl<K> Drop for KeyCell<K> {
    fn drop(&mut self) {
        let addr = self as *const KeyCell<K> as usize;
        let watchers = self.watchers.get_mut().unwrap();
        for queue in watchers.drain(..) {
            // Queues of maps that were dropped first simply fail to
            // upgrade.
            if let Some(queue) = queue.upgrade() {
                queue.lock().unwrap().push(addr);
            }
        }
    }
}

/// A strong handle to a [`WeakKeyMap`] key.
///
/// The map itself holds the key only weakly: once every strong handle to a
/// key is dropped, the key's entries are queued for reclamation and
/// removed before the next operation observes any map they were in.
///
/// Handles compare, hash and clone by *identity*: two handles are equal
/// only if they share one allocation, and cloning a handle never clones
/// the key inside.
pub struct KeyHandle<K>(Arc<KeyCell<K>>);

impl<K> KeyHandle<K> {
    pub fn new(key: K) -> KeyHandle<K> {
        KeyHandle(Arc::new(KeyCell {
            watchers: Mutex::new(Vec::new()),
            key,
        }))
    }

    /// Returns `true` if both handles refer to the same key allocation.
    pub fn ptr_eq(this: &KeyHandle<K>, other: &KeyHandle<K>) -> bool {
        Arc::ptr_eq(&this.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn identity(&self) -> u64 {
        identity_hash(self.addr())
    }
}

impl<K> Clone for KeyHandle<K> {
    fn clone(&self) -> KeyHandle<K> {
        KeyHandle(self.0.clone())
    }
}

impl<K> Deref for KeyHandle<K> {
    type Target = K;

    fn deref(&self) -> &K {
        &self.0.key
    }
}

impl<K> PartialEq for KeyHandle<K> {
    fn eq(&self, other: &KeyHandle<K>) -> bool {
        KeyHandle::ptr_eq(self, other)
    }
}

impl<K> Eq for KeyHandle<K> {}

impl<K> Hash for KeyHandle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.identity());
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyHandle").field(&self.0.key).finish()
    }
}

/// A chained hash map whose keys may be reclaimed behind its back.
///
/// Keys live in [`KeyHandle`]s and are compared by identity; the map keeps
/// only a weak reference per entry, plus the entry's cached identity hash.
/// When the last strong handle for a key is dropped, on whatever thread,
/// the key's address is pushed onto the map's pending-reclamation queue.
/// Every public operation drains that queue before doing anything else, so
/// [`len`](WeakKeyMap::len) and iteration always reflect the post-sweep
/// view. The sweep never fails; reclamation is a background fact, not an
/// error.
///
/// Values are owned by their entries and dropped when the entry is purged.
/// A value that strongly references its own key keeps the entry alive
/// forever.
///
/// The map is not internally synchronized. It is `Send` but deliberately
/// not `Sync`: for cross-thread use, wrap the map in a `Mutex` shared
/// between the map and every iterator derived from it. Because reads must
/// sweep, callbacks passed to [`update`], [`for_each`] and friends must
/// not touch the map; re-entry is reported as a borrow panic.
///
/// [`update`]: WeakKeyMap::update
/// [`for_each`]: WeakKeyMap::for_each
///
/// # Examples
///
/// ```
/// use loquat::{KeyHandle, WeakKeyMap};
///
/// let map = WeakKeyMap::new();
/// let key = KeyHandle::new("session-42".to_string());
/// map.insert(&key, "state");
///
/// assert_eq!(map.len(), 1);
/// drop(key);
/// assert_eq!(map.len(), 0);
/// ```
pub struct WeakKeyMap<K, V> {
    core: RefCell<ChainTable<Weak<KeyCell<K>>, V>>,
    pending: Arc<PendingQueue>,
}

/// A builder for a [`WeakKeyMap`].
pub struct WeakKeyMapBuilder<K, V> {
    capacity: usize,
    load_factor: f32,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> WeakKeyMapBuilder<K, V> {
    /// Set the initial capacity. Rounded up to a power of two.
    pub fn capacity(self, capacity: usize) -> WeakKeyMapBuilder<K, V> {
        WeakKeyMapBuilder { capacity, ..self }
    }

    /// Set the load factor.
    ///
    /// # Panics
    ///
    /// `build` panics if the load factor is not positive and finite.
    pub fn load_factor(self, load_factor: f32) -> WeakKeyMapBuilder<K, V> {
        WeakKeyMapBuilder { load_factor, ..self }
    }

    pub fn build(self) -> WeakKeyMap<K, V> {
        WeakKeyMap {
            core: RefCell::new(ChainTable::new(
                Geometry::PowerOfTwo,
                self.capacity,
                self.load_factor,
            )),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<K, V> WeakKeyMap<K, V> {
    /// Creates an empty `WeakKeyMap` with the default capacity (16) and
    /// load factor (0.75).
    pub fn new() -> WeakKeyMap<K, V> {
        WeakKeyMap::builder().build()
    }

    pub fn with_capacity(capacity: usize) -> WeakKeyMap<K, V> {
        WeakKeyMap::builder().capacity(capacity).build()
    }

    pub fn builder() -> WeakKeyMapBuilder<K, V> {
        WeakKeyMapBuilder {
            capacity: DEFAULT_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            _kv: PhantomData,
        }
    }

    /// Drains the pending-reclamation queue, physically unlinking every
    /// notified entry, then hands the table to the caller's operation.
    fn sweep(&self) -> RefMut<'_, ChainTable<Weak<KeyCell<K>>, V>> {
        let mut core = self.core.borrow_mut();
        let stale = mem::take(&mut *self.pending.lock().unwrap());
        for addr in stale {
            // Only a dead weak is purged: a new key allocated at a reused
            // address is left alone.
            core.remove(identity_hash(addr), |weak| {
                weak.as_ptr() as usize == addr && weak.strong_count() == 0
            });
        }
        core
    }

    fn register(&self, key: &KeyHandle<K>) {
        let mut watchers = key.0.watchers.lock().unwrap();
        let target = Arc::as_ptr(&self.pending);
        if !watchers.iter().any(|w| std::ptr::eq(w.as_ptr(), target)) {
            watchers.push(Arc::downgrade(&self.pending));
        }
    }

    fn unregister(&self, cell: &Arc<KeyCell<K>>) {
        let target = Arc::as_ptr(&self.pending);
        cell.watchers
            .lock()
            .unwrap()
            .retain(|w| !std::ptr::eq(w.as_ptr(), target));
    }

    /// Returns the number of live entries, after the sweep.
    pub fn len(&self) -> usize {
        self.sweep().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sweep().capacity()
    }

    /// Returns `true` if the map has an entry for this key allocation.
    pub fn contains_key(&self, key: &KeyHandle<K>) -> bool {
        let addr = key.addr();
        self.sweep()
            .find(key.identity(), |weak| weak.as_ptr() as usize == addr)
            .is_some()
    }

    /// Returns `true` if any live entry's value compares equal to `value`.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let core = self.sweep();
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

    /// Returns a clone of the value for this key allocation.
    pub fn get(&self, key: &KeyHandle<K>) -> Option<V>
    where
        V: Clone,
    {
        let addr = key.addr();
        self.sweep()
            .find(key.identity(), |weak| weak.as_ptr() as usize == addr)
            .map(|node| node.value.clone())
    }

    /// Inserts the pair, returning the previous value if this key
    /// allocation was already present.
    ///
    /// The map does not keep the handle alive: dropping every strong
    /// handle for `key` queues the entry for reclamation.
    pub fn insert(&self, key: &KeyHandle<K>, value: V) -> Option<V> {
        let mut core = self.sweep();
        self.register(key);
        core.insert(
            key.identity(),
            Arc::downgrade(&key.0),
            value,
            |a, b| a.as_ptr() == b.as_ptr(),
        )
    }

    /// Inserts every pair from `iter`. The handles are borrowed: the caller
    /// keeps the strong references that keep the entries alive.
    pub fn insert_all<'a, I>(&self, iter: I)
    where
        K: 'a,
        I: IntoIterator<Item = (&'a KeyHandle<K>, V)>,
    {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }

    /// Returns a clone of the value for this key allocation, inserting the
    /// result of `f` first if the key is absent.
    ///
    /// `f` must not touch the map; re-entry is a borrow panic.
    pub fn get_or_insert_with(&self, key: &KeyHandle<K>, f: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        let addr = key.addr();
        let mut core = self.sweep();
        if let Some(node) = core.find(key.identity(), |weak| weak.as_ptr() as usize == addr) {
            return node.value.clone();
        }
        self.register(key);
        let value = f();
        let result = value.clone();
        core.insert(
            key.identity(),
            Arc::downgrade(&key.0),
            value,
            |a, b| a.as_ptr() == b.as_ptr(),
        );
        result
    }

    /// Applies `f` to the value for this key allocation, in place.
    ///
    /// `f` must not touch the map; re-entry is a borrow panic.
    pub fn update<R>(&self, key: &KeyHandle<K>, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let addr = key.addr();
        let mut core = self.sweep();
        let node = core.find_mut(key.identity(), |weak| weak.as_ptr() as usize == addr)?;
        Some(f(&mut node.value))
    }

    /// Removes the entry for this key allocation, returning its value.
    ///
    /// The map also stops watching the key: dropping the handle afterwards
    /// no longer notifies this map.
    pub fn remove(&self, key: &KeyHandle<K>) -> Option<V> {
        let addr = key.addr();
        let mut core = self.sweep();
        let node = core.remove(key.identity(), |weak| weak.as_ptr() as usize == addr)?;
        self.unregister(&key.0);
        Some(node.value)
    }

    /// Removes every entry and stops watching every live key. Keeps the
    /// current capacity.
    pub fn clear(&self) {
        let mut core = self.sweep();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                if let Some(cell) = node.key.upgrade() {
                    self.unregister(&cell);
                }
                cur = node.next.as_deref();
            }
        }
        core.clear();
    }

    /// Keeps only the entries for which `f` returns `true`.
    ///
    /// `f` must not touch the map; re-entry is a borrow panic.
    pub fn retain(&self, mut f: impl FnMut(&K, &mut V) -> bool) {
        let mut core = self.sweep();
        let pending = &self.pending;
        core.retain(|weak, value| match weak.upgrade() {
            Some(cell) => {
                if f(&cell.key, value) {
                    true
                } else {
                    let target = Arc::as_ptr(pending);
                    cell.watchers
                        .lock()
                        .unwrap()
                        .retain(|w| !std::ptr::eq(w.as_ptr(), target));
                    false
                }
            }
            // The key died mid-walk; drop the entry now, the queued
            // notification will find nothing.
            None => false,
        });
    }

    /// Calls `f` for every live entry.
    ///
    /// `f` must not touch the map; re-entry is a borrow panic.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let core = self.sweep();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                if let Some(cell) = node.key.upgrade() {
                    f(&cell.key, &node.value);
                }
                cur = node.next.as_deref();
            }
        }
    }

    /// A fail-fast iterator yielding `(KeyHandle<K>, V)` pairs.
    ///
    /// The iterator borrows the map per step, not for its whole lifetime,
    /// so the map stays usable while iterating; if any operation
    /// structurally modifies the map in between (including a sweep that
    /// purges a reclaimed key), the next step panics rather than yield
    /// possibly-corrupt data. Keys that died since the iterator's own
    /// sweep are silently skipped.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let expected = self.sweep().mod_count;
        Iter {
            map: self,
            bucket: 0,
            depth: 0,
            expected,
            last: None,
        }
    }

    /// A fail-fast iterator over the live keys.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys { inner: self.iter() }
    }

    /// A fail-fast iterator over clones of the live values.
    pub fn values(&self) -> Values<'_, K, V> {
        Values { inner: self.iter() }
    }

    /// A traversal cursor over the bucket range that can be split in half
    /// for bulk traversal. Validates the structural counter once, at
    /// exhaustion.
    pub fn split_iter(&self) -> SplitIter<'_, K, V> {
        let core = self.sweep();
        SplitIter {
            map: self,
            bucket: 0,
            depth: 0,
            fence: core.capacity(),
            expected: core.mod_count,
            done: false,
        }
    }

    pub(crate) fn try_for_each_entry<E>(
        &self,
        mut f: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        let core = self.sweep();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                if let Some(cell) = node.key.upgrade() {
                    f(&cell.key, &node.value)?;
                }
                cur = node.next.as_deref();
            }
        }
        Ok(())
    }
}

impl<K, V> Default for WeakKeyMap<K, V> {
    fn default() -> WeakKeyMap<K, V> {
        WeakKeyMap::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for WeakKeyMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.sweep();
        let mut map = f.debug_map();
        for head in core.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                if let Some(cell) = node.key.upgrade() {
                    map.entry(&cell.key, &node.value);
                }
                cur = node.next.as_deref();
            }
        }
        map.finish()
    }
}

// Walks the cursor to the next position whose key is still alive, handing
// back the upgraded cell. Dead entries are skipped, not removed.
fn advance_live<K, V>(
    core: &ChainTable<Weak<KeyCell<K>>, V>,
    bucket: &mut usize,
    depth: &mut usize,
) -> Option<(usize, usize, Arc<KeyCell<K>>)> {
    loop {
        if *bucket >= core.capacity() {
            return None;
        }
        match core.node_at(*bucket, *depth) {
            Some(node) => {
                let position = (*bucket, *depth);
                *depth += 1;
                if let Some(cell) = node.key.upgrade() {
                    return Some((position.0, position.1, cell));
                }
            }
            None => {
                *bucket += 1;
                *depth = 0;
            }
        }
    }
}

/// A fail-fast iterator over a [`WeakKeyMap`]. See [`WeakKeyMap::iter`].
pub struct Iter<'a, K, V> {
    map: &'a WeakKeyMap<K, V>,
    bucket: usize,
    depth: usize,
    expected: u64,
    last: Option<(usize, usize)>,
}

impl<K, V> Iter<'_, K, V> {
    /// Removes the entry this iterator most recently yielded, returning
    /// its value.
    ///
    /// The iterator adopts the structural counter after the removal, so
    /// deleting the element just returned does not trip the fail-fast
    /// check. Returns `None` if nothing has been yielded since the last
    /// removal.
    pub fn remove_current(&mut self) -> Option<V> {
        let (bucket, depth) = self.last.take()?;
        let mut core = self.map.core.borrow_mut();
        check_unmodified(core.mod_count, self.expected);
        let node = core.remove_at(bucket, depth);
        if let Some(cell) = node.key.upgrade() {
            self.map.unregister(&cell);
        }
        self.expected = core.mod_count;
        self.depth = depth;
        Some(node.value)
    }
}

impl<K, V: Clone> Iterator for Iter<'_, K, V> {
    type Item = (KeyHandle<K>, V);

    fn next(&mut self) -> Option<Self::Item> {
        let core = self.map.core.borrow();
        check_unmodified(core.mod_count, self.expected);
        let (bucket, depth, cell) = advance_live(&core, &mut self.bucket, &mut self.depth)?;
        self.last = Some((bucket, depth));
        let value = core.node_at(bucket, depth).unwrap().value.clone();
        Some((KeyHandle(cell), value))
    }
}

/// A fail-fast iterator over live keys. See [`WeakKeyMap::keys`].
pub struct Keys<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<K, V> Iterator for Keys<'_, K, V> {
    type Item = KeyHandle<K>;

    fn next(&mut self) -> Option<KeyHandle<K>> {
        let core = self.inner.map.core.borrow();
        check_unmodified(core.mod_count, self.inner.expected);
        let (bucket, depth, cell) =
            advance_live(&core, &mut self.inner.bucket, &mut self.inner.depth)?;
        self.inner.last = Some((bucket, depth));
        Some(KeyHandle(cell))
    }
}

/// A fail-fast iterator over value clones. See [`WeakKeyMap::values`].
pub struct Values<'a, K, V> {
    inner: Iter<'a, K, V>,
}

impl<K, V: Clone> Iterator for Values<'_, K, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let core = self.inner.map.core.borrow();
        check_unmodified(core.mod_count, self.inner.expected);
        let (bucket, depth, _cell) =
            advance_live(&core, &mut self.inner.bucket, &mut self.inner.depth)?;
        self.inner.last = Some((bucket, depth));
        Some(core.node_at(bucket, depth).unwrap().value.clone())
    }
}

/// A split-capable traversal cursor over a [`WeakKeyMap`].
///
/// `split` halves the remaining bucket range. The cursor validates the
/// structural counter once, at exhaustion, rather than before every
/// element: entries observed before that point may predate a racing
/// modification.
pub struct SplitIter<'a, K, V> {
    map: &'a WeakKeyMap<K, V>,
    bucket: usize,
    depth: usize,
    fence: usize,
    expected: u64,
    done: bool,
}

impl<'a, K, V> SplitIter<'a, K, V> {
    /// Splits the remaining range in half, returning a cursor over the
    /// back half. Returns `None` once the range is too small to split.
    pub fn split(&mut self) -> Option<SplitIter<'a, K, V>> {
        if self.fence - self.bucket < 2 {
            return None;
        }
        let mid = self.bucket + (self.fence - self.bucket) / 2;
        let back = SplitIter {
            map: self.map,
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

impl<K, V: Clone> Iterator for SplitIter<'_, K, V> {
    type Item = (KeyHandle<K>, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let core = self.map.core.borrow();
        loop {
            if self.bucket >= self.fence {
                self.done = true;
                check_unmodified(core.mod_count, self.expected);
                return None;
            }
            match core.node_at(self.bucket, self.depth) {
                Some(node) => {
                    self.depth += 1;
                    if let Some(cell) = node.key.upgrade() {
                        let value = node.value.clone();
                        return Some((KeyHandle(cell), value));
                    }
                }
                None => {
                    self.bucket += 1;
                    self.depth = 0;
                }
            }
        }
    }
}
