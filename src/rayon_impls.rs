// Parallel iteration support for rayon, bridged through the map's own
// split-capable cursor.

use rayon::iter::plumbing::{bridge_unindexed, Folder, UnindexedConsumer, UnindexedProducer};
use rayon::iter::ParallelIterator;

use std::sync::Arc;

use crate::identity::SplitIter;
use crate::IdentityMap;

impl<K, V> IdentityMap<K, V> {
    /// A parallel iterator over the entries.
    ///
    /// Work is distributed by repeatedly halving the slot range, exactly
    /// like [`split_iter`](IdentityMap::split_iter).
    pub fn par_iter(&self) -> ParIter<'_, K, V> {
        ParIter { map: self }
    }
}

/// A parallel iterator over an [`IdentityMap`]. See
/// [`IdentityMap::par_iter`].
pub struct ParIter<'a, K, V> {
    map: &'a IdentityMap<K, V>,
}

impl<'a, K, V> ParallelIterator for ParIter<'a, K, V>
where
    K: Send + Sync,
    V: Sync,
{
    type Item = (&'a Arc<K>, &'a V);

    fn drive_unindexed<C>(self, consumer: C) -> C::Result
    where
        C: UnindexedConsumer<Self::Item>,
    {
        bridge_unindexed(
            SplitProducer {
                iter: self.map.split_iter(),
            },
            consumer,
        )
    }
}

struct SplitProducer<'a, K, V> {
    iter: SplitIter<'a, K, V>,
}

impl<'a, K, V> UnindexedProducer for SplitProducer<'a, K, V>
where
    K: Send + Sync,
    V: Sync,
{
    type Item = (&'a Arc<K>, &'a V);

    fn split(mut self) -> (Self, Option<Self>) {
        let back = self.iter.split().map(|iter| SplitProducer { iter });
        (self, back)
    }

    fn fold_with<F>(self, folder: F) -> F
    where
        F: Folder<Self::Item>,
    {
        folder.consume_iter(self.iter)
    }
}
