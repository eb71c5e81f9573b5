use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt::{self, Formatter};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::raw::chain::ChainTable;
use crate::{IdentityMap, SyncTable, WeakKeyMap};

// `SyncTable` keeps its historical persisted layout: the original
// bucket-array length first, then the live entries. The capacity is
// replayed on deserialization; the threshold is reconstructed from it.

const SYNC_TABLE_FIELDS: &[&str] = &["capacity", "entries"];

impl<K, V, S> Serialize for SyncTable<K, V, S>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        let core = self.core();
        let mut table = serializer.serialize_struct("SyncTable", 2)?;
        table.serialize_field("capacity", &core.capacity())?;
        table.serialize_field("entries", &Entries(&core))?;
        table.end()
    }
}

struct Entries<'a, K, V>(&'a ChainTable<K, V>);

impl<K, V> Serialize for Entries<'_, K, V>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len))?;
        for head in self.0.buckets.iter() {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                map.serialize_entry(&node.key, &node.value)?;
                cur = node.next.as_deref();
            }
        }
        map.end()
    }
}

// The entries field, decoded into insertion order.
struct Pairs<K, V>(Vec<(K, V)>);

impl<'de, K, V> Deserialize<'de> for Pairs<K, V>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PairsVisitor<K, V>(PhantomData<(K, V)>);

        impl<'de, K, V> Visitor<'de> for PairsVisitor<K, V>
        where
            K: Deserialize<'de>,
            V: Deserialize<'de>,
        {
            type Value = Pairs<K, V>;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "a map of entries")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(pair) = access.next_entry()? {
                    pairs.push(pair);
                }
                Ok(Pairs(pairs))
            }
        }

        deserializer.deserialize_map(PairsVisitor(PhantomData))
    }
}

enum Field {
    Capacity,
    Entries,
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D>(deserializer: D) -> Result<Field, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FieldVisitor;

        impl Visitor<'_> for FieldVisitor {
            type Value = Field;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "`capacity` or `entries`")
            }

            fn visit_str<E>(self, value: &str) -> Result<Field, E>
            where
                E: de::Error,
            {
                match value {
                    "capacity" => Ok(Field::Capacity),
                    "entries" => Ok(Field::Entries),
                    _ => Err(de::Error::unknown_field(value, SYNC_TABLE_FIELDS)),
                }
            }
        }

        deserializer.deserialize_identifier(FieldVisitor)
    }
}

struct SyncTableVisitor<K, V, S> {
    _marker: PhantomData<SyncTable<K, V, S>>,
}

impl<'de, K, V, S> Visitor<'de> for SyncTableVisitor<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
    S: BuildHasher + Default,
{
    type Value = SyncTable<K, V, S>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a SyncTable")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let capacity: usize = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let entries: Pairs<K, V> = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        Ok(rebuild(capacity, entries))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut capacity: Option<usize> = None;
        let mut entries: Option<Pairs<K, V>> = None;
        while let Some(field) = access.next_key()? {
            match field {
                Field::Capacity => {
                    if capacity.is_some() {
                        return Err(de::Error::duplicate_field("capacity"));
                    }
                    capacity = Some(access.next_value()?);
                }
                Field::Entries => {
                    if entries.is_some() {
                        return Err(de::Error::duplicate_field("entries"));
                    }
                    entries = Some(access.next_value()?);
                }
            }
        }
        let capacity = capacity.ok_or_else(|| de::Error::missing_field("capacity"))?;
        let entries = entries.ok_or_else(|| de::Error::missing_field("entries"))?;
        Ok(rebuild(capacity, entries))
    }
}

fn rebuild<K, V, S>(capacity: usize, entries: Pairs<K, V>) -> SyncTable<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    let table = SyncTable::with_capacity_and_hasher(capacity, S::default());
    table.insert_all(entries.0);
    table
}

impl<'de, K, V, S> Deserialize<'de> for SyncTable<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
    S: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_struct(
            "SyncTable",
            SYNC_TABLE_FIELDS,
            SyncTableVisitor {
                _marker: PhantomData,
            },
        )
    }
}

impl<K, V> Serialize for IdentityMap<K, V>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        serializer.collect_map(self.iter().map(|(key, value)| (&**key, value)))
    }
}

impl<'de, K, V> Deserialize<'de> for IdentityMap<K, V>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    /// Every deserialized key gets a fresh allocation, and so a fresh
    /// identity; look keys up through [`IdentityMap::keys`] afterwards.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdentityMapVisitor<K, V> {
            _marker: PhantomData<IdentityMap<K, V>>,
        }

        impl<'de, K, V> Visitor<'de> for IdentityMapVisitor<K, V>
        where
            K: Deserialize<'de>,
            V: Deserialize<'de>,
        {
            type Value = IdentityMap<K, V>;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "a map")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut map = match access.size_hint() {
                    Some(size) => IdentityMap::with_capacity(size),
                    None => IdentityMap::new(),
                };
                while let Some((key, value)) = access.next_entry()? {
                    map.insert(Arc::new(key), value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(IdentityMapVisitor {
            _marker: PhantomData,
        })
    }
}

// `WeakKeyMap` serializes its live entries only. There is no matching
// `Deserialize`: the map holds its keys weakly, so deserialized entries
// would have no strong handle anywhere and be reclaimed on the next sweep.
impl<K, V> Serialize for WeakKeyMap<K, V>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<Sr>(&self, serializer: Sr) -> Result<Sr::Ok, Sr::Error>
    where
        Sr: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        self.try_for_each_entry(|key, value| map.serialize_entry(key, value))?;
        map.end()
    }
}

#[cfg(test)]
mod test {
    use crate::{IdentityMap, KeyHandle, SyncTable, WeakKeyMap};
    use std::sync::Arc;

    #[test]
    fn sync_table_round_trip() {
        let table: SyncTable<String, u32> = SyncTable::builder().capacity(64).build();
        for i in 0..10 {
            table.insert(format!("key-{i}"), i);
        }

        let serialized = serde_json::to_string(&table).unwrap();
        let deserialized: SyncTable<String, u32> = serde_json::from_str(&serialized).unwrap();

        assert_eq!(table, deserialized);
        // The historical layout carries the bucket-array length verbatim.
        assert_eq!(deserialized.capacity(), 64);
    }

    #[test]
    fn identity_map_round_trip_mints_fresh_identities() {
        let mut map = IdentityMap::new();
        let key = Arc::new("a".to_string());
        map.insert(key.clone(), 7u32);

        let serialized = serde_json::to_string(&map).unwrap();
        let deserialized: IdentityMap<String, u32> = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.len(), 1);
        // The original allocation is unknown to the deserialized map.
        assert_eq!(deserialized.get(&key), None);
        let fresh = deserialized.keys().next().unwrap().clone();
        assert_eq!(*fresh, "a");
        assert_eq!(deserialized.get(&fresh), Some(&7));
    }

    #[test]
    fn weak_key_map_serializes_live_entries_only() {
        let map = WeakKeyMap::new();
        let alive = KeyHandle::new("alive".to_string());
        let dead = KeyHandle::new("dead".to_string());
        map.insert(&alive, 1u32);
        map.insert(&dead, 2u32);
        drop(dead);

        let serialized = serde_json::to_string(&map).unwrap();
        assert_eq!(serialized, r#"{"alive":1}"#);
    }
}
