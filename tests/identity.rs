use loquat::identity::Entry;
use loquat::IdentityMap;

use std::sync::Arc;

// No `Hash`, no `Eq`, no `PartialEq`: identity keys need none of them.
struct Opaque(#[allow(dead_code)] u32);

#[test]
fn value_equal_keys_are_distinct_entries() {
    let one = Arc::new("key".to_string());
    let two = Arc::new("key".to_string());

    let mut map = IdentityMap::new();
    map.insert(one.clone(), 1);
    map.insert(two.clone(), 2);

    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&one), Some(&1));
    assert_eq!(map.get(&two), Some(&2));
}

#[test]
fn clones_of_one_allocation_are_one_entry() {
    let key = Arc::new("key".to_string());
    let alias = key.clone();

    let mut map = IdentityMap::new();
    assert_eq!(map.insert(key.clone(), 1), None);
    assert_eq!(map.insert(alias.clone(), 2), Some(1));
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&key), Some(&2));
}

#[test]
fn keys_need_no_trait_bounds() {
    let key = Arc::new(Opaque(1));
    let mut map = IdentityMap::new();
    map.insert(key.clone(), "value");
    assert_eq!(map.get(&key), Some(&"value"));
}

#[test]
fn get_mut_and_get_key_value() {
    let key = Arc::new(1u32);
    let mut map = IdentityMap::new();
    map.insert(key.clone(), 10);

    *map.get_mut(&key).unwrap() += 1;
    let (stored, value) = map.get_key_value(&key).unwrap();
    assert!(Arc::ptr_eq(stored, &key));
    assert_eq!(*value, 11);
}

#[test]
fn remove_and_remove_entry() {
    let key = Arc::new(1u32);
    let mut map = IdentityMap::new();
    map.insert(key.clone(), 10);

    assert_eq!(map.remove(&key), Some(10));
    assert_eq!(map.remove(&key), None);

    map.insert(key.clone(), 20);
    let (stored, value) = map.remove_entry(&key).unwrap();
    assert!(Arc::ptr_eq(&stored, &key));
    assert_eq!(value, 20);
    assert!(map.is_empty());
}

#[test]
fn rehash_preserves_mappings() {
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..1000).map(Arc::new).collect();
    for (i, key) in keys.iter().enumerate() {
        map.insert(key.clone(), i);
    }
    assert_eq!(map.len(), 1000);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(map.get(key), Some(&i));
    }
}

#[test]
fn colliding_keys_survive_removal_of_their_neighbor() {
    // Brute statistics instead of crafted hashes: with every key kept
    // alive, any probe run disturbed by a removal must stay reachable.
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..256).map(Arc::new).collect();
    for (i, key) in keys.iter().enumerate() {
        map.insert(key.clone(), i);
    }
    for key in keys.iter().step_by(3) {
        map.remove(key);
    }
    for (i, key) in keys.iter().enumerate() {
        if i % 3 == 0 {
            assert_eq!(map.get(key), None);
        } else {
            assert_eq!(map.get(key), Some(&i));
        }
    }
}

#[test]
fn entry_api() {
    let mut map = IdentityMap::new();
    let key = Arc::new("counter".to_string());

    *map.entry(key.clone()).or_insert(0) += 1;
    *map.entry(key.clone()).or_insert(0) += 1;
    assert_eq!(map.get(&key), Some(&2));

    match map.entry(key.clone()) {
        Entry::Occupied(mut entry) => {
            assert_eq!(entry.insert(10), 2);
        }
        Entry::Vacant(_) => unreachable!(),
    }
    assert_eq!(map.get(&key), Some(&10));
}

#[test]
fn retain_and_contains_value() {
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..10).map(Arc::new).collect();
    for key in &keys {
        map.insert(key.clone(), **key);
    }

    assert!(map.contains_value(&7));
    map.retain(|_, v| *v % 2 == 0);
    assert_eq!(map.len(), 5);
    assert!(!map.contains_value(&7));
    assert!(map.contains_key(&keys[4]));
    assert!(!map.contains_key(&keys[5]));
}

#[test]
fn drain_empties_but_keeps_capacity() {
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..100).map(Arc::new).collect();
    for (i, key) in keys.iter().enumerate() {
        map.insert(key.clone(), i);
    }
    let capacity = map.capacity();

    let mut drained: Vec<usize> = map.drain().map(|(_, v)| v).collect();
    drained.sort_unstable();
    assert_eq!(drained, (0..100).collect::<Vec<_>>());
    assert!(map.is_empty());
    assert_eq!(map.capacity(), capacity);
}

#[test]
fn iterators_and_mutation_through_views() {
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..50).map(Arc::new).collect();
    for key in &keys {
        map.insert(key.clone(), **key);
    }

    assert_eq!(map.iter().count(), 50);
    assert_eq!(map.keys().count(), 50);

    for value in map.values_mut() {
        *value *= 2;
    }
    let mut values: Vec<u32> = map.values().copied().collect();
    values.sort_unstable();
    assert_eq!(values, (0..50).map(|i| i * 2).collect::<Vec<_>>());

    for (_, value) in map.iter_mut() {
        *value += 1;
    }
    assert_eq!(map.get(&keys[0]), Some(&1));
}

#[test]
fn into_iter_moves_the_entries() {
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..10).map(Arc::new).collect();
    for (i, key) in keys.iter().enumerate() {
        map.insert(key.clone(), i);
    }
    let mut values: Vec<usize> = map.into_iter().map(|(_, v)| v).collect();
    values.sort_unstable();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
}

#[test]
fn clone_preserves_identities() {
    let mut map = IdentityMap::new();
    let key = Arc::new(1u32);
    map.insert(key.clone(), 10);

    let mut copy = map.clone();
    assert_eq!(copy.get(&key), Some(&10));
    assert_eq!(map, copy);

    copy.insert(key.clone(), 20);
    assert_eq!(map.get(&key), Some(&10));
    assert_ne!(map, copy);
}

#[test]
fn size_invariant_under_traversal() {
    let mut map = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..64).map(Arc::new).collect();
    for key in &keys {
        map.insert(key.clone(), ());
    }
    for key in keys.iter().step_by(2) {
        map.remove(key);
    }
    assert_eq!(map.iter().count(), map.len());
    assert_eq!(map.split_iter().count(), map.len());
}
