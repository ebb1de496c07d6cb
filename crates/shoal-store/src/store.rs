//! The bucket store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use shoal_core::types::{KeyHash, MapHash};

/// Shared handle to a bucket's contents.  Sibling replicas created by a
/// mask split hold the same parent store through this handle.
pub type StoreHandle = Arc<BucketStore>;

#[derive(Debug, Clone)]
struct ItemRecord {
    value: Bytes,
    expires_at: Option<Instant>,
    epoch: u64,
}

#[derive(Debug, Clone, Default)]
struct NameRecord {
    name: Option<String>,
    name_int: Option<i64>,
    epoch: u64,
}

/// One unit of work handed to the migration engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrateEntry {
    /// A string name binding, sent as `SYNC_NAME`.
    Name { hash: KeyHash, name: String },
    /// A value item, sent as `SYNC`.
    Item {
        map: MapHash,
        hash: KeyHash,
        value: Bytes,
        name_int: i64,
        expires: i32,
    },
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<(MapHash, KeyHash), ItemRecord>,
    names: HashMap<KeyHash, NameRecord>,
    /// Pre-split snapshot this store was derived from, if any.
    parent: Option<StoreHandle>,
}

/// In-memory contents of one bucket replica.
#[derive(Debug)]
pub struct BucketStore {
    index: u64,
    inner: Mutex<Inner>,
}

impl BucketStore {
    pub fn new(index: u64) -> StoreHandle {
        Arc::new(Self {
            index,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Create the store for a replica derived by a mask split.  The child
    /// starts empty and reads through to `parent` until the parent drains.
    pub fn split_child(parent: &StoreHandle, index: u64) -> StoreHandle {
        Arc::new(Self {
            index,
            inner: Mutex::new(Inner {
                parent: Some(Arc::clone(parent)),
                ..Inner::default()
            }),
        })
    }

    /// The bucket index this store was created for.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Read a value.  Walks the parent chain so post-split reads still see
    /// everything the pre-split bucket held.
    pub fn get(&self, map: MapHash, hash: KeyHash) -> Option<Bytes> {
        let inner = self.inner.lock();
        if let Some(item) = inner.items.get(&(map, hash)) {
            if expired(item.expires_at) {
                return None;
            }
            return Some(item.value.clone());
        }
        inner.parent.as_ref().and_then(|p| p.get(map, hash))
    }

    /// Store a value.  A write resets the entry's sync epoch so an active
    /// migration will pick it up again.
    pub fn set(&self, map: MapHash, hash: KeyHash, value: Bytes, name_int: i64, expires: i32) {
        let mut inner = self.inner.lock();
        inner.items.insert(
            (map, hash),
            ItemRecord {
                value,
                expires_at: deadline(expires),
                epoch: 0,
            },
        );
        if name_int != 0 {
            inner.names.entry(hash).or_default().name_int = Some(name_int);
        }
    }

    /// Bind a string name to a key hash.  Idempotent.
    pub fn set_name(&self, hash: KeyHash, name: String) {
        let mut inner = self.inner.lock();
        let record = inner.names.entry(hash).or_default();
        record.name = Some(name);
        record.epoch = 0;
    }

    /// Bind an integer name to a key hash.  Idempotent.
    pub fn set_name_int(&self, hash: KeyHash, name_int: i64) {
        let mut inner = self.inner.lock();
        let record = inner.names.entry(hash).or_default();
        record.name_int = Some(name_int);
        record.epoch = 0;
    }

    /// The string name bound to a key hash, if any.
    pub fn name_of(&self, hash: KeyHash) -> Option<String> {
        let inner = self.inner.lock();
        if let Some(record) = inner.names.get(&hash) {
            if record.name.is_some() {
                return record.name.clone();
            }
        }
        inner.parent.as_ref().and_then(|p| p.name_of(hash))
    }

    /// Number of value items held directly (parent chain excluded).
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect up to `limit` entries not yet stamped with `epoch`, stamping
    /// them as it goes.  Entries found in a chained parent snapshot are
    /// re-homed into this store first; the parent handle is released once
    /// it has drained.  Returns an empty vec when nothing is left to send.
    pub fn take_migratable(
        &self,
        index: u64,
        mask: u64,
        epoch: u64,
        limit: usize,
    ) -> Vec<MigrateEntry> {
        let mut inner = self.inner.lock();
        self.rehome_from_parent(&mut inner, index, mask);

        let mut out = Vec::new();

        let mut name_hashes: Vec<KeyHash> = inner
            .names
            .iter()
            .filter(|(hash, record)| {
                record.epoch < epoch && (*hash & mask) == index && record.name.is_some()
            })
            .map(|(hash, _)| *hash)
            .collect();
        name_hashes.sort_unstable();
        for hash in name_hashes {
            if out.len() >= limit {
                return out;
            }
            let record = inner.names.get_mut(&hash).expect("name just enumerated");
            record.epoch = epoch;
            out.push(MigrateEntry::Name {
                hash,
                name: record.name.clone().expect("filtered on presence"),
            });
        }

        let mut item_keys: Vec<(MapHash, KeyHash)> = inner
            .items
            .iter()
            .filter(|((_, hash), item)| item.epoch < epoch && (hash & mask) == index)
            .map(|(key, _)| *key)
            .collect();
        item_keys.sort_unstable();
        for key in item_keys {
            if out.len() >= limit {
                return out;
            }
            let name_int = inner.names.get(&key.1).and_then(|n| n.name_int).unwrap_or(0);
            let item = inner.items.get_mut(&key).expect("item just enumerated");
            if expired(item.expires_at) {
                inner.items.remove(&key);
                continue;
            }
            item.epoch = epoch;
            out.push(MigrateEntry::Item {
                map: key.0,
                hash: key.1,
                value: item.value.clone(),
                name_int,
                expires: remaining_secs(item.expires_at),
            });
        }

        out
    }

    /// Destroy all contents, releasing any chained parent snapshot.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.names.clear();
        inner.parent = None;
    }

    /// Move everything belonging to `index` out of the parent chain into
    /// this store, detaching the parent once it holds nothing at all.
    fn rehome_from_parent(&self, inner: &mut Inner, index: u64, mask: u64) {
        let Some(parent) = inner.parent.clone() else {
            return;
        };

        let (items, names, drained) = parent.extract_for(index, mask);
        trace!(
            bucket = format_args!("{:#x}", index),
            rehomed = items.len(),
            "re-homed chained items"
        );
        for (key, item) in items {
            inner.items.entry(key).or_insert(item);
        }
        for (hash, record) in names {
            let slot = inner.names.entry(hash).or_default();
            if slot.name.is_none() {
                slot.name = record.name;
            }
            if slot.name_int.is_none() {
                slot.name_int = record.name_int;
            }
        }
        if drained {
            inner.parent = None;
        }
    }

    /// Remove and return entries matching `index` under `mask`, recursing
    /// into this store's own parent.  The bool reports whether this store
    /// (chain included) is now completely empty.
    fn extract_for(
        &self,
        index: u64,
        mask: u64,
    ) -> (
        Vec<((MapHash, KeyHash), ItemRecord)>,
        Vec<(KeyHash, NameRecord)>,
        bool,
    ) {
        let mut inner = self.inner.lock();

        if let Some(parent) = inner.parent.clone() {
            let (items, names, drained) = parent.extract_for(index, mask);
            for (key, item) in items {
                inner.items.entry(key).or_insert(item);
            }
            for (hash, record) in names {
                inner.names.entry(hash).or_insert(record);
            }
            if drained {
                inner.parent = None;
            }
        }

        let item_keys: Vec<(MapHash, KeyHash)> = inner
            .items
            .keys()
            .filter(|(_, hash)| (hash & mask) == index)
            .copied()
            .collect();
        let mut items = Vec::with_capacity(item_keys.len());
        for key in item_keys {
            let mut item = inner.items.remove(&key).expect("key just enumerated");
            item.epoch = 0;
            items.push((key, item));
        }

        let name_hashes: Vec<KeyHash> = inner
            .names
            .keys()
            .filter(|hash| (*hash & mask) == index)
            .copied()
            .collect();
        let mut names = Vec::with_capacity(name_hashes.len());
        for hash in name_hashes {
            let mut record = inner.names.remove(&hash).expect("hash just enumerated");
            record.epoch = 0;
            names.push((hash, record));
        }

        let drained = inner.items.is_empty() && inner.names.is_empty() && inner.parent.is_none();
        (items, names, drained)
    }
}

fn deadline(expires: i32) -> Option<Instant> {
    if expires > 0 {
        Some(Instant::now() + Duration::from_secs(expires as u64))
    } else {
        None
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| d <= Instant::now())
}

fn remaining_secs(deadline: Option<Instant>) -> i32 {
    match deadline {
        None => 0,
        Some(d) => d
            .saturating_duration_since(Instant::now())
            .as_secs()
            .max(1)
            .min(i32::MAX as u64) as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let store = BucketStore::new(1);
        store.set(1, 0x11, Bytes::from_static(b"v"), 0, 0);
        assert_eq!(store.get(1, 0x11), Some(Bytes::from_static(b"v")));
        assert_eq!(store.get(2, 0x11), None);
    }

    #[test]
    fn test_name_bindings_idempotent() {
        let store = BucketStore::new(0);
        store.set_name(0x20, "foo".to_string());
        store.set_name(0x20, "foo".to_string());
        store.set_name_int(0x20, 7);
        assert_eq!(store.name_of(0x20), Some("foo".to_string()));

        // one binding record, one item after repeated syncs
        store.set(1, 0x20, Bytes::from_static(b"v"), 7, 0);
        store.set(1, 0x20, Bytes::from_static(b"v"), 7, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let store = BucketStore::new(0);
        store.set(1, 0x4, Bytes::from_static(b"v"), 0, -1);
        assert!(store.get(1, 0x4).is_some(), "non-positive expiry never lapses");

        // a deadline already in the past reads as absent
        {
            let mut inner = store.inner.lock();
            inner.items.get_mut(&(1, 0x4)).unwrap().expires_at =
                Some(Instant::now() - Duration::from_secs(1));
        }
        assert_eq!(store.get(1, 0x4), None);
    }

    #[test]
    fn test_split_child_reads_parent() {
        let parent = BucketStore::new(1);
        parent.set(1, 0x5, Bytes::from_static(b"old"), 0, 0);
        parent.set_name(0x5, "named".to_string());

        let child = BucketStore::split_child(&parent, 0x5 & 0x7);
        assert_eq!(child.get(1, 0x5), Some(Bytes::from_static(b"old")));
        assert_eq!(child.name_of(0x5), Some("named".to_string()));

        // a child write shadows the parent copy
        child.set(1, 0x5, Bytes::from_static(b"new"), 0, 0);
        assert_eq!(child.get(1, 0x5), Some(Bytes::from_static(b"new")));
    }

    #[test]
    fn test_take_migratable_stamps_and_drains() {
        let store = BucketStore::new(2);
        store.set(1, 0x2, Bytes::from_static(b"a"), 0, 0);
        store.set(1, 0x6, Bytes::from_static(b"b"), 0, 0);
        store.set_name(0x2, "a-name".to_string());

        let first = store.take_migratable(2, 0x3, 1, 16);
        // name travels ahead of its item; both items under mask 0x3 match
        assert_eq!(first.len(), 3);
        assert!(matches!(first[0], MigrateEntry::Name { hash: 0x2, .. }));

        // everything is stamped now
        assert!(store.take_migratable(2, 0x3, 1, 16).is_empty());

        // a write during the migration resets the stamp
        store.set(1, 0x2, Bytes::from_static(b"a2"), 0, 0);
        let resent = store.take_migratable(2, 0x3, 1, 16);
        assert_eq!(resent.len(), 1);

        // a later migration with a fresh epoch sees everything again
        assert_eq!(store.take_migratable(2, 0x3, 2, 16).len(), 3);
    }

    #[test]
    fn test_take_migratable_honours_limit() {
        let store = BucketStore::new(0);
        for i in 0..10u64 {
            store.set(1, i << 2, Bytes::from_static(b"x"), 0, 0);
        }
        let batch = store.take_migratable(0, 0x3, 1, 4);
        assert_eq!(batch.len(), 4);
        let rest = store.take_migratable(0, 0x3, 1, 100);
        assert_eq!(rest.len(), 6);
    }

    #[test]
    fn test_rehome_from_parent_chain() {
        let parent = BucketStore::new(1);
        // 0x1 and 0x5 share index 1 under mask 0x3 but split apart under 0x7
        parent.set(1, 0x1, Bytes::from_static(b"one"), 0, 0);
        parent.set(1, 0x5, Bytes::from_static(b"five"), 0, 0);

        let low = BucketStore::split_child(&parent, 0x1);
        let high = BucketStore::split_child(&parent, 0x5);

        let low_entries = low.take_migratable(0x1, 0x7, 1, 16);
        assert_eq!(low_entries.len(), 1);
        assert!(matches!(low_entries[0], MigrateEntry::Item { hash: 0x1, .. }));
        // the sibling's key stayed in the parent
        assert_eq!(high.get(1, 0x5), Some(Bytes::from_static(b"five")));

        let high_entries = high.take_migratable(0x5, 0x7, 1, 16);
        assert_eq!(high_entries.len(), 1);
        assert!(matches!(high_entries[0], MigrateEntry::Item { hash: 0x5, .. }));
        assert!(high.inner.lock().parent.is_none());

        // the other sibling detaches on its next pass over the now-empty
        // parent
        assert!(low.take_migratable(0x1, 0x7, 1, 16).is_empty());
        assert!(low.inner.lock().parent.is_none());
    }

    #[test]
    fn test_grandparent_chain_rehomes() {
        let oldest = BucketStore::new(1);
        oldest.set(1, 0x9, Bytes::from_static(b"deep"), 0, 0);

        let mid = BucketStore::split_child(&oldest, 0x1);
        let leaf = BucketStore::split_child(&mid, 0x1);

        assert_eq!(leaf.get(1, 0x9), Some(Bytes::from_static(b"deep")));
        let entries = leaf.take_migratable(0x1, 0x7, 1, 16);
        assert_eq!(entries.len(), 1);
        assert_eq!(leaf.len(), 1);
    }

    #[test]
    fn test_clear_releases_parent() {
        let parent = BucketStore::new(0);
        parent.set(1, 0x0, Bytes::from_static(b"x"), 0, 0);
        let child = BucketStore::split_child(&parent, 0x0);
        child.clear();
        assert_eq!(child.get(1, 0x0), None);
    }
}
