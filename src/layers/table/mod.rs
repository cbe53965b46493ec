// SPDX-License-Identifier: MPL-2.0

//! The remap table: an O(1) average-case `bad -> spare` hash map with
//! dynamic resizing, an insertion-stable serialization order, and the
//! spare-sector allocator, guarded by the same writer lock as the table
//! itself.
//!
//! Concurrency model: a single `RwLock<Inner>`. Readers (`lookup`) take
//! a read guard and never block on other readers; writers (`insert*`,
//! `remove`, resize) take a write guard and are serialized among
//! themselves. A resize happens inside the same write-guard critical
//! section as the insert/remove that triggered it, so no reader ever
//! observes a partially-resized table. See `DESIGN.md` for the rationale
//! behind choosing a plain `RwLock` over a lock-free structure here.

mod allocator;

pub use allocator::SpareAllocator;

use std::sync::RwLock;

use crate::prelude::*;
use crate::sector::{RemapEntry, RemapFlags, Sector};

const INITIAL_BUCKETS: usize = 256;
const GROW_LOAD_FACTOR: f64 = 0.75;
const SHRINK_LOAD_FACTOR: f64 = 0.1;

/// A strong 64-bit mixing function (splitmix64 finalizer), used so that
/// sequential `bad` values (the common case: adjacent bad sectors on a
/// failing disk region) spread evenly across buckets.
fn mix(key: Sector) -> u64 {
    let mut z = key.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[derive(Clone, Copy)]
struct BucketSlot {
    bad: Sector,
    order_idx: usize,
}

struct Inner {
    buckets: Vec<Vec<BucketSlot>>,
    /// Insertion-stable storage. `None` marks a tombstone left by a
    /// `remove`; live entries are never reordered, so serialization
    /// order always matches original insertion order modulo deletions.
    order: Vec<Option<RemapEntry>>,
    nlive: usize,
    allocator: SpareAllocator,
}

impl Inner {
    fn bucket_index(&self, bad: Sector) -> usize {
        (mix(bad) as usize) % self.buckets.len()
    }

    fn find(&self, bad: Sector) -> Option<usize> {
        let bidx = self.bucket_index(bad);
        self.buckets[bidx].iter().find(|s| s.bad == bad).map(|s| s.order_idx)
    }

    fn load_factor(&self) -> f64 {
        self.nlive as f64 / self.buckets.len() as f64
    }

    fn maybe_resize(&mut self) {
        let lf = self.load_factor();
        if lf > GROW_LOAD_FACTOR {
            self.rehash(self.buckets.len() * 2);
        } else if lf < SHRINK_LOAD_FACTOR && self.buckets.len() > INITIAL_BUCKETS {
            self.rehash((self.buckets.len() / 2).max(INITIAL_BUCKETS));
        }
    }

    fn rehash(&mut self, new_nbuckets: usize) {
        let mut new_buckets: Vec<Vec<BucketSlot>> = vec![Vec::new(); new_nbuckets];
        for (order_idx, slot) in self.order.iter().enumerate() {
            if let Some(entry) = slot {
                let bidx = (mix(entry.bad) as usize) % new_nbuckets;
                new_buckets[bidx].push(BucketSlot { bad: entry.bad, order_idx });
            }
        }
        self.buckets = new_buckets;
    }

    fn insert_at_new_slot(&mut self, entry: RemapEntry) {
        let order_idx = self.order.len();
        self.order.push(Some(entry));
        let bidx = self.bucket_index(entry.bad);
        self.buckets[bidx].push(BucketSlot { bad: entry.bad, order_idx });
        self.nlive += 1;
        self.maybe_resize();
    }

    fn remove_bad(&mut self, bad: Sector) -> Option<RemapEntry> {
        let order_idx = self.find(bad)?;
        let bidx = self.bucket_index(bad);
        self.buckets[bidx].retain(|s| s.bad != bad);
        let entry = self.order[order_idx].take();
        if entry.is_some() {
            self.nlive -= 1;
            self.maybe_resize();
        }
        entry
    }
}

pub struct RemapTable {
    inner: RwLock<Inner>,
}

impl RemapTable {
    /// Creates an empty table over the given spare allocator.
    pub fn new(allocator: SpareAllocator) -> Self {
        Self {
            inner: RwLock::new(Inner {
                buckets: vec![Vec::new(); INITIAL_BUCKETS],
                order: Vec::new(),
                nlive: 0,
                allocator,
            }),
        }
    }

    /// Rebuilds a table from a previously-serialized, insertion-ordered
    /// entry list (used by the recovery orchestration and by `restore`).
    /// Fails with `Internal` if the entries violate the uniqueness
    /// invariants (duplicate `bad`/`spare`), which should never happen
    /// for a CRC-validated record but is checked anyway.
    pub fn rebuild_from(mut allocator: SpareAllocator, entries: Vec<RemapEntry>) -> Result<Self> {
        let table = Self::new_with_allocator_seed(&mut allocator, &entries)?;
        let mut inner = Inner { buckets: vec![Vec::new(); INITIAL_BUCKETS], order: Vec::new(), nlive: 0, allocator };
        for entry in entries {
            if inner.find(entry.bad).is_some() {
                return_errno_with_msg!(Internal, "duplicate bad sector in recovered record");
            }
            inner.insert_at_new_slot(entry);
        }
        let _ = table;
        Ok(Self { inner: RwLock::new(inner) })
    }

    /// Marks every entry's spare sector used in `allocator` up front, so
    /// that `rebuild_from`'s per-entry pass only has to check `bad`
    /// uniqueness; duplicate `spare` values surface as `SpareInUse` here.
    fn new_with_allocator_seed(allocator: &mut SpareAllocator, entries: &[RemapEntry]) -> Result<()> {
        for entry in entries {
            allocator.mark_used(entry.spare).map_err(|e| {
                if e.errno() == Errno::SpareInUse {
                    Error::with_msg(Errno::Internal, "duplicate spare sector in recovered record")
                } else {
                    Error::with_msg(Errno::Internal, "recovered spare sector out of data region")
                }
            })?;
        }
        Ok(())
    }

    /// O(1) average-case lookup. Never blocks on a writer beyond a
    /// transient `RwLock` read-acquisition; see module docs.
    pub fn lookup(&self, bad: Sector) -> Option<Sector> {
        let inner = self.inner.read().unwrap();
        inner.find(bad).and_then(|idx| inner.order[idx]).map(|e| e.spare)
    }

    pub fn lookup_entry(&self, bad: Sector) -> Option<RemapEntry> {
        let inner = self.inner.read().unwrap();
        inner.find(bad).and_then(|idx| inner.order[idx])
    }

    /// Inserts a new remap for `bad`, letting the allocator choose the
    /// spare sector. Used by `add` and by auto-remap.
    pub fn insert_new(&self, bad: Sector, created_ns: u64, flags: RemapFlags) -> Result<RemapEntry> {
        let mut inner = self.inner.write().unwrap();
        if inner.find(bad).is_some() {
            return_errno!(AlreadyMapped);
        }
        let spare = inner.allocator.alloc().ok_or(Error::new(Errno::SpareExhausted))?;
        let entry = RemapEntry::new(bad, spare, created_ns, flags);
        inner.insert_at_new_slot(entry);
        Ok(entry)
    }

    /// Inserts a remap with a caller-chosen spare sector. Used by
    /// `test_remap`.
    pub fn insert_specific(&self, bad: Sector, spare: Sector, created_ns: u64, flags: RemapFlags) -> Result<RemapEntry> {
        let mut inner = self.inner.write().unwrap();
        if inner.find(bad).is_some() {
            return_errno!(AlreadyMapped);
        }
        inner.allocator.mark_used(spare)?;
        let entry = RemapEntry::new(bad, spare, created_ns, flags);
        inner.insert_at_new_slot(entry);
        Ok(entry)
    }

    /// Removes `bad`, returning its spare sector to the allocator.
    pub fn remove(&self, bad: Sector) -> Result<Sector> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner.remove_bad(bad).ok_or(Error::new(Errno::NotFound))?;
        inner.allocator.free(entry.spare);
        Ok(entry.spare)
    }

    /// Increments `error_count` on an existing live entry (auto-remap
    /// idempotence: the sector is already mapped, so just bump the
    /// counter rather than allocating anew).
    pub fn bump_error_count(&self, bad: Sector) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let idx = inner.find(bad).ok_or(Error::new(Errno::NotFound))?;
        if let Some(entry) = inner.order[idx].as_mut() {
            entry.error_count = entry.error_count.saturating_add(1);
        }
        Ok(())
    }

    /// Clears `PENDING_WRITE` on every live entry, marking the current
    /// state as durably persisted.
    pub fn mark_all_persisted(&self) {
        let mut inner = self.inner.write().unwrap();
        for slot in inner.order.iter_mut().flatten() {
            slot.flags.remove(RemapFlags::PENDING_WRITE);
        }
    }

    /// A stable, insertion-ordered snapshot for serialization. Read-lock
    /// only; reflects a single consistent point in time.
    pub fn snapshot_for_serialize(&self) -> Vec<RemapEntry> {
        let inner = self.inner.read().unwrap();
        inner.order.iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().nlive
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().unwrap().buckets.len()
    }

    pub fn load_factor(&self) -> f64 {
        self.inner.read().unwrap().load_factor()
    }

    pub fn allocator_free(&self) -> usize {
        self.inner.read().unwrap().allocator.num_free()
    }

    pub fn allocator_capacity(&self) -> usize {
        self.inner.read().unwrap().allocator.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::RemapFlags;

    fn table(data_start: Sector, data_end: Sector) -> RemapTable {
        RemapTable::new(SpareAllocator::new(data_start, data_end))
    }

    #[test]
    fn insert_then_lookup() {
        let t = table(1000, 2000);
        let entry = t.insert_new(42, 1, RemapFlags::ADMIN).unwrap();
        assert_eq!(t.lookup(42), Some(entry.spare));
        assert_eq!(t.lookup(43), None);
    }

    #[test]
    fn already_mapped() {
        let t = table(1000, 2000);
        t.insert_new(42, 1, RemapFlags::ADMIN).unwrap();
        assert_eq!(t.insert_new(42, 2, RemapFlags::ADMIN).unwrap_err().errno(), Errno::AlreadyMapped);
    }

    #[test]
    fn insert_remove_idempotent() {
        let t = table(1000, 2000);
        let before_free = t.allocator_free();
        let entry = t.insert_new(42, 1, RemapFlags::ADMIN).unwrap();
        let freed = t.remove(42).unwrap();
        assert_eq!(freed, entry.spare);
        assert_eq!(t.len(), 0);
        assert_eq!(t.allocator_free(), before_free);
        assert_eq!(t.lookup(42), None);
    }

    #[test]
    fn not_found_on_remove() {
        let t = table(1000, 2000);
        assert_eq!(t.remove(1).unwrap_err().errno(), Errno::NotFound);
    }

    #[test]
    fn resize_preserves_all_entries() {
        let t = table(0, 10_000);
        for bad in 0..1000u64 {
            t.insert_new(bad, bad, RemapFlags::ADMIN).unwrap();
        }
        assert!(t.capacity() > INITIAL_BUCKETS);
        for bad in 0..1000u64 {
            assert!(t.lookup(bad).is_some(), "missing bad={bad} after growth");
        }
        for bad in 0..900u64 {
            t.remove(bad).unwrap();
        }
        for bad in 900..1000u64 {
            assert!(t.lookup(bad).is_some(), "missing bad={bad} after shrink");
        }
    }

    #[test]
    fn snapshot_preserves_insertion_order_modulo_deletions() {
        let t = table(1000, 2000);
        t.insert_new(100, 1, RemapFlags::ADMIN).unwrap();
        t.insert_new(200, 2, RemapFlags::ADMIN).unwrap();
        t.insert_new(300, 3, RemapFlags::ADMIN).unwrap();
        t.remove(200).unwrap();
        t.insert_new(400, 4, RemapFlags::ADMIN).unwrap();
        let snap = t.snapshot_for_serialize();
        let bads: Vec<_> = snap.iter().map(|e| e.bad).collect();
        assert_eq!(bads, vec![100, 300, 400]);
    }

    #[test]
    fn test_remap_rejects_spare_in_use_and_out_of_range() {
        let t = table(1000, 1010);
        t.insert_specific(1, 1005, 1, RemapFlags::ADMIN).unwrap();
        assert_eq!(t.insert_specific(2, 1005, 1, RemapFlags::ADMIN).unwrap_err().errno(), Errno::SpareInUse);
        assert_eq!(t.insert_specific(3, 999, 1, RemapFlags::ADMIN).unwrap_err().errno(), Errno::OutOfRange);
    }
}
