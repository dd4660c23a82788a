//! Two-level resource lookup tables.
//!
//! The context tracks queue pairs and shared receive queues in fixed-size
//! tables indexed by resource number. Each bucket covers a contiguous range
//! of numbers and lazily allocates its slot array on first use, so a context
//! that never creates a resource of one kind pays one pointer per bucket.

use std::sync::{Arc, Mutex, Weak};

/// One bucket: a live-slot count plus the lazily allocated slot array.
///
/// `refcnt` equals the number of occupied slots; the slot array exists
/// exactly while `refcnt > 0`.
struct Bucket<T> {
    refcnt: u32,
    slots: Option<Box<[Option<Weak<T>>]>>,
}

pub(crate) struct ResourceTable<T> {
    buckets: Mutex<Box<[Bucket<T>]>>,
    /// Confines a resource number to the table's capacity.
    capacity_mask: u32,
    /// Right shift taking a confined number to its bucket index.
    shift: u32,
    /// Masks out the slot index within a bucket.
    mask: u32,
}

impl<T> ResourceTable<T> {
    /// Builds a table for `table_size` resource numbers split across
    /// `1 << bucket_bits` buckets. `table_size` must be a power of two (the
    /// kernel reports it as one; the caller validates).
    pub(crate) fn new(table_size: u32, bucket_bits: u32) -> Self {
        let shift = table_size.trailing_zeros().saturating_sub(bucket_bits);
        let mask = (1u32 << shift) - 1;
        let buckets = (0..1usize << bucket_bits)
            .map(|_| Bucket {
                refcnt: 0,
                slots: None,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets: Mutex::new(buckets),
            capacity_mask: table_size.wrapping_sub(1),
            shift,
            mask,
        }
    }

    fn bucket_index(&self, n: u32) -> usize {
        ((n & self.capacity_mask) >> self.shift) as usize
    }

    fn slot_index(&self, n: u32) -> usize {
        (n & self.mask) as usize
    }

    /// Records a weak back-reference for resource number `n`.
    ///
    /// Storing over an occupied slot replaces the reference without
    /// disturbing the bucket count.
    pub(crate) fn store(&self, n: u32, value: &Arc<T>) {
        let mut buckets = self.buckets.lock().unwrap();
        let slots = self.mask as usize + 1;
        let bucket = &mut buckets[self.bucket_index(n)];
        let table = bucket
            .slots
            .get_or_insert_with(|| (0..slots).map(|_| None).collect());
        if table[self.slot_index(n)].replace(Arc::downgrade(value)).is_none() {
            bucket.refcnt += 1;
        }
    }

    /// Upgrades the stored back-reference for `n`, if any.
    pub(crate) fn find(&self, n: u32) -> Option<Arc<T>> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = &buckets[self.bucket_index(n)];
        bucket
            .slots
            .as_ref()
            .and_then(|slots| slots[self.slot_index(n)].as_ref())
            .and_then(Weak::upgrade)
    }

    /// Clears the slot for `n`; the last clear in a bucket drops its slot
    /// array. Clearing an empty slot is a no-op.
    pub(crate) fn clear(&self, n: u32) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = &mut buckets[self.bucket_index(n)];
        let Some(slots) = bucket.slots.as_mut() else {
            return;
        };
        if slots[self.slot_index(n)].take().is_some() {
            bucket.refcnt -= 1;
            if bucket.refcnt == 0 {
                bucket.slots = None;
            }
        }
    }

    #[cfg(test)]
    fn bucket_refcnt(&self, n: u32) -> u32 {
        let buckets = self.buckets.lock().unwrap();
        buckets[self.bucket_index(n)].refcnt
    }
}
