//! Binary min-heap keyed by due time, with handle back-references
//!
//! One generic heap, instantiated once for one-shot timeouts and once
//! for repeating intervals.  Slots are numbered from 1 so that the
//! parent of slot `i` is `i / 2` and its children are `2i` and
//! `2i + 1`; the heap invariant is `due(i) >= due(i / 2)` for every
//! live slot `i >= 2`.
//!
//! Every swap reports the moved entries' new slots to the
//! [`HandleTable`], keeping cancel-by-key at O(log n).  Deleting at an
//! arbitrary slot moves the last entry into the hole and sifts it up,
//! or down if it did not move upward, avoiding a full rebuild.

use crate::handle::{HandleTable, TimerKey};

/// An entry that can be ordered by absolute due time
pub(crate) trait Deadline {
    /// Absolute due time in nanoseconds
    fn due(&self) -> u64;
    /// Key of the handle-table row tracking this entry
    fn key(&self) -> TimerKey;
}

pub(crate) struct DueHeap<E> {
    v: Vec<E>,
}

impl<E: Deadline> DueHeap<E> {
    pub fn new() -> Self {
        Self { v: Vec::new() }
    }

    /// Number of live entries; they occupy slots `1..=len()`
    pub fn len(&self) -> u32 {
        self.v.len() as u32
    }

    pub fn get(&self, slot: u32) -> &E {
        &self.v[slot as usize - 1]
    }

    pub fn get_mut(&mut self, slot: u32) -> &mut E {
        &mut self.v[slot as usize - 1]
    }

    /// Entry with the earliest due time, at slot 1
    pub fn root(&self) -> Option<&E> {
        self.v.first()
    }

    /// Append `e` and sift it up into position
    ///
    /// The caller must already have registered `e.key()` in the table
    /// pointing at slot `len() + 1`.
    pub fn insert(&mut self, e: E, table: &mut HandleTable) {
        self.v.push(e);
        let slot = self.len();
        self.sift_up(slot, table);
    }

    /// Delete the entry at `slot` and return it
    ///
    /// The former last entry takes over the freed slot and is sifted
    /// to wherever it belongs.  The removed entry's table row is left
    /// untouched; retiring it is the caller's business.
    pub fn remove(&mut self, slot: u32, table: &mut HandleTable) -> E {
        let e = self.v.swap_remove(slot as usize - 1);
        if slot <= self.len() {
            table.set_slot(self.get(slot).key(), slot);
            self.resift(slot, table);
        }
        self.maybe_shrink();
        e
    }

    /// Restore heap order for `slot` after its key changed in place
    pub fn resift(&mut self, slot: u32, table: &mut HandleTable) {
        if !self.sift_up(slot, table) {
            self.sift_down(slot, table);
        }
    }

    fn swap(&mut self, a: u32, b: u32, table: &mut HandleTable) {
        self.v.swap(a as usize - 1, b as usize - 1);
        table.set_slot(self.get(a).key(), a);
        table.set_slot(self.get(b).key(), b);
    }

    // Returns true if the entry moved
    fn sift_up(&mut self, mut slot: u32, table: &mut HandleTable) -> bool {
        let start = slot;
        while slot > 1 && self.get(slot).due() < self.get(slot / 2).due() {
            self.swap(slot, slot / 2, table);
            slot /= 2;
        }
        slot != start
    }

    fn sift_down(&mut self, mut slot: u32, table: &mut HandleTable) {
        let len = self.len();
        loop {
            let left = slot * 2;
            let right = left + 1;
            let mut smallest = slot;
            if left <= len && self.get(left).due() < self.get(smallest).due() {
                smallest = left;
            }
            if right <= len && self.get(right).due() < self.get(smallest).due() {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest, table);
            slot = smallest;
        }
    }

    // Geometric shrink mirroring Vec's geometric growth: give back
    // excess capacity once occupancy drops below a quarter of it.
    fn maybe_shrink(&mut self) {
        let cap = self.v.capacity();
        if cap > 8 && self.v.len() < cap / 4 {
            self.v.shrink_to(self.v.len() * 2 + 1);
        }
    }

    // Validate the heap invariant and handle consistency, for tests
    #[cfg(test)]
    pub fn check(&self, table: &HandleTable, loc_of: impl Fn(u32) -> crate::handle::Loc) {
        for slot in 2..=self.len() {
            assert!(
                self.get(slot).due() >= self.get(slot / 2).due(),
                "heap order violated at slot {}",
                slot
            );
        }
        for slot in 1..=self.len() {
            assert_eq!(
                Some(loc_of(slot)),
                table.get(self.get(slot).key()),
                "handle back-reference out of date at slot {}",
                slot
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Loc;

    struct Item {
        due: u64,
        key: TimerKey,
    }

    impl Deadline for Item {
        fn due(&self) -> u64 {
            self.due
        }
        fn key(&self) -> TimerKey {
            self.key
        }
    }

    struct Fixture {
        heap: DueHeap<Item>,
        table: HandleTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                heap: DueHeap::new(),
                table: HandleTable::new(),
            }
        }

        fn add(&mut self, due: u64) -> TimerKey {
            let key = self.table.insert(Loc::Timeout(self.heap.len() + 1));
            self.heap.insert(Item { due, key }, &mut self.table);
            self.check();
            key
        }

        fn cancel(&mut self, key: TimerKey) -> bool {
            match self.table.get(key) {
                Some(Loc::Timeout(slot)) => {
                    self.heap.remove(slot, &mut self.table);
                    self.table.remove(key);
                    self.check();
                    true
                }
                _ => false,
            }
        }

        fn reschedule(&mut self, key: TimerKey, due: u64) -> bool {
            match self.table.get(key) {
                Some(Loc::Timeout(slot)) => {
                    self.heap.get_mut(slot).due = due;
                    self.heap.resift(slot, &mut self.table);
                    self.check();
                    true
                }
                _ => false,
            }
        }

        fn pop_root(&mut self) -> Option<u64> {
            if self.heap.len() == 0 {
                return None;
            }
            let e = self.heap.remove(1, &mut self.table);
            self.table.remove(e.key);
            self.check();
            Some(e.due)
        }

        fn check(&self) {
            self.heap.check(&self.table, Loc::Timeout);
        }
    }

    // ZX Spectrum random number generator!
    struct Rand(u16);

    impl Rand {
        fn next(&mut self) -> u32 {
            self.0 = (((self.0 as u32) + 1) * 75 % 65537 - 1) as u16;
            self.0 as u32
        }
    }

    #[test]
    fn insert_orders_root() {
        let mut f = Fixture::new();
        f.add(300);
        f.add(100);
        f.add(200);
        assert_eq!(100, f.heap.root().unwrap().due());
        assert_eq!(Some(100), f.pop_root());
        assert_eq!(Some(200), f.pop_root());
        assert_eq!(Some(300), f.pop_root());
        assert_eq!(None, f.pop_root());
    }

    #[test]
    fn duplicate_due_times() {
        let mut f = Fixture::new();
        for _ in 0..10 {
            f.add(42);
        }
        f.add(41);
        assert_eq!(Some(41), f.pop_root());
        for _ in 0..10 {
            assert_eq!(Some(42), f.pop_root());
        }
    }

    #[test]
    fn cancel_middle_entry() {
        let mut f = Fixture::new();
        let _a = f.add(10);
        let b = f.add(20);
        let _c = f.add(30);
        let _d = f.add(40);
        assert!(f.cancel(b));
        assert!(!f.cancel(b));
        assert_eq!(Some(10), f.pop_root());
        assert_eq!(Some(30), f.pop_root());
        assert_eq!(Some(40), f.pop_root());
    }

    #[test]
    fn reschedule_moves_both_ways() {
        let mut f = Fixture::new();
        let a = f.add(100);
        let b = f.add(200);
        f.add(300);
        assert!(f.reschedule(a, 400));
        assert!(f.reschedule(b, 50));
        assert_eq!(Some(50), f.pop_root());
        assert_eq!(Some(300), f.pop_root());
        assert_eq!(Some(400), f.pop_root());
    }

    #[test]
    fn rand_churn() {
        // Pseudo-random add/cancel/reschedule/pop churn; the fixture
        // validates heap order and back-references after every step
        let mut f = Fixture::new();
        let mut rand = Rand(0x1234);
        let mut keys = Vec::new();
        for _ in 0..2000 {
            match rand.next() % 5 {
                0 | 1 => {
                    keys.push(f.add(rand.next() as u64));
                }
                2 => {
                    if !keys.is_empty() {
                        let key = keys.swap_remove(rand.next() as usize % keys.len());
                        f.cancel(key);
                    }
                }
                3 => {
                    if !keys.is_empty() {
                        let key = keys[rand.next() as usize % keys.len()];
                        f.reschedule(key, rand.next() as u64);
                    }
                }
                _ => {
                    f.pop_root();
                }
            }
        }
        let mut prev = 0;
        while let Some(due) = f.pop_root() {
            assert!(due >= prev);
            prev = due;
        }
        assert_eq!(0, f.table.len());
    }
}
