//! Generational timer keys and the slot indirection table
//!
//! A [`TimerKey`] is the caller's stable reference to an armed entry.
//! The heaps move entries around constantly, so the key never points
//! at a heap slot directly.  Instead every active entry owns a row in
//! the [`HandleTable`], and the heaps rewrite that row's slot number
//! on every move.  Cancel-by-key then resolves in O(1) and the delete
//! itself in O(log n), instead of an O(n) search.
//!
//! Rows carry a generation so that a key left over from a fired or
//! canceled entry can never alias a row that was since reused: all
//! lookups with a stale key fail closed.

use slab::Slab;
use static_assertions::assert_eq_size;

/// Key referencing an armed timer
///
/// Returned by the `add_timeout` / `add_interval` methods on
/// [`Timers`].  It is plain `Copy` data, 8 bytes long, and is used to
/// cancel, query or reschedule the entry.  A `Default` key is inert
/// and matches nothing.  Once the entry fires (for a one-shot) or is
/// canceled, the key goes stale and every operation on it reports the
/// entry as expired.  Note that a key should only be used on the
/// [`Timers`] instance that issued it.
///
/// [`Timers`]: crate::Timers
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct TimerKey {
    pub(crate) slot: u32,
    // Generation; never 0, so a Default key matches nothing
    pub(crate) gen: u32,
}

assert_eq_size!(TimerKey, u64);

/// Which heap an active entry currently lives in, and at which slot
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Loc {
    Timeout(u32),
    Interval(u32),
}

struct Row {
    gen: u32,
    loc: Loc,
}

pub(crate) struct HandleTable {
    rows: Slab<Row>,
    gen: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            rows: Slab::new(),
            gen: 0,
        }
    }

    /// Register a new entry and issue its key
    pub fn insert(&mut self, loc: Loc) -> TimerKey {
        self.gen = self.gen.wrapping_add(1);
        if self.gen == 0 {
            self.gen = 1;
        }
        let gen = self.gen;
        let slot = self.rows.insert(Row { gen, loc });
        assert!(slot < u32::MAX as usize, "timer handle table overflow");
        TimerKey {
            slot: slot as u32,
            gen,
        }
    }

    pub fn get(&self, key: TimerKey) -> Option<Loc> {
        self.rows
            .get(key.slot as usize)
            .filter(|row| row.gen == key.gen)
            .map(|row| row.loc)
    }

    pub fn contains(&self, key: TimerKey) -> bool {
        self.get(key).is_some()
    }

    /// Rewrite the heap slot recorded for `key`
    ///
    /// Called by the heaps for every entry they move; the location
    /// kind is preserved since an entry never changes heap.
    pub fn set_slot(&mut self, key: TimerKey, slot: u32) {
        if let Some(row) = self.rows.get_mut(key.slot as usize) {
            if row.gen == key.gen {
                row.loc = match row.loc {
                    Loc::Timeout(_) => Loc::Timeout(slot),
                    Loc::Interval(_) => Loc::Interval(slot),
                };
            }
        }
    }

    /// Retire the row for `key`, making the key stale
    pub fn remove(&mut self, key: TimerKey) -> bool {
        match self.rows.get(key.slot as usize) {
            Some(row) if row.gen == key.gen => {
                self.rows.remove(key.slot as usize);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_matches_nothing() {
        let table = HandleTable::new();
        assert!(!table.contains(TimerKey::default()));
        assert_eq!(None, table.get(TimerKey::default()));
    }

    #[test]
    fn insert_get_remove() {
        let mut table = HandleTable::new();
        let key = table.insert(Loc::Timeout(1));
        assert_eq!(Some(Loc::Timeout(1)), table.get(key));
        assert!(table.remove(key));
        assert!(!table.contains(key));
        assert!(!table.remove(key));
    }

    #[test]
    fn stale_generation_fails_closed() {
        let mut table = HandleTable::new();
        let key = table.insert(Loc::Interval(1));
        assert!(table.remove(key));
        // Reuses the same row index but with a fresh generation
        let key2 = table.insert(Loc::Interval(1));
        assert_eq!(key.slot, key2.slot);
        assert_ne!(key.gen, key2.gen);
        assert!(!table.contains(key));
        assert!(table.contains(key2));
    }

    #[test]
    fn set_slot_rewrites_location() {
        let mut table = HandleTable::new();
        let key = table.insert(Loc::Timeout(3));
        table.set_slot(key, 7);
        assert_eq!(Some(Loc::Timeout(7)), table.get(key));

        let ikey = table.insert(Loc::Interval(2));
        table.set_slot(ikey, 1);
        assert_eq!(Some(Loc::Interval(1)), table.get(ikey));
    }

    #[test]
    fn set_slot_ignores_stale_key() {
        let mut table = HandleTable::new();
        let key = table.insert(Loc::Timeout(3));
        assert!(table.remove(key));
        let key2 = table.insert(Loc::Timeout(5));
        table.set_slot(key, 9);
        assert_eq!(Some(Loc::Timeout(5)), table.get(key2));
    }
}
