//! A set of targets, used for dependency and dependent edges.
//!
//! Most targets have a handful of edges so the set is a small open-addressed
//! table.  Entries are kept in "ordered hashing" order: along any key's
//! probe sequence, every slot before the key holds a larger key.  That lets a
//! lookup stop at the first smaller slot, and empty slots (zero) are smaller
//! than everything.

use crate::graph::TargetId;

const INITIAL_SIZE: usize = 4;

/// Slots store `TargetId + 1` so zero can mean empty.
#[derive(Clone, Default)]
pub struct TargetSet {
    slots: Vec<u32>,
    len: usize,
}

fn probe(key: u32) -> (usize, usize) {
    let h = key.wrapping_mul(0x9E37_79B9);
    (h as usize, ((h >> 16) as usize) | 1)
}

impl TargetSet {
    pub fn new() -> Self {
        TargetSet::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: TargetId) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let key = id.index() as u32 + 1;
        let mask = self.slots.len() - 1;
        let (start, incr) = probe(key);
        let mut i = start & mask;
        loop {
            let s = self.slots[i];
            if s == key {
                return true;
            }
            if s < key {
                return false;
            }
            i = (i + incr) & mask;
        }
    }

    /// Insert a target, returning true if it was not already present.
    pub fn insert(&mut self, id: TargetId) -> bool {
        if self.contains(id) {
            return false;
        }
        if (self.len + 1) * 8 > self.slots.len() * 7 {
            self.grow();
        }
        let mask = self.slots.len() - 1;
        let mut key = id.index() as u32 + 1;
        let (start, mut incr) = probe(key);
        let mut i = start & mask;
        loop {
            let s = self.slots[i];
            if s < key {
                self.slots[i] = key;
                if s == 0 {
                    break;
                }
                // Carry the displaced key onwards along its own sequence.
                key = s;
                incr = probe(key).1;
            }
            i = (i + incr) & mask;
        }
        self.len += 1;
        true
    }

    fn grow(&mut self) {
        let size = if self.slots.is_empty() {
            INITIAL_SIZE
        } else {
            self.slots.len() * 2
        };
        let mut keys: Vec<u32> = self.slots.iter().copied().filter(|&s| s != 0).collect();
        // Placing keys largest first keeps the ordering without displacement.
        keys.sort_unstable_by(|a, b| b.cmp(a));
        let mut slots = vec![0u32; size];
        let mask = size - 1;
        for key in keys {
            let (start, incr) = probe(key);
            let mut i = start & mask;
            while slots[i] != 0 {
                i = (i + incr) & mask;
            }
            slots[i] = key;
        }
        self.slots = slots;
    }

    pub fn iter(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.slots
            .iter()
            .filter(|&&s| s != 0)
            .map(|&s| TargetId::from(s as usize - 1))
    }

    /// Snapshot the members, for iterating while the graph is mutated.
    pub fn to_vec(&self) -> Vec<TargetId> {
        self.iter().collect()
    }
}

impl FromIterator<TargetId> for TargetSet {
    fn from_iter<I: IntoIterator<Item = TargetId>>(iter: I) -> Self {
        let mut set = TargetSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl std::fmt::Debug for TargetSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
