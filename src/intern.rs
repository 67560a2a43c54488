//! Interning of target id strings to dense `TargetId`s.
//!
//! The persistent identity log in the db replays into this table on open;
//! the index a string receives here is the index it has in every db store.

use crate::graph::TargetId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Intern {
    lookup: FxHashMap<Arc<str>, TargetId>,
    ids: Vec<Arc<str>>,
}

impl Intern {
    pub fn new() -> Intern {
        Intern::default()
    }

    /// Intern a string, returning its id and whether it was newly added.
    pub fn add(&mut self, s: &str) -> (TargetId, bool) {
        if let Some(&id) = self.lookup.get(s) {
            return (id, false);
        }
        let id = TargetId::from(self.ids.len());
        let s: Arc<str> = Arc::from(s);
        self.ids.push(s.clone());
        self.lookup.insert(s, id);
        (id, true)
    }

    pub fn lookup(&self, s: &str) -> Option<TargetId> {
        self.lookup.get(s).copied()
    }

    pub fn get(&self, id: TargetId) -> &str {
        &self.ids[id.index()]
    }

    pub fn try_get(&self, id: TargetId) -> Option<&str> {
        self.ids.get(id.index()).map(|s| &**s)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetId, &str)> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, s)| (TargetId::from(i), &**s))
    }
}
