//! A map of dense integer key to value.

use std::marker::PhantomData;

pub trait Index: From<usize> + Copy {
    fn index(&self) -> usize;
}

/// A map of a dense integer key to value, implemented as a vector.
/// Effectively wraps Vec<V> to provide typed keys.
pub struct DenseMap<K, V> {
    vec: Vec<V>,
    key_type: PhantomData<K>,
}

impl<K, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        DenseMap {
            vec: Vec::default(),
            key_type: PhantomData,
        }
    }
}

impl<K: Index, V> std::ops::Index<K> for DenseMap<K, V> {
    type Output = V;

    fn index(&self, k: K) -> &Self::Output {
        &self.vec[k.index()]
    }
}

impl<K: Index, V> std::ops::IndexMut<K> for DenseMap<K, V> {
    fn index_mut(&mut self, k: K) -> &mut Self::Output {
        &mut self.vec[k.index()]
    }
}

impl<K: Index, V> DenseMap<K, V> {
    pub fn lookup(&self, k: K) -> Option<&V> {
        self.vec.get(k.index())
    }

    pub fn lookup_mut(&mut self, k: K) -> Option<&mut V> {
        self.vec.get_mut(k.index())
    }

    pub fn next_id(&self) -> K {
        K::from(self.vec.len())
    }

    pub fn push(&mut self, val: V) -> K {
        let id = self.next_id();
        self.vec.push(val);
        id
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    pub fn all_ids(&self) -> impl Iterator<Item = K> {
        (0..self.vec.len()).map(|id| K::from(id))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.vec.iter_mut()
    }
}

impl<K: Index, V: Default> DenseMap<K, V> {
    /// Store `v` at `k`, filling any gap below it with default values.
    pub fn set_grow(&mut self, k: K, v: V) {
        if k.index() >= self.vec.len() {
            self.vec.resize_with(k.index() + 1, V::default);
        }
        self.vec[k.index()] = v
    }

    /// Get a mutable entry, growing the map with defaults if needed.
    pub fn get_grow(&mut self, k: K) -> &mut V {
        if k.index() >= self.vec.len() {
            self.vec.resize_with(k.index() + 1, V::default);
        }
        &mut self.vec[k.index()]
    }
}
