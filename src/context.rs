//! Build contexts: the directory-scoped environments targets are defined in.
//! Each context carries symbol bindings that `symb:` targets observe.

use crate::densemap::{self, DenseMap};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ContextId(u32);
impl densemap::Index for ContextId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for ContextId {
    fn from(u: usize) -> ContextId {
        ContextId(u as u32)
    }
}

pub struct Context {
    /// Directory relative to the project root: "" for the root, otherwise
    /// "/dir/sub".
    pub path: String,
    /// Unique name; equal to `path` except for named scopes ("path:scope").
    pub name: String,
    pub parent: Option<ContextId>,
    symbols: FxHashMap<String, Value>,
}

pub struct Contexts {
    contexts: DenseMap<ContextId, Context>,
    by_name: FxHashMap<String, ContextId>,
}

impl Default for Contexts {
    fn default() -> Self {
        Self::new()
    }
}

impl Contexts {
    pub fn new() -> Self {
        let mut contexts = Contexts {
            contexts: DenseMap::default(),
            by_name: FxHashMap::default(),
        };
        contexts.insert(String::new(), String::new(), None);
        contexts
    }

    fn insert(&mut self, path: String, name: String, parent: Option<ContextId>) -> ContextId {
        let id = self.contexts.push(Context {
            path,
            name: name.clone(),
            parent,
            symbols: FxHashMap::default(),
        });
        self.by_name.insert(name, id);
        id
    }

    pub fn root(&self) -> ContextId {
        ContextId(0)
    }

    pub fn get(&self, id: ContextId) -> &Context {
        &self.contexts[id]
    }

    pub fn find(&self, name: &str) -> Option<ContextId> {
        self.by_name.get(name).copied()
    }

    /// Find or create the context for a directory path ("" or "/a/b"),
    /// creating its parents too.
    pub fn directory(&mut self, path: &str) -> ContextId {
        let path = path.trim_end_matches('/');
        if let Some(id) = self.find(path) {
            return id;
        }
        let parent = match path.rfind('/') {
            Some(i) => self.directory(&path[..i]),
            None => self.root(),
        };
        self.insert(path.to_owned(), path.to_owned(), Some(parent))
    }

    /// Find or create a named scope nested in `parent`, sharing its path.
    pub fn scope(&mut self, parent: ContextId, name: &str) -> ContextId {
        let full = format!("{}:{}", self.get(parent).name, name);
        if let Some(id) = self.find(&full) {
            return id;
        }
        let path = self.get(parent).path.clone();
        self.insert(path, full, Some(parent))
    }

    /// Resolve a context by its unique name, as found in a `symb:` id.
    pub fn by_name(&mut self, name: &str) -> ContextId {
        if let Some(id) = self.find(name) {
            return id;
        }
        match name.rfind(':') {
            Some(i) => {
                let parent = self.by_name(&name[..i]);
                self.scope(parent, &name[i + 1..])
            }
            None => self.directory(name),
        }
    }

    /// Look up a symbol, searching enclosing contexts.
    pub fn symbol(&self, id: ContextId, name: &str) -> Option<&Value> {
        let mut cur = Some(id);
        while let Some(id) = cur {
            let context = self.get(id);
            if let Some(v) = context.symbols.get(name) {
                return Some(v);
            }
            cur = context.parent;
        }
        None
    }

    pub fn set_symbol(&mut self, id: ContextId, name: &str, value: Value) {
        self.contexts[id].symbols.insert(name.to_owned(), value);
    }

    /// Absolute directory of a context.
    pub fn dir(&self, root: &Path, id: ContextId) -> PathBuf {
        let path = &self.get(id).path;
        root.join(path.trim_start_matches('/'))
    }
}
