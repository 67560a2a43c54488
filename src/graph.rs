//! The target graph: every named build entity and the edges between them.

use crate::context::ContextId;
use crate::densemap::{self, DenseMap};
use crate::hash::Hash;
use crate::rule::BuildFn;
use crate::targetset::TargetSet;
use crate::value::Value;
use anyhow::bail;
use std::sync::Arc;

/// Id for a target.  This is the same index the db uses for the target, so
/// it is stable across runs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TargetId(u32);
impl densemap::Index for TargetId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for TargetId {
    fn from(u: usize) -> TargetId {
        TargetId(u as u32)
    }
}
impl TargetId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Identifies the thread updating a target.  Worker 0 is the thread that
/// defines targets and drives the build.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WorkerId(pub usize);

/// Where a target is in its update cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Unchecked,
    /// Enqueued; waiting for its depends or for a worker.
    Queued,
    /// A worker is running `update` on it.
    Checking(WorkerId),
    /// Up to date.  Carries the iteration in which its hash last changed.
    Done(u32),
}

#[derive(Debug)]
pub enum TargetKind {
    /// A file; `path` is relative to the project root unless absolute.
    File { path: String, absolute: bool },
    Meta { context: String, name: String },
    Expr { context: String, name: String, value: Option<Value> },
    Scan { source: TargetId, name: String },
    Symbol { context: ContextId, name: String },
}

/// A target id split into its parts, before any referenced source target or
/// context has been resolved.
#[derive(Debug, PartialEq)]
pub enum ParsedId<'a> {
    File { path: &'a str },
    Meta { context: &'a str, name: &'a str },
    Expr { context: &'a str, name: &'a str },
    Scan { source: &'a str, name: &'a str },
    Symbol { context: &'a str, name: &'a str },
}

impl<'a> ParsedId<'a> {
    pub fn parse(id: &'a str) -> anyhow::Result<ParsedId<'a>> {
        let Some((prefix, rest)) = id.split_once(':') else {
            bail!("malformed target id {:?}", id);
        };
        let split = |sep: &str| match rest.rfind(sep) {
            Some(i) => Ok((&rest[..i], &rest[i + sep.len()..])),
            None => Err(anyhow::anyhow!("malformed target id {:?}", id)),
        };
        Ok(match prefix {
            "file" => ParsedId::File { path: rest },
            "meta" => {
                let (context, name) = split("::")?;
                ParsedId::Meta { context, name }
            }
            "expr" => {
                let (context, name) = split("::")?;
                ParsedId::Expr { context, name }
            }
            "scan" => {
                let (source, name) = split("::")?;
                ParsedId::Scan { source, name }
            }
            "symb" => {
                let (context, name) = split("/")?;
                ParsedId::Symbol { context, name }
            }
            _ => bail!("unknown target type {:?} in id {:?}", prefix, id),
        })
    }
}

pub struct Target {
    pub kind: TargetKind,
    pub status: Status,
    /// Hash as of the last completed update (or as loaded from the db).
    pub hash: Hash,
    /// Static dependencies, declared before building.
    pub depends: TargetSet,
    /// Dependencies discovered while running the build function.
    pub build_depends: TargetSet,
    /// Queued targets waiting on this one.
    pub affects: TargetSet,
    /// Number of `depends` edges not yet completed since this was queued.
    pub wait_count: usize,
    pub build: Option<Arc<dyn BuildFn>>,
    pub build_context: Option<ContextId>,
    /// The target whose build function defined this target's build.
    pub parent: Option<TargetId>,
    /// Position in the ready heap, if present.
    pub queue_index: Option<usize>,
    /// Scheduling priority; None when it must be recomputed.
    pub priority: Option<u64>,
    pub priority_pending: bool,
    /// Set once this target's build function has run this iteration.
    pub built: bool,
}

impl Target {
    pub fn new(kind: TargetKind) -> Self {
        Target {
            kind,
            status: Status::Unchecked,
            hash: Hash::ZERO,
            depends: TargetSet::new(),
            build_depends: TargetSet::new(),
            affects: TargetSet::new(),
            wait_count: 0,
            build: None,
            build_context: None,
            parent: None,
            queue_index: None,
            priority: None,
            priority_pending: false,
            built: false,
        }
    }

    /// Forget per-run scheduling state so the target is checked again.
    pub fn reset(&mut self) {
        self.status = Status::Unchecked;
        self.affects = TargetSet::new();
        self.wait_count = 0;
        self.queue_index = None;
        self.priority = None;
        self.priority_pending = false;
        self.built = false;
    }
}

/// Arena of in-memory targets, indexed by `TargetId`.  Not every interned id
/// has a target: ids only known to the db are materialized on demand.
#[derive(Default)]
pub struct Graph {
    targets: DenseMap<TargetId, Option<Target>>,
}

impl Graph {
    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.targets.lookup(id).and_then(|t| t.as_ref())
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.get(id).is_some()
    }

    /// Look up a target known to be materialized.
    pub fn target(&self, id: TargetId) -> &Target {
        match self.get(id) {
            Some(t) => t,
            None => panic!("target {:?} not materialized", id),
        }
    }

    pub fn target_mut(&mut self, id: TargetId) -> &mut Target {
        match self.targets.lookup_mut(id).and_then(|t| t.as_mut()) {
            Some(t) => t,
            None => panic!("target {:?} not materialized", id),
        }
    }

    pub fn insert(&mut self, id: TargetId, target: Target) {
        self.targets.set_grow(id, Some(target));
    }

    pub fn ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.targets.all_ids().filter(move |&id| self.contains(id))
    }

    pub fn targets_mut(&mut self) -> impl Iterator<Item = &mut Target> {
        self.targets.values_mut().filter_map(|t| t.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids() {
        assert_eq!(
            ParsedId::parse("file:src/a.c").unwrap(),
            ParsedId::File { path: "src/a.c" }
        );
        assert_eq!(
            ParsedId::parse("meta:/lib::all").unwrap(),
            ParsedId::Meta { context: "/lib", name: "all" }
        );
        assert_eq!(
            ParsedId::parse("expr:::CFLAGS").unwrap(),
            ParsedId::Expr { context: "", name: "CFLAGS" }
        );
        assert_eq!(
            ParsedId::parse("symb:/lib/sub/CC").unwrap(),
            ParsedId::Symbol { context: "/lib/sub", name: "CC" }
        );
    }

    #[test]
    fn scan_splits_at_last_separator() {
        assert_eq!(
            ParsedId::parse("scan:scan:file:a.c::includes::deep").unwrap(),
            ParsedId::Scan { source: "scan:file:a.c::includes", name: "deep" }
        );
    }

    #[test]
    fn parse_errors() {
        assert!(ParsedId::parse("blob:x").is_err());
        assert!(ParsedId::parse("nocolon").is_err());
        assert!(ParsedId::parse("meta:noseparator").is_err());
    }
}
