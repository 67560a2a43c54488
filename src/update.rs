//! Updating a single target: decide whether it is stale, rebuild it if so,
//! and record its new hash.
//!
//! A target is stale when any dependency changed after the target was last
//! checked, when its build function changed, or when its kind reports its
//! output missing.  Dependencies come from three places: the static
//! `depends`, those recorded in the db from the previous build, and (for
//! scans) the persisted scan results.

use crate::db::Details;
use crate::dot::Edge;
use crate::fs::Stat;
use crate::graph::{Status, TargetId, TargetKind};
use crate::hash::{value_hash, Hash};
use crate::rule::BuildFn;
use crate::targetset::TargetSet;
use crate::trace;
use crate::value::Value;
use crate::work::{Aborted, BuildCx};
use anyhow::{anyhow, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl<'a> BuildCx<'a> {
    pub(crate) fn update(&mut self, id: TargetId) -> anyhow::Result<()> {
        let name = self.id_str(id).to_owned();
        match trace::scope(&name, || self.update_target(id)) {
            Err(err) if !err.is::<Aborted>() => {
                self.abort(err);
                Err(Aborted.into())
            }
            result => result,
        }
    }

    fn update_target(&mut self, id: TargetId) -> anyhow::Result<()> {
        let iteration = self.iteration();
        self.state.graph.target_mut(id).status = Status::Checking(self.worker);
        let prev = self.state.db.details(id);
        let mut depends_updated = 0;

        let build = self.state.graph.target(id).build.clone();
        let mut build_hash = Hash::ZERO;
        if let Some(build) = &build {
            build_hash = build.hash();
            if let Some(context) = self.state.graph.target(id).build_context {
                build_hash.xor_cyclic(self.state.contexts.get(context).name.as_bytes());
            }
            if build_hash != prev.build_hash {
                debug!(target_id = self.id_str(id), "build function changed");
                depends_updated = iteration;
            }
        }

        for dep in self.state.graph.target(id).depends.to_vec() {
            self.wait(dep)?;
            depends_updated = depends_updated.max(self.done_iteration(dep));
            self.state.dot_edge(id, dep, Edge::Static);
        }

        if depends_updated <= prev.last_checked {
            for dep in self.state.db.depends(id)? {
                let dep = self.load(dep)?;
                if dep == id {
                    continue;
                }
                self.enqueue(dep, Some(id));
                self.wait(dep)?;
                depends_updated = depends_updated.max(self.done_iteration(dep));
            }
        }

        let stale = depends_updated > prev.last_checked || self.is_missing(id)?;
        if stale {
            debug!(
                target_id = self.id_str(id),
                depends_updated,
                last_checked = prev.last_checked,
                "stale"
            );
            match build {
                Some(build) => self.run_build(id, build)?,
                None => {
                    if let Some(parent) = prev.parent {
                        if self.rebuild_ancestor(id, parent)? {
                            return Ok(());
                        }
                    }
                    self.check_input(id)?;
                }
            }
        } else if let TargetKind::Scan { .. } = self.state.graph.target(id).kind {
            for scan in self.state.db.scans(id)? {
                let scan = self.load(scan)?;
                self.enqueue(scan, Some(id));
                self.wait(scan)?;
            }
        }

        let parent = self.state.graph.target(id).parent;
        self.state.db.set_build_hash(id, build_hash, parent)?;
        if let Some(parent) = parent {
            self.state.dot_edge(id, parent, Edge::Parent);
        }

        let (hash, mtime) = self.compute_hash(id, depends_updated, &prev)?;
        let last_updated = if prev.last_updated == 0 || hash != prev.hash {
            self.state.db.set_hash(id, hash, mtime)?;
            iteration
        } else {
            self.state.db.touch_checked(id, mtime)?;
            prev.last_updated
        };
        self.finish(id, hash, last_updated);
        Ok(())
    }

    fn done_iteration(&self, id: TargetId) -> u32 {
        match self.state.graph.target(id).status {
            Status::Done(n) => n,
            _ => 0,
        }
    }

    /// Mark a target up to date and release everything waiting on it.
    fn finish(&mut self, id: TargetId, hash: Hash, last_updated: u32) {
        let state = &mut *self.state;
        let target = state.graph.target_mut(id);
        target.hash = hash;
        target.status = Status::Done(last_updated);
        let affects = std::mem::take(&mut target.affects);
        state.counts.checked += 1;
        let updated = last_updated == state.db.iteration();
        state.dot_node(id, updated);
        state
            .progress
            .target_updated(state.db.ids().get(id), last_updated, &state.counts);
        self.engine.target_updated.notify_all();

        for waiter in affects.iter() {
            let w = state.graph.target_mut(waiter);
            w.wait_count = w.wait_count.saturating_sub(1);
            if w.wait_count == 0 && w.status == Status::Queued {
                state.queue.push(&mut state.graph, waiter);
                self.engine.target_available.notify_one();
            }
        }
    }

    fn file_path(&self, id: TargetId) -> Option<PathBuf> {
        match &self.state.graph.target(id).kind {
            TargetKind::File { path, absolute } => Some(if *absolute {
                PathBuf::from(path)
            } else {
                self.engine.root().join(path)
            }),
            _ => None,
        }
    }

    /// stat() a file target with the lock released.
    fn stat(&mut self, id: TargetId) -> anyhow::Result<(PathBuf, Stat)> {
        let Some(path) = self.file_path(id) else {
            bail!("{} is not a file", self.id_str(id));
        };
        let engine = self.engine;
        let path = engine.fs.resolve(&path);
        match self.unlocked(|| engine.fs.stat(&path)) {
            Ok(stat) => Ok((path, stat)),
            Err(err) => bail!("stat {}: {}", path.display(), err),
        }
    }

    fn is_missing(&mut self, id: TargetId) -> anyhow::Result<bool> {
        match &self.state.graph.target(id).kind {
            TargetKind::File { .. } => Ok(self.stat(id)?.1 == Stat::Missing),
            TargetKind::Expr { value: Some(_), .. } => Ok(false),
            TargetKind::Expr { value: None, .. } => {
                let Some(value) = self.state.db.expr(id)? else {
                    return Ok(true);
                };
                let mut refs = Vec::new();
                value.for_each_target(&mut |t| refs.push(t));
                for t in refs {
                    self.load(t)?;
                }
                if let TargetKind::Expr { value: v, .. } = &mut self.state.graph.target_mut(id).kind {
                    *v = Some(value);
                }
                Ok(false)
            }
            TargetKind::Scan { .. } => {
                for scan in self.state.db.scans(id)? {
                    let scan = self.load(scan)?;
                    if let TargetKind::File { .. } = self.state.graph.target(scan).kind {
                        if self.stat(scan)?.1 == Stat::Missing {
                            debug!(
                                target_id = self.id_str(id),
                                missing = self.id_str(scan),
                                "scan result missing"
                            );
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            TargetKind::Meta { .. } | TargetKind::Symbol { .. } => Ok(false),
        }
    }

    fn required_by(&self, id: TargetId) -> String {
        let names: Vec<&str> = self
            .state
            .graph
            .target(id)
            .affects
            .iter()
            .map(|t| self.id_str(t))
            .collect();
        names.join(", ")
    }

    /// A file with no way to build it must exist.
    fn check_input(&mut self, id: TargetId) -> anyhow::Result<()> {
        if self.file_path(id).is_none() {
            return Ok(());
        }
        let (path, stat) = self.stat(id)?;
        if stat == Stat::Missing {
            bail!(
                "{} is missing and has no build function (required by: {})",
                path.display(),
                self.required_by(id)
            );
        }
        Ok(())
    }

    /// Run a target's build function with it as the current target, then
    /// record what it produced and which dependencies it discovered.
    fn run_build(&mut self, id: TargetId, build: Arc<dyn BuildFn>) -> anyhow::Result<()> {
        let name = self.id_str(id).to_owned();
        self.state.progress.target_started(&name);
        self.state.counts.built += 1;
        self.state.graph.target_mut(id).built = true;
        let context = match self.state.graph.target(id).build_context {
            Some(context) => context,
            None => self.state.contexts.root(),
        };
        self.state.graph.target_mut(id).build_depends = TargetSet::new();

        let saved_target = self.target.replace(id);
        let saved_context = std::mem::replace(&mut self.context, context);
        let result = trace::scope("build", || build.call(self, id));
        self.target = saved_target;
        self.context = saved_context;

        let value = match result {
            _ if self.state.aborted => return Err(Aborted.into()),
            Ok(value) => value,
            Err(err) => {
                error!(target_id = %name, "{}", err);
                self.state.progress.target_failed(&name, &err);
                self.abort(anyhow!("failed to build {}: {}", name, err));
                return Err(Aborted.into());
            }
        };

        match self.state.graph.target(id).kind {
            TargetKind::Expr { .. } => {
                self.state.db.set_expr(id, &value)?;
                if let TargetKind::Expr { value: v, .. } = &mut self.state.graph.target_mut(id).kind {
                    *v = Some(value);
                }
            }
            TargetKind::Scan { .. } => {
                let scans = self.scan_results(id, &value)?;
                for &scan in &scans {
                    self.enqueue(scan, Some(id));
                }
                for &scan in &scans {
                    self.wait(scan)?;
                    self.state.dot_edge(id, scan, Edge::Scan);
                }
                self.state.db.set_scans(id, &scans)?;
            }
            _ => {}
        }

        let build_depends = self.state.graph.target(id).build_depends.to_vec();
        for &dep in &build_depends {
            self.state.dot_edge(id, dep, Edge::Build);
        }
        self.state.db.set_depends(id, &build_depends)
    }

    /// Flatten a scan build function's result into its set of targets.
    fn scan_results(&self, id: TargetId, value: &Value) -> anyhow::Result<Vec<TargetId>> {
        fn collect(value: &Value, set: &mut TargetSet) -> bool {
            match value {
                Value::Target(t) => {
                    set.insert(*t);
                    true
                }
                Value::List(items) => items.iter().all(|item| collect(item, set)),
                _ => false,
            }
        }
        let mut set = TargetSet::new();
        if !matches!(value, Value::List(_)) || !collect(value, &mut set) {
            bail!(
                "{}: scan results must be a list of targets",
                self.id_str(id)
            );
        }
        Ok(set.iter().filter(|&t| t != id).collect())
    }

    /// A target with no build function of its own went stale, but some
    /// ancestor's build function defined it last time.  Wait for the nearest
    /// ancestor that has a build function, re-running it if it has not run
    /// this iteration, then check the target again.
    /// Returns false when there is no ancestor to run.
    fn rebuild_ancestor(&mut self, id: TargetId, parent: TargetId) -> anyhow::Result<bool> {
        let mut ancestor = self.load(parent)?;
        let mut hops = 0;
        while self.state.graph.target(ancestor).build.is_none() {
            hops += 1;
            match self.state.db.parent(ancestor) {
                Some(p) if hops <= self.state.db.ids().len() => ancestor = self.load(p)?,
                _ => return Ok(false),
            }
        }
        if ancestor == id {
            return Ok(false);
        }
        match self.state.graph.target(ancestor).status {
            Status::Done(_) => {}
            // Its build is on our own stack and has not defined us yet.
            Status::Checking(owner) if owner == self.worker => return Ok(false),
            _ => self.wait(ancestor)?,
        }

        if self.state.graph.target(id).build.is_none() {
            if self.state.graph.target(ancestor).built {
                return Ok(false);
            }
            info!(
                "rebuilding {} because of {}",
                self.id_str(ancestor),
                self.id_str(id)
            );
            let Some(build) = self.state.graph.target(ancestor).build.clone() else {
                return Ok(false);
            };
            let status = std::mem::replace(
                &mut self.state.graph.target_mut(ancestor).status,
                Status::Checking(self.worker),
            );
            let result = self.run_build(ancestor, build);
            self.state.graph.target_mut(ancestor).status = status;
            self.engine.target_updated.notify_all();
            result?;
        }

        let state = &mut *self.state;
        state.graph.target_mut(id).status = Status::Unchecked;
        state.counts.queued = state.counts.queued.saturating_sub(1);
        self.enqueue(id, None);
        self.engine.target_updated.notify_all();
        Ok(true)
    }

    /// Hash a file from its contents and mtime, reusing the previous hash
    /// when the mtime is unchanged.
    fn hash_file(&mut self, id: TargetId, prev: &Details) -> anyhow::Result<(Hash, u64)> {
        let (path, stat) = self.stat(id)?;
        Ok(match stat {
            Stat::Missing => {
                warn!(
                    "{} does not exist (required by: {})",
                    path.display(),
                    self.required_by(id)
                );
                (Hash::filled(0xF0), 0)
            }
            Stat::Dir(mtime) => {
                let mut hash = Hash::filled(0xD0);
                hash.0[..8].copy_from_slice(&mtime.to_le_bytes());
                (hash, mtime)
            }
            Stat::File(mtime) if mtime == prev.mtime && prev.last_updated != 0 => (prev.hash, mtime),
            Stat::File(mtime) => {
                let engine = self.engine;
                let mut hash = match self.unlocked(|| engine.fs.digest(&path)) {
                    Ok(hash) => hash,
                    Err(err) => bail!("read {}: {}", path.display(), err),
                };
                hash.xor_cyclic(&mtime.to_le_bytes());
                (hash, mtime)
            }
        })
    }

    fn compute_hash(
        &mut self,
        id: TargetId,
        depends_updated: u32,
        prev: &Details,
    ) -> anyhow::Result<(Hash, u64)> {
        if self.file_path(id).is_some() {
            return self.hash_file(id, prev);
        }
        let iteration = self.iteration();
        let state = &*self.state;
        Ok(match &state.graph.target(id).kind {
            TargetKind::File { .. } => unreachable!(),
            TargetKind::Meta { .. } => {
                if depends_updated == iteration {
                    (Hash::from_u32(iteration), 0)
                } else {
                    (prev.hash, 0)
                }
            }
            TargetKind::Scan { .. } => {
                let mut hash = Hash::ZERO;
                for scan in state.db.scans(id)? {
                    if let Some(t) = state.graph.get(scan) {
                        hash.xor(&t.hash);
                    }
                }
                (hash, 0)
            }
            TargetKind::Expr { value, .. } => {
                let nil = Value::Nil;
                (value_hash(value.as_ref().unwrap_or(&nil), state.db.ids()), 0)
            }
            TargetKind::Symbol { context, name } => {
                let nil = Value::Nil;
                let value = state.contexts.symbol(*context, name).unwrap_or(&nil);
                (value_hash(value, state.db.ids()), 0)
            }
        })
    }
}
