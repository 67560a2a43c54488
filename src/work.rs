//! Scheduling: the engine, its shared state, and the worker pool.
//!
//! All graph, queue, and db state lives behind one global lock.  Build
//! functions run with the lock held and only release it around blocking
//! I/O (file hashing and subprocesses), so graph mutations never race.
//! Each worker thread owns a `BuildCx` holding the lock guard; the same
//! `BuildCx` is what build functions receive to call back into the engine.

use crate::context::{ContextId, Contexts};
use crate::db::Db;
use crate::dot::{DotWriter, Edge};
use crate::fs::{canon_path, FileSystem, RealFileSystem};
use crate::graph::{Graph, ParsedId, Status, Target, TargetId, TargetKind, WorkerId};
use crate::hash::Hash;
use crate::options::Options;
use crate::process::{self, Children};
use crate::progress::{ConsoleProgress, Counts, Progress};
use crate::queue::TargetQueue;
use crate::rule::BuildFn;
use crate::trace;
use crate::value::Value;
use anyhow::{anyhow, bail};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Id of the target that changes every iteration.
pub const ITERATION_ID: &str = "meta:::ITERATION";

/// Returned by waits interrupted because another worker hit a fatal error.
#[derive(Debug)]
pub struct Aborted;

impl std::fmt::Display for Aborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "build aborted")
    }
}

impl std::error::Error for Aborted {}

/// Everything guarded by the global lock.
pub struct State {
    pub(crate) graph: Graph,
    pub(crate) db: Db,
    pub(crate) queue: TargetQueue,
    pub(crate) contexts: Contexts,
    pub(crate) counts: Counts,
    pub(crate) progress: Box<dyn Progress>,
    pub(crate) dot: Option<DotWriter>,
    /// Workers not idle on an empty queue.
    running: usize,
    finished: bool,
    pub(crate) aborted: bool,
    error: Option<anyhow::Error>,
    /// Per worker, the target it is blocked waiting on.
    waiting_on: Vec<Option<TargetId>>,
}

impl State {
    pub(crate) fn id_str(&self, id: TargetId) -> &str {
        self.db.ids().get(id)
    }

    /// Record a dependency graph entry, if graph output is enabled.
    pub(crate) fn dot_edge(&mut self, from: TargetId, to: TargetId, kind: Edge) {
        if let Some(dot) = self.dot.as_mut() {
            let ids = self.db.ids();
            if dot.edge(ids.get(from), ids.get(to), kind).is_err() {
                self.dot = None;
            }
        }
    }

    pub(crate) fn dot_node(&mut self, id: TargetId, updated: bool) {
        if let Some(dot) = self.dot.as_mut() {
            if dot.node(self.db.ids().get(id), updated).is_err() {
                self.dot = None;
            }
        }
    }

    /// Forget per-run scheduling state left by an earlier run.
    fn reset_pending(&mut self) {
        self.queue.clear(&mut self.graph);
        for target in self.graph.targets_mut() {
            if matches!(target.status, Status::Queued | Status::Checking(_)) {
                target.reset();
            } else {
                target.affects = Default::default();
                target.wait_count = 0;
                target.built = false;
            }
        }
    }
}

pub struct Engine {
    root: PathBuf,
    options: Options,
    pub(crate) fs: Box<dyn FileSystem>,
    pub(crate) children: Children,
    state: Mutex<State>,
    pub(crate) target_available: Condvar,
    pub(crate) target_updated: Condvar,
}

impl Engine {
    /// Open the project at `root`, starting a new iteration of its cache.
    pub fn open(root: &Path, options: Options) -> anyhow::Result<Engine> {
        let progress = Box::new(ConsoleProgress::new(options.status_updates));
        Engine::open_with(root, options, Box::new(RealFileSystem::new()), progress)
    }

    pub fn open_with(
        root: &Path,
        options: Options,
        fs: Box<dyn FileSystem>,
        progress: Box<dyn Progress>,
    ) -> anyhow::Result<Engine> {
        let root = std::fs::canonicalize(root)
            .map_err(|err| anyhow!("project root {:?}: {}", root, err))?;
        if let Some(path) = &options.trace {
            trace::open(&path.to_string_lossy())?;
        }
        let mut db = Db::open(&root.join(&options.db_name))?;
        let iteration = db.bump_iteration()?;
        info!("iteration {}", iteration);
        let dot = match &options.dependency_graph {
            Some(path) => Some(DotWriter::create(path)?),
            None => None,
        };
        let engine = Engine {
            root,
            options,
            fs,
            children: Children::default(),
            state: Mutex::new(State {
                graph: Graph::default(),
                db,
                queue: TargetQueue::new(),
                contexts: Contexts::new(),
                counts: Counts::default(),
                progress,
                dot,
                running: 0,
                finished: false,
                aborted: false,
                error: None,
                waiting_on: vec![None],
            }),
            target_available: Condvar::new(),
            target_updated: Condvar::new(),
        };
        engine.define(|cx| cx.refresh_iteration_target())?;
        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Run definitions on the calling thread, in the root context with no
    /// current target.
    pub fn define<T>(&self, f: impl FnOnce(&mut BuildCx) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let state = self.state.lock();
        let context = state.contexts.root();
        let mut cx = BuildCx::new(self, state, WorkerId(0), context);
        f(&mut cx)
    }

    pub fn iteration(&self) -> u32 {
        self.state.lock().db.iteration()
    }

    /// Start another iteration in the same process, so every target is
    /// checked again by the next `build`.
    pub fn bump_iteration(&self) -> anyhow::Result<u32> {
        let iteration = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let iteration = state.db.bump_iteration()?;
            state.queue.clear(&mut state.graph);
            for target in state.graph.targets_mut() {
                target.reset();
            }
            iteration
        };
        self.define(|cx| cx.refresh_iteration_target())?;
        Ok(iteration)
    }

    pub fn status(&self, id: TargetId) -> Option<Status> {
        self.state.lock().graph.get(id).map(|t| t.status)
    }

    /// Iteration in which the target last changed, once it is up to date.
    pub fn last_updated(&self, id: TargetId) -> Option<u32> {
        match self.status(id)? {
            Status::Done(n) => Some(n),
            _ => None,
        }
    }

    pub fn hash(&self, id: TargetId) -> Option<Hash> {
        self.state.lock().graph.get(id).map(|t| t.hash)
    }

    /// The in-memory value of an `expr:` target.
    pub fn value(&self, id: TargetId) -> Option<Value> {
        match &self.state.lock().graph.get(id)?.kind {
            TargetKind::Expr { value, .. } => value.clone(),
            _ => None,
        }
    }

    /// The scan results recorded in the cache for a target.
    pub fn cached_scans(&self, id: TargetId) -> anyhow::Result<Vec<TargetId>> {
        self.state.lock().db.scans(id)
    }

    pub fn cached_depends(&self, id: TargetId) -> anyhow::Result<Vec<TargetId>> {
        self.state.lock().db.depends(id)
    }

    pub fn cached_parent(&self, id: TargetId) -> Option<TargetId> {
        self.state.lock().db.parent(id)
    }

    pub fn id_str(&self, id: TargetId) -> String {
        self.state.lock().id_str(id).to_owned()
    }

    /// Bring `roots` up to date, running build functions on a pool of
    /// worker threads.  Returns the run's counters.
    pub fn build(&self, roots: &[TargetId]) -> anyhow::Result<Counts> {
        let workers = self.options.parallelism.max(1);
        {
            let mut state = self.state.lock();
            state.reset_pending();
            state.counts = Counts::default();
            state.running = workers;
            state.finished = false;
            state.aborted = false;
            state.error = None;
            self.children.reset();
            state.waiting_on = vec![None; workers + 1];
            let context = state.contexts.root();
            let mut cx = BuildCx::new(self, state, WorkerId(0), context);
            for &root in roots {
                cx.enqueue(root, None);
            }
        }

        let panicked = trace::scope("work.run", || {
            std::thread::scope(|s| {
                let handles: Vec<_> = (1..=workers)
                    .map(|w| s.spawn(move || self.worker(WorkerId(w))))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().is_err())
                    .fold(false, |a, b| a || b)
            })
        });

        let mut state = self.state.lock();
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        if panicked {
            bail!("worker thread panicked");
        }
        let stuck: Vec<&str> = roots
            .iter()
            .filter(|&&id| !matches!(state.graph.target(id).status, Status::Done(_)))
            .map(|&id| state.id_str(id))
            .collect();
        if !stuck.is_empty() {
            let queued: Vec<&str> = state
                .graph
                .ids()
                .filter(|&id| state.graph.target(id).status == Status::Queued)
                .map(|id| state.id_str(id))
                .collect();
            bail!(
                "dependency cycle: {} could not be updated (waiting: {})",
                stuck.join(", "),
                queued.join(", ")
            );
        }
        Ok(state.counts)
    }

    fn worker(&self, worker: WorkerId) {
        let state = self.state.lock();
        let context = state.contexts.root();
        let mut cx = BuildCx::new(self, state, worker, context);
        cx.run_worker();
    }

    /// Flush the cache and finish any trace or graph output.
    pub fn close(self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.db.close()?;
        if let Some(dot) = state.dot.take() {
            dot.finish()?;
        }
        if self.options.trace.is_some() {
            trace::close()?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.children.kill_all();
    }
}

/// A worker's handle on the engine, holding the global lock.  Build
/// functions receive it to define targets and declare dependencies.
pub struct BuildCx<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) state: MutexGuard<'a, State>,
    pub(crate) worker: WorkerId,
    /// The target whose build function is running, if any.
    pub(crate) target: Option<TargetId>,
    pub(crate) context: ContextId,
}

impl<'a> BuildCx<'a> {
    fn new(
        engine: &'a Engine,
        state: MutexGuard<'a, State>,
        worker: WorkerId,
        context: ContextId,
    ) -> Self {
        BuildCx {
            engine,
            state,
            worker,
            target: None,
            context,
        }
    }

    pub fn root(&self) -> &Path {
        &self.engine.root
    }

    pub fn iteration(&self) -> u32 {
        self.state.db.iteration()
    }

    pub fn current_target(&self) -> Option<TargetId> {
        self.target
    }

    pub fn id_str(&self, id: TargetId) -> &str {
        self.state.id_str(id)
    }

    pub fn hash(&self, id: TargetId) -> Hash {
        self.state.graph.target(id).hash
    }

    pub fn status(&self, id: TargetId) -> Status {
        self.state.graph.target(id).status
    }

    /// Run `f` with the global lock released.  `f` must not touch the graph.
    pub fn unlocked<T>(&mut self, f: impl FnOnce() -> T) -> T {
        MutexGuard::unlocked(&mut self.state, f)
    }

    // Target factory.

    /// Look up or create the target for an id string.
    pub fn target(&mut self, id: &str) -> anyhow::Result<TargetId> {
        if let Some(index) = self.state.db.lookup(id) {
            if self.state.graph.contains(index) {
                return Ok(index);
            }
        }
        let kind = match ParsedId::parse(id)? {
            ParsedId::File { path } => TargetKind::File {
                path: path.to_owned(),
                absolute: path.starts_with('/'),
            },
            ParsedId::Meta { context, name } => TargetKind::Meta {
                context: context.to_owned(),
                name: name.to_owned(),
            },
            ParsedId::Expr { context, name } => TargetKind::Expr {
                context: context.to_owned(),
                name: name.to_owned(),
                value: None,
            },
            ParsedId::Scan { source, name } => TargetKind::Scan {
                source: self.target(source)?,
                name: name.to_owned(),
            },
            ParsedId::Symbol { context, name } => TargetKind::Symbol {
                context: self.state.contexts.by_name(context),
                name: name.to_owned(),
            },
        };
        let index = self.state.db.intern(id)?;
        let mut target = Target::new(kind);
        target.hash = self.state.db.details(index).hash;
        if let TargetKind::Scan { source, .. } = target.kind {
            target.depends.insert(source);
        }
        self.state.graph.insert(index, target);
        Ok(index)
    }

    /// Materialize a target known only by its cache index.
    pub(crate) fn load(&mut self, index: TargetId) -> anyhow::Result<TargetId> {
        if self.state.graph.contains(index) {
            return Ok(index);
        }
        let id = match self.state.db.ids().try_get(index) {
            Some(id) => id.to_owned(),
            None => bail!("unknown target index {}", index.index()),
        };
        self.target(&id)
    }

    /// The `file:` target for a path, relative to the current context's
    /// directory unless absolute.
    pub fn file(&mut self, path: &str) -> anyhow::Result<TargetId> {
        let path = if path.starts_with('/') {
            let path = canon_path(path);
            let root = self.engine.root.to_string_lossy();
            match path.strip_prefix(&*root).and_then(|p| p.strip_prefix('/')) {
                Some(rel) => rel.to_owned(),
                None => path,
            }
        } else {
            let dir = self.state.contexts.get(self.context).path.trim_start_matches('/');
            if dir.is_empty() {
                canon_path(path)
            } else {
                canon_path(&format!("{}/{}", dir, path))
            }
        };
        self.target(&format!("file:{}", path))
    }

    pub fn meta(&mut self, name: &str) -> anyhow::Result<TargetId> {
        let id = format!("meta:{}::{}", self.state.contexts.get(self.context).path, name);
        self.target(&id)
    }

    pub fn expr(&mut self, name: &str) -> anyhow::Result<TargetId> {
        let id = format!("expr:{}::{}", self.state.contexts.get(self.context).path, name);
        self.target(&id)
    }

    pub fn scan(&mut self, source: TargetId, name: &str) -> anyhow::Result<TargetId> {
        let id = format!("scan:{}::{}", self.id_str(source), name);
        self.target(&id)
    }

    pub fn symbol(&mut self, name: &str) -> anyhow::Result<TargetId> {
        let id = format!("symb:{}/{}", self.state.contexts.get(self.context).name, name);
        self.target(&id)
    }

    pub(crate) fn refresh_iteration_target(&mut self) -> anyhow::Result<()> {
        let id = self.target(ITERATION_ID)?;
        let iteration = self.iteration();
        let hash = Hash::from_u32(iteration);
        let root = self.state.contexts.root();
        self.state
            .contexts
            .set_symbol(root, "ITERATION", Value::Integer(iteration as i64));
        self.state.db.set_hash(id, hash, 0)?;
        let target = self.state.graph.target_mut(id);
        target.hash = hash;
        target.status = Status::Done(iteration);
        Ok(())
    }

    // Definitions.

    /// Add a static dependency.  During a build it is also recorded as a
    /// dependency discovered by that build.
    pub fn add_depends(&mut self, target: TargetId, dep: TargetId) {
        if target == dep {
            return;
        }
        let building = self.target.is_some();
        let t = self.state.graph.target_mut(target);
        t.depends.insert(dep);
        if building {
            t.build_depends.insert(dep);
        }
    }

    /// Attach a build function, capturing the current context.  Inside a
    /// build, the running target becomes the new build's parent.
    pub fn set_build(&mut self, target: TargetId, build: Arc<dyn BuildFn>) {
        let context = self.context;
        let parent = self.target;
        let t = self.state.graph.target_mut(target);
        t.build = Some(build);
        t.build_context = Some(context);
        if parent.is_some() && parent != Some(target) {
            t.parent = parent;
        }
    }

    pub fn set_symbol(&mut self, name: &str, value: Value) {
        self.state.contexts.set_symbol(self.context, name, value);
    }

    pub fn symbol_value(&self, name: &str) -> Value {
        self.state
            .contexts
            .symbol(self.context, name)
            .cloned()
            .unwrap_or_default()
    }

    /// Run `f` with the context for directory `path` ("" or "/a/b") current.
    pub fn in_directory<T>(
        &mut self,
        path: &str,
        f: impl FnOnce(&mut Self) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let context = self.state.contexts.directory(path);
        let saved = std::mem::replace(&mut self.context, context);
        let result = f(self);
        self.context = saved;
        result
    }

    /// Run `f` in a named scope nested in the current context.
    pub fn in_scope<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let context = self.state.contexts.scope(self.context, name);
        let saved = std::mem::replace(&mut self.context, context);
        let result = f(self);
        self.context = saved;
        result
    }

    /// Record `dep` as a dependency of the running build and bring it up to
    /// date before returning.  Does nothing outside a build.
    pub fn depends_auto(&mut self, dep: TargetId) -> anyhow::Result<()> {
        let Some(current) = self.target else {
            return Ok(());
        };
        if current == dep {
            return Ok(());
        }
        self.state.graph.target_mut(current).build_depends.insert(dep);
        self.enqueue(dep, Some(current));
        self.wait(dep)
    }

    /// The value of an `expr:` target, brought up to date first when called
    /// from a build.
    pub fn value(&mut self, expr: TargetId) -> anyhow::Result<Value> {
        self.depends_auto(expr)?;
        match &self.state.graph.target(expr).kind {
            TargetKind::Expr { value, .. } => Ok(value.clone().unwrap_or_default()),
            _ => bail!("{} is not an expression target", self.id_str(expr)),
        }
    }

    /// Run a shell command in the current context's directory with the
    /// global lock released.
    pub fn run_command(&mut self, cmdline: &str) -> anyhow::Result<process::Output> {
        let dir = self.state.contexts.dir(&self.engine.root, self.context);
        debug!(dir = %dir.display(), "run {}", cmdline);
        let engine = self.engine;
        self.unlocked(|| process::run_command(&engine.children, cmdline, &dir))
    }

    // Scheduling.

    /// Queue a target for update.  With `waiter`, also record that `waiter`
    /// can't complete until `id` does.
    pub(crate) fn enqueue(&mut self, id: TargetId, waiter: Option<TargetId>) {
        let state = &mut *self.state;
        if let Status::Done(_) = state.graph.target(id).status {
            return;
        }
        if let Some(waiter) = waiter {
            if state.graph.target_mut(id).affects.insert(waiter) {
                state.graph.target_mut(waiter).wait_count += 1;
            }
        }
        match state.graph.target(id).status {
            Status::Unchecked => {
                state.graph.target_mut(id).status = Status::Queued;
                state.counts.queued += 1;
                for dep in state.graph.target(id).depends.to_vec() {
                    self.enqueue(dep, Some(id));
                }
                let state = &mut *self.state;
                if state.graph.target(id).wait_count == 0 {
                    state.queue.push(&mut state.graph, id);
                    self.engine.target_available.notify_one();
                }
            }
            Status::Queued => state.queue.invalidate(&mut state.graph, id),
            _ => {}
        }
    }

    /// Block until a target is up to date, updating it on this worker if
    /// no other worker has started it.
    pub(crate) fn wait(&mut self, id: TargetId) -> anyhow::Result<()> {
        loop {
            if self.state.aborted {
                return Err(Aborted.into());
            }
            match self.state.graph.target(id).status {
                Status::Done(_) => return Ok(()),
                Status::Unchecked => self.enqueue(id, None),
                Status::Queued => self.update(id)?,
                Status::Checking(owner) => {
                    if let Err(err) = self.check_cycle(id, owner) {
                        self.abort(err);
                        return Err(Aborted.into());
                    }
                    self.state.waiting_on[self.worker.0] = Some(id);
                    self.engine.target_updated.wait(&mut self.state);
                    self.state.waiting_on[self.worker.0] = None;
                }
            }
        }
    }

    /// Fail if blocking on `id`, being checked by `owner`, would wait on
    /// this worker through the chain of workers waiting on each other.
    fn check_cycle(&self, id: TargetId, owner: WorkerId) -> anyhow::Result<()> {
        let mut worker = owner;
        for _ in 0..self.state.waiting_on.len() {
            if worker == self.worker {
                bail!("dependency cycle detected at {}", self.id_str(id));
            }
            let Some(Some(next)) = self.state.waiting_on.get(worker.0) else {
                return Ok(());
            };
            match self.state.graph.target(*next).status {
                Status::Checking(w) => worker = w,
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    fn run_worker(&mut self) {
        loop {
            let next = loop {
                if self.state.finished || self.state.aborted {
                    return;
                }
                let state = &mut *self.state;
                if let Some(id) = state.queue.pop(&mut state.graph) {
                    break id;
                }
                state.running -= 1;
                if state.running == 0 {
                    state.finished = true;
                    self.engine.target_available.notify_all();
                    return;
                }
                self.engine.target_available.wait(&mut self.state);
                if self.state.finished || self.state.aborted {
                    return;
                }
                self.state.running += 1;
            };
            if self.state.graph.target(next).status == Status::Queued {
                if let Err(err) = self.update(next) {
                    self.abort(err);
                    return;
                }
            }
        }
    }

    /// Stop the build: record the first real error, kill running children,
    /// and wake every waiter.
    pub(crate) fn abort(&mut self, err: anyhow::Error) {
        if !err.is::<Aborted>() && self.state.error.is_none() {
            self.state.error = Some(err);
        }
        self.state.aborted = true;
        self.engine.children.kill_all();
        self.engine.target_available.notify_all();
        self.engine.target_updated.notify_all();
    }
}
