//! Engine tests against a real temporary project directory.

use filetime::FileTime;
use mason::fs::{FileSystem, RealFileSystem, Stat};
use mason::hash::Hash;
use mason::process::Termination;
use mason::progress::NoProgress;
use mason::{BuildCx, BuildError, BuildFn, Engine, Options, Rule, Status, TargetId, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Implementation of fs::FileSystem that counts content reads.
struct CountingFileSystem {
    real: RealFileSystem,
    digests: Arc<AtomicUsize>,
}

impl FileSystem for CountingFileSystem {
    fn stat(&self, path: &Path) -> std::io::Result<Stat> {
        self.real.stat(path)
    }

    fn digest(&self, path: &Path) -> std::io::Result<Hash> {
        self.digests.fetch_add(1, Ordering::SeqCst);
        self.real.digest(path)
    }
}

/// Manages a temporary project directory.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    fn path(&self, path: &str) -> PathBuf {
        self.dir.path().join(path)
    }

    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.path(path), content)
    }

    /// Set a file's mtime `secs` seconds into the future.
    fn touch_ahead(&self, path: &str, secs: i64) -> std::io::Result<()> {
        let now = FileTime::now();
        let t = FileTime::from_unix_time(now.unix_seconds() + secs, 0);
        filetime::set_file_mtime(self.path(path), t)
    }

    fn open(&self) -> anyhow::Result<Engine> {
        self.open_with(Options::default())
    }

    fn open_with(&self, options: Options) -> anyhow::Result<Engine> {
        Engine::open_with(
            self.dir.path(),
            options,
            Box::new(RealFileSystem::new()),
            Box::new(NoProgress),
        )
    }

    fn open_counting(&self, digests: &Arc<AtomicUsize>) -> anyhow::Result<Engine> {
        let fs = CountingFileSystem {
            real: RealFileSystem::new(),
            digests: digests.clone(),
        };
        Engine::open_with(
            self.dir.path(),
            Options::default(),
            Box::new(fs),
            Box::new(NoProgress),
        )
    }
}

fn rule(
    identity: &str,
    f: impl Fn(&mut BuildCx, TargetId) -> Result<Value, BuildError> + Send + Sync + 'static,
) -> Arc<dyn BuildFn> {
    Arc::new(Rule::new(identity, f))
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn count(c: &Arc<AtomicUsize>) -> usize {
    c.load(Ordering::SeqCst)
}

#[test]
fn unchanged_file_is_not_rehashed() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "hello")?;

    let digests = counter();
    let engine = space.open_counting(&digests)?;
    let a = engine.define(|cx| cx.file("a.txt"))?;
    engine.build(&[a])?;
    assert_eq!(engine.last_updated(a), Some(1));
    assert_eq!(count(&digests), 1);
    engine.close()?;

    let digests = counter();
    let engine = space.open_counting(&digests)?;
    let a = engine.define(|cx| cx.file("a.txt"))?;
    engine.build(&[a])?;
    assert_eq!(engine.iteration(), 2);
    assert_eq!(engine.last_updated(a), Some(1));
    assert_eq!(count(&digests), 0);
    Ok(())
}

fn define_all(cx: &mut BuildCx) -> anyhow::Result<(TargetId, TargetId, TargetId)> {
    let a = cx.file("a.txt")?;
    let b = cx.file("b.txt")?;
    let all = cx.meta("all")?;
    cx.add_depends(all, a);
    cx.add_depends(all, b);
    Ok((a, b, all))
}

#[test]
fn touch_propagates_through_meta() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "a")?;
    space.write("b.txt", "b")?;

    let engine = space.open()?;
    let (a, b, all) = engine.define(define_all)?;
    engine.build(&[all])?;
    assert_eq!(engine.last_updated(all), Some(1));
    engine.close()?;

    space.touch_ahead("b.txt", 100)?;
    let engine = space.open()?;
    let (a2, b2, all2) = engine.define(define_all)?;
    assert_eq!((a, b, all), (a2, b2, all2));
    engine.build(&[all])?;
    assert_eq!(engine.last_updated(b), Some(2));
    assert_eq!(engine.last_updated(all), Some(2));
    assert_eq!(engine.last_updated(a), Some(1));
    engine.close()?;

    // Nothing changed: everything keeps its iteration.
    let engine = space.open()?;
    engine.define(define_all)?;
    engine.build(&[all])?;
    assert_eq!(engine.last_updated(all), Some(2));
    assert_eq!(engine.last_updated(b), Some(2));
    Ok(())
}

fn define_flags(cx: &mut BuildCx, calls: &Arc<AtomicUsize>) -> anyhow::Result<TargetId> {
    let flags = cx.expr("CFLAGS")?;
    let c = calls.clone();
    cx.set_build(
        flags,
        rule("cflags", move |cx, _| {
            c.fetch_add(1, Ordering::SeqCst);
            let src = cx.file("main.c")?;
            Ok(Value::List(vec![Value::from("-O2"), Value::Target(src)]))
        }),
    );
    Ok(flags)
}

#[test]
fn expr_value_persists_across_runs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "int main;")?;
    let calls = counter();

    let engine = space.open()?;
    let flags = engine.define(|cx| define_flags(cx, &calls))?;
    engine.build(&[flags])?;
    let expected = engine.value(flags);
    assert!(matches!(&expected, Some(Value::List(items)) if items.len() == 2));
    engine.close()?;

    let engine = space.open()?;
    engine.define(|cx| define_flags(cx, &calls))?;
    engine.build(&[flags])?;
    assert_eq!(count(&calls), 1);
    assert_eq!(engine.value(flags), expected);
    assert_eq!(engine.last_updated(flags), Some(1));
    Ok(())
}

fn define_scan(cx: &mut BuildCx, calls: &Arc<AtomicUsize>) -> anyhow::Result<TargetId> {
    let src = cx.file("a.c")?;
    let includes = cx.scan(src, "includes")?;
    let c = calls.clone();
    cx.set_build(
        includes,
        rule("includes", move |cx, _| {
            c.fetch_add(1, Ordering::SeqCst);
            let mut found = Vec::new();
            for name in ["x.h", "y.h"] {
                if cx.root().join(name).exists() {
                    found.push(Value::Target(cx.file(name)?));
                }
            }
            Ok(Value::List(found))
        }),
    );
    Ok(includes)
}

#[test]
fn scan_reports_missing_results() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.c", "#include \"x.h\"\n#include \"y.h\"\n")?;
    space.write("x.h", "x")?;
    space.write("y.h", "y")?;
    let calls = counter();

    let engine = space.open()?;
    let includes = engine.define(|cx| define_scan(cx, &calls))?;
    assert_eq!(engine.id_str(includes), "scan:file:a.c::includes");
    engine.build(&[includes])?;
    assert_eq!(engine.cached_scans(includes)?.len(), 2);
    engine.close()?;

    // Unchanged: the scan isn't re-run.
    let engine = space.open()?;
    engine.define(|cx| define_scan(cx, &calls))?;
    engine.build(&[includes])?;
    assert_eq!(count(&calls), 1);
    engine.close()?;

    std::fs::remove_file(space.path("y.h"))?;
    let engine = space.open()?;
    engine.define(|cx| define_scan(cx, &calls))?;
    engine.build(&[includes])?;
    assert_eq!(count(&calls), 2);
    let scans = engine.cached_scans(includes)?;
    assert_eq!(scans.len(), 1);
    assert_eq!(engine.id_str(scans[0]), "file:x.h");
    assert_eq!(engine.last_updated(includes), Some(3));
    Ok(())
}

#[test]
fn shared_dependency_builds_once() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let shared_calls = counter();
    let user_calls = counter();

    let engine = space.open_with(Options {
        parallelism: 8,
        ..Options::default()
    })?;
    let (all, users) = engine.define(|cx| {
        let shared = cx.expr("shared")?;
        let c = shared_calls.clone();
        cx.set_build(
            shared,
            rule("shared", move |cx, _| {
                c.fetch_add(1, Ordering::SeqCst);
                cx.unlocked(|| std::thread::sleep(Duration::from_millis(20)));
                Ok(Value::Integer(42))
            }),
        );
        let all = cx.meta("all")?;
        let mut users = Vec::new();
        for i in 0..16 {
            let user = cx.expr(&format!("user{}", i))?;
            let c = user_calls.clone();
            cx.set_build(
                user,
                rule("user", move |cx, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(cx.value(shared)?)
                }),
            );
            cx.add_depends(all, user);
            users.push(user);
        }
        Ok((all, users))
    })?;
    let counts = engine.build(&[all])?;
    assert_eq!(count(&shared_calls), 1);
    assert_eq!(count(&user_calls), 16);
    assert_eq!(counts.built, 17);
    for user in users {
        assert_eq!(engine.value(user), Some(Value::Integer(42)));
    }
    Ok(())
}

#[test]
fn repeat_build_is_noop() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "a")?;
    space.write("b.txt", "b")?;
    let engine = space.open()?;
    let (_, _, all) = engine.define(define_all)?;
    let first = engine.build(&[all])?;
    assert_eq!(first.checked, 3);
    let second = engine.build(&[all])?;
    assert_eq!(second.checked, 0);
    assert_eq!(engine.status(all), Some(Status::Done(1)));
    Ok(())
}

#[test]
fn depends_build_first() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let engine = space.open()?;
    let a = engine.define(|cx| {
        let mut prev = None;
        let mut last = None;
        for name in ["c", "b", "a"] {
            let t = cx.meta(name)?;
            let order = order.clone();
            cx.set_build(
                t,
                rule(name, move |_, _| {
                    order.lock().unwrap().push(name);
                    Ok(Value::Nil)
                }),
            );
            if let Some(prev) = prev {
                cx.add_depends(t, prev);
            }
            prev = Some(t);
            last = Some(t);
        }
        last.ok_or_else(|| anyhow::anyhow!("no targets"))
    })?;
    engine.build(&[a])?;
    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    Ok(())
}

#[test]
fn static_cycle_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.open()?;
    let a = engine.define(|cx| {
        let a = cx.meta("a")?;
        let b = cx.meta("b")?;
        cx.add_depends(a, b);
        cx.add_depends(b, a);
        Ok(a)
    })?;
    let err = engine.build(&[a]).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{}", err);
    Ok(())
}

#[test]
fn dynamic_cycle_is_reported() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.open_with(Options {
        parallelism: 2,
        ..Options::default()
    })?;
    let a = engine.define(|cx| {
        let a = cx.meta("a")?;
        let b = cx.meta("b")?;
        cx.set_build(
            a,
            rule("a", move |cx, _| {
                cx.depends_auto(b)?;
                Ok(Value::Nil)
            }),
        );
        cx.set_build(
            b,
            rule("b", move |cx, _| {
                cx.depends_auto(a)?;
                Ok(Value::Nil)
            }),
        );
        Ok(a)
    })?;
    let err = engine.build(&[a]).unwrap_err();
    assert!(format!("{:#}", err).contains("cycle"), "{:#}", err);
    Ok(())
}

#[test]
fn build_error_is_fatal() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.open()?;
    let all = engine.define(|cx| {
        let bad = cx.meta("bad")?;
        cx.set_build(
            bad,
            rule("bad", |_, _| Err(BuildError::new("boom").at("build.mason", 3))),
        );
        let all = cx.meta("all")?;
        cx.add_depends(all, bad);
        Ok(all)
    })?;
    let err = engine.build(&[all]).unwrap_err().to_string();
    assert!(err.contains("meta:::bad"), "{}", err);
    assert!(err.contains("boom"), "{}", err);
    assert!(err.contains("build.mason:3"), "{}", err);
    assert_ne!(engine.status(all), Some(Status::Done(1)));
    Ok(())
}

#[test]
fn swallowed_dependency_error_still_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.open_with(Options {
        parallelism: 1,
        ..Options::default()
    })?;
    let a = engine.define(|cx| {
        let b = cx.meta("b")?;
        cx.set_build(b, rule("b", |_, _| Err(BuildError::new("boom"))));
        let a = cx.meta("a")?;
        cx.set_build(
            a,
            rule("a", move |cx, _| {
                let _ = cx.depends_auto(b);
                Ok(Value::Nil)
            }),
        );
        Ok(a)
    })?;
    let err = engine.build(&[a]).unwrap_err();
    assert!(format!("{:#}", err).contains("boom"), "{:#}", err);
    assert!(!matches!(engine.status(a), Some(Status::Done(_))));
    Ok(())
}

#[test]
fn missing_input_is_fatal() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.open()?;
    let all = engine.define(|cx| {
        let missing = cx.file("missing.txt")?;
        let all = cx.meta("all")?;
        cx.add_depends(all, missing);
        Ok(all)
    })?;
    let err = engine.build(&[all]).unwrap_err().to_string();
    assert!(err.contains("missing.txt"), "{}", err);
    assert!(err.contains("required by: meta:::all"), "{}", err);
    Ok(())
}

#[test]
fn build_function_change_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let calls = counter();
    let run = |identity: &'static str| -> anyhow::Result<()> {
        let engine = space.open()?;
        let e = engine.define(|cx| {
            let e = cx.expr("version")?;
            let c = calls.clone();
            cx.set_build(
                e,
                rule(identity, move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from(identity))
                }),
            );
            Ok(e)
        })?;
        engine.build(&[e])?;
        engine.close()
    };
    run("v1")?;
    run("v2")?;
    assert_eq!(count(&calls), 2);
    run("v2")?;
    assert_eq!(count(&calls), 2);
    Ok(())
}

fn define_generated(
    cx: &mut BuildCx,
    gen_calls: &Arc<AtomicUsize>,
    write_calls: &Arc<AtomicUsize>,
) -> anyhow::Result<(TargetId, TargetId)> {
    let gen = cx.meta("gen")?;
    let g = gen_calls.clone();
    let w = write_calls.clone();
    cx.set_build(
        gen,
        rule("gen", move |cx, _| {
            g.fetch_add(1, Ordering::SeqCst);
            let out = cx.file("out.txt")?;
            let w = w.clone();
            cx.set_build(
                out,
                rule("write", move |cx, _| {
                    w.fetch_add(1, Ordering::SeqCst);
                    std::fs::write(cx.root().join("out.txt"), "generated")
                        .map_err(|err| BuildError::new(err.to_string()))?;
                    Ok(Value::Nil)
                }),
            );
            Ok(Value::Nil)
        }),
    );
    let all = cx.meta("all")?;
    cx.add_depends(all, gen);
    cx.set_build(
        all,
        rule("all", |cx, _| {
            let out = cx.file("out.txt")?;
            cx.depends_auto(out)?;
            Ok(Value::Nil)
        }),
    );
    Ok((gen, all))
}

#[test]
fn stale_output_reruns_defining_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let gen_calls = counter();
    let write_calls = counter();

    let engine = space.open()?;
    let (gen, all) = engine.define(|cx| define_generated(cx, &gen_calls, &write_calls))?;
    engine.build(&[all])?;
    assert_eq!((count(&gen_calls), count(&write_calls)), (1, 1));
    let out = engine.define(|cx| cx.file("out.txt"))?;
    assert_eq!(engine.cached_parent(out), Some(gen));
    engine.close()?;

    // In a new process only `gen` knows how to build out.txt, and gen itself
    // is up to date.  Losing the output must re-run gen to redefine it.
    std::fs::remove_file(space.path("out.txt"))?;
    let engine = space.open()?;
    engine.define(|cx| define_generated(cx, &gen_calls, &write_calls))?;
    engine.build(&[all])?;
    assert_eq!((count(&gen_calls), count(&write_calls)), (2, 2));
    assert_eq!(std::fs::read_to_string(space.path("out.txt"))?, "generated");
    assert_eq!(engine.last_updated(out), Some(2));
    assert_eq!(engine.cached_parent(out), Some(gen));
    Ok(())
}

/// p's build is slow and defines how to build c.txt.  c.txt waits only on d,
/// so it can go stale while p is still running.
fn define_slow_parent(
    cx: &mut BuildCx,
    calls: &Arc<AtomicUsize>,
    active: &Arc<AtomicUsize>,
    overlap: &Arc<AtomicUsize>,
) -> anyhow::Result<(TargetId, TargetId)> {
    let iteration = cx.target("meta:::ITERATION")?;
    let p = cx.meta("p")?;
    let d = cx.meta("d")?;
    let c = cx.file("c.txt")?;
    cx.add_depends(p, iteration);
    cx.add_depends(d, iteration);
    cx.add_depends(c, iteration);
    cx.add_depends(c, d);
    cx.set_build(d, rule("d", |_, _| Ok(Value::Nil)));
    let (calls, active, overlap) = (calls.clone(), active.clone(), overlap.clone());
    cx.set_build(
        p,
        rule("p", move |cx, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            overlap.fetch_max(now, Ordering::SeqCst);
            cx.unlocked(|| std::thread::sleep(Duration::from_millis(300)));
            active.fetch_sub(1, Ordering::SeqCst);
            let c = cx.file("c.txt")?;
            cx.set_build(
                c,
                rule("write c", |cx, _| {
                    std::fs::write(cx.root().join("c.txt"), "c")
                        .map_err(|err| BuildError::new(err.to_string()))?;
                    Ok(Value::Nil)
                }),
            );
            Ok(Value::Nil)
        }),
    );
    Ok((p, c))
}

#[test]
fn retroactive_rebuild_waits_for_running_ancestor() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let (calls, active, overlap) = (counter(), counter(), counter());

    let engine = space.open_with(Options {
        parallelism: 1,
        ..Options::default()
    })?;
    let (p, c) = engine.define(|cx| define_slow_parent(cx, &calls, &active, &overlap))?;
    engine.build(&[p])?;
    engine.build(&[c])?;
    assert_eq!(engine.cached_parent(c), Some(p));
    engine.close()?;

    // Both p and c.txt are stale.  The worker checking c.txt must wait for
    // the worker running p rather than run p a second time alongside it.
    let engine = space.open_with(Options {
        parallelism: 2,
        ..Options::default()
    })?;
    let all = engine.define(|cx| {
        let (p, c) = define_slow_parent(cx, &calls, &active, &overlap)?;
        let all = cx.meta("all")?;
        cx.add_depends(all, p);
        cx.add_depends(all, c);
        Ok(all)
    })?;
    engine.build(&[all])?;
    assert_eq!(count(&calls), 2);
    assert_eq!(count(&overlap), 1);
    assert_eq!(std::fs::read_to_string(space.path("c.txt"))?, "c");
    Ok(())
}

fn define_symbol_user(
    cx: &mut BuildCx,
    cc: &str,
    calls: &Arc<AtomicUsize>,
) -> anyhow::Result<TargetId> {
    cx.set_symbol("CC", Value::from(cc));
    let symbol = cx.symbol("CC")?;
    let out = cx.expr("compiler")?;
    let c = calls.clone();
    cx.set_build(
        out,
        rule("compiler", move |cx, _| {
            c.fetch_add(1, Ordering::SeqCst);
            cx.depends_auto(symbol)?;
            Ok(cx.symbol_value("CC"))
        }),
    );
    Ok(out)
}

#[test]
fn symbol_changes_propagate() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let calls = counter();
    for (cc, expected_calls) in [("gcc", 1), ("gcc", 1), ("clang", 2)] {
        let engine = space.open()?;
        let out = engine.define(|cx| define_symbol_user(cx, cc, &calls))?;
        engine.build(&[out])?;
        assert_eq!(count(&calls), expected_calls, "CC={}", cc);
        assert_eq!(engine.value(out), Some(Value::from(cc)));
        engine.close()?;
    }
    Ok(())
}

#[test]
fn iteration_target_forces_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let calls = counter();
    for run in 1..=2 {
        let engine = space.open()?;
        let stamp = engine.define(|cx| {
            let stamp = cx.expr("stamp")?;
            let c = calls.clone();
            cx.set_build(
                stamp,
                rule("stamp", move |cx, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                    let iteration = cx.target("meta:::ITERATION")?;
                    cx.depends_auto(iteration)?;
                    Ok(cx.symbol_value("ITERATION"))
                }),
            );
            Ok(stamp)
        })?;
        engine.build(&[stamp])?;
        assert_eq!(count(&calls), run);
        assert_eq!(engine.value(stamp), Some(Value::Integer(run as i64)));
        engine.close()?;
    }
    Ok(())
}

#[test]
fn commands_run_in_context_directory() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    std::fs::create_dir(space.path("sub"))?;
    let engine = space.open()?;
    let out = engine.define(|cx| {
        cx.in_directory("/sub", |cx| {
            let out = cx.file("out.txt")?;
            cx.set_build(
                out,
                rule("echo", |cx, _| {
                    let result = cx.run_command("echo hi > out.txt")?;
                    if result.termination != Termination::Success {
                        return Err(BuildError::new("command failed"));
                    }
                    Ok(Value::Nil)
                }),
            );
            Ok(out)
        })
    })?;
    assert_eq!(engine.id_str(out), "file:sub/out.txt");
    engine.build(&[out])?;
    assert_eq!(std::fs::read_to_string(space.path("sub/out.txt"))?, "hi\n");
    Ok(())
}

#[test]
fn bump_iteration_rechecks_in_process() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "a")?;
    space.write("b.txt", "b")?;
    let engine = space.open()?;
    let (a, b, all) = engine.define(define_all)?;
    engine.build(&[all])?;

    space.write("a.txt", "changed")?;
    space.touch_ahead("a.txt", 100)?;
    assert_eq!(engine.bump_iteration()?, 2);
    assert_eq!(engine.status(all), Some(Status::Unchecked));
    engine.build(&[all])?;
    assert_eq!(engine.last_updated(a), Some(2));
    assert_eq!(engine.last_updated(b), Some(1));
    assert_eq!(engine.last_updated(all), Some(2));
    Ok(())
}

#[test]
fn dependency_graph_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "a")?;
    space.write("b.txt", "b")?;
    let dot = space.path("deps.dot");
    let engine = space.open_with(Options {
        dependency_graph: Some(dot.clone()),
        ..Options::default()
    })?;
    let (_, _, all) = engine.define(define_all)?;
    engine.build(&[all])?;
    engine.close()?;
    let text = std::fs::read_to_string(&dot)?;
    assert!(text.starts_with("digraph Dependencies {"), "{}", text);
    assert!(text.contains("\"meta:::all\" -> \"file:a.txt\";"), "{}", text);
    Ok(())
}

#[test]
fn incompatible_cache_rebuilds_everything() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let calls = counter();
    let run = || -> anyhow::Result<u32> {
        let engine = space.open()?;
        let flags = engine.define(|cx| define_flags(cx, &calls))?;
        engine.build(&[flags])?;
        let iteration = engine.iteration();
        engine.close()?;
        Ok(iteration)
    };
    space.write("main.c", "int main;")?;
    assert_eq!(run()?, 1);
    assert_eq!(run()?, 2);
    assert_eq!(count(&calls), 1);

    std::fs::write(space.path(".mason_db/metadata"), "mason-db 9.0.0\n5\n")?;
    assert_eq!(run()?, 1);
    assert_eq!(count(&calls), 2);
    Ok(())
}
