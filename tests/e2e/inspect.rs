//! Tests for the cache inspection commands.

use super::*;
use mason::{Rule, Value};
use std::sync::Arc;

/// Build a small project: an input file, an expression, and a meta target
/// depending on both.
fn populate(space: &TestSpace) -> anyhow::Result<()> {
    space.write("in.txt", "input")?;
    let engine = space.engine()?;
    let all = engine.define(|cx| {
        let input = cx.file("in.txt")?;
        let flags = cx.expr("flags")?;
        cx.set_build(
            flags,
            Arc::new(Rule::new("flags", move |_, _| {
                Ok(Value::List(vec![Value::from("-g"), Value::Target(input)]))
            })),
        );
        let all = cx.meta("all")?;
        cx.add_depends(all, input);
        cx.add_depends(all, flags);
        Ok(all)
    })?;
    engine.build(&[all])?;
    engine.close()
}

#[test]
fn info() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    populate(&space)?;
    let out = space.run_expect(&mut mason_command(vec!["info"]))?;
    assert_output_contains(&out, "version: 0.1.0");
    assert_output_contains(&out, "iteration: 1");
    Ok(())
}

#[test]
fn list() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    populate(&space)?;
    let out = space.run_expect(&mut mason_command(vec!["list"]))?;
    assert_output_contains(&out, "file:in.txt");
    assert_output_contains(&out, "expr:::flags");
    assert_output_contains(&out, "meta:::all");
    Ok(())
}

#[test]
fn show_expr() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    populate(&space)?;
    let out = space.run_expect(&mut mason_command(vec!["show", "expr:::flags"]))?;
    assert_output_contains(&out, "last updated: 1");
    assert_output_contains(&out, "value: [\"-g\", file:in.txt]");
    Ok(())
}

#[test]
fn show_unknown_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    populate(&space)?;
    let out = space.run(&mut mason_command(vec!["show", "meta:::nope"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "unknown target");
    Ok(())
}

#[test]
fn no_cache() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut mason_command(vec!["info"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "no cache at");
    Ok(())
}

#[test]
fn newer_cache_is_left_alone() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    populate(&space)?;
    space.write(".mason_db/metadata", "mason-db 9.0.0\n5\n")?;
    let targets = space.read(".mason_db/targets")?;

    let out = space.run(&mut mason_command(vec!["info"]))?;
    assert!(!out.status.success());
    assert_stderr_contains(&out, "cache version 9.0.0 is not supported");
    assert_eq!(space.read(".mason_db/metadata")?, b"mason-db 9.0.0\n5\n");
    assert_eq!(space.read(".mason_db/targets")?, targets);
    Ok(())
}
