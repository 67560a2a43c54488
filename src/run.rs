//! The `mason` command: inspects the persistent cache of a project.
//! Builds themselves are driven through `Engine` by the embedding tool.

use crate::db::{Db, CURRENT_VERSION};
use crate::graph::TargetId;
use crate::value::Value;
use anyhow::{anyhow, bail};
use argh::FromArgs;
use std::path::{Path, PathBuf};

#[derive(FromArgs)]
/// mason, an incremental build orchestrator
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<PathBuf>,

    /// name of the cache directory
    #[argh(option, default = "String::from(\".mason_db\")")]
    db: String,

    /// print debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Info(InfoArgs),
    List(ListArgs),
    Show(ShowArgs),
}

#[derive(FromArgs)]
/// print cache version, iteration, and size
#[argh(subcommand, name = "info")]
struct InfoArgs {}

#[derive(FromArgs)]
/// list every target id in the cache
#[argh(subcommand, name = "list")]
struct ListArgs {}

#[derive(FromArgs)]
/// print everything the cache records about one target
#[argh(subcommand, name = "show")]
struct ShowArgs {
    /// target id, e.g. file:src/main.c
    #[argh(positional)]
    id: String,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_existing(path: &Path) -> anyhow::Result<Db> {
    if !path.join("metadata").exists() {
        bail!("no cache at {}", path.display());
    }
    Db::open_read_only(path)
}

fn format_value(db: &Db, value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_owned(),
        Value::Integer(n) => n.to_string(),
        Value::Real(r) => r.to_string(),
        Value::String(s) => format!("{:?}", s),
        Value::List(items) => {
            let items: Vec<String> = items.iter().map(|v| format_value(db, v)).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Map(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{} is {}", format_value(db, k), format_value(db, v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Value::Target(id) => db.ids().get(*id).to_owned(),
    }
}

fn print_ids(db: &Db, label: &str, ids: &[TargetId]) {
    println!("{}:", label);
    for &id in ids {
        println!("  {}", db.ids().get(id));
    }
}

fn show(db: &Db, name: &str) -> anyhow::Result<()> {
    let id = db
        .lookup(name)
        .ok_or_else(|| anyhow!("unknown target {:?}", name))?;
    let details = db.details(id);
    println!("index: {}", id.index());
    println!("hash: {}", details.hash);
    println!("build hash: {}", details.build_hash);
    if let Some(parent) = details.parent {
        println!("parent: {}", db.ids().get(parent));
    }
    println!("last updated: {}", details.last_updated);
    println!("last checked: {}", details.last_checked);
    println!("mtime: {}", details.mtime);
    print_ids(db, "depends", &db.depends(id)?);
    let scans = db.scans(id)?;
    if !scans.is_empty() {
        print_ids(db, "scans", &scans);
    }
    if let Some(value) = db.expr(id)? {
        println!("value: {}", format_value(db, &value));
    }
    Ok(())
}

pub fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    init_logging(args.verbose);

    if let Some(dir) = &args.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    let db = open_existing(Path::new(&args.db))?;

    match args.command {
        Command::Info(_) => {
            println!("version: {} (supported: {})", db.version(), CURRENT_VERSION);
            println!("iteration: {}", db.iteration());
            println!("targets: {}", db.ids().len());
        }
        Command::List(_) => {
            for (id, name) in db.ids().iter() {
                println!("{}\t{}", id.index(), name);
            }
        }
        Command::Show(show_args) => show(&db, &show_args.id)?,
    }
    Ok(0)
}
