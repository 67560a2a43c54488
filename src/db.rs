//! The mason database stores what previous runs learned about each target,
//! so a later run can tell which targets are up to date.
//!
//! It is a directory of stores, all keyed by the dense index a target id
//! receives when first interned:
//! - `metadata`: format version and the current iteration.
//! - `targets`: append-only log of target id strings; position is the index.
//! - `details`: fixed-size records (hashes, parent, iterations, mtime).
//! - `depends`, `scans`, `exprs`: append-only logs of variable-size records,
//!   where the last record written for an index wins.

use crate::densemap::DenseMap;
use crate::graph::TargetId;
use crate::hash::Hash;
use crate::intern::Intern;
use crate::trace;
use crate::value::{self, Value};
use anyhow::{anyhow, bail, Context};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32, pub u32);

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

impl std::str::FromStr for Version {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Version> {
        let mut parts = s.split('.').map(|p| p.parse::<u32>());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(a)), Some(Ok(b)), Some(Ok(c)), None) => Ok(Version(a, b, c)),
            _ => bail!("bad version {:?}", s),
        }
    }
}

/// Version written by this build.
pub const CURRENT_VERSION: Version = Version(0, 1, 0);
/// Oldest on-disk version this build can read.
pub const MINIMAL_VERSION: Version = Version(0, 1, 0);

const METADATA_MAGIC: &str = "mason-db";
const DETAILS_SIZE: usize = 84;
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Per-target fixed record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Details {
    pub hash: Hash,
    pub build_hash: Hash,
    pub parent: Option<TargetId>,
    /// Iteration in which the hash last changed; 0 if never built.
    pub last_updated: u32,
    /// Iteration in which the target was last confirmed up to date.
    pub last_checked: u32,
    pub mtime: u64,
}

impl Details {
    fn encode(&self) -> [u8; DETAILS_SIZE] {
        let mut buf = [0u8; DETAILS_SIZE];
        buf[0..32].copy_from_slice(&self.hash.0);
        buf[32..64].copy_from_slice(&self.build_hash.0);
        let parent = self.parent.map_or(0, |p| p.index() as u32 + 1);
        buf[64..68].copy_from_slice(&parent.to_le_bytes());
        buf[68..72].copy_from_slice(&self.last_updated.to_le_bytes());
        buf[72..76].copy_from_slice(&self.last_checked.to_le_bytes());
        buf[76..84].copy_from_slice(&self.mtime.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Details {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let mut hash = Hash::ZERO;
        hash.0.copy_from_slice(&buf[0..32]);
        let mut build_hash = Hash::ZERO;
        build_hash.0.copy_from_slice(&buf[32..64]);
        let parent = match u32_at(64) {
            0 => None,
            p => Some(TargetId::from(p as usize - 1)),
        };
        let mut mtime = [0u8; 8];
        mtime.copy_from_slice(&buf[76..84]);
        Details {
            hash,
            build_hash,
            parent,
            last_updated: u32_at(68),
            last_checked: u32_at(72),
            mtime: u64::from_le_bytes(mtime),
        }
    }
}

fn read_u32(buf: &[u8], ofs: usize) -> Option<u32> {
    let b = buf.get(ofs..ofs + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Read a whole store file, treating a missing file as empty.
fn read_store(path: &Path) -> anyhow::Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(buf) => Ok(buf),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn open_append(path: &Path) -> anyhow::Result<BufWriter<File>> {
    let f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok(BufWriter::new(f))
}

/// Open a store for appending, or for reading only; writes through a
/// read-only handle fail.
fn open_store(path: &Path, read_only: bool) -> anyhow::Result<BufWriter<File>> {
    if !read_only {
        return open_append(path);
    }
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(BufWriter::new(f))
}

/// An append-only log of `[u32 index][u32 len][bytes]` records, replayed
/// into memory on open.
struct LogStore {
    path: PathBuf,
    w: BufWriter<File>,
    entries: DenseMap<TargetId, Option<Vec<u8>>>,
    live: usize,
    dead: usize,
}

impl LogStore {
    fn open(path: PathBuf, read_only: bool) -> anyhow::Result<LogStore> {
        let buf = read_store(&path)?;
        let mut entries: DenseMap<TargetId, Option<Vec<u8>>> = DenseMap::default();
        let (mut live, mut dead) = (0, 0);
        let mut ofs = 0;
        while ofs < buf.len() {
            let (index, len) = match (read_u32(&buf, ofs), read_u32(&buf, ofs + 4)) {
                (Some(index), Some(len)) => (index as usize, len as usize),
                _ => bail!("{}: truncated record at offset {}", path.display(), ofs),
            };
            let start = ofs + 8;
            let Some(data) = buf.get(start..start + len) else {
                bail!("{}: truncated record at offset {}", path.display(), ofs);
            };
            let entry = entries.get_grow(TargetId::from(index));
            if let Some(old) = entry.take() {
                live -= old.len() + 8;
                dead += old.len() + 8;
            }
            *entry = Some(data.to_vec());
            live += len + 8;
            ofs = start + len;
        }
        let w = open_store(&path, read_only)?;
        Ok(LogStore {
            path,
            w,
            entries,
            live,
            dead,
        })
    }

    fn get(&self, id: TargetId) -> Option<&[u8]> {
        self.entries.lookup(id).and_then(|e| e.as_deref())
    }

    fn write_record(w: &mut impl Write, id: TargetId, data: &[u8]) -> std::io::Result<()> {
        w.write_all(&(id.index() as u32).to_le_bytes())?;
        w.write_all(&(data.len() as u32).to_le_bytes())?;
        w.write_all(data)
    }

    fn set(&mut self, id: TargetId, data: Vec<u8>) -> anyhow::Result<()> {
        Self::write_record(&mut self.w, id, &data)?;
        self.w.flush()?;
        let entry = self.entries.get_grow(id);
        if let Some(old) = entry.take() {
            self.live -= old.len() + 8;
            self.dead += old.len() + 8;
        }
        self.live += data.len() + 8;
        *entry = Some(data);
        Ok(())
    }

    /// Rewrite the log without superseded records once they dominate it.
    fn compact(&mut self) -> anyhow::Result<()> {
        self.w.flush()?;
        if self.dead <= self.live || self.dead < COMPACT_THRESHOLD {
            return Ok(());
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for id in self.entries.all_ids() {
                if let Some(data) = &self.entries[id] {
                    Self::write_record(&mut w, id, data)?;
                }
            }
            w.flush()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {}", tmp.display()))?;
        self.w = open_append(&self.path)?;
        self.dead = 0;
        Ok(())
    }
}

fn encode_set(ids: &[TargetId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + ids.len() * 4);
    buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(&(id.index() as u32).to_le_bytes());
    }
    buf
}

fn decode_set(buf: &[u8], target_count: usize) -> anyhow::Result<Vec<TargetId>> {
    let count = read_u32(buf, 0).ok_or_else(|| anyhow!("truncated set"))? as usize;
    if buf.len() != 4 + count * 4 {
        bail!("set of {} entries has {} bytes", count, buf.len());
    }
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let index = read_u32(buf, 4 + i * 4).unwrap_or_default() as usize;
        if index >= target_count {
            bail!("set refers to unknown target index {}", index);
        }
        ids.push(TargetId::from(index));
    }
    Ok(ids)
}

fn parse_metadata(text: &str) -> anyhow::Result<(Version, u32)> {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    let Some(version) = header.strip_prefix(METADATA_MAGIC) else {
        bail!("not a mason database");
    };
    let version: Version = version.trim().parse()?;
    let iteration = match lines.next() {
        Some(line) => line
            .trim()
            .parse::<u32>()
            .with_context(|| format!("bad iteration {:?}", line))?,
        None => bail!("missing iteration"),
    };
    Ok((version, iteration))
}

pub struct Db {
    dir: PathBuf,
    version: Version,
    iteration: u32,
    ids: Intern,
    ids_w: BufWriter<File>,
    details: DenseMap<TargetId, Details>,
    details_file: File,
    depends: LogStore,
    scans: LogStore,
    exprs: LogStore,
    read_only: bool,
}

impl Db {
    /// Open the database in `dir`, creating it if absent.  A database
    /// written by an incompatible version is discarded and recreated.
    pub fn open(dir: &Path) -> anyhow::Result<Db> {
        trace::scope("db::open", || Db::open_impl(dir, false))
            .with_context(|| format!("cache {}", dir.display()))
    }

    /// Open an existing database without modifying it.  Unlike `open`, an
    /// incompatible version is an error and nothing is created or removed.
    pub fn open_read_only(dir: &Path) -> anyhow::Result<Db> {
        trace::scope("db::open", || Db::open_impl(dir, true))
            .with_context(|| format!("cache {}", dir.display()))
    }

    fn open_impl(dir: &Path, read_only: bool) -> anyhow::Result<Db> {
        match std::fs::metadata(dir) {
            Ok(meta) if !meta.is_dir() => bail!("not a directory"),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !read_only => {
                std::fs::create_dir_all(dir)?;
            }
            Err(err) => return Err(err.into()),
        }

        let meta_path = dir.join("metadata");
        let existing = match std::fs::read_to_string(&meta_path) {
            Ok(text) => Some(parse_metadata(&text).context("read metadata")?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err).context("read metadata"),
        };
        let (version, iteration) = match existing {
            Some((version, iteration))
                if version >= MINIMAL_VERSION && version <= CURRENT_VERSION =>
            {
                (version, iteration)
            }
            Some((version, _)) if read_only => bail!(
                "cache version {} is not supported by this mason (supported {}..{})",
                version,
                MINIMAL_VERSION,
                CURRENT_VERSION
            ),
            Some((version, _)) => {
                info!(
                    "cache version {} incompatible with {}, recreating",
                    version, CURRENT_VERSION
                );
                std::fs::remove_dir_all(dir)?;
                std::fs::create_dir_all(dir)?;
                Db::create(dir)?
            }
            None if read_only => bail!("no metadata"),
            None => Db::create(dir)?,
        };

        let mut ids = Intern::new();
        let buf = read_store(&dir.join("targets"))?;
        let mut ofs = 0;
        while ofs < buf.len() {
            let Some(len) = read_u32(&buf, ofs) else {
                bail!("targets: truncated record at offset {}", ofs);
            };
            let Some(name) = buf.get(ofs + 4..ofs + 4 + len as usize) else {
                bail!("targets: truncated record at offset {}", ofs);
            };
            let name = std::str::from_utf8(name)
                .with_context(|| format!("targets: bad id at offset {}", ofs))?;
            let (_, new) = ids.add(name);
            if !new {
                bail!("targets: duplicate id {:?}", name);
            }
            ofs += 4 + len as usize;
        }
        let ids_w = open_store(&dir.join("targets"), read_only)?;

        let details_path = dir.join("details");
        let buf = read_store(&details_path)?;
        if buf.len() % DETAILS_SIZE != 0 || buf.len() / DETAILS_SIZE > ids.len() {
            bail!("details: {} bytes inconsistent with {} targets", buf.len(), ids.len());
        }
        let mut details: DenseMap<TargetId, Details> = DenseMap::default();
        for chunk in buf.chunks(DETAILS_SIZE) {
            details.push(Details::decode(chunk));
        }
        let details_file = OpenOptions::new()
            .create(!read_only)
            .read(true)
            .write(!read_only)
            .open(&details_path)
            .with_context(|| format!("open {}", details_path.display()))?;

        let mut db = Db {
            dir: dir.to_path_buf(),
            version,
            iteration,
            ids,
            ids_w,
            details,
            details_file,
            depends: LogStore::open(dir.join("depends"), read_only)?,
            scans: LogStore::open(dir.join("scans"), read_only)?,
            exprs: LogStore::open(dir.join("exprs"), read_only)?,
            read_only,
        };
        if read_only {
            return Ok(db);
        }
        // Records may be missing for ids interned just before a crash.
        for id in db.ids.iter().map(|(id, _)| id).collect::<Vec<_>>() {
            if db.details.lookup(id).is_none() {
                db.write_details(id, Details::default())?;
            }
        }
        Ok(db)
    }

    /// Start a fresh database: empty stores, current version, iteration 0.
    fn create(dir: &Path) -> anyhow::Result<(Version, u32)> {
        for store in ["targets", "details", "depends", "scans", "exprs"] {
            File::create(dir.join(store))?;
        }
        write_metadata(dir, CURRENT_VERSION, 0)?;
        Ok((CURRENT_VERSION, 0))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Advance to the next iteration and persist it.
    pub fn bump_iteration(&mut self) -> anyhow::Result<u32> {
        if self.read_only {
            bail!("cache opened read-only");
        }
        self.iteration += 1;
        write_metadata(&self.dir, self.version, self.iteration)?;
        Ok(self.iteration)
    }

    pub fn ids(&self) -> &Intern {
        &self.ids
    }

    pub fn lookup(&self, id: &str) -> Option<TargetId> {
        self.ids.lookup(id)
    }

    /// Intern a target id, persisting it and a zeroed details record if it
    /// is new.
    pub fn intern(&mut self, id: &str) -> anyhow::Result<TargetId> {
        let (index, new) = self.ids.add(id);
        if new {
            self.ids_w.write_all(&(id.len() as u32).to_le_bytes())?;
            self.ids_w.write_all(id.as_bytes())?;
            self.ids_w.flush()?;
            self.write_details(index, Details::default())?;
        }
        Ok(index)
    }

    pub fn details(&self, id: TargetId) -> Details {
        self.details.lookup(id).copied().unwrap_or_default()
    }

    fn write_details(&mut self, id: TargetId, details: Details) -> anyhow::Result<()> {
        self.details_file
            .write_all_at(&details.encode(), (id.index() * DETAILS_SIZE) as u64)
            .with_context(|| format!("write details for {}", self.ids.get(id)))?;
        self.details.set_grow(id, details);
        Ok(())
    }

    /// Record a new hash, stamping both last-updated and last-checked with
    /// the current iteration.
    pub fn set_hash(&mut self, id: TargetId, hash: Hash, mtime: u64) -> anyhow::Result<()> {
        let details = Details {
            hash,
            last_updated: self.iteration,
            last_checked: self.iteration,
            mtime,
            ..self.details(id)
        };
        self.write_details(id, details)
    }

    /// Record that the target was confirmed unchanged this iteration.
    pub fn touch_checked(&mut self, id: TargetId, mtime: u64) -> anyhow::Result<()> {
        let details = Details {
            last_checked: self.iteration,
            mtime,
            ..self.details(id)
        };
        self.write_details(id, details)
    }

    /// Record the build function identity, and the defining parent if any.
    pub fn set_build_hash(
        &mut self,
        id: TargetId,
        build_hash: Hash,
        parent: Option<TargetId>,
    ) -> anyhow::Result<()> {
        let old = self.details(id);
        let details = Details {
            build_hash,
            parent: parent.or(old.parent),
            ..old
        };
        self.write_details(id, details)
    }

    pub fn parent(&self, id: TargetId) -> Option<TargetId> {
        self.details(id).parent
    }

    pub fn depends(&self, id: TargetId) -> anyhow::Result<Vec<TargetId>> {
        match self.depends.get(id) {
            None => Ok(Vec::new()),
            Some(buf) => decode_set(buf, self.ids.len())
                .with_context(|| format!("depends of {}", self.ids.get(id))),
        }
    }

    pub fn set_depends(&mut self, id: TargetId, depends: &[TargetId]) -> anyhow::Result<()> {
        self.depends.set(id, encode_set(depends))
    }

    pub fn scans(&self, id: TargetId) -> anyhow::Result<Vec<TargetId>> {
        match self.scans.get(id) {
            None => Ok(Vec::new()),
            Some(buf) => decode_set(buf, self.ids.len())
                .with_context(|| format!("scans of {}", self.ids.get(id))),
        }
    }

    pub fn set_scans(&mut self, id: TargetId, scans: &[TargetId]) -> anyhow::Result<()> {
        self.scans.set(id, encode_set(scans))
    }

    pub fn expr(&self, id: TargetId) -> anyhow::Result<Option<Value>> {
        match self.exprs.get(id) {
            None => Ok(None),
            Some(buf) => value::decode(buf, self.ids.len())
                .map(Some)
                .with_context(|| format!("value of {}", self.ids.get(id))),
        }
    }

    pub fn set_expr(&mut self, id: TargetId, value: &Value) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        value::encode(value, &mut buf);
        self.exprs.set(id, buf)
    }

    /// Flush all stores, compacting logs dominated by stale records.
    pub fn close(&mut self) -> anyhow::Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.ids_w.flush()?;
        self.details_file.sync_data()?;
        self.depends.compact()?;
        self.scans.compact()?;
        self.exprs.compact()?;
        Ok(())
    }
}

fn write_metadata(dir: &Path, version: Version, iteration: u32) -> anyhow::Result<()> {
    let tmp = dir.join("metadata.tmp");
    std::fs::write(
        &tmp,
        format!("{} {}\n{}\n", METADATA_MAGIC, version, iteration),
    )?;
    std::fs::rename(&tmp, dir.join("metadata"))?;
    Ok(())
}
