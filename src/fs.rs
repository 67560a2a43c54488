//! File system access used for hashing `file:` targets, behind a trait so
//! tests can observe or fake it.

use crate::hash::Hash;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::os::unix::prelude::MetadataExt;
use std::path::{Path, PathBuf};

/// What stat() found at a path.  mtimes are nanoseconds since the epoch.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Stat {
    Missing,
    File(u64),
    Dir(u64),
}

pub trait FileSystem: Send + Sync {
    fn stat(&self, path: &Path) -> std::io::Result<Stat>;

    /// SHA-256 of a regular file's contents.
    fn digest(&self, path: &Path) -> std::io::Result<Hash>;

    /// Map a logical target path to the on-disk path to inspect.  The
    /// default is the identity; virtual file system layers override it.
    fn resolve(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

#[derive(Default)]
pub struct RealFileSystem {}
impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

fn mtime_nanos(meta: &std::fs::Metadata) -> u64 {
    (meta.mtime() as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(meta.mtime_nsec() as u64)
}

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &Path) -> std::io::Result<Stat> {
        Ok(match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Stat::Dir(mtime_nanos(&meta)),
            Ok(meta) => Stat::File(mtime_nanos(&meta)),
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Stat::Missing
                } else {
                    return Err(err);
                }
            }
        })
    }

    fn digest(&self, path: &Path) -> std::io::Result<Hash> {
        let mut f = std::fs::File::open(path)?;
        let mut ctx = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.update(&buf[..n]);
        }
        Ok(Hash(ctx.finalize().into()))
    }
}

/// Lexically normalize a slash-separated path: drop "." and empty
/// components and fold "dir/.." pairs.  Leading ".." that can't be folded
/// are kept.
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}
