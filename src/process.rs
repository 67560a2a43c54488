//! Running subprocesses on behalf of build functions.
//!
//! Each child runs in its own process group and is registered while it
//! runs, so an aborted build can kill everything still in flight.

use anyhow::bail;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of running a command.
#[derive(Debug)]
pub struct Output {
    pub termination: Termination,
    /// Console output, stdout followed by stderr.
    pub output: Vec<u8>,
}

/// Process groups of running children.
#[derive(Default)]
pub struct Children {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    pids: FxHashSet<u32>,
    /// Set by kill_all; children registered afterwards are killed at once.
    killed: bool,
}

fn killpg(pid: u32) {
    // Safety: killpg has no memory safety requirements; a stale pid only
    // yields ESRCH.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

impl Children {
    /// Send SIGKILL to every registered child's process group, and to any
    /// child registered until the next reset.
    pub fn kill_all(&self) {
        let mut registry = self.registry.lock();
        registry.killed = true;
        for &pid in registry.pids.iter() {
            killpg(pid);
        }
    }

    /// Track a freshly spawned child.  Returns false, having killed it, if
    /// kill_all ran first.
    pub fn register(&self, pid: u32) -> bool {
        let mut registry = self.registry.lock();
        if registry.killed {
            killpg(pid);
            return false;
        }
        registry.pids.insert(pid);
        true
    }

    fn unregister(&self, pid: u32) {
        self.registry.lock().pids.remove(&pid);
    }

    pub fn is_killed(&self) -> bool {
        self.registry.lock().killed
    }

    /// Allow children to run again after a kill_all.
    pub fn reset(&self) {
        self.registry.lock().killed = false;
    }

    pub fn len(&self) -> usize {
        self.registry.lock().pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run `cmdline` under /bin/sh in `dir`, blocking until it exits.
/// Returns an Err() if we failed outside of the process itself.
pub fn run_command(children: &Children, cmdline: &str, dir: &Path) -> anyhow::Result<Output> {
    if children.is_killed() {
        bail!("build aborted");
    }
    let child = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmdline)
        .current_dir(dir)
        .process_group(0)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    let pid = child.id();
    let registered = children.register(pid);
    let result = child.wait_with_output();
    if !registered {
        bail!("build aborted");
    }
    children.unregister(pid);
    let mut cmd = result?;

    let mut output = Vec::new();
    output.append(&mut cmd.stdout);
    output.append(&mut cmd.stderr);

    let mut termination = Termination::Success;
    if !cmd.status.success() {
        termination = Termination::Failure;
        if let Some(sig) = cmd.status.signal() {
            match sig {
                libc::SIGINT => {
                    output.extend_from_slice(b"interrupted");
                    termination = Termination::Interrupted;
                }
                _ => output.extend_from_slice(format!("signal {}", sig).as_bytes()),
            }
        }
    }
    Ok(Output {
        termination,
        output,
    })
}
