//! Build progress reporting, for the purpose of display to the user.

use crate::rule::BuildError;

/// Counts of targets by how far they've gotten this run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Counts {
    /// Targets enqueued.
    pub queued: usize,
    /// Targets whose update completed.
    pub checked: usize,
    /// Build functions run.
    pub built: usize,
}

/// Trait for build progress notifications.
pub trait Progress: Send {
    /// Called before a target's build function runs.
    fn target_started(&mut self, id: &str);

    /// Called when a target finishes updating.
    fn target_updated(&mut self, id: &str, last_updated: u32, counts: &Counts);

    /// Called when a target's build function fails.
    fn target_failed(&mut self, id: &str, err: &BuildError);

    /// Log a line of output.
    fn log(&mut self, msg: &str);
}

/// Progress implementation for a plain console, without any overprinting.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print a line as each target completes.
    status_updates: bool,
}

impl ConsoleProgress {
    pub fn new(status_updates: bool) -> Self {
        ConsoleProgress { status_updates }
    }
}

impl Progress for ConsoleProgress {
    fn target_started(&mut self, _id: &str) {}

    fn target_updated(&mut self, id: &str, last_updated: u32, counts: &Counts) {
        if self.status_updates {
            self.log(&format!(
                "{} / {} Updated {} to iteration {}",
                counts.checked, counts.queued, id, last_updated
            ));
        }
    }

    fn target_failed(&mut self, id: &str, err: &BuildError) {
        self.log(&format!("failed: {}: {}", id, err));
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress implementation that prints nothing.
pub struct NoProgress;

impl Progress for NoProgress {
    fn target_started(&mut self, _id: &str) {}
    fn target_updated(&mut self, _id: &str, _last_updated: u32, _counts: &Counts) {}
    fn target_failed(&mut self, _id: &str, _err: &BuildError) {}
    fn log(&mut self, _msg: &str) {}
}
