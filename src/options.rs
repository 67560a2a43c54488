//! Engine configuration.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Options {
    /// Number of worker threads.
    pub parallelism: usize,
    /// Name of the cache directory under the project root.
    pub db_name: String,
    /// Print a line for every target that finishes updating.
    pub status_updates: bool,
    /// Write a graphviz file of the dependencies discovered by the build.
    pub dependency_graph: Option<PathBuf>,
    /// Write a chrome trace of the build.
    pub trace: Option<PathBuf>,
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: default_parallelism(),
            db_name: ".mason_db".to_owned(),
            status_updates: false,
            dependency_graph: None,
            trace: None,
        }
    }
}
