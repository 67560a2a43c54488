pub mod context;
pub mod db;
mod densemap;
pub mod dot;
pub mod fs;
pub mod graph;
pub mod hash;
mod intern;
pub mod options;
pub mod process;
pub mod progress;
mod queue;
pub mod rule;
pub mod run;
pub mod targetset;
pub mod trace;
mod update;
pub mod value;
pub mod work;

pub use graph::{Status, TargetId};
pub use options::Options;
pub use rule::{BuildError, BuildFn, Rule};
pub use value::Value;
pub use work::{BuildCx, Engine};

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
