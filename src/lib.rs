mod artifact;
pub mod db;
mod deps;
pub mod digest;
pub mod flow;
mod fs;
pub mod memo;
mod pool;
pub mod process;
pub mod trace;
pub mod value;

pub use deps::EnvError;
pub use memo::{Engine, EngineOptions, MemoFn, TracedFn};
pub use value::{Outcome, TaskError, Value, ValueSet};

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
