mod context_files;
mod orchestration;
mod sub_agent;
mod worker_pool;

pub use context_files::*;
pub use orchestration::*;
pub use sub_agent::*;
pub use worker_pool::*;
