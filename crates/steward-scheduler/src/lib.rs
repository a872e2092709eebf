mod heartbeat;
mod runner;
mod service;
mod service_tools;

pub use heartbeat::*;
pub use runner::*;
pub use service::*;
pub use service_tools::*;
