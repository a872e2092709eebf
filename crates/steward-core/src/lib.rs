mod config;
mod context;
mod error;
mod events;
mod path_policy;
mod time;
mod tokens;

pub use config::*;
pub use context::*;
pub use error::*;
pub use events::*;
pub use path_policy::*;
pub use time::*;
pub use tokens::*;
