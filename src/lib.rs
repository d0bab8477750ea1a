pub mod config;
pub mod election;
pub mod error;
pub mod http;

pub use config::ElectionConfig;
pub use election::{ElectionManager, LeaderChangeEvent};
pub use error::{ElectionError, Result};
