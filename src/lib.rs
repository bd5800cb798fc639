pub mod admission;
pub mod aggregate;
pub mod config;
pub mod error;
pub mod kick;
pub mod model;
pub mod mqtt;
pub mod relay;
pub mod repositories;
pub mod topics;
pub mod upstream;

// Re-export commonly used items
pub use config::Config;
pub use error::{AppError, Result};
pub use relay::{Outcome, Relay, RelayOptions};
