pub mod connected;
pub mod json_file;
pub mod whitelist;

pub use connected::{ConnectedClient, ConnectedRepository};
pub use whitelist::{WhitelistEntry, WhitelistRepository};
