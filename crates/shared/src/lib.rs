pub mod models;
pub mod error;
pub mod config;

pub use config::{Config, FriendConfig, LpnConfig, NodeConfig};
pub use error::{Error, Result};
pub use models::{Address, NetIdx, Transmit};
