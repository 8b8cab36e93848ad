//! Virtual-time simulator for mesh friendship and PB-ADV transfers

pub mod medium;
pub mod scenario;

pub use medium::{Medium, MediumStats, RadioBearer};
pub use scenario::{run_friendship, run_transfer, FriendshipReport, SimSettings, TransferReport};
