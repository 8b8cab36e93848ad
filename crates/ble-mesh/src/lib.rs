//! Mesh friendship for low-power nodes
//!
//! This crate implements both sides of a mesh friendship: the Friend that
//! buffers traffic for sleeping Low Power Nodes, and the LPN client that
//! finds a Friend and polls it. It also carries the segmented transaction
//! engine of the advertising provisioning bearer.
//!
//! The protocol logic is sans-IO and lives in [`MeshNodeRuntime`]; the
//! [`NodeDriver`] runs it on tokio against a [`Bearer`].

pub mod adapter;
pub mod context;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod friend;
pub mod lpn;
pub mod message;
pub mod runtime;
pub mod subnet;
pub mod timer;
pub mod transaction;
pub mod wire;

// Re-export main types
pub use adapter::{Bearer, SendProgress};
pub use context::{Action, FriendshipEvent, FriendshipObserver, SendEvent, SendToken};
pub use credentials::{CredentialManager, FriendCredentials, Sha256CredentialManager};
pub use driver::{NodeDriver, NodeHandle};
pub use error::{MeshError, MeshResult};
pub use friend::{FriendshipInfo, FriendshipServer};
pub use lpn::{LpnClient, LpnState, LpnStatus, OfferPolicy};
pub use message::{NetworkMessage, OutboundPdu, RxContext, SegmentInfo};
pub use runtime::MeshNodeRuntime;
pub use transaction::{GenericPdu, LinkAction, LinkEvent, TransactionSegmenter};
pub use wire::{ControlPdu, WireError};
