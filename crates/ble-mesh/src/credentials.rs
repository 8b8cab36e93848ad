//! Friendship security credentials
//!
//! Friend and LPN encrypt their mutual traffic with credentials bound to the
//! pair of addresses and the two counters exchanged during establishment.
//! The derivation itself is a collaborator behind [`CredentialManager`].

use crate::error::MeshResult;
use crate::subnet::{NetKey, Subnet};
use sha2::{Digest, Sha256};
use shared::models::Address;

/// Inputs binding credentials to one friendship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendshipParams {
    pub lpn_addr: Address,
    pub friend_addr: Address,
    pub lpn_counter: u16,
    pub friend_counter: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendCredentials {
    pub nid: u8,
    pub encryption_key: [u8; 16],
    pub privacy_key: [u8; 16],
}

pub trait CredentialManager: Send + Sync {
    fn derive_credentials(
        &self,
        net_key: &NetKey,
        params: &FriendshipParams,
    ) -> MeshResult<FriendCredentials>;
}

/// SHA-256 based derivation used by the simulator and the tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256CredentialManager;

impl CredentialManager for Sha256CredentialManager {
    fn derive_credentials(
        &self,
        net_key: &NetKey,
        params: &FriendshipParams,
    ) -> MeshResult<FriendCredentials> {
        let mut hasher = Sha256::new();
        hasher.update(b"friend");
        hasher.update(net_key);
        hasher.update(params.lpn_addr.to_be_bytes());
        hasher.update(params.friend_addr.to_be_bytes());
        hasher.update(params.lpn_counter.to_be_bytes());
        hasher.update(params.friend_counter.to_be_bytes());
        let digest = hasher.finalize();

        let mut encryption_key = [0u8; 16];
        encryption_key.copy_from_slice(&digest[..16]);
        let mut privacy_key = [0u8; 16];
        privacy_key.copy_from_slice(&digest[16..]);

        Ok(FriendCredentials {
            nid: digest[0] & 0x7f,
            encryption_key,
            privacy_key,
        })
    }
}

/// Credentials for the current key and, during key refresh, the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSlots {
    pub current: Option<FriendCredentials>,
    pub updated: Option<FriendCredentials>,
}

impl CredentialSlots {
    pub fn derive(
        manager: &dyn CredentialManager,
        subnet: &Subnet,
        params: &FriendshipParams,
    ) -> MeshResult<Self> {
        let current = manager.derive_credentials(&subnet.net_key, params)?;
        let updated = match &subnet.updated_key {
            Some(key) => Some(manager.derive_credentials(key, params)?),
            None => None,
        };
        Ok(Self {
            current: Some(current),
            updated,
        })
    }

    /// Credentials to send with on `subnet` and whether they belong to the new key.
    pub fn for_tx(&self, subnet: &Subnet) -> Option<(FriendCredentials, bool)> {
        let (_, new_key) = subnet.tx_key();
        if new_key {
            if let Some(creds) = &self.updated {
                return Some((creds.clone(), true));
            }
        }
        self.current.clone().map(|creds| (creds, false))
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.updated = None;
    }
}
