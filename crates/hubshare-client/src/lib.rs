//! # hubshare-client
//!
//! Peer side of hubshare: talks to the hub, distributes per-recipient file
//! keys, and moves ciphertext directly between peers.
//!
//! [`Peer`] ties the pieces together; each piece is usable on its own.

pub mod config;
pub mod distribution;
pub mod hub_client;
pub mod peer;
pub mod store;
pub mod transfer;

pub use config::PeerConfig;
pub use distribution::{KeyDistributionManager, RotationReceipt, ShareReceipt};
pub use hub_client::{HubClient, TokenAuthority, TokenGrant};
pub use peer::Peer;
pub use store::{CiphertextStore, ShareRecord};
