//! Chunked transfer protocol, both roles.
//!
//! The uploader serves a local ciphertext as a sequence of hashed chunks;
//! the downloader fetches, verifies and resumes. Both talk the
//! [`hubshare_shared::protocol::PeerRequest`] /
//! [`hubshare_shared::protocol::PeerEvent`] JSON protocol over a WebSocket.

pub mod downloader;
pub mod state;
pub mod uploader;

pub use downloader::{DownloadOutcome, Downloader};
pub use state::{DownloadEvent, DownloadMachine, DownloadState, Effect, Failure};
pub use uploader::{TokenTable, Uploader};
