//! Peer configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hubshare_shared::constants::{CHUNK_SIZE, DEFAULT_UPLOADER_PORT, RSA_KEY_BITS};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub nickname: String,
    /// WebSocket endpoint of the hub, e.g. `ws://127.0.0.1:3000/ws`
    pub hub_url: String,
    /// Where the RSA keypair lives
    pub key_dir: PathBuf,
    /// Seals the private key at rest when set
    pub key_passphrase: Option<String>,
    /// Ciphertexts this peer serves, one `<fileHash>.enc` per file
    pub shared_dir: PathBuf,
    /// Downloaded ciphertexts and their decrypted output
    pub download_dir: PathBuf,
    /// Bind address of the uploader server
    pub listen_addr: SocketAddr,
    /// Address other peers should dial, if different from the bound one
    /// (NAT, reverse proxy)
    pub advertised_addr: Option<String>,
    pub chunk_size: usize,
    pub request_timeout: Duration,
    /// How long past expiry a token still covers `requestChunk` on the
    /// connection it opened
    pub token_grace: Duration,
    pub rsa_bits: usize,
}

impl PeerConfig {
    pub fn new(nickname: &str, hub_url: &str, data_dir: &Path) -> Self {
        Self {
            nickname: nickname.to_string(),
            hub_url: hub_url.to_string(),
            key_dir: data_dir.join("keys"),
            key_passphrase: None,
            shared_dir: data_dir.join("shared"),
            download_dir: data_dir.join("downloads"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UPLOADER_PORT)),
            advertised_addr: None,
            chunk_size: CHUNK_SIZE,
            request_timeout: Duration::from_secs(10),
            token_grace: Duration::ZERO,
            rsa_bits: RSA_KEY_BITS,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.key_dir, &self.shared_dir, &self.download_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
