//! A connected peer: hub session, keys, uploader and downloader.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hubshare_shared::identity::PeerKeys;
use hubshare_shared::protocol::HubEvent;
use hubshare_shared::types::{AuditEntry, DownloadToken, UserSummary};
use hubshare_shared::ShareError;

use crate::config::PeerConfig;
use crate::distribution::{KeyDistributionManager, RotationReceipt, ShareReceipt};
use crate::hub_client::{HubClient, TokenAuthority};
use crate::store::CiphertextStore;
use crate::transfer::{DownloadOutcome, Downloader, Uploader};

/// How often, and how far apart, a downloader looks up an uploader that
/// has not published its address yet.
const ADDR_LOOKUP_ATTEMPTS: u32 = 10;
const ADDR_LOOKUP_DELAY: Duration = Duration::from_millis(100);

struct Started {
    addr: String,
    task: JoinHandle<()>,
}

/// The uploader server, started on first use.
struct UploaderService {
    uploader: Uploader,
    hub: Arc<HubClient>,
    public_pem: String,
    listen_addr: SocketAddr,
    advertised_addr: Option<String>,
    started: OnceCell<Started>,
}

impl UploaderService {
    /// Bind, start serving and tell the hub where to find us. Later calls
    /// return the address from the first.
    async fn ensure_started(&self) -> Result<&str, ShareError> {
        self.started
            .get_or_try_init(|| async move {
                let listener = TcpListener::bind(self.listen_addr).await?;
                let local = listener.local_addr()?;
                let addr = self
                    .advertised_addr
                    .clone()
                    .unwrap_or_else(|| format!("ws://{local}"));

                let task = tokio::spawn(self.uploader.clone().serve(listener));
                if let Err(e) = self
                    .hub
                    .register_key(self.public_pem.clone(), Some(addr.clone()))
                    .await
                {
                    task.abort();
                    return Err(e);
                }

                info!(%addr, "Uploader started");
                Ok::<_, ShareError>(Started { addr, task })
            })
            .await
            .map(|started| started.addr.as_str())
    }
}

async fn pump_notifications(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    service: Arc<UploaderService>,
    forward: mpsc::UnboundedSender<HubEvent>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            HubEvent::DownloadTokenIssued { token, file_hash, downloader, expires_at } => {
                debug!(file_hash = %file_hash, downloader = %downloader, "Download token issued for our file");
                service
                    .uploader
                    .tokens()
                    .insert(DownloadToken {
                        token: token.clone(),
                        file_hash: file_hash.clone(),
                        downloader: downloader.clone(),
                        issued_at: Utc::now(),
                        expires_at: *expires_at,
                    })
                    .await;
                if let Err(e) = service.ensure_started().await {
                    warn!(error = %e, "Could not start uploader");
                }
            }
            HubEvent::RevokedNotice { file_hash, by } => {
                info!(file_hash = %file_hash, by = %by, "Access to file revoked");
            }
            HubEvent::KeyUpdateNotice { file_hash, by } => {
                info!(file_hash = %file_hash, by = %by, "File key rotated");
            }
            _ => {}
        }
        let _ = forward.send(event);
    }
}

pub struct Peer {
    nickname: String,
    keys: Arc<PeerKeys>,
    hub: Arc<HubClient>,
    distribution: KeyDistributionManager,
    uploader: Arc<UploaderService>,
    downloader: Downloader,
    pump: JoinHandle<()>,
}

impl Peer {
    /// Load or create our keys, open a hub session with `credential`,
    /// register our public key and announce what we hold. Hub
    /// notifications are forwarded on the returned channel.
    pub async fn connect(
        config: PeerConfig,
        credential: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HubEvent>), ShareError> {
        config.ensure_dirs()?;

        let key_dir = config.key_dir.clone();
        let passphrase = config.key_passphrase.clone();
        let bits = config.rsa_bits;
        let keys = tokio::task::spawn_blocking(move || {
            PeerKeys::load_or_generate_with_bits(&key_dir, passphrase.as_deref(), bits)
        })
        .await
        .map_err(|e| ShareError::Protocol(format!("key loading task failed: {e}")))??;
        let keys = Arc::new(keys);

        let (hub, hub_events) =
            HubClient::connect(&config.hub_url, credential, config.request_timeout).await?;
        if hub.nickname() != config.nickname {
            return Err(ShareError::ValidationError(format!(
                "credential is for {}, not {}",
                hub.nickname(),
                config.nickname
            )));
        }
        let hub = Arc::new(hub);

        let public_pem = keys.public_pem()?;
        hub.register_key(public_pem.clone(), None).await?;

        let store = CiphertextStore::open(&config.shared_dir)?;
        let index = store.index().await?;
        let holding = !index.is_empty();
        let announced = hub.announce_index(index).await?;
        debug!(files = announced, "Announced file index");

        let authority: Arc<dyn TokenAuthority> = hub.clone();
        let uploader = Uploader::new(store.clone(), config.chunk_size, config.token_grace)
            .with_authority(authority);
        let service = Arc::new(UploaderService {
            uploader,
            hub: hub.clone(),
            public_pem,
            listen_addr: config.listen_addr,
            advertised_addr: config.advertised_addr.clone(),
            started: OnceCell::new(),
        });

        // files from an earlier session are servable right away
        if holding {
            service.ensure_started().await?;
        }

        let (forward, notifications) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_notifications(hub_events, service.clone(), forward));

        let distribution =
            KeyDistributionManager::new(hub.clone(), keys.clone(), store, config.chunk_size);

        Ok((
            Self {
                nickname: config.nickname.clone(),
                keys,
                hub,
                distribution,
                uploader: service,
                downloader: Downloader::new(&config.download_dir),
                pump,
            },
            notifications,
        ))
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn keys(&self) -> &PeerKeys {
        &self.keys
    }

    pub fn hub(&self) -> &HubClient {
        &self.hub
    }

    pub fn distribution(&self) -> &KeyDistributionManager {
        &self.distribution
    }

    /// Where our uploader listens, once it has been started.
    pub fn transfer_addr(&self) -> Option<&str> {
        self.uploader.started.get().map(|started| started.addr.as_str())
    }

    pub async fn users(&self) -> Result<Vec<UserSummary>, ShareError> {
        self.hub.users().await
    }

    pub async fn share_file(&self, path: &Path, recipients: &[&str]) -> Result<ShareReceipt, ShareError> {
        self.uploader.ensure_started().await?;
        self.distribution.share_file(path, recipients).await
    }

    /// Revoke `target`'s access to a file we own and rotate its key. Once
    /// the hub has taken the revocation our uploader stops serving
    /// `target`, whether or not the rotation goes through.
    pub async fn revoke(&self, file_hash: &str, target: &str) -> Result<RotationReceipt, ShareError> {
        self.hub.revoke_access(file_hash, target).await?;
        let dropped = self.uploader.uploader.tokens().revoke_for(file_hash, target).await;
        if dropped > 0 {
            debug!(file_hash, user = target, dropped, "Dropped local tokens of revoked user");
        }
        self.distribution.rotate_after_revocation(file_hash, target).await
    }

    /// Get a token, fetch the ciphertext from its owner and report the
    /// completed download to the hub.
    pub async fn download(&self, file_hash: &str, uploader: Option<&str>) -> Result<DownloadOutcome, ShareError> {
        let grant = self.hub.request_download_token(file_hash, uploader).await?;

        let addr = match grant.uploader_addr.clone() {
            Some(addr) => addr,
            None => self.lookup_transfer_addr(&grant.uploader).await?,
        };

        let outcome = self
            .downloader
            .download(&grant.uploader, &addr, file_hash, &grant.token)
            .await?;
        self.hub.download_complete(file_hash).await?;
        Ok(outcome)
    }

    /// An uploader publishes its address when its server comes up, which
    /// can trail the token by a moment.
    async fn lookup_transfer_addr(&self, uploader: &str) -> Result<String, ShareError> {
        for attempt in 0..ADDR_LOOKUP_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(ADDR_LOOKUP_DELAY).await;
            }
            let addr = self
                .hub
                .users()
                .await?
                .into_iter()
                .find(|u| u.nickname == uploader)
                .and_then(|u| u.transfer_addr);
            if let Some(addr) = addr {
                return Ok(addr);
            }
        }
        Err(ShareError::Transport(format!("{uploader} is not accepting transfers")))
    }

    /// Decrypt a completed download into `output`.
    pub async fn decrypt(&self, file_hash: &str, output: &Path) -> Result<PathBuf, ShareError> {
        let ciphertext = self.downloader.path_for(file_hash)?;
        self.distribution
            .decrypt_received(file_hash, &ciphertext, output)
            .await
    }

    pub async fn audit_log(&self, file_hash: &str) -> Result<Vec<AuditEntry>, ShareError> {
        self.hub.audit_log(file_hash).await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(started) = self.uploader.started.get() {
            started.task.abort();
        }
        self.hub.close();
    }
}
