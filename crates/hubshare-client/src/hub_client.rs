//! WebSocket client for the hub protocol.
//!
//! At most one request is in flight at a time. The reply to it is the next
//! non-notification event the hub sends; notifications are forwarded to a
//! separate channel handed out by [`HubClient::connect`]. A request that
//! times out closes the session, so a late reply can never be taken for
//! the answer to a later request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use hubshare_shared::protocol::{HubEvent, HubRequest};
use hubshare_shared::types::{AuditEntry, DownloadToken, IndexEntry, UserSummary};
use hubshare_shared::ShareError;

/// A download token as granted to the requester.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub token: String,
    pub file_hash: String,
    pub uploader: String,
    pub uploader_addr: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Whatever can confirm a download token the local table does not know.
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    async fn confirm(&self, file_hash: &str, token: &str) -> Result<DownloadToken, ShareError>;
}

pub struct HubClient {
    nickname: String,
    outgoing: mpsc::UnboundedSender<Message>,
    replies: Mutex<mpsc::UnboundedReceiver<HubEvent>>,
    timeout: Duration,
    shut: AtomicBool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

fn closed() -> ShareError {
    ShareError::Transport("hub connection closed".to_string())
}

fn unexpected(event: HubEvent) -> ShareError {
    ShareError::Protocol(format!("unexpected hub reply: {event:?}"))
}

fn with_credential(hub_url: &str, credential: &str) -> String {
    let sep = if hub_url.contains('?') { '&' } else { '?' };
    format!("{hub_url}{sep}token={credential}")
}

impl HubClient {
    /// Connect and wait for the hub's `welcome`. A rejected credential is
    /// `AuthenticationFailed`.
    pub async fn connect(
        hub_url: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HubEvent>), ShareError> {
        let (ws, _) = match tokio_tungstenite::connect_async(with_credential(hub_url, credential)).await {
            Ok(conn) => conn,
            Err(WsError::Http(resp)) if resp.status().as_u16() == 401 => {
                return Err(ShareError::AuthenticationFailed)
            }
            Err(e) => return Err(ShareError::Transport(e.to_string())),
        };
        let (mut sink, mut stream) = ws.split();

        let nickname = match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match HubEvent::from_json(&text)? {
                HubEvent::Welcome { nickname } => nickname,
                other => return Err(unexpected(other)),
            },
            Ok(Some(Ok(other))) => {
                return Err(ShareError::Protocol(format!("expected welcome, got {other:?}")))
            }
            Ok(Some(Err(e))) => return Err(ShareError::Transport(e.to_string())),
            Ok(None) => return Err(closed()),
            Err(_) => return Err(ShareError::Transport("no welcome from hub".to_string())),
        };
        info!(user = %nickname, "Connected to hub");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let event = match HubEvent::from_json(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Unparseable hub event");
                        continue;
                    }
                };
                if event.is_notification() {
                    // nobody listening for notifications is fine
                    let _ = notify_tx.send(event);
                } else if reply_tx.send(event).is_err() {
                    break;
                }
            }
            debug!("Hub reader finished");
        });

        Ok((
            Self {
                nickname,
                outgoing,
                replies: Mutex::new(replies),
                timeout,
                shut: AtomicBool::new(false),
                reader,
                writer,
            },
            notifications,
        ))
    }

    /// The nickname the hub authenticated us as.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Send one request and wait for its reply. An `error` reply becomes
    /// the matching `ShareError`.
    pub async fn request(&self, request: HubRequest) -> Result<HubEvent, ShareError> {
        let mut replies = self.replies.lock().await;
        if self.shut.load(Ordering::Acquire) {
            return Err(closed());
        }

        self.outgoing
            .send(Message::Text(request.to_json()?))
            .map_err(|_| closed())?;

        match tokio::time::timeout(self.timeout, replies.recv()).await {
            Err(_) => {
                warn!(timeout = ?self.timeout, "Hub request timed out, closing session");
                self.close();
                Err(ShareError::Transport("hub request timed out".to_string()))
            }
            Ok(None) => Err(closed()),
            Ok(Some(HubEvent::Error { text, code })) => {
                Err(ShareError::from_wire(code.as_deref(), &text))
            }
            Ok(Some(event)) => Ok(event),
        }
    }

    pub async fn register_key(
        &self,
        public_key: String,
        transfer_addr: Option<String>,
    ) -> Result<(), ShareError> {
        let request = HubRequest::RegisterKey {
            from: self.nickname.clone(),
            public_key,
            transfer_addr,
        };
        match self.request(request).await? {
            HubEvent::KeyAck { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn announce_index(&self, files: Vec<IndexEntry>) -> Result<usize, ShareError> {
        match self.request(HubRequest::FileIndex { files }).await? {
            HubEvent::IndexAck { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn users(&self) -> Result<Vec<UserSummary>, ShareError> {
        match self.request(HubRequest::GetUsers).await? {
            HubEvent::UserList { users } => Ok(users),
            other => Err(unexpected(other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn share_file(
        &self,
        file_hash: &str,
        file_name: &str,
        size: u64,
        iv: String,
        encrypted_keys: BTreeMap<String, String>,
        allowed_users: BTreeSet<String>,
        chunk_hashes: Vec<String>,
        chunk_size: usize,
    ) -> Result<(), ShareError> {
        let request = HubRequest::ShareFile {
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
            size,
            iv,
            encrypted_keys,
            allowed_users,
            chunk_hashes,
            chunk_size,
        };
        match self.request(request).await? {
            HubEvent::ShareAck { file_hash: acked } if acked == file_hash => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Our wrapped key and the IV for a file.
    pub async fn file_key(&self, file_hash: &str) -> Result<(String, String), ShareError> {
        let request = HubRequest::GetFileKey {
            file_hash: file_hash.to_string(),
        };
        match self.request(request).await? {
            HubEvent::FileKey { encrypted_key, iv, .. } => Ok((encrypted_key, iv)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_download_token(
        &self,
        file_hash: &str,
        uploader: Option<&str>,
    ) -> Result<TokenGrant, ShareError> {
        let request = HubRequest::RequestDownloadToken {
            file_hash: file_hash.to_string(),
            uploader: uploader.map(str::to_string),
        };
        match self.request(request).await? {
            HubEvent::DownloadToken {
                token,
                file_hash,
                uploader,
                uploader_addr,
                expires_at,
            } => Ok(TokenGrant {
                token,
                file_hash,
                uploader,
                uploader_addr,
                expires_at,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn revoke_access(&self, file_hash: &str, target_user: &str) -> Result<(), ShareError> {
        let request = HubRequest::RevokeAccess {
            file_hash: file_hash.to_string(),
            target_user: target_user.to_string(),
        };
        match self.request(request).await? {
            HubEvent::RevocationConfirmed { revoked_user, .. } if revoked_user == target_user => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_file_keys(
        &self,
        file_hash: &str,
        new_iv: String,
        new_encrypted_keys: BTreeMap<String, String>,
        chunk_hashes: Option<Vec<String>>,
    ) -> Result<(), ShareError> {
        let request = HubRequest::UpdateFileKeys {
            file_hash: file_hash.to_string(),
            new_iv,
            new_encrypted_keys,
            chunk_hashes,
        };
        match self.request(request).await? {
            HubEvent::KeysUpdated { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn audit_log(&self, file_hash: &str) -> Result<Vec<AuditEntry>, ShareError> {
        let request = HubRequest::GetAuditLog {
            file_hash: file_hash.to_string(),
        };
        match self.request(request).await? {
            HubEvent::AuditLog { logs, .. } => Ok(logs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn download_complete(&self, file_hash: &str) -> Result<(), ShareError> {
        let request = HubRequest::DownloadComplete {
            file_hash: file_hash.to_string(),
        };
        match self.request(request).await? {
            HubEvent::DownloadRecorded { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn validate_token(&self, file_hash: &str, token: &str) -> Result<DownloadToken, ShareError> {
        let request = HubRequest::ValidateToken {
            file_hash: file_hash.to_string(),
            token: token.to_string(),
        };
        match self.request(request).await? {
            HubEvent::TokenValid {
                token,
                file_hash,
                downloader,
                expires_at,
            } => Ok(DownloadToken {
                token,
                file_hash,
                downloader,
                issued_at: Utc::now(),
                expires_at,
            }),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl TokenAuthority for HubClient {
    async fn confirm(&self, file_hash: &str, token: &str) -> Result<DownloadToken, ShareError> {
        self.validate_token(file_hash, token).await
    }
}

impl HubClient {
    /// Stop both socket tasks, closing the session. Every later request
    /// fails with a transport error.
    pub fn close(&self) {
        self.shut.store(true, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.close();
    }
}
