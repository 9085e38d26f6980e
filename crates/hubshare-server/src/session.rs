//! Per-connection session actor.
//!
//! Each authenticated WebSocket gets one task that reads requests in order
//! and one that drains the connection's outbound queue. Replies and
//! notifications share that queue, so a peer sees them in the order the
//! hub produced them. Shared state is only reached through the registry,
//! the token issuer and the peer directory.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use hubshare_shared::protocol::{HubEvent, HubRequest};
use hubshare_shared::types::{FileRecord, UserSummary};
use hubshare_shared::ShareError;

use crate::api::AppState;
use crate::error::HubResult;

pub async fn run(socket: WebSocket, state: AppState, nickname: String, remote_addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (connection_id, mut outbox_rx) = state.peers.connect(&nickname, remote_addr).await;

    let writer = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode hub event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    state
        .peers
        .reply(&nickname, connection_id, HubEvent::Welcome { nickname: nickname.clone() })
        .await;
    info!(user = %nickname, addr = %remote_addr, "Session started");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(user = %nickname, error = %e, "Socket read failed");
                break;
            }
        };

        let reply = match HubRequest::from_json(&text) {
            Ok(_) if !state.session_limiter.check(&nickname).await => {
                warn!(user = %nickname, "Session rate limit exceeded");
                HubEvent::error(&ShareError::Protocol("rate limit exceeded".to_string()))
            }
            Ok(request) => match dispatch(&state, &nickname, request).await {
                Ok(event) => event,
                Err(e) => {
                    debug!(user = %nickname, error = %e, "Request failed");
                    e.to_event()
                }
            },
            Err(e) => HubEvent::error(&ShareError::Protocol(e.to_string())),
        };

        if !state.peers.reply(&nickname, connection_id, reply).await {
            debug!(user = %nickname, "Connection superseded");
            break;
        }
    }

    state.peers.disconnect(&nickname, connection_id).await;
    writer.abort();
    info!(user = %nickname, "Session ended");
}

/// Handle one request from `nickname` and produce its reply. Notifications
/// to other peers are pushed from here.
pub async fn dispatch(state: &AppState, nickname: &str, request: HubRequest) -> HubResult<HubEvent> {
    match request {
        HubRequest::RegisterKey { from, public_key, transfer_addr } => {
            if from != nickname {
                return Err(ShareError::ValidationError(
                    "registerKey.from does not match the session".to_string(),
                )
                .into());
            }
            state.registry.register_user(nickname, &public_key).await?;
            state.peers.set_transfer_addr(nickname, transfer_addr).await;
            info!(user = nickname, "Public key registered");
            Ok(HubEvent::KeyAck { nickname: nickname.to_string() })
        }

        HubRequest::FileIndex { files } => {
            let count = state.peers.set_index(nickname, files).await;
            Ok(HubEvent::IndexAck { count })
        }

        HubRequest::GetUsers => {
            let mut users = Vec::new();
            for user in state.registry.list_users().await? {
                users.push(UserSummary {
                    online: state.peers.is_online(&user.nickname).await,
                    transfer_addr: state.peers.transfer_addr(&user.nickname).await,
                    nickname: user.nickname,
                    public_key: user.public_key,
                });
            }
            Ok(HubEvent::UserList { users })
        }

        HubRequest::ShareFile {
            file_hash,
            file_name,
            size,
            iv,
            encrypted_keys,
            allowed_users,
            chunk_hashes,
            chunk_size,
        } => {
            let record = FileRecord {
                file_hash,
                owner: nickname.to_string(),
                file_name,
                size,
                iv,
                encrypted_keys,
                allowed_users,
                chunk_hashes,
                chunk_size,
            };
            let record = state.registry.share_file(nickname, record).await?;

            for (recipient, encrypted_key) in &record.encrypted_keys {
                let delivered = state
                    .peers
                    .notify(
                        recipient,
                        HubEvent::FileShared {
                            from: nickname.to_string(),
                            file_hash: record.file_hash.clone(),
                            file_name: record.file_name.clone(),
                            size: record.size,
                            encrypted_key: encrypted_key.clone(),
                            iv: record.iv.clone(),
                        },
                    )
                    .await;
                if !delivered {
                    debug!(recipient = %recipient, "Recipient offline, share kept for getFileKey");
                }
            }
            Ok(HubEvent::ShareAck { file_hash: record.file_hash })
        }

        HubRequest::GetFileKey { file_hash } => {
            let (encrypted_key, iv) = state.registry.get_key_for(&file_hash, nickname).await?;
            Ok(HubEvent::FileKey { file_hash, encrypted_key, iv })
        }

        HubRequest::RequestDownloadToken { file_hash, uploader } => {
            let record = state.registry.authorize_download(&file_hash, nickname).await?;

            if uploader.as_deref().is_some_and(|u| u != record.owner) {
                let err = ShareError::ValidationError(format!("only {} serves this file", record.owner));
                return Err(state.tokens.refuse(&file_hash, nickname, err.into()).await);
            }
            if !state.peers.is_online(&record.owner).await {
                let err = ShareError::Transport(format!("uploader {} is offline", record.owner));
                return Err(state.tokens.refuse(&file_hash, nickname, err.into()).await);
            }

            let token = state.tokens.mint(&file_hash, nickname).await?;

            let notified = state
                .peers
                .notify(
                    &record.owner,
                    HubEvent::DownloadTokenIssued {
                        token: token.token.clone(),
                        file_hash: file_hash.clone(),
                        downloader: nickname.to_string(),
                        expires_at: token.expires_at,
                    },
                )
                .await;
            if !notified {
                // owner dropped between the check and the notify
                state.tokens.discard(&token.token).await;
                let err = ShareError::Transport(format!("uploader {} is offline", record.owner));
                return Err(state.tokens.refuse(&file_hash, nickname, err.into()).await);
            }

            Ok(HubEvent::DownloadToken {
                token: token.token,
                file_hash,
                uploader_addr: state.peers.transfer_addr(&record.owner).await,
                uploader: record.owner,
                expires_at: token.expires_at,
            })
        }

        HubRequest::RevokeAccess { file_hash, target_user } => {
            state.registry.revoke(nickname, &file_hash, &target_user).await?;
            let dropped = state.tokens.revoke_for(&file_hash, &target_user).await;
            if dropped > 0 {
                debug!(user = %target_user, dropped, "Dropped outstanding tokens of revoked user");
            }
            state
                .peers
                .notify(
                    &target_user,
                    HubEvent::RevokedNotice { file_hash: file_hash.clone(), by: nickname.to_string() },
                )
                .await;
            Ok(HubEvent::RevocationConfirmed { file_hash, revoked_user: target_user })
        }

        HubRequest::UpdateFileKeys { file_hash, new_iv, new_encrypted_keys, chunk_hashes } => {
            let record = state
                .registry
                .rotate_keys(
                    nickname,
                    &file_hash,
                    &new_iv,
                    &new_encrypted_keys,
                    chunk_hashes.as_deref(),
                )
                .await?;
            for recipient in record.encrypted_keys.keys() {
                state
                    .peers
                    .notify(
                        recipient,
                        HubEvent::KeyUpdateNotice { file_hash: file_hash.clone(), by: nickname.to_string() },
                    )
                    .await;
            }
            Ok(HubEvent::KeysUpdated { file_hash })
        }

        HubRequest::GetAuditLog { file_hash } => {
            let logs = state.registry.audit_log(nickname, &file_hash).await?;
            Ok(HubEvent::AuditLog { file_hash, logs })
        }

        HubRequest::DownloadComplete { file_hash } => {
            state.registry.record_download(&file_hash, nickname).await?;
            Ok(HubEvent::DownloadRecorded { file_hash })
        }

        HubRequest::ValidateToken { file_hash, token } => {
            let valid = state
                .tokens
                .validate_for_owner(nickname, &token, &file_hash)
                .await?;
            Ok(HubEvent::TokenValid {
                token: valid.token,
                file_hash: valid.file_hash,
                downloader: valid.downloader,
                expires_at: valid.expires_at,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::config::HubConfig;
    use crate::error::HubError;
    use hubshare_shared::chunks::sha256_hex;
    use hubshare_shared::crypto::SessionKey;
    use hubshare_shared::identity::PeerKeys;
    use hubshare_shared::types::{AuditAction, AuditStatus};
    use hubshare_store::Database;

    fn state() -> AppState {
        AppState::new(HubConfig::default(), Database::open_in_memory().unwrap())
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn share_request(recipients: &[&str]) -> HubRequest {
        HubRequest::ShareFile {
            file_hash: sha256_hex(b"cipher"),
            file_name: "notes.txt".into(),
            size: 6,
            iv: SessionKey::generate().iv_base64(),
            encrypted_keys: recipients.iter().map(|r| (r.to_string(), format!("k-{r}"))).collect(),
            allowed_users: recipients.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
            chunk_hashes: vec![],
            chunk_size: 1024,
        }
    }

    #[tokio::test]
    async fn register_key_must_match_session() {
        let state = state();
        let pem = PeerKeys::generate_with_bits(1024).unwrap().public_pem().unwrap();

        let err = dispatch(
            &state,
            "alice",
            HubRequest::RegisterKey { from: "bob".into(), public_key: pem.clone(), transfer_addr: None },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::ValidationError(_))));

        let ok = dispatch(
            &state,
            "alice",
            HubRequest::RegisterKey { from: "alice".into(), public_key: pem, transfer_addr: None },
        )
        .await
        .unwrap();
        assert_eq!(ok, HubEvent::KeyAck { nickname: "alice".into() });
    }

    #[tokio::test]
    async fn share_notifies_online_recipients() {
        let state = state();
        let (_, mut bob_rx) = state.peers.connect("bob", addr()).await;

        let ack = dispatch(&state, "alice", share_request(&["bob", "carol"])).await.unwrap();
        assert_eq!(ack, HubEvent::ShareAck { file_hash: sha256_hex(b"cipher") });

        match bob_rx.recv().await {
            Some(HubEvent::FileShared { from, encrypted_key, .. }) => {
                assert_eq!(from, "alice");
                assert_eq!(encrypted_key, "k-bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_request_needs_online_owner() {
        let state = state();
        dispatch(&state, "alice", share_request(&["bob"])).await.unwrap();

        let err = dispatch(
            &state,
            "bob",
            HubRequest::RequestDownloadToken { file_hash: sha256_hex(b"cipher"), uploader: None },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::Transport(_))));
        assert_eq!(state.tokens.outstanding().await, 0);

        let logs = state.registry.audit_log("alice", &sha256_hex(b"cipher")).await.unwrap();
        let issued: Vec<_> = logs
            .iter()
            .filter(|e| e.action_type == AuditAction::TokenIssued)
            .collect();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].status, AuditStatus::Failed);
        assert_eq!(issued[0].acting_user.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn token_request_for_wrong_uploader_mints_nothing() {
        let state = state();
        state.peers.connect("alice", addr()).await;
        dispatch(&state, "alice", share_request(&["bob"])).await.unwrap();

        let err = dispatch(
            &state,
            "bob",
            HubRequest::RequestDownloadToken {
                file_hash: sha256_hex(b"cipher"),
                uploader: Some("mallory".into()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::ValidationError(_))));
        assert_eq!(state.tokens.outstanding().await, 0);

        let logs = state.registry.audit_log("alice", &sha256_hex(b"cipher")).await.unwrap();
        assert!(!logs
            .iter()
            .any(|e| e.action_type == AuditAction::TokenIssued && e.status == AuditStatus::Success));
    }

    #[tokio::test]
    async fn token_request_notifies_owner() {
        let state = state();
        let (_, mut alice_rx) = state.peers.connect("alice", addr()).await;
        dispatch(&state, "alice", share_request(&["bob"])).await.unwrap();

        let reply = dispatch(
            &state,
            "bob",
            HubRequest::RequestDownloadToken {
                file_hash: sha256_hex(b"cipher"),
                uploader: Some("alice".into()),
            },
        )
        .await
        .unwrap();

        let HubEvent::DownloadToken { token, uploader, .. } = reply else {
            panic!("expected downloadToken, got {reply:?}");
        };
        assert_eq!(uploader, "alice");

        match alice_rx.recv().await {
            Some(HubEvent::DownloadTokenIssued { token: issued, downloader, .. }) => {
                assert_eq!(issued, token);
                assert_eq!(downloader, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn revoke_then_token_is_denied() {
        let state = state();
        state.peers.connect("alice", addr()).await;
        let (_, mut carol_rx) = state.peers.connect("carol", addr()).await;
        dispatch(&state, "alice", share_request(&["bob", "carol"])).await.unwrap();
        // drain fileShared
        carol_rx.recv().await;

        let reply = dispatch(
            &state,
            "alice",
            HubRequest::RevokeAccess { file_hash: sha256_hex(b"cipher"), target_user: "carol".into() },
        )
        .await
        .unwrap();
        assert!(matches!(reply, HubEvent::RevocationConfirmed { .. }));
        assert!(matches!(carol_rx.recv().await, Some(HubEvent::RevokedNotice { .. })));

        let err = dispatch(
            &state,
            "carol",
            HubRequest::RequestDownloadToken { file_hash: sha256_hex(b"cipher"), uploader: None },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::AccessDenied)));
        assert_eq!(err.to_event(), HubEvent::error(&ShareError::AccessDenied));
    }

    #[tokio::test]
    async fn update_keys_notifies_remaining_recipients() {
        let state = state();
        let (_, mut bob_rx) = state.peers.connect("bob", addr()).await;
        dispatch(&state, "alice", share_request(&["bob"])).await.unwrap();
        bob_rx.recv().await;

        let reply = dispatch(
            &state,
            "alice",
            HubRequest::UpdateFileKeys {
                file_hash: sha256_hex(b"cipher"),
                new_iv: SessionKey::generate().iv_base64(),
                new_encrypted_keys: BTreeMap::from([("bob".to_string(), "k2".to_string())]),
                chunk_hashes: None,
            },
        )
        .await
        .unwrap();
        assert!(matches!(reply, HubEvent::KeysUpdated { .. }));
        assert!(matches!(bob_rx.recv().await, Some(HubEvent::KeyUpdateNotice { .. })));
    }
}
