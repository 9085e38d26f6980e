//! Uploader side of the chunked transfer protocol.
//!
//! Every accepted connection serves exactly one file to one downloader,
//! from its own file handle. The token that opened the connection is
//! dropped from the local table when the connection closes. A downloader
//! revoked while connected gets nothing more from that connection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use futures::{Sink, SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncSeekExt, SeekFrom};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use hubshare_shared::chunks::{chunk_range, read_full, sha256_hex, ChunkManifest};
use hubshare_shared::constants::MAX_CHUNK_SIZE;
use hubshare_shared::protocol::{FileChunk, FileMetadata, PeerEvent, PeerRequest};
use hubshare_shared::types::DownloadToken;
use hubshare_shared::ShareError;

use crate::hub_client::TokenAuthority;
use crate::store::CiphertextStore;

/// Tokens the hub told us about, keyed by token value, plus the
/// (file, downloader) pairs revoked since we started.
#[derive(Clone, Default)]
pub struct TokenTable {
    tokens: Arc<RwLock<HashMap<String, DownloadToken>>>,
    revoked: Arc<RwLock<HashSet<(String, String)>>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a token, dropping any that have expired.
    pub async fn insert(&self, token: DownloadToken) {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, t| !t.is_expired_at(now));
        tokens.insert(token.token.clone(), token);
    }

    pub async fn check(&self, token: &str, file_hash: &str) -> Result<DownloadToken, ShareError> {
        let found = self
            .tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(ShareError::TokenNotFound)?;
        found.check(file_hash, Utc::now())?;
        Ok(found)
    }

    pub async fn remove(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Forget `user`'s tokens for `file_hash` and refuse that pair from
    /// now on, including on connections already open.
    pub async fn revoke_for(&self, file_hash: &str, user: &str) -> usize {
        self.revoked
            .write()
            .await
            .insert((file_hash.to_string(), user.to_string()));
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !(t.file_hash == file_hash && t.downloader == user));
        before - tokens.len()
    }

    pub async fn is_revoked(&self, file_hash: &str, user: &str) -> bool {
        self.revoked
            .read()
            .await
            .contains(&(file_hash.to_string(), user.to_string()))
    }

    pub async fn outstanding(&self) -> usize {
        self.tokens.read().await.len()
    }
}

/// What one connection is serving.
struct Serving {
    token: DownloadToken,
    file: tokio::fs::File,
    file_size: u64,
    total: u32,
}

#[derive(Clone)]
pub struct Uploader {
    store: CiphertextStore,
    tokens: TokenTable,
    authority: Option<Arc<dyn TokenAuthority>>,
    chunk_size: usize,
    token_grace: Duration,
}

async fn send_event<S>(sink: &mut S, event: &PeerEvent) -> Result<(), ShareError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(event.to_json()?))
        .await
        .map_err(|e| ShareError::Transport(e.to_string()))
}

impl Uploader {
    pub fn new(store: CiphertextStore, chunk_size: usize, token_grace: std::time::Duration) -> Self {
        Self {
            store,
            tokens: TokenTable::new(),
            authority: None,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            token_grace: Duration::from_std(token_grace).unwrap_or_else(|_| Duration::zero()),
        }
    }

    /// Have `authority` confirm every token before it opens a transfer.
    /// Tokens missing from the local table are learned from its answer.
    pub fn with_authority(mut self, authority: Arc<dyn TokenAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    /// Accept downloaders until the listener fails.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Uploader listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let uploader = self.clone();
                    tokio::spawn(async move { uploader.handle_connection(stream, addr).await });
                }
                Err(e) => {
                    warn!(error = %e, "Uploader accept failed");
                    break;
                }
            }
        }
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();
        let mut serving: Option<Serving> = None;

        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            let outcome = match PeerRequest::from_json(&text) {
                Err(e) => Err(ShareError::from(e)),
                Ok(PeerRequest::DownloadRequest { .. }) if serving.is_some() => Err(
                    ShareError::Protocol("connection is already serving a file".to_string()),
                ),
                Ok(PeerRequest::DownloadRequest { file_hash, token, start_offset }) => self
                    .start(&mut sink, &file_hash, &token, start_offset)
                    .await
                    .map(|s| serving = Some(s)),
                Ok(PeerRequest::RequestChunk { file_hash, token, chunk_index }) => {
                    self.resend(&mut sink, serving.as_mut(), &file_hash, &token, chunk_index)
                        .await
                }
            };

            if let Err(e) = outcome {
                warn!(%addr, error = %e, "Refusing transfer request");
                let _ = send_event(&mut sink, &PeerEvent::error(&e)).await;
                break;
            }
        }

        if let Some(serving) = serving {
            self.tokens.remove(&serving.token.token).await;
            debug!(%addr, file_hash = %serving.token.file_hash, "Transfer connection closed");
        }
        let _ = sink.close().await;
    }

    async fn authorize(&self, token: &str, file_hash: &str) -> Result<DownloadToken, ShareError> {
        let local = self.tokens.check(token, file_hash).await;
        let found = match (&self.authority, local) {
            (None, local) => local?,
            (Some(authority), Ok(_) | Err(ShareError::TokenNotFound)) => {
                // the hub drops a revoked user's tokens, so it has the last word
                let confirmed = authority.confirm(file_hash, token).await?;
                confirmed.check(file_hash, Utc::now())?;
                self.tokens.insert(confirmed.clone()).await;
                confirmed
            }
            (Some(_), Err(e)) => return Err(e),
        };

        if self.tokens.is_revoked(file_hash, &found.downloader).await {
            return Err(ShareError::AccessDenied);
        }
        Ok(found)
    }

    async fn start<S>(
        &self,
        sink: &mut S,
        file_hash: &str,
        token: &str,
        start_offset: u64,
    ) -> Result<Serving, ShareError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let token = self.authorize(token, file_hash).await?;

        let mut file = self.store.open_file(file_hash).await?;
        let manifest = ChunkManifest::from_reader(&mut file, self.chunk_size).await?;
        let total = manifest.total_chunks();
        let start = if start_offset >= manifest.file_size {
            total
        } else {
            (start_offset / self.chunk_size as u64) as u32
        };

        info!(
            file_hash,
            downloader = %token.downloader,
            start_chunk = start,
            total_chunks = total,
            "Serving file"
        );

        let metadata = FileMetadata {
            file_hash: file_hash.to_string(),
            total_chunks: total,
            file_size: manifest.file_size,
            expected_chunk_hashes: manifest.chunk_hashes,
            start_chunk_index: start,
            chunk_size: self.chunk_size,
            content_hash: manifest.content_hash,
        };
        send_event(sink, &PeerEvent::FileMetadata(metadata)).await?;

        let mut serving = Serving {
            token,
            file,
            file_size: manifest.file_size,
            total,
        };
        for index in start..total {
            self.send_chunk(sink, &mut serving, index).await?;
        }
        send_event(sink, &PeerEvent::FileComplete { file_hash: file_hash.to_string() }).await?;

        Ok(serving)
    }

    async fn resend<S>(
        &self,
        sink: &mut S,
        serving: Option<&mut Serving>,
        file_hash: &str,
        token: &str,
        chunk_index: u32,
    ) -> Result<(), ShareError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let Some(serving) = serving else {
            return Err(ShareError::Protocol("requestChunk before downloadRequest".to_string()));
        };
        if file_hash != serving.token.file_hash {
            return Err(ShareError::TokenFileMismatch);
        }
        if !bool::from(token.as_bytes().ct_eq(serving.token.token.as_bytes())) {
            return Err(ShareError::TokenNotFound);
        }
        if Utc::now() >= serving.token.expires_at + self.token_grace {
            return Err(ShareError::TokenExpired);
        }
        if chunk_index >= serving.total {
            return Err(ShareError::ValidationError(format!(
                "chunk {chunk_index} out of range"
            )));
        }

        debug!(file_hash, chunk_index, "Re-sending chunk");
        self.send_chunk(sink, serving, chunk_index).await
    }

    async fn send_chunk<S>(&self, sink: &mut S, serving: &mut Serving, index: u32) -> Result<(), ShareError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        if self
            .tokens
            .is_revoked(&serving.token.file_hash, &serving.token.downloader)
            .await
        {
            return Err(ShareError::AccessDenied);
        }

        let (start, end) = chunk_range(index, serving.file_size, self.chunk_size);
        let mut buf = vec![0u8; (end - start) as usize];
        serving.file.seek(SeekFrom::Start(start)).await?;
        let filled = read_full(&mut serving.file, &mut buf).await?;
        buf.truncate(filled);

        let chunk = FileChunk {
            current: index,
            total: serving.total,
            hash: sha256_hex(&buf),
            chunk: STANDARD.encode(&buf),
        };
        send_event(sink, &PeerEvent::FileChunk(chunk)).await
    }
}
