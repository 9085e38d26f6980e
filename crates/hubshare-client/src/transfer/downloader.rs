//! Downloader driver: runs a [`DownloadMachine`] against a live uploader
//! connection and the local partial file.
//!
//! Verified chunks go through a bounded queue to a writer task. When the
//! queue is full the driver stops reading from the socket until the writer
//! catches up. A failed or cancelled transfer leaves the partial file in
//! place for the next attempt to resume from.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use hubshare_shared::chunks::{chunk_range, read_full, sha256_hex, ChunkManifest};
use hubshare_shared::protocol::PeerEvent;
use hubshare_shared::ShareError;

use super::state::{DownloadEvent, DownloadMachine, DownloadState, Effect};
use crate::store::is_file_hash;

type PeerSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const DEFAULT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub file_hash: String,
    /// Where the verified ciphertext is
    pub path: PathBuf,
    pub file_size: u64,
    /// SHA-256 of the whole ciphertext
    pub content_hash: String,
    /// Chunks that actually crossed the network
    pub chunks_received: u32,
}

enum WriteJob {
    Chunk { offset: u64, data: Vec<u8> },
    Flush(oneshot::Sender<std::io::Result<()>>),
}

/// Releases a `(fileHash, uploader)` slot on drop.
struct ActiveTransfer {
    active: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct Downloader {
    dir: PathBuf,
    active: Arc<Mutex<HashSet<(String, String)>>>,
    queue_depth: usize,
}

impl Downloader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            active: Arc::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Where the ciphertext for `file_hash` is (or will be) kept.
    pub fn path_for(&self, file_hash: &str) -> Result<PathBuf, ShareError> {
        if !is_file_hash(file_hash) {
            return Err(ShareError::ValidationError(format!(
                "not a file hash: {file_hash:?}"
            )));
        }
        Ok(self.dir.join(format!("{file_hash}.enc")))
    }

    fn claim(&self, file_hash: &str, uploader: &str) -> Result<ActiveTransfer, ShareError> {
        let key = (file_hash.to_string(), uploader.to_string());
        let mut active = self
            .active
            .lock()
            .map_err(|_| ShareError::Protocol("download registry poisoned".to_string()))?;
        if !active.insert(key.clone()) {
            return Err(ShareError::ValidationError(format!(
                "a download of this file from {uploader} is already running"
            )));
        }
        Ok(ActiveTransfer {
            active: self.active.clone(),
            key,
        })
    }

    /// Fetch `file_hash` from the uploader at `uploader_addr`, resuming
    /// from whatever is already on disk.
    pub async fn download(
        &self,
        uploader: &str,
        uploader_addr: &str,
        file_hash: &str,
        token: &str,
    ) -> Result<DownloadOutcome, ShareError> {
        let _slot = self.claim(file_hash, uploader)?;
        let path = self.path_for(file_hash)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await?;
        let local_size = file.metadata().await?.len();

        let (ws, _) = tokio_tungstenite::connect_async(uploader_addr)
            .await
            .map_err(|e| ShareError::Transport(e.to_string()))?;
        let (sink, mut stream) = ws.split();

        let (jobs, jobs_rx) = mpsc::channel(self.queue_depth);
        let writer = tokio::spawn(write_loop(file, jobs_rx));

        info!(file_hash, uploader, local_size, "Starting download");

        let mut transfer = Transfer { sink, jobs, path: path.clone() };
        let mut machine = DownloadMachine::new(file_hash);
        let mut pending = VecDeque::from([DownloadEvent::Start {
            token: token.to_string(),
            local_size,
        }]);

        let result = loop {
            while let Some(event) = pending.pop_front() {
                let (state, effects) = machine.handle(event);
                if state.is_terminal() && effects.is_empty() {
                    break;
                }
                for effect in effects {
                    match transfer.apply(&mut machine, effect).await {
                        Ok(Some(next)) => pending.push_back(next),
                        Ok(None) => {}
                        Err(e) => {
                            pending.clear();
                            machine.handle(DownloadEvent::Disconnected);
                            warn!(file_hash, error = %e, "Local transfer step failed");
                            drop(transfer);
                            let _ = writer.await;
                            return Err(e);
                        }
                    }
                }
            }

            match machine.state() {
                DownloadState::Complete => break Ok(()),
                DownloadState::Failed(failure) => break Err(failure.to_error()),
                _ => {}
            }

            let event = match stream.next().await {
                Some(Ok(Message::Text(text))) => match PeerEvent::from_json(&text) {
                    Ok(event) => into_event(event),
                    Err(e) => DownloadEvent::PeerError {
                        code: None,
                        text: e.to_string(),
                    },
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => DownloadEvent::Disconnected,
                Some(Ok(_)) => continue,
            };
            pending.push_back(event);
        };

        let _ = transfer.sink.close().await;
        drop(transfer);
        let _ = writer.await;

        match result {
            Ok(()) => {
                let meta = machine
                    .metadata()
                    .ok_or_else(|| ShareError::Protocol("completed without metadata".to_string()))?;
                info!(
                    file_hash,
                    uploader,
                    received = machine.chunks_received(),
                    "Download verified"
                );
                Ok(DownloadOutcome {
                    file_hash: file_hash.to_string(),
                    path,
                    file_size: meta.file_size,
                    content_hash: meta.content_hash.clone(),
                    chunks_received: machine.chunks_received(),
                })
            }
            Err(e) => {
                warn!(file_hash, uploader, error = %e, "Download failed, partial file kept");
                Err(e)
            }
        }
    }
}

fn into_event(event: PeerEvent) -> DownloadEvent {
    match event {
        PeerEvent::FileMetadata(meta) => DownloadEvent::Metadata(meta),
        PeerEvent::FileChunk(chunk) => match STANDARD.decode(&chunk.chunk) {
            Ok(data) => DownloadEvent::Chunk {
                index: chunk.current,
                data,
            },
            Err(_) => DownloadEvent::ChunkCorrupt {
                index: chunk.current,
            },
        },
        PeerEvent::FileComplete { file_hash } => DownloadEvent::StreamEnded { file_hash },
        PeerEvent::Error { text, code } => DownloadEvent::PeerError { code, text },
    }
}

struct Transfer {
    sink: PeerSink,
    jobs: mpsc::Sender<WriteJob>,
    path: PathBuf,
}

impl Transfer {
    /// Carry out one effect. Returns the event it produces, if any.
    async fn apply(
        &mut self,
        machine: &mut DownloadMachine,
        effect: Effect,
    ) -> Result<Option<DownloadEvent>, ShareError> {
        match effect {
            Effect::Send(request) => {
                let sent = self.sink.send(Message::Text(request.to_json()?)).await;
                Ok(sent.err().map(|_| DownloadEvent::Disconnected))
            }

            Effect::CheckLocal { upto, chunk_size, file_size } => {
                let hashes = hash_local_chunks(&self.path, upto, chunk_size, file_size).await?;
                Ok(Some(DownloadEvent::LocalHashes(hashes)))
            }

            Effect::Write { offset, data, .. } => {
                match self.jobs.try_send(WriteJob::Chunk { offset, data }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(job)) => {
                        let (_, effects) = machine.handle(DownloadEvent::SinkFull);
                        if effects.contains(&Effect::PauseReading) {
                            debug!("Write queue full, pausing inbound stream");
                            self.jobs.send(job).await.map_err(|_| writer_gone())?;
                            machine.handle(DownloadEvent::SinkDrained);
                        }
                    }
                    Err(TrySendError::Closed(_)) => return Err(writer_gone()),
                }
                Ok(None)
            }

            Effect::PauseReading | Effect::ResumeReading | Effect::Finished => Ok(None),

            Effect::VerifyAll { file_size, chunk_size } => {
                let (ack, done) = oneshot::channel();
                self.jobs
                    .send(WriteJob::Flush(ack))
                    .await
                    .map_err(|_| writer_gone())?;
                done.await.map_err(|_| writer_gone())??;

                let file = tokio::fs::OpenOptions::new().write(true).open(&self.path).await?;
                file.set_len(file_size).await?;
                drop(file);

                let manifest = ChunkManifest::from_file(&self.path, chunk_size).await?;
                Ok(Some(DownloadEvent::Verified {
                    chunk_hashes: manifest.chunk_hashes,
                    content_hash: manifest.content_hash,
                }))
            }
        }
    }
}

fn writer_gone() -> ShareError {
    ShareError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "chunk writer stopped",
    ))
}

async fn write_loop(mut file: tokio::fs::File, mut jobs: mpsc::Receiver<WriteJob>) {
    let mut failed: Option<std::io::Error> = None;

    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Chunk { offset, data } => {
                if failed.is_some() {
                    continue;
                }
                let written = async {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&data).await
                }
                .await;
                if let Err(e) = written {
                    failed = Some(e);
                }
            }
            WriteJob::Flush(ack) => {
                let result = match failed.take() {
                    Some(e) => Err(e),
                    None => file.flush().await,
                };
                let _ = ack.send(result);
            }
        }
    }

    let _ = file.flush().await;
}

/// Hash chunks `0..upto` of a local partial file. Regions past its end
/// hash as whatever short read they produce, so they never match.
async fn hash_local_chunks(
    path: &Path,
    upto: u32,
    chunk_size: usize,
    file_size: u64,
) -> Result<Vec<String>, ShareError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hashes = Vec::with_capacity(upto as usize);

    for index in 0..upto {
        let (start, end) = chunk_range(index, file_size, chunk_size);
        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        let filled = read_full(&mut file, &mut buf).await?;
        hashes.push(sha256_hex(&buf[..filled]));
    }
    Ok(hashes)
}
