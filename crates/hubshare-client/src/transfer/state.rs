//! Downloader state machine.
//!
//! `Idle -> AwaitingMetadata -> Streaming -> Verifying -> Complete | Failed`
//!
//! The machine does no I/O. The driver feeds it [`DownloadEvent`]s (things
//! that arrived from the uploader or finished on disk) and carries out the
//! [`Effect`]s it returns (messages to send, bytes to write, regions to
//! hash). Chunks are only ever written after their hash matched the
//! uploader's metadata.

use std::collections::{BTreeMap, BTreeSet};

use hubshare_shared::chunks::{chunk_range, sha256_hex, total_chunks};
use hubshare_shared::constants::{MAX_CHUNK_RETRIES, MAX_CHUNK_SIZE};
use hubshare_shared::protocol::{FileMetadata, PeerRequest};
use hubshare_shared::ShareError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A chunk kept failing its hash check
    HashMismatch { chunk: u32 },
    /// The uploader reported an error
    Remote { code: Option<String>, text: String },
    Protocol(String),
    Disconnected,
}

impl Failure {
    pub fn to_error(&self) -> ShareError {
        match self {
            Failure::HashMismatch { chunk } => ShareError::HashMismatch { chunk: *chunk },
            Failure::Remote { code, text } => ShareError::from_wire(code.as_deref(), text),
            Failure::Protocol(text) => ShareError::Protocol(text.clone()),
            Failure::Disconnected => {
                ShareError::Transport("uploader closed the connection".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    AwaitingMetadata,
    Streaming,
    Verifying,
    Complete,
    Failed(Failure),
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Complete | DownloadState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Begin, with `local_size` bytes of a previous attempt already on disk
    Start { token: String, local_size: u64 },
    Metadata(FileMetadata),
    /// Hashes of the chunks already on disk, as requested by
    /// [`Effect::CheckLocal`]
    LocalHashes(Vec<String>),
    Chunk { index: u32, data: Vec<u8> },
    /// A chunk frame that could not be decoded
    ChunkCorrupt { index: u32 },
    /// The uploader sent `fileComplete`
    StreamEnded { file_hash: String },
    /// Per-chunk hashes of the finished file, as requested by
    /// [`Effect::VerifyAll`]
    Verified { chunk_hashes: Vec<String>, content_hash: String },
    SinkFull,
    SinkDrained,
    PeerError { code: Option<String>, text: String },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(PeerRequest),
    /// Hash local chunks `0..upto` and answer with `LocalHashes`
    CheckLocal { upto: u32, chunk_size: usize, file_size: u64 },
    Write { index: u32, offset: u64, data: Vec<u8> },
    PauseReading,
    ResumeReading,
    /// Flush, truncate to `file_size`, hash everything and answer with
    /// `Verified`
    VerifyAll { file_size: u64, chunk_size: usize },
    Finished,
}

#[derive(Debug)]
pub struct DownloadMachine {
    file_hash: String,
    token: String,
    state: DownloadState,
    metadata: Option<FileMetadata>,
    outstanding: BTreeSet<u32>,
    retries: BTreeMap<u32, u32>,
    stream_ended: bool,
    paused: bool,
    received: u32,
}

impl DownloadMachine {
    pub fn new(file_hash: &str) -> Self {
        Self {
            file_hash: file_hash.to_string(),
            token: String::new(),
            state: DownloadState::Idle,
            metadata: None,
            outstanding: BTreeSet::new(),
            retries: BTreeMap::new(),
            stream_ended: false,
            paused: false,
            received: 0,
        }
    }

    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    /// Chunks accepted from the network so far.
    pub fn chunks_received(&self) -> u32 {
        self.received
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn outstanding(&self) -> impl Iterator<Item = u32> + '_ {
        self.outstanding.iter().copied()
    }

    pub fn handle(&mut self, event: DownloadEvent) -> (DownloadState, Vec<Effect>) {
        let effects = if self.state.is_terminal() {
            Vec::new()
        } else {
            self.step(event)
        };
        (self.state.clone(), effects)
    }

    fn fail(&mut self, failure: Failure) -> Vec<Effect> {
        self.state = DownloadState::Failed(failure);
        Vec::new()
    }

    fn protocol(&mut self, text: impl Into<String>) -> Vec<Effect> {
        self.fail(Failure::Protocol(text.into()))
    }

    fn step(&mut self, event: DownloadEvent) -> Vec<Effect> {
        match (&self.state, event) {
            (_, DownloadEvent::PeerError { code, text }) => self.fail(Failure::Remote { code, text }),
            (_, DownloadEvent::Disconnected) => self.fail(Failure::Disconnected),

            (DownloadState::Idle, DownloadEvent::Start { token, local_size }) => {
                self.token = token.clone();
                self.state = DownloadState::AwaitingMetadata;
                vec![Effect::Send(PeerRequest::DownloadRequest {
                    file_hash: self.file_hash.clone(),
                    token,
                    start_offset: local_size,
                })]
            }

            (DownloadState::AwaitingMetadata, DownloadEvent::Metadata(meta)) => self.on_metadata(meta),

            (DownloadState::Streaming, DownloadEvent::LocalHashes(hashes)) => self.on_local_hashes(hashes),
            (DownloadState::Streaming, DownloadEvent::Chunk { index, data }) => self.on_chunk(index, data),
            (DownloadState::Streaming, DownloadEvent::ChunkCorrupt { index }) => {
                let in_range = self
                    .metadata
                    .as_ref()
                    .is_some_and(|m| index < m.total_chunks);
                if !in_range {
                    return self.protocol(format!("chunk {index} out of range"));
                }
                self.reject_chunk(index)
            }
            (DownloadState::Streaming, DownloadEvent::StreamEnded { file_hash }) => {
                if file_hash != self.file_hash {
                    return self.protocol("fileComplete for a different file");
                }
                self.stream_ended = true;
                self.maybe_verify()
            }
            (DownloadState::Streaming | DownloadState::Verifying, DownloadEvent::SinkFull) => {
                self.paused = true;
                vec![Effect::PauseReading]
            }
            (DownloadState::Streaming | DownloadState::Verifying, DownloadEvent::SinkDrained) => {
                self.paused = false;
                vec![Effect::ResumeReading]
            }

            (DownloadState::Verifying, DownloadEvent::Verified { chunk_hashes, content_hash }) => {
                self.on_verified(chunk_hashes, content_hash)
            }

            (state, event) => {
                let text = format!("{event:?} is not expected while {state:?}");
                self.protocol(text)
            }
        }
    }

    fn on_metadata(&mut self, meta: FileMetadata) -> Vec<Effect> {
        if meta.file_hash != self.file_hash {
            return self.protocol("metadata for a different file");
        }
        if meta.chunk_size == 0 || meta.chunk_size > MAX_CHUNK_SIZE {
            return self.protocol(format!("chunk size {} out of bounds", meta.chunk_size));
        }
        if meta.total_chunks != total_chunks(meta.file_size, meta.chunk_size)
            || meta.expected_chunk_hashes.len() != meta.total_chunks as usize
            || meta.start_chunk_index > meta.total_chunks
        {
            return self.protocol("inconsistent file metadata");
        }

        self.outstanding = (meta.start_chunk_index..meta.total_chunks).collect();
        self.state = DownloadState::Streaming;

        let effects = if meta.start_chunk_index > 0 {
            vec![Effect::CheckLocal {
                upto: meta.start_chunk_index,
                chunk_size: meta.chunk_size,
                file_size: meta.file_size,
            }]
        } else {
            Vec::new()
        };
        self.metadata = Some(meta);
        effects
    }

    fn on_local_hashes(&mut self, hashes: Vec<String>) -> Vec<Effect> {
        let Some(meta) = &self.metadata else {
            return self.protocol("local check before metadata");
        };

        let stale: Vec<u32> = (0..meta.start_chunk_index)
            .filter(|&i| hashes.get(i as usize) != meta.expected_chunk_hashes.get(i as usize))
            .collect();

        let mut effects = Vec::with_capacity(stale.len());
        for index in stale {
            self.outstanding.insert(index);
            effects.push(self.request_chunk(index));
        }
        effects
    }

    fn on_chunk(&mut self, index: u32, data: Vec<u8>) -> Vec<Effect> {
        let Some(meta) = &self.metadata else {
            return self.protocol("chunk before metadata");
        };
        let Some(expected) = meta.expected_chunk_hashes.get(index as usize) else {
            return self.protocol(format!("chunk {index} out of range"));
        };

        if !self.outstanding.contains(&index) {
            // duplicate of a chunk we already accepted
            return Vec::new();
        }
        if sha256_hex(&data) != *expected {
            return self.reject_chunk(index);
        }

        let (offset, _) = chunk_range(index, meta.file_size, meta.chunk_size);
        self.outstanding.remove(&index);
        self.received += 1;

        let mut effects = vec![Effect::Write { index, offset, data }];
        effects.extend(self.maybe_verify());
        effects
    }

    /// Mark a chunk outstanding again and re-request it, within the retry
    /// budget.
    fn reject_chunk(&mut self, index: u32) -> Vec<Effect> {
        let retries = self.retries.entry(index).or_insert(0);
        *retries += 1;
        if *retries > MAX_CHUNK_RETRIES {
            return self.fail(Failure::HashMismatch { chunk: index });
        }
        self.outstanding.insert(index);
        vec![self.request_chunk(index)]
    }

    fn request_chunk(&self, chunk_index: u32) -> Effect {
        Effect::Send(PeerRequest::RequestChunk {
            file_hash: self.file_hash.clone(),
            token: self.token.clone(),
            chunk_index,
        })
    }

    fn maybe_verify(&mut self) -> Vec<Effect> {
        if !self.stream_ended || !self.outstanding.is_empty() {
            return Vec::new();
        }
        let Some(meta) = &self.metadata else {
            return self.protocol("stream ended before metadata");
        };
        let effect = Effect::VerifyAll {
            file_size: meta.file_size,
            chunk_size: meta.chunk_size,
        };
        self.state = DownloadState::Verifying;
        vec![effect]
    }

    fn on_verified(&mut self, chunk_hashes: Vec<String>, content_hash: String) -> Vec<Effect> {
        let Some(meta) = &self.metadata else {
            return self.protocol("verification before metadata");
        };

        let bad: Vec<u32> = (0..meta.total_chunks)
            .filter(|&i| chunk_hashes.get(i as usize) != meta.expected_chunk_hashes.get(i as usize))
            .collect();

        if bad.is_empty() {
            if content_hash != meta.content_hash {
                return self.protocol("chunks verified but whole-file hash differs");
            }
            self.state = DownloadState::Complete;
            return vec![Effect::Finished];
        }

        // back to streaming for just the damaged range
        self.state = DownloadState::Streaming;
        let mut effects = Vec::with_capacity(bad.len());
        for index in bad {
            let mut retry = self.reject_chunk(index);
            if self.state.is_terminal() {
                return Vec::new();
            }
            effects.append(&mut retry);
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubshare_shared::chunks::ChunkManifest;

    const CHUNK: usize = 4;

    fn blob() -> Vec<u8> {
        (0..10u8).collect()
    }

    fn metadata(start: u32) -> FileMetadata {
        let manifest = ChunkManifest::from_bytes(&blob(), CHUNK);
        FileMetadata {
            file_hash: "h".into(),
            total_chunks: manifest.total_chunks(),
            file_size: manifest.file_size,
            expected_chunk_hashes: manifest.chunk_hashes,
            start_chunk_index: start,
            chunk_size: CHUNK,
            content_hash: manifest.content_hash,
        }
    }

    fn chunk(index: u32) -> DownloadEvent {
        let (start, end) = chunk_range(index, 10, CHUNK);
        DownloadEvent::Chunk {
            index,
            data: blob()[start as usize..end as usize].to_vec(),
        }
    }

    fn verified() -> DownloadEvent {
        let manifest = ChunkManifest::from_bytes(&blob(), CHUNK);
        DownloadEvent::Verified {
            chunk_hashes: manifest.chunk_hashes,
            content_hash: manifest.content_hash,
        }
    }

    fn started(local_size: u64) -> DownloadMachine {
        let mut machine = DownloadMachine::new("h");
        machine.handle(DownloadEvent::Start { token: "t".into(), local_size });
        machine
    }

    #[test]
    fn full_download_happy_path() {
        let mut machine = DownloadMachine::new("h");

        let (state, effects) = machine.handle(DownloadEvent::Start { token: "t".into(), local_size: 0 });
        assert_eq!(state, DownloadState::AwaitingMetadata);
        assert_eq!(
            effects,
            vec![Effect::Send(PeerRequest::DownloadRequest {
                file_hash: "h".into(),
                token: "t".into(),
                start_offset: 0,
            })]
        );

        let (state, effects) = machine.handle(DownloadEvent::Metadata(metadata(0)));
        assert_eq!(state, DownloadState::Streaming);
        assert!(effects.is_empty());

        for i in 0..3 {
            let (_, effects) = machine.handle(chunk(i));
            assert!(matches!(&effects[0], Effect::Write { index, offset, .. } if *index == i && *offset == i as u64 * 4));
        }

        let (state, effects) = machine.handle(DownloadEvent::StreamEnded { file_hash: "h".into() });
        assert_eq!(state, DownloadState::Verifying);
        assert_eq!(effects, vec![Effect::VerifyAll { file_size: 10, chunk_size: CHUNK }]);

        let (state, effects) = machine.handle(verified());
        assert_eq!(state, DownloadState::Complete);
        assert_eq!(effects, vec![Effect::Finished]);
        assert_eq!(machine.chunks_received(), 3);
    }

    #[test]
    fn corrupt_chunk_is_not_written_and_is_re_requested() {
        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));

        let (state, effects) = machine.handle(DownloadEvent::Chunk { index: 1, data: vec![0xff, 5, 6, 7] });
        assert_eq!(state, DownloadState::Streaming);
        assert_eq!(
            effects,
            vec![Effect::Send(PeerRequest::RequestChunk {
                file_hash: "h".into(),
                token: "t".into(),
                chunk_index: 1,
            })]
        );
        assert!(machine.outstanding().any(|i| i == 1));

        machine.handle(chunk(0));
        machine.handle(chunk(2));
        let (state, _) = machine.handle(DownloadEvent::StreamEnded { file_hash: "h".into() });
        assert_eq!(state, DownloadState::Streaming, "waits for the re-requested chunk");

        let (state, effects) = machine.handle(chunk(1));
        assert_eq!(state, DownloadState::Verifying);
        assert!(matches!(effects[0], Effect::Write { index: 1, .. }));
        assert!(matches!(effects[1], Effect::VerifyAll { .. }));
    }

    #[test]
    fn retries_are_bounded() {
        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));

        for _ in 0..MAX_CHUNK_RETRIES {
            let (state, _) = machine.handle(DownloadEvent::ChunkCorrupt { index: 2 });
            assert_eq!(state, DownloadState::Streaming);
        }
        let (state, effects) = machine.handle(DownloadEvent::ChunkCorrupt { index: 2 });
        assert_eq!(state, DownloadState::Failed(Failure::HashMismatch { chunk: 2 }));
        assert!(effects.is_empty());
        assert!(matches!(
            machine.state().clone(),
            DownloadState::Failed(f) if matches!(f.to_error(), ShareError::HashMismatch { chunk: 2 })
        ));
    }

    #[test]
    fn resume_checks_local_chunks_first() {
        let mut machine = started(8);

        let (_, effects) = machine.handle(DownloadEvent::Metadata(metadata(2)));
        assert_eq!(effects, vec![Effect::CheckLocal { upto: 2, chunk_size: CHUNK, file_size: 10 }]);
        assert_eq!(machine.outstanding().collect::<Vec<_>>(), vec![2]);

        // chunk 0 on disk is fine, chunk 1 is damaged
        let good = metadata(2).expected_chunk_hashes;
        let (_, effects) = machine.handle(DownloadEvent::LocalHashes(vec![
            good[0].clone(),
            sha256_hex(b"junk"),
        ]));
        assert_eq!(
            effects,
            vec![Effect::Send(PeerRequest::RequestChunk {
                file_hash: "h".into(),
                token: "t".into(),
                chunk_index: 1,
            })]
        );
        assert_eq!(machine.outstanding().collect::<Vec<_>>(), vec![1, 2]);

        machine.handle(chunk(2));
        machine.handle(DownloadEvent::StreamEnded { file_hash: "h".into() });
        let (state, _) = machine.handle(chunk(1));
        assert_eq!(state, DownloadState::Verifying);
        assert_eq!(machine.chunks_received(), 2);
    }

    #[test]
    fn completed_file_transfers_nothing() {
        let mut machine = started(10);

        let (_, effects) = machine.handle(DownloadEvent::Metadata(metadata(3)));
        assert_eq!(effects, vec![Effect::CheckLocal { upto: 3, chunk_size: CHUNK, file_size: 10 }]);

        let (_, effects) = machine.handle(DownloadEvent::LocalHashes(metadata(3).expected_chunk_hashes));
        assert!(effects.is_empty());

        let (state, _) = machine.handle(DownloadEvent::StreamEnded { file_hash: "h".into() });
        assert_eq!(state, DownloadState::Verifying);
        let (state, _) = machine.handle(verified());
        assert_eq!(state, DownloadState::Complete);
        assert_eq!(machine.chunks_received(), 0);
    }

    #[test]
    fn failed_verification_re_requests_damaged_range() {
        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));
        for i in 0..3 {
            machine.handle(chunk(i));
        }
        machine.handle(DownloadEvent::StreamEnded { file_hash: "h".into() });

        let DownloadEvent::Verified { mut chunk_hashes, content_hash } = verified() else {
            unreachable!()
        };
        chunk_hashes[0] = sha256_hex(b"flipped bit on disk");
        let (state, effects) = machine.handle(DownloadEvent::Verified { chunk_hashes, content_hash });

        assert_eq!(state, DownloadState::Streaming);
        assert_eq!(effects.len(), 1);
        let (state, effects) = machine.handle(chunk(0));
        assert_eq!(state, DownloadState::Verifying);
        assert!(matches!(effects.last(), Some(Effect::VerifyAll { .. })));
    }

    #[test]
    fn backpressure_pauses_and_resumes() {
        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));

        let (_, effects) = machine.handle(DownloadEvent::SinkFull);
        assert_eq!(effects, vec![Effect::PauseReading]);
        assert!(machine.is_paused());

        let (_, effects) = machine.handle(DownloadEvent::SinkDrained);
        assert_eq!(effects, vec![Effect::ResumeReading]);
        assert!(!machine.is_paused());
    }

    #[test]
    fn uploader_error_and_disconnect_fail() {
        let mut machine = started(0);
        let (state, _) = machine.handle(DownloadEvent::PeerError {
            code: Some("TOKEN_EXPIRED".into()),
            text: "Download token expired".into(),
        });
        assert!(matches!(
            state,
            DownloadState::Failed(ref f) if matches!(f.to_error(), ShareError::TokenExpired)
        ));

        // terminal states ignore further input
        let (state2, effects) = machine.handle(chunk(0));
        assert_eq!(state2, state);
        assert!(effects.is_empty());

        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));
        let (state, _) = machine.handle(DownloadEvent::Disconnected);
        assert_eq!(state, DownloadState::Failed(Failure::Disconnected));
    }

    #[test]
    fn rejects_out_of_order_protocol() {
        let mut machine = started(0);
        let (state, _) = machine.handle(chunk(0));
        assert!(matches!(state, DownloadState::Failed(Failure::Protocol(_))));

        let mut machine = started(0);
        let mut wrong = metadata(0);
        wrong.file_hash = "other".into();
        let (state, _) = machine.handle(DownloadEvent::Metadata(wrong));
        assert!(matches!(state, DownloadState::Failed(Failure::Protocol(_))));

        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));
        let (state, _) = machine.handle(DownloadEvent::Chunk { index: 7, data: vec![] });
        assert!(matches!(state, DownloadState::Failed(Failure::Protocol(_))));
    }

    #[test]
    fn unbounded_chunk_size_is_refused() {
        let mut machine = started(0);
        let mut huge = metadata(0);
        huge.total_chunks = 1;
        huge.expected_chunk_hashes.truncate(1);
        huge.chunk_size = usize::MAX;

        let (state, effects) = machine.handle(DownloadEvent::Metadata(huge));
        assert!(matches!(state, DownloadState::Failed(Failure::Protocol(_))));
        assert!(effects.is_empty());
    }

    #[test]
    fn chunk_count_must_match_file_size() {
        let mut machine = started(0);
        let mut short = metadata(0);
        short.file_size = 100;

        let (state, _) = machine.handle(DownloadEvent::Metadata(short));
        assert!(matches!(state, DownloadState::Failed(Failure::Protocol(_))));
    }

    #[test]
    fn duplicate_chunk_is_ignored() {
        let mut machine = started(0);
        machine.handle(DownloadEvent::Metadata(metadata(0)));
        machine.handle(chunk(0));

        let (state, effects) = machine.handle(chunk(0));
        assert_eq!(state, DownloadState::Streaming);
        assert!(effects.is_empty());
        assert_eq!(machine.chunks_received(), 1);
    }
}
