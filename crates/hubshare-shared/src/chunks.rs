//! Deterministic fixed-size chunking and SHA-256 content hashing.
//!
//! Chunk boundaries are contiguous and numbered from 0. Every hash here is
//! taken over the bytes that travel on the wire, i.e. the ciphertext.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Number of chunks a file of `file_size` bytes splits into. An empty file
/// is a single empty chunk.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    file_size.div_ceil(chunk_size).max(1) as u32
}

/// Byte range `[start, end)` covered by chunk `index`.
pub fn chunk_range(index: u32, file_size: u64, chunk_size: usize) -> (u64, u64) {
    let start = (index as u64 * chunk_size as u64).min(file_size);
    let end = (start + chunk_size as u64).min(file_size);
    (start, end)
}

/// Per-chunk and whole-file hashes of one ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    pub file_size: u64,
    pub chunk_size: usize,
    pub chunk_hashes: Vec<String>,
    pub content_hash: String,
}

impl ChunkManifest {
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        let chunk_hashes = if data.is_empty() {
            vec![sha256_hex(&[])]
        } else {
            data.chunks(chunk_size.max(1)).map(sha256_hex).collect()
        };

        Self {
            file_size: data.len() as u64,
            chunk_size,
            chunk_hashes,
            content_hash: sha256_hex(data),
        }
    }

    /// Stream a file from disk, hashing one chunk at a time.
    pub async fn from_file(path: &Path, chunk_size: usize) -> std::io::Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        Self::from_reader(&mut file, chunk_size).await
    }

    /// Same as [`ChunkManifest::from_file`] over an already open reader,
    /// consumed to EOF.
    pub async fn from_reader<R>(reader: &mut R, chunk_size: usize) -> std::io::Result<Self>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut whole = Sha256::new();
        let mut chunk_hashes = Vec::new();
        let mut file_size = 0u64;
        let mut buf = vec![0u8; chunk_size.max(1)];

        loop {
            let filled = read_full(reader, &mut buf).await?;
            if filled == 0 && !chunk_hashes.is_empty() {
                break;
            }
            whole.update(&buf[..filled]);
            chunk_hashes.push(sha256_hex(&buf[..filled]));
            file_size += filled as u64;
            if filled < buf.len() {
                break;
            }
        }

        Ok(Self {
            file_size,
            chunk_size,
            chunk_hashes,
            content_hash: hex::encode(whole.finalize()),
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }
}

/// Fill `buf` from `reader` until it is full or EOF is reached.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncReadExt + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, 4), 1);
        assert_eq!(total_chunks(1, 4), 1);
        assert_eq!(total_chunks(4, 4), 1);
        assert_eq!(total_chunks(5, 4), 2);
        assert_eq!(total_chunks(12, 4), 3);
    }

    #[test]
    fn test_chunk_range_clamps_last_chunk() {
        assert_eq!(chunk_range(0, 10, 4), (0, 4));
        assert_eq!(chunk_range(2, 10, 4), (8, 10));
        assert_eq!(chunk_range(5, 10, 4), (10, 10));
    }

    #[test]
    fn test_manifest_hashes_each_chunk() {
        let data: Vec<u8> = (0..10u8).collect();
        let manifest = ChunkManifest::from_bytes(&data, 4);

        assert_eq!(manifest.total_chunks(), 3);
        assert_eq!(manifest.chunk_hashes[0], sha256_hex(&data[0..4]));
        assert_eq!(manifest.chunk_hashes[2], sha256_hex(&data[8..10]));
        assert_eq!(manifest.content_hash, sha256_hex(&data));
    }

    #[test]
    fn test_empty_manifest_has_one_chunk() {
        let manifest = ChunkManifest::from_bytes(&[], 4);
        assert_eq!(manifest.total_chunks(), 1);
        assert_eq!(manifest.chunk_hashes[0], sha256_hex(&[]));
    }

    #[tokio::test]
    async fn test_file_manifest_matches_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.enc");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let from_disk = ChunkManifest::from_file(&path, 128).await.unwrap();
        assert_eq!(from_disk, ChunkManifest::from_bytes(&data, 128));
        assert_eq!(from_disk.content_hash, sha256_hex(&data));
    }

    #[tokio::test]
    async fn test_file_manifest_exact_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.enc");
        let data = vec![9u8; 256];
        tokio::fs::write(&path, &data).await.unwrap();

        let manifest = ChunkManifest::from_file(&path, 128).await.unwrap();
        assert_eq!(manifest.total_chunks(), 2);
        assert_eq!(manifest, ChunkManifest::from_bytes(&data, 128));
    }
}
