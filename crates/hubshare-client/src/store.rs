//! On-disk ciphertext store.
//!
//! Each shared file is kept as `<root>/<fileHash>.enc`. The file hash is
//! the only thing that ever becomes part of a path, and it has to be 64
//! lowercase hex characters, so a peer-supplied hash cannot escape the
//! root. Writes go to a temporary sibling and are renamed into place, so
//! readers with an open handle keep seeing the old ciphertext.
//!
//! Files this peer owns also get a `<fileHash>.share.json` record naming
//! the plaintext source and the current recipients, which is what a key
//! rotation needs after a restart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hubshare_shared::types::IndexEntry;
use hubshare_shared::ShareError;

const EXTENSION: &str = "enc";
const SHARE_SUFFIX: &str = "share.json";

/// What the owner needs to re-encrypt one of its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    pub source: PathBuf,
    pub file_name: String,
    pub recipients: BTreeSet<String>,
}

/// A ciphertext written next to its final path but not yet visible there.
/// Dropped without [`StagedCiphertext::commit`], the temporary file is
/// removed and the stored ciphertext stays as it was.
#[derive(Debug)]
pub struct StagedCiphertext {
    tmp: PathBuf,
    path: PathBuf,
    committed: bool,
}

impl StagedCiphertext {
    pub async fn commit(mut self) -> Result<PathBuf, ShareError> {
        tokio::fs::rename(&self.tmp, &self.path).await?;
        self.committed = true;
        Ok(self.path.clone())
    }
}

impl Drop for StagedCiphertext {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.tmp.display(), error = %e, "Failed to remove staged ciphertext");
            }
        }
    }
}

pub fn is_file_hash(candidate: &str) -> bool {
    candidate.len() == 64
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[derive(Debug, Clone)]
pub struct CiphertextStore {
    root: PathBuf,
}

impl CiphertextStore {
    pub fn open(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path_for(&self, file_hash: &str) -> Result<PathBuf, ShareError> {
        if !is_file_hash(file_hash) {
            return Err(ShareError::ValidationError(format!(
                "not a file hash: {file_hash:?}"
            )));
        }
        Ok(self.root.join(format!("{file_hash}.{EXTENSION}")))
    }

    /// Open a ciphertext for reading. Missing files are `FileNotFound`.
    pub async fn open_file(&self, file_hash: &str) -> Result<tokio::fs::File, ShareError> {
        let path = self.path_for(file_hash)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ShareError::FileNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a ciphertext beside its final path. Nothing replaces the
    /// stored copy until the returned handle is committed.
    pub async fn stage(&self, file_hash: &str, ciphertext: &[u8]) -> Result<StagedCiphertext, ShareError> {
        let path = self.path_for(file_hash)?;
        let staged = StagedCiphertext {
            tmp: self.root.join(format!("{file_hash}.{EXTENSION}.tmp")),
            path,
            committed: false,
        };
        tokio::fs::write(&staged.tmp, ciphertext).await?;

        debug!(file_hash, bytes = ciphertext.len(), "Staged ciphertext");
        Ok(staged)
    }

    /// Write or atomically replace a ciphertext.
    pub async fn write(&self, file_hash: &str, ciphertext: &[u8]) -> Result<PathBuf, ShareError> {
        self.stage(file_hash, ciphertext).await?.commit().await
    }

    fn share_path(&self, file_hash: &str) -> Result<PathBuf, ShareError> {
        self.path_for(file_hash)?;
        Ok(self.root.join(format!("{file_hash}.{SHARE_SUFFIX}")))
    }

    pub async fn save_share(&self, file_hash: &str, record: &ShareRecord) -> Result<(), ShareError> {
        let path = self.share_path(file_hash)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record).map_err(|e| ShareError::Io(e.into()))?;

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// The share record of a file we own. `FileNotFound` if there is none.
    pub async fn load_share(&self, file_hash: &str) -> Result<ShareRecord, ShareError> {
        let path = self.share_path(file_hash)?;
        let json = match tokio::fs::read(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ShareError::FileNotFound),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&json).map_err(|e| ShareError::Io(e.into()))
    }

    /// Everything currently stored, as a file index for the hub.
    pub async fn index(&self) -> Result<Vec<IndexEntry>, ShareError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_file_hash(stem) {
                continue;
            }
            entries.push(IndexEntry {
                file_name: format!("{stem}.{EXTENSION}"),
                file_hash: stem.to_string(),
                size: entry.metadata().await?.len(),
            });
        }

        entries.sort_by(|a, b| a.file_hash.cmp(&b.file_hash));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubshare_shared::chunks::sha256_hex;

    #[test]
    fn rejects_non_hash_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CiphertextStore::open(dir.path()).unwrap();

        assert!(store.path_for("../../etc/passwd").is_err());
        assert!(store.path_for(&"A".repeat(64)).is_err());
        assert!(store.path_for("abc").is_err());
        assert!(store.path_for(&sha256_hex(b"x")).unwrap().starts_with(dir.path()));
    }

    #[tokio::test]
    async fn write_replace_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = CiphertextStore::open(dir.path()).unwrap();
        let hash = sha256_hex(b"first");

        assert!(matches!(store.open_file(&hash).await, Err(ShareError::FileNotFound)));

        store.write(&hash, b"first").await.unwrap();
        let mut held = store.open_file(&hash).await.unwrap();
        let path = store.write(&hash, b"second version").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second version");
        let mut old = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut held, &mut old).await.unwrap();
        assert_eq!(old, b"first");

        tokio::fs::write(dir.path().join("notes.txt"), b"ignored").await.unwrap();
        let index = store.index().await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].file_hash, hash);
        assert_eq!(index[0].size, 14);
    }

    #[tokio::test]
    async fn dropped_stage_leaves_stored_copy_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = CiphertextStore::open(dir.path()).unwrap();
        let hash = sha256_hex(b"original");
        let path = store.write(&hash, b"original").await.unwrap();

        let staged = store.stage(&hash, b"rotated").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"original");
        drop(staged);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"original");
        assert!(!dir.path().join(format!("{hash}.enc.tmp")).exists());

        store.stage(&hash, b"rotated").await.unwrap().commit().await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"rotated");
    }

    #[tokio::test]
    async fn share_records_survive_reopen_and_stay_out_of_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let hash = sha256_hex(b"cipher");
        let record = ShareRecord {
            source: dir.path().join("report.pdf"),
            file_name: "report.pdf".into(),
            recipients: ["bob".to_string(), "carol".to_string()].into(),
        };

        let store = CiphertextStore::open(dir.path()).unwrap();
        assert!(matches!(store.load_share(&hash).await, Err(ShareError::FileNotFound)));
        store.write(&hash, b"cipher").await.unwrap();
        store.save_share(&hash, &record).await.unwrap();

        let reopened = CiphertextStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_share(&hash).await.unwrap(), record);
        assert_eq!(reopened.index().await.unwrap().len(), 1);
        assert!(reopened.save_share("../escape", &record).await.is_err());
    }
}
