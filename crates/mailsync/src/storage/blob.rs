//! Message body cache
//!
//! Prefetched bodies are large and read rarely, so they live outside the
//! database as zstd-compressed files:
//!
//! ```text
//! bodies/
//!   1/                      # account id
//!     18/                   # first two chars of the message id
//!       18c2f0a9e1.txt.zst
//!       18c2f0a9e1.html.zst
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};

use crate::models::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    Text,
    Html,
}

impl BodyKind {
    fn extension(&self) -> &'static str {
        match self {
            BodyKind::Text => "txt",
            BodyKind::Html => "html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    pub account_id: i64,
    pub message_id: MessageId,
    pub kind: BodyKind,
}

impl BlobKey {
    pub fn text(account_id: i64, message_id: &MessageId) -> Self {
        Self {
            account_id,
            message_id: message_id.clone(),
            kind: BodyKind::Text,
        }
    }

    pub fn html(account_id: i64, message_id: &MessageId) -> Self {
        Self {
            account_id,
            message_id: message_id.clone(),
            kind: BodyKind::Html,
        }
    }
}

/// Body storage. Implementations compress internally.
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()>;

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &BlobKey) -> Result<bool>;

    /// Remove both bodies of a message.
    fn delete_message(&self, account_id: i64, message_id: &MessageId) -> Result<()>;

    fn delete_account(&self, account_id: i64) -> Result<()>;

    /// Text body, or `None` when neither body is cached.
    fn get_text(&self, account_id: i64, message_id: &MessageId) -> Result<Option<String>> {
        let key = BlobKey::text(account_id, message_id);
        Ok(self
            .get(&key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

pub struct FileBlobStore {
    root: PathBuf,
    compression_level: i32,
}

impl FileBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create body cache directory")?;
        Ok(Self {
            root,
            compression_level: 3,
        })
    }

    fn account_dir(&self, account_id: i64) -> PathBuf {
        self.root.join(account_id.to_string())
    }

    /// Message ids are server-issued hex strings, but anything outside
    /// `[A-Za-z0-9_-]` is replaced so an id can never escape its directory.
    fn file_stem(message_id: &MessageId) -> String {
        message_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    fn blob_path(&self, key: &BlobKey) -> PathBuf {
        let stem = Self::file_stem(&key.message_id);
        let shard: String = stem.chars().take(2).collect();
        let shard = if shard.len() == 2 { shard } else { "xx".to_string() };
        self.account_dir(key.account_id)
            .join(shard)
            .join(format!("{}.{}.zst", stem, key.kind.extension()))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress body")?;

        // Readers never see a partial file
        let temp_path = path.with_extension("zst.tmp");
        fs::write(&temp_path, &compressed)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let compressed = fs::read(&path)?;
        let data = zstd::decode_all(compressed.as_slice()).context("Failed to decompress body")?;
        Ok(Some(data))
    }

    fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blob_path(key).exists())
    }

    fn delete_message(&self, account_id: i64, message_id: &MessageId) -> Result<()> {
        for key in [
            BlobKey::text(account_id, message_id),
            BlobKey::html(account_id, message_id),
        ] {
            let path = self.blob_path(&key);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn delete_account(&self, account_id: i64) -> Result<()> {
        let dir = self.account_dir(account_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Uncompressed in-memory body cache
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key))
    }

    fn delete_message(&self, account_id: i64, message_id: &MessageId) -> Result<()> {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| !(k.account_id == account_id && &k.message_id == message_id));
        Ok(())
    }

    fn delete_account(&self, account_id: i64) -> Result<()> {
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| k.account_id != account_id);
        Ok(())
    }
}
