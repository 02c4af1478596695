//! On-disk attachment files for queued messages
//!
//! ```text
//! outbox/
//!   6f1c…-uuid/
//!     0-report.pdf
//!     1-photo.jpg
//! ```
//!
//! Rows reference files by path relative to the root so the container can
//! move (iOS relocates app containers on update).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::models::{AttachmentRef, DraftAttachment};

pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create outbox attachment directory")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write every attachment of one outbox item. On failure nothing is
    /// left behind.
    pub fn write(&self, outbox_id: &Uuid, attachments: &[DraftAttachment]) -> Result<Vec<AttachmentRef>> {
        if attachments.is_empty() {
            return Ok(Vec::new());
        }

        let result = self.write_all(outbox_id, attachments);
        if result.is_err() {
            let _ = self.remove(outbox_id);
        }
        result
    }

    fn write_all(&self, outbox_id: &Uuid, attachments: &[DraftAttachment]) -> Result<Vec<AttachmentRef>> {
        let dir = self.root.join(outbox_id.to_string());
        fs::create_dir_all(&dir)?;

        let refs = attachments
            .iter()
            .enumerate()
            .map(|(n, attachment)| {
                let relative_path = format!(
                    "{}/{}-{}",
                    outbox_id,
                    n,
                    sanitize_filename(&attachment.filename)
                );
                write_durable(&self.root.join(&relative_path), &attachment.data).with_context(
                    || format!("Failed to write attachment {}", attachment.filename),
                )?;
                Ok(AttachmentRef {
                    filename: attachment.filename.clone(),
                    mime_type: attachment.mime_type.clone(),
                    relative_path,
                    size: attachment.data.len() as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Make the renames durable before the row that points at them
        sync_dir(&dir)?;
        Ok(refs)
    }

    pub fn read(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        fs::read(self.path(attachment))
            .with_context(|| format!("Attachment {} is missing", attachment.relative_path))
    }

    pub fn path(&self, attachment: &AttachmentRef) -> PathBuf {
        self.root.join(&attachment.relative_path)
    }

    /// Remove all files of one outbox item.
    pub fn remove(&self, outbox_id: &Uuid) -> Result<()> {
        let dir = self.root.join(outbox_id.to_string());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Write through a temp file that is flushed to disk before it takes the
/// final name, so a crash never leaves a truncated attachment.
fn write_durable(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("part");
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn attachment(name: &str, data: &[u8]) -> DraftAttachment {
        DraftAttachment {
            filename: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let refs = store
            .write(&id, &[attachment("a.txt", b"first"), attachment("a.txt", b"second")])
            .unwrap();
        assert_eq!(refs.len(), 2);
        assert_ne!(refs[0].relative_path, refs[1].relative_path);
        assert_eq!(refs[1].size, 6);
        assert_eq!(store.read(&refs[0]).unwrap(), b"first");

        store.remove(&id).unwrap();
        assert!(!store.path(&refs[0]).exists());
        assert!(store.read(&refs[0]).is_err());
    }

    #[test]
    fn test_write_leaves_only_final_files() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        let big = vec![7u8; 256 * 1024];

        let refs = store
            .write(&id, &[attachment("scan.pdf", &big), attachment("notes", b"n")])
            .unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path().join(id.to_string()))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["0-scan.pdf".to_string(), "1-notes".to_string()]);
        assert_eq!(store.read(&refs[0]).unwrap(), big);
        assert_eq!(refs[0].size, big.len() as u64);
    }

    #[test]
    fn test_hostile_filenames_stay_inside() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let refs = store.write(&id, &[attachment("../../escape.sh", b"x")]).unwrap();
        let path = store.path(&refs[0]);
        assert!(path.starts_with(dir.path().join(id.to_string())));
        assert_eq!(refs[0].filename, "../../escape.sh");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename(".."), "attachment");
        assert_eq!(sanitize_filename(""), "attachment");
    }
}
