//! File attachment storage. The default store inlines small files as data
//! URLs; a directory-backed store writes them to disk and hands back a file
//! URL.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::StoreError;

/// Hard cap on attachment size.
pub const MAX_UPLOAD_BYTES: usize = 2_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub file_url: String,
    pub file_name: String,
}

pub trait FileStore: Send + Sync {
    fn upload(&self, name: &str, content_type: &str, bytes: &[u8]) -> Result<StoredFile, StoreError>;
}

/// Encodes the file as a self-contained data URL. Nothing is written
/// anywhere, so the URL travels with the message record.
#[derive(Debug, Default)]
pub struct DataUrlStore;

impl FileStore for DataUrlStore {
    fn upload(&self, name: &str, content_type: &str, bytes: &[u8]) -> Result<StoredFile, StoreError> {
        check_size(bytes)?;
        Ok(StoredFile {
            file_url: format!("data:{};base64,{}", content_type, STANDARD.encode(bytes)),
            file_name: sanitize(name),
        })
    }
}

/// Writes uploads into a directory, one file per upload with a unique
/// prefix.
#[derive(Debug)]
pub struct DirFileStore {
    dir: PathBuf,
}

impl DirFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> DirFileStore {
        DirFileStore { dir: dir.into() }
    }
}

impl FileStore for DirFileStore {
    fn upload(&self, name: &str, _content_type: &str, bytes: &[u8]) -> Result<StoredFile, StoreError> {
        check_size(bytes)?;
        let file_name = sanitize(name);
        let stored = format!("{}_{}", Uuid::new_v4().simple(), file_name);
        let path = self.dir.join(&stored);
        std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(&path, bytes))
            .map_err(|err| StoreError::Persistence(format!("upload to {path:?} failed: {err}")))?;
        Ok(StoredFile {
            file_url: format!("file://{}", path.display()),
            file_name,
        })
    }
}

fn check_size(bytes: &[u8]) -> Result<(), StoreError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(StoreError::Validation(format!(
            "file of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_UPLOAD_BYTES
        )));
    }
    Ok(())
}

/// Keeps only filename-safe characters; path separators in particular must
/// never reach the filesystem.
fn sanitize(name: &str) -> String {
    let cleaned: String = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
