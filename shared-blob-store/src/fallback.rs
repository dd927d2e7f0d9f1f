//! Whole-file storage on local disk, used when no cluster is configured.
//!
//! Files are named `{blob_id}{extension}` directly under the fallback
//! directory; the extension is recovered by prefix match. TTLs are not
//! enforced here, files stay until something else reaps them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::error::BlobError;
use crate::types::{BlobId, RetrievedBlob};

/// Rendered length of a [`BlobId`].
const BLOB_ID_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct LocalFallback {
    root: PathBuf,
}

impl LocalFallback {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, blob_id: &BlobId, extension: &str) -> PathBuf {
        self.root.join(format!("{blob_id}{extension}"))
    }

    /// Copies `source` into a new file. The content lands under a hidden
    /// name first and is renamed once complete, so a failed copy never
    /// shows up as a stored blob.
    pub async fn store<R>(
        &self,
        blob_id: &BlobId,
        source: &mut R,
        extension: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, BlobError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        if let Some(ttl) = ttl {
            debug!(%blob_id, ?ttl, "local fallback does not enforce ttl");
        }
        fs::create_dir_all(&self.root).await?;

        let path = self.path_for(blob_id, extension);
        let partial = self.root.join(format!(".{blob_id}{extension}.part"));
        match write_file(&partial, source).await {
            Ok(size) => {
                fs::rename(&partial, &path).await?;
                debug!(%blob_id, size, path = %path.display(), "file stored locally");
                Ok(size)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e.into())
            }
        }
    }

    pub async fn retrieve(&self, blob_id: &BlobId) -> Result<RetrievedBlob, BlobError> {
        let Some((path, extension)) = self.find(blob_id).await?.into_iter().next() else {
            return Err(BlobError::FileNotFound(*blob_id));
        };
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::FileNotFound(*blob_id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(RetrievedBlob {
            data: Bytes::from(data),
            extension,
        })
    }

    /// Removes every file of the blob; returns how many were removed.
    pub async fn delete(&self, blob_id: &BlobId) -> Result<usize, BlobError> {
        let mut removed = 0;
        for (path, _) in self.find(blob_id).await? {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(%blob_id, removed, "local files deleted");
        Ok(removed)
    }

    pub async fn exists(&self, blob_id: &BlobId) -> bool {
        match self.find(blob_id).await {
            Ok(found) => !found.is_empty(),
            Err(e) => {
                debug!(%blob_id, error = %e, "local existence check failed");
                false
            }
        }
    }

    /// Distinct ids of every stored file, sorted.
    pub async fn list(&self) -> Result<Vec<BlobId>, BlobError> {
        let mut ids: Vec<BlobId> = self
            .entries()
            .await?
            .into_iter()
            .filter_map(|(_, name)| name.get(..BLOB_ID_LEN)?.parse().ok())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Files belonging to `blob_id` with their extensions, sorted by name.
    async fn find(&self, blob_id: &BlobId) -> Result<Vec<(PathBuf, String)>, BlobError> {
        let prefix = blob_id.to_string();
        let mut found: Vec<(PathBuf, String)> = self
            .entries()
            .await?
            .into_iter()
            .filter_map(|(path, name)| {
                let extension = name.strip_prefix(&prefix)?.to_string();
                Some((path, extension))
            })
            .collect();
        found.sort();
        Ok(found)
    }

    /// Regular files directly under the root. A missing root reads as empty.
    async fn entries(&self) -> Result<Vec<(PathBuf, String)>, BlobError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push((entry.path(), name.to_string()));
            }
        }
        Ok(entries)
    }
}

async fn write_file<R>(path: &Path, source: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = fs::File::create(path).await?;
    let size = tokio::io::copy(source, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}
