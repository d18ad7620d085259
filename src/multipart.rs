//! On-disk multipart-upload manifests.
//!
//! GCS has no multipart protocol, so the sidecar emulates S3 multipart by
//! writing each part as a sibling object `<key>-part-<n>` and recording
//! its ETag in a small manifest file named by upload id, one CSV line per
//! part: `etag,part-object-key`.  The manifest is created empty on
//! initiate, appended per part, consumed on complete, and deleted on
//! abort.  Appends open the file append-only and write one line in a
//! single call, so concurrent part uploads interleave whole records.

use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::errors::SidecarError;

/// Build the sibling object key for one part.
pub fn part_object_key(key: &str, part_number: u32) -> String {
    format!("{key}-part-{part_number}")
}

/// Recover the part number embedded in a part object key.
pub fn part_number_of(part_key: &str) -> Option<u32> {
    let idx = part_key.rfind("-part-")?;
    part_key[idx + "-part-".len()..].parse().ok()
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub etag: String,
    pub part_key: String,
}

impl PartRecord {
    pub fn part_number(&self) -> Option<u32> {
        part_number_of(&self.part_key)
    }
}

/// Sort records by the part number embedded in their object keys.
/// Records without a parseable number sort first, which keeps them
/// visible rather than silently dropped.
pub fn sort_by_part_number(records: &mut [PartRecord]) {
    records.sort_by_key(|r| r.part_number().unwrap_or(0));
}

/// Manifest files for one tenant, rooted at its configured directory.
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Upload ids come back from clients on later calls; only the shapes
    /// the sidecar hands out (UUIDs) are accepted as file names.
    fn path(&self, upload_id: &str) -> Result<PathBuf, SidecarError> {
        let valid = !upload_id.is_empty()
            && upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(SidecarError::BadRequest(format!(
                "invalid upload id {upload_id:?}"
            )));
        }
        Ok(self.dir.join(upload_id))
    }

    /// Create an empty manifest for a fresh upload id.
    pub async fn create(&self, upload_id: &str) -> Result<(), SidecarError> {
        let path = self.path(upload_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SidecarError::Internal(anyhow::anyhow!("manifest dir: {e}")))?;
        tokio::fs::File::create(&path)
            .await
            .map_err(|e| SidecarError::Internal(anyhow::anyhow!("manifest create: {e}")))?;
        Ok(())
    }

    /// Append one part record.  The upload must have been initiated.
    pub async fn append(
        &self,
        upload_id: &str,
        etag: &str,
        part_key: &str,
    ) -> Result<(), SidecarError> {
        let path = self.path(upload_id)?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::map_open_error(upload_id, e))?;
        file.write_all(format!("{etag},{part_key}\n").as_bytes())
            .await
            .map_err(|e| SidecarError::Internal(anyhow::anyhow!("manifest append: {e}")))?;
        Ok(())
    }

    /// Read every part record.  The upload must exist.
    pub async fn read(&self, upload_id: &str) -> Result<Vec<PartRecord>, SidecarError> {
        let path = self.path(upload_id)?;
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Self::map_open_error(upload_id, e))?;

        let mut records = Vec::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((etag, part_key)) = line.split_once(',') else {
                return Err(SidecarError::Internal(anyhow::anyhow!(
                    "corrupt manifest line for upload {upload_id}: {line:?}"
                )));
            };
            records.push(PartRecord {
                etag: etag.to_string(),
                part_key: part_key.to_string(),
            });
        }
        Ok(records)
    }

    /// Whether a manifest exists for this upload id.
    pub async fn exists(&self, upload_id: &str) -> Result<bool, SidecarError> {
        let path = self.path(upload_id)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    /// Record the composed ETag of a finished upload in a side file.
    /// Written before the manifest is deleted, so a repeated Complete
    /// can check whether the final object matches what this upload
    /// actually produced.
    pub async fn record_completed(&self, upload_id: &str, etag: &str) -> Result<(), SidecarError> {
        let path = self.completed_path(upload_id)?;
        tokio::fs::write(&path, etag)
            .await
            .map_err(|e| SidecarError::Internal(anyhow::anyhow!("completion record: {e}")))
    }

    /// The composed ETag recorded for an already-completed upload.
    pub async fn completed_etag(&self, upload_id: &str) -> Result<Option<String>, SidecarError> {
        let path = self.completed_path(upload_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(etag) => Ok(Some(etag.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SidecarError::Internal(anyhow::anyhow!(
                "completion record read: {e}"
            ))),
        }
    }

    fn completed_path(&self, upload_id: &str) -> Result<PathBuf, SidecarError> {
        let manifest = self.path(upload_id)?;
        Ok(manifest.with_extension("etag"))
    }

    /// Delete a manifest.  Idempotent.
    pub async fn delete(&self, upload_id: &str) -> Result<(), SidecarError> {
        let path = self.path(upload_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SidecarError::Internal(anyhow::anyhow!(
                "manifest delete: {e}"
            ))),
        }
    }

    fn map_open_error(upload_id: &str, e: std::io::Error) -> SidecarError {
        if e.kind() == ErrorKind::NotFound {
            SidecarError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            }
        } else {
            SidecarError::Internal(anyhow::anyhow!("manifest open: {e}"))
        }
    }
}

// -- Tests -------------------------------------------------------------------
