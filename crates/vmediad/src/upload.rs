//! Image uploads into the images directory.
//!
//! `startStorageFileUpload` reserves an upload id and opens
//! `<name>.incomplete` for appending. The peer then opens the upload
//! channel with that id and streams the image as binary frames. When the
//! declared size has arrived the file takes its final name; an upload that
//! ends short keeps the `.incomplete` file, and starting the same name again
//! resumes after the bytes already there.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vmedia_proto::constants::{INCOMPLETE_SUFFIX, UPLOAD_ID_PREFIX};
use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::{StorageFileUpload, UploadProgress};

use crate::storage::sanitize_filename;

/// An upload that was started but whose channel has not opened yet.
struct PendingUpload {
    file: File,
    path: PathBuf,
    size: u64,
    already: u64,
}

/// Uploads waiting for their channel, keyed by upload id.
pub struct UploadManager {
    dir: PathBuf,
    pending: DashMap<String, PendingUpload>,
    progress_interval: Duration,
}

impl UploadManager {
    pub fn new(dir: PathBuf, progress_interval: Duration) -> Self {
        Self {
            dir,
            pending: DashMap::new(),
            progress_interval,
        }
    }

    /// Reserve an upload of `size` bytes for `filename`.
    pub async fn start(&self, filename: &str, size: u64) -> VmResult<StorageFileUpload> {
        let name = sanitize_filename(filename)?;
        let path = self.dir.join(&name);
        if fs::metadata(&path).await.is_ok() {
            return Err(VmError::FileExists(name));
        }

        let upload_path = incomplete_path(&path);
        let already = match fs::metadata(&upload_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&upload_path)
            .await
            .map_err(|e| VmError::Io(format!("failed to open file for upload: {}", e)))?;

        let id = format!("{}{}", UPLOAD_ID_PREFIX, Uuid::new_v4());
        self.pending.insert(
            id.clone(),
            PendingUpload {
                file,
                path: upload_path,
                size,
                already,
            },
        );
        info!(
            "upload {} of {} started ({} of {} bytes present)",
            id, name, already, size
        );
        Ok(StorageFileUpload {
            already_uploaded_bytes: already,
            data_channel: id,
        })
    }

    /// Hand the upload `id` to the channel that just opened for it.
    pub fn claim(&self, id: &str) -> VmResult<ActiveUpload> {
        let (_, pending) = self
            .pending
            .remove(id)
            .ok_or_else(|| VmError::UnknownUpload(id.to_string()))?;
        debug!("upload {} channel opened", id);
        Ok(ActiveUpload {
            id: id.to_string(),
            file: pending.file,
            path: pending.path,
            size: pending.size,
            written: pending.already,
            last_progress: Instant::now(),
            progress_interval: self.progress_interval,
        })
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// An upload whose channel is open and receiving data.
pub struct ActiveUpload {
    id: String,
    file: File,
    path: PathBuf,
    size: u64,
    written: u64,
    last_progress: Instant,
    progress_interval: Duration,
}

impl ActiveUpload {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            size: self.size,
            already_uploaded_bytes: self.written,
        }
    }

    /// Append `data`. Returns a progress report when one is due: at most one
    /// per interval, and always once the declared size is reached.
    pub async fn write(&mut self, data: &[u8]) -> VmResult<Option<UploadProgress>> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| VmError::Io(format!("failed to write upload: {}", e)))?;
        self.written += data.len() as u64;

        let progress = self.progress();
        if progress.is_complete() || self.last_progress.elapsed() >= self.progress_interval {
            self.last_progress = Instant::now();
            return Ok(Some(progress));
        }
        Ok(None)
    }

    /// Close the file. Renames it to its final name if exactly the declared
    /// size arrived and returns whether it did.
    pub async fn finish(mut self) -> VmResult<bool> {
        self.file.flush().await?;
        drop(self.file);

        if self.written != self.size {
            warn!(
                "upload {} ended at {} of {} bytes, keeping {}",
                self.id,
                self.written,
                self.size,
                self.path.display()
            );
            return Ok(false);
        }
        let target = final_path(&self.path);
        fs::rename(&self.path, &target)
            .await
            .map_err(|e| VmError::Io(format!("failed to rename uploaded file: {}", e)))?;
        info!("upload {} complete: {}", self.id, target.display());
        Ok(true)
    }
}

fn incomplete_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(INCOMPLETE_SUFFIX);
    PathBuf::from(name)
}

fn final_path(path: &Path) -> PathBuf {
    let name = path.to_string_lossy();
    PathBuf::from(name.strip_suffix(INCOMPLETE_SUFFIX).unwrap_or(name.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(name: &str) -> (PathBuf, UploadManager) {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let uploads = UploadManager::new(dir.clone(), Duration::from_secs(3600));
        (dir, uploads)
    }

    #[tokio::test]
    async fn test_upload_completes_and_renames() {
        let (dir, uploads) = setup("vmediad_test_upload_complete");

        let started = uploads.start("disk.img", 10).await.unwrap();
        assert!(started.data_channel.starts_with("upload_"));
        assert_eq!(started.already_uploaded_bytes, 0);
        assert!(dir.join("disk.img.incomplete").exists());

        let mut upload = uploads.claim(&started.data_channel).unwrap();
        assert_eq!(uploads.pending_count(), 0);
        // Interval not yet elapsed, nothing to report
        assert_eq!(upload.write(b"01234").await.unwrap(), None);
        let progress = upload.write(b"56789").await.unwrap().unwrap();
        assert_eq!(progress.already_uploaded_bytes, 10);
        assert!(progress.is_complete());

        assert!(upload.finish().await.unwrap());
        assert_eq!(std::fs::read(dir.join("disk.img")).unwrap(), b"0123456789");
        assert!(!dir.join("disk.img.incomplete").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_short_upload_resumes() {
        let (dir, uploads) = setup("vmediad_test_upload_resume");

        let first = uploads.start("a.iso", 8).await.unwrap();
        let mut upload = uploads.claim(&first.data_channel).unwrap();
        upload.write(b"abc").await.unwrap();
        assert!(!upload.finish().await.unwrap());
        assert!(!dir.join("a.iso").exists());

        let second = uploads.start("a.iso", 8).await.unwrap();
        assert_eq!(second.already_uploaded_bytes, 3);
        assert_ne!(second.data_channel, first.data_channel);
        let mut upload = uploads.claim(&second.data_channel).unwrap();
        assert_eq!(upload.progress().already_uploaded_bytes, 3);
        upload.write(b"defgh").await.unwrap();
        assert!(upload.finish().await.unwrap());
        assert_eq!(std::fs::read(dir.join("a.iso")).unwrap(), b"abcdefgh");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_upload_rejects_existing_and_bad_names() {
        let (dir, uploads) = setup("vmediad_test_upload_rejects");
        std::fs::write(dir.join("taken.iso"), b"x").unwrap();

        assert_eq!(
            uploads.start("taken.iso", 1).await.unwrap_err(),
            VmError::FileExists("taken.iso".into())
        );
        assert_eq!(
            uploads.start("../escape.iso", 1).await.unwrap_err(),
            VmError::InvalidFilename
        );
        assert!(matches!(
            uploads.claim("upload_nope"),
            Err(VmError::UnknownUpload(_))
        ));
        // A claimed id cannot be claimed twice
        let started = uploads.start("new.iso", 1).await.unwrap();
        let _upload = uploads.claim(&started.data_channel).unwrap();
        assert!(uploads.claim(&started.data_channel).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_progress_is_throttled() {
        let dir = std::env::temp_dir().join("vmediad_test_upload_throttle");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let uploads = UploadManager::new(dir.clone(), Duration::ZERO);

        let started = uploads.start("t.img", 100).await.unwrap();
        let mut upload = uploads.claim(&started.data_channel).unwrap();
        // A zero interval reports on every write
        let progress = upload.write(b"0123").await.unwrap().unwrap();
        assert_eq!(progress, UploadProgress { size: 100, already_uploaded_bytes: 4 });
        assert!(!progress.is_complete());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_incomplete_paths() {
        let path = Path::new("/images/a.iso");
        let upload = incomplete_path(path);
        assert_eq!(upload, Path::new("/images/a.iso.incomplete"));
        assert_eq!(final_path(&upload), path);
    }
}
