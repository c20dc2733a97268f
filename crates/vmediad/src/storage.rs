//! Local image storage.
//!
//! Images live in a single flat directory. Every filename that reaches the
//! filesystem goes through [`sanitize_filename`] first.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::{StorageFile, StorageFiles, StorageSpace};

/// Reduce a user-supplied name to a bare filename.
///
/// Absolute paths and any `..` segment are rejected outright; otherwise only
/// the final path component is kept.
pub fn sanitize_filename(filename: &str) -> VmResult<String> {
    let path = Path::new(filename);
    if filename.is_empty() || path.is_absolute() || filename.contains("..") {
        return Err(VmError::InvalidFilename);
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(VmError::InvalidFilename);
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() && name != "." => Ok(name.to_string()),
        _ => Err(VmError::InvalidFilename),
    }
}

/// The images directory.
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub async fn ensure_dir(&self) -> VmResult<()> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            warn!("failed to create images dir {}: {}", self.dir.display(), e);
            VmError::from(e)
        })
    }

    /// Sanitize `filename` and return its absolute path inside the store.
    pub fn resolve(&self, filename: &str) -> VmResult<PathBuf> {
        let name = sanitize_filename(filename)?;
        Ok(self.dir.join(name))
    }

    /// Size of an existing image.
    pub async fn image_size(&self, filename: &str) -> VmResult<u64> {
        let path = self.resolve(filename)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(VmError::FileNotFound(filename.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VmError::FileNotFound(filename.to_string()))
            }
            Err(e) => Err(VmError::Io(format!("failed to get file info: {}", e))),
        }
    }

    pub async fn list(&self) -> VmResult<StorageFiles> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| VmError::Io(format!("failed to read directory: {}", e)))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| VmError::Io(format!("failed to get file info: {}", e)))?;
            if meta.is_dir() {
                continue;
            }
            let created_at: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(StorageFile {
                filename: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                created_at,
            });
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        debug!("listed {} image(s) in {}", files.len(), self.dir.display());
        Ok(StorageFiles { files })
    }

    pub async fn delete(&self, filename: &str) -> VmResult<()> {
        let path = self.resolve(filename)?;
        if fs::metadata(&path).await.is_err() {
            return Err(VmError::FileNotFound(filename.to_string()));
        }
        fs::remove_file(&path)
            .await
            .map_err(|e| VmError::Io(format!("failed to delete file: {}", e)))?;
        info!("deleted image {}", path.display());
        Ok(())
    }

    pub async fn space(&self) -> VmResult<StorageSpace> {
        let dir = self.dir.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&dir))
            .await
            .map_err(|e| VmError::Io(e.to_string()))?
            .map_err(|e| VmError::Io(format!("failed to get storage stats: {}", e)))?;

        let unit = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * unit;
        let free = stat.blocks_free() as u64 * unit;
        Ok(StorageSpace {
            bytes_used: total.saturating_sub(free),
            bytes_free: free,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert_eq!(sanitize_filename("../etc/passwd"), Err(VmError::InvalidFilename));
        assert_eq!(sanitize_filename("/etc/passwd"), Err(VmError::InvalidFilename));
        assert_eq!(sanitize_filename("a/../../b.iso"), Err(VmError::InvalidFilename));
        assert_eq!(sanitize_filename(""), Err(VmError::InvalidFilename));
        assert_eq!(sanitize_filename("."), Err(VmError::InvalidFilename));
    }

    #[test]
    fn test_sanitize_accepts_plain_names() {
        assert_eq!(sanitize_filename("ubuntu.iso").unwrap(), "ubuntu.iso");
        assert_eq!(sanitize_filename("./disk.img").unwrap(), "disk.img");
        assert_eq!(sanitize_filename("sub/disk.img").unwrap(), "disk.img");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let tmp = std::env::temp_dir().join("vmediad_test_store_list");
        let _ = std::fs::remove_dir_all(&tmp);

        let store = ImageStore::new(tmp.clone());
        store.ensure_dir().await.unwrap();
        std::fs::write(tmp.join("b.iso"), vec![0u8; 2048]).unwrap();
        std::fs::write(tmp.join("a.img"), b"abc").unwrap();
        std::fs::create_dir_all(tmp.join("nested")).unwrap();

        let listed = store.list().await.unwrap();
        let names: Vec<_> = listed.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["a.img", "b.iso"]);
        assert_eq!(listed.files[1].size, 2048);

        store.delete("a.img").await.unwrap();
        assert!(!tmp.join("a.img").exists());
        assert_eq!(
            store.delete("a.img").await,
            Err(VmError::FileNotFound("a.img".into()))
        );
        assert_eq!(store.delete("../b.iso").await, Err(VmError::InvalidFilename));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_image_size() {
        let tmp = std::env::temp_dir().join("vmediad_test_store_size");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        let store = ImageStore::new(tmp.clone());
        std::fs::write(tmp.join("x.img"), vec![1u8; 1000]).unwrap();
        assert_eq!(store.image_size("x.img").await.unwrap(), 1000);
        assert!(matches!(
            store.image_size("missing.img").await,
            Err(VmError::FileNotFound(_))
        ));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_space_reports_free_bytes() {
        let store = ImageStore::new(std::env::temp_dir());
        let space = store.space().await.unwrap();
        assert!(space.bytes_free > 0);
    }
}
