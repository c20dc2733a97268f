//! USB mass-storage gadget LUN control.
//!
//! The kernel mass-storage function exposes each logical unit as a
//! configfs directory. Writing a path to `file` inserts a medium, writing
//! a blank value ejects it, and `cdrom` switches between CD-ROM and disk
//! presentation.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use vmedia_proto::error::{VmError, VmResult};

/// One logical unit of the mass-storage function.
pub struct MassStorageLun {
    dir: PathBuf,
}

impl MassStorageLun {
    pub fn new(function_path: &Path, lun: &str) -> Self {
        Self {
            dir: function_path.join(lun),
        }
    }

    /// Point the LUN at a backing file or block device node.
    pub async fn set_backing_file(&self, path: &str) -> VmResult<()> {
        debug!("setting mass storage image to {:?}", path);
        self.write_attr("file", path)
            .await
            .map_err(|e| VmError::Gadget(format!("failed to set image path: {}", e)))
    }

    /// Eject whatever medium the LUN currently presents.
    pub async fn clear_backing_file(&self) -> VmResult<()> {
        // The kernel treats a lone newline as "no medium".
        self.set_backing_file("\n").await
    }

    pub async fn backing_file(&self) -> VmResult<String> {
        self.read_attr("file")
            .await
            .map_err(|e| VmError::Gadget(format!("failed to read image path: {}", e)))
    }

    pub async fn set_cdrom(&self, cdrom: bool) -> VmResult<()> {
        let value = if cdrom { "1" } else { "0" };
        self.write_attr("cdrom", value)
            .await
            .map_err(|e| VmError::Gadget(format!("failed to set cdrom mode: {}", e)))
    }

    pub async fn cdrom(&self) -> VmResult<bool> {
        let value = self
            .read_attr("cdrom")
            .await
            .map_err(|e| VmError::Gadget(format!("failed to read cdrom mode: {}", e)))?;
        Ok(value == "1")
    }

    async fn write_attr(&self, name: &str, value: &str) -> std::io::Result<()> {
        fs::write(self.dir.join(name), value.as_bytes()).await
    }

    async fn read_attr(&self, name: &str) -> std::io::Result<String> {
        let data = fs::read_to_string(self.dir.join(name)).await?;
        Ok(data.trim().to_string())
    }
}
