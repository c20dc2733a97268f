//! Images directory subcommands.

use serde_json::{json, Value};
use tabled::{Table, Tabled};

use vmedia_proto::error::VmResult;
use vmedia_proto::media::{StorageFile, StorageFiles, StorageSpace};

use crate::common::{format_size, print_success, PeerClient};

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Created")]
    created: String,
}

impl From<&StorageFile> for FileRow {
    fn from(file: &StorageFile) -> Self {
        Self {
            name: file.filename.clone(),
            size: format_size(file.size),
            created: file.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

pub async fn list(client: &PeerClient) -> VmResult<()> {
    let value = client.call("listStorageFiles", Value::Null).await?;
    let files: StorageFiles = serde_json::from_value(value)?;
    if files.files.is_empty() {
        println!("No images");
        return Ok(());
    }
    let rows: Vec<FileRow> = files.files.iter().map(FileRow::from).collect();
    println!("{}", Table::new(rows));
    Ok(())
}

pub async fn delete(client: &PeerClient, filename: &str) -> VmResult<()> {
    client
        .call("deleteStorageFile", json!({"filename": filename}))
        .await?;
    print_success(&format!("Deleted {}", filename));
    Ok(())
}

pub async fn space(client: &PeerClient) -> VmResult<()> {
    let value = client.call("getStorageSpace", Value::Null).await?;
    let space: StorageSpace = serde_json::from_value(value)?;
    let total = space.bytes_used + space.bytes_free;
    let pct = if total > 0 {
        space.bytes_used as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    println!(
        "Used: {}  Free: {}  ({:.1}% used)",
        format_size(space.bytes_used),
        format_size(space.bytes_free),
        pct
    );
    Ok(())
}
