//! Mount, unmount and state subcommands.

use serde_json::{json, Value};

use vmedia_proto::error::VmResult;
use vmedia_proto::media::{VirtualMediaMode, VirtualMediaState, VirtualMediaUrlInfo};

use crate::common::{format_size, print_success, PeerClient};

pub async fn state(client: &PeerClient) -> VmResult<()> {
    let value = client.call("getVirtualMediaState", Value::Null).await?;
    let state: Option<VirtualMediaState> = serde_json::from_value(value)?;
    match state {
        Some(state) => println!("{}", describe_state(&state)),
        None => println!("Nothing mounted"),
    }
    Ok(())
}

fn describe_state(state: &VirtualMediaState) -> String {
    let name = state
        .filename
        .as_deref()
        .or(state.url.as_deref())
        .unwrap_or("-");
    format!(
        "Source: {:?}\nMode:   {}\nImage:  {}\nSize:   {} ({} bytes)",
        state.source,
        state.mode,
        name,
        format_size(state.size),
        state.size
    )
}

pub async fn mount_storage(client: &PeerClient, filename: &str, mode: VirtualMediaMode) -> VmResult<()> {
    client
        .call("mountWithStorage", json!({"filename": filename, "mode": mode}))
        .await?;
    print_success(&format!("Mounted {} as {}", filename, mode));
    Ok(())
}

pub async fn mount_http(client: &PeerClient, url: &str, mode: VirtualMediaMode) -> VmResult<()> {
    client
        .call("mountWithHTTP", json!({"url": url, "mode": mode}))
        .await?;
    print_success(&format!("Mounted {} as {}", url, mode));
    Ok(())
}

pub async fn unmount(client: &PeerClient) -> VmResult<()> {
    client.call("unmountImage", Value::Null).await?;
    print_success("Unmounted");
    Ok(())
}

pub async fn check_url(client: &PeerClient, url: &str) -> VmResult<()> {
    let value = client.call("checkMountUrl", json!({"url": url})).await?;
    let info: VirtualMediaUrlInfo = serde_json::from_value(value)?;
    if info.usable {
        println!("{} is mountable ({})", url, format_size(info.size));
    } else {
        println!(
            "{} is not mountable: {}",
            url,
            info.reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

pub async fn mode(client: &PeerClient, mode: Option<&str>) -> VmResult<()> {
    let value = match mode {
        Some(mode) => client.call("setMassStorageMode", json!({"mode": mode})).await?,
        None => client.call("getMassStorageMode", Value::Null).await?,
    };
    println!("{}", value.as_str().unwrap_or("unknown"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmedia_proto::media::VirtualMediaSource;

    #[test]
    fn test_describe_state() {
        let state = VirtualMediaState {
            source: VirtualMediaSource::Http,
            mode: VirtualMediaMode::Cdrom,
            filename: None,
            url: Some("http://example.com/a.iso".into()),
            size: 2 * 1024 * 1024,
        };
        let text = describe_state(&state);
        assert!(text.contains("Http"));
        assert!(text.contains("CDROM"));
        assert!(text.contains("http://example.com/a.iso"));
        assert!(text.contains("2.0 MB"));
    }
}
