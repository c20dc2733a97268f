//! Byte-range reads from an HTTP URL.
//!
//! The image size is learned once, at mount time, from the `Content-Range`
//! of a one-byte range request. Servers that ignore `Range` are rejected
//! since every block read would otherwise download the whole image.

use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::{debug, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::VirtualMediaUrlInfo;

/// Reader for a fixed URL backed by HTTP range requests.
pub struct RangeHttpReader {
    client: reqwest::Client,
    url: String,
    size: u64,
}

impl RangeHttpReader {
    /// Learn the size of `url` and build a reader for it.
    pub async fn open(url: &str, timeout: Duration) -> VmResult<Self> {
        let client = build_client(timeout)?;
        let size = fetch_size(&client, url).await?;
        debug!("using remote url {} with size {}", url, size);
        Ok(Self {
            client,
            url: url.to_string(),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes at `offset`. Never reads past the image end.
    pub async fn read_at(&self, offset: u64, len: u64) -> VmResult<Vec<u8>> {
        let end = offset.saturating_add(len).min(self.size);
        if end <= offset {
            return Ok(Vec::new());
        }

        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", offset, end - 1))
            .send()
            .await
            .map_err(|e| {
                warn!("range request to {} failed: {}", self.url, e);
                VmError::Http(e.to_string())
            })?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(VmError::RangeUnsupported),
            status => return Err(VmError::Http(format!("HTTP {}", status))),
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| VmError::Http(e.to_string()))?;
        let wanted = (end - offset) as usize;
        if body.len() < wanted {
            warn!(
                "short range response from {}: got {} expected {}",
                self.url,
                body.len(),
                wanted
            );
        }
        Ok(body[..body.len().min(wanted)].to_vec())
    }
}

/// Check whether `url` can be mounted.
pub async fn check_url(url: &str, timeout: Duration) -> VirtualMediaUrlInfo {
    let result = match build_client(timeout) {
        Ok(client) => fetch_size(&client, url).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(size) => VirtualMediaUrlInfo {
            usable: true,
            reason: None,
            size,
        },
        Err(e) => VirtualMediaUrlInfo {
            usable: false,
            reason: Some(e.to_string()),
            size: 0,
        },
    }
}

fn build_client(timeout: Duration) -> VmResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| VmError::Http(e.to_string()))
}

async fn fetch_size(client: &reqwest::Client, url: &str) -> VmResult<u64> {
    let resp = client
        .get(url)
        .header(RANGE, "bytes=0-0")
        .send()
        .await
        .map_err(|e| VmError::Http(e.to_string()))?;

    match resp.status() {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK => return Err(VmError::RangeUnsupported),
        status => return Err(VmError::Http(format!("HTTP {}", status))),
    }

    let header = resp
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| VmError::Http("missing Content-Range".into()))?;
    parse_content_range_total(header)
        .ok_or_else(|| VmError::Http(format!("unusable Content-Range: {}", header)))
}

/// Extract the complete length from `bytes 0-0/12345`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{header, HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;

    async fn serve_range(State(data): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response {
        let total = data.len() as u64;
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?)));
        match range {
            Some((start, end)) if start < total => {
                let end = end.min(total - 1);
                let body = data[start as usize..=end as usize].to_vec();
                (
                    AxumStatus::PARTIAL_CONTENT,
                    [(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, total),
                    )],
                    body,
                )
                    .into_response()
            }
            _ => (AxumStatus::OK, data.as_ref().clone()).into_response(),
        }
    }

    async fn serve_whole(State(data): State<Arc<Vec<u8>>>) -> Response {
        (AxumStatus::OK, data.as_ref().clone()).into_response()
    }

    /// Serve `data` at `/image.iso` (range aware) and `/plain.iso` (range ignored).
    pub(crate) async fn spawn_image_server(data: Vec<u8>) -> String {
        let app = Router::new()
            .route("/image.iso", get(serve_range))
            .route("/plain.iso", get(serve_whole))
            .with_state(Arc::new(data));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_total("bytes 0-0/734003200"), Some(734003200));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/10"), None);
    }

    #[tokio::test]
    async fn test_open_and_read() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let base = spawn_image_server(data.clone()).await;

        let reader = RangeHttpReader::open(&format!("{}/image.iso", base), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reader.size(), 5000);

        let got = reader.read_at(1000, 512).await.unwrap();
        assert_eq!(got, &data[1000..1512]);

        // Clamped at the end of the image
        let tail = reader.read_at(4990, 100).await.unwrap();
        assert_eq!(tail, &data[4990..]);

        assert!(reader.read_at(5000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_without_range_support() {
        let base = spawn_image_server(vec![0u8; 64]).await;
        let err = RangeHttpReader::open(&format!("{}/plain.iso", base), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert_eq!(err, VmError::RangeUnsupported);
    }

    #[tokio::test]
    async fn test_check_url() {
        let base = spawn_image_server(vec![0u8; 4096]).await;

        let ok = check_url(&format!("{}/image.iso", base), Duration::from_secs(5)).await;
        assert!(ok.usable);
        assert_eq!(ok.size, 4096);

        let missing = check_url(&format!("{}/missing.iso", base), Duration::from_secs(5)).await;
        assert!(!missing.usable);
        assert!(missing.reason.unwrap().contains("404"));
    }
}
