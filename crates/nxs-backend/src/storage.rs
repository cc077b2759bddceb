//! Blob storage over `/storage/v1`.

use crate::error::Result;
use crate::rest::HttpTransport;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use std::sync::Arc;

/// Characters escaped inside an object path. `/` separates segments.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn encode_object_path(path: &str) -> String {
    utf8_percent_encode(path.trim_start_matches('/'), PATH_SEGMENT).to_string()
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key", alias = "key")]
    key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageClient {
    transport: Arc<HttpTransport>,
}

impl StorageClient {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        self.transport
            .config()
            .storage_url(&format!("object/{}/{}", bucket, encode_object_path(path)))
    }

    /// Upload an object, returning its key (`bucket/path`).
    pub async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String> {
        let url = self.object_url(bucket, path);
        tracing::info!("[Storage] upload {} ({} bytes)", url, data.len());
        let response = self
            .transport
            .send(None, |c| {
                c.post(&url)
                    .header("Content-Type", content_type)
                    .header("x-upsert", "false")
                    .body(data.clone())
            })
            .await?;
        let parsed: Option<UploadResponse> = response.json().await.ok();
        Ok(parsed
            .and_then(|r| r.key)
            .unwrap_or_else(|| format!("{}/{}", bucket, path)))
    }

    pub async fn download(&self, bucket: &str, path: &str) -> Result<Bytes> {
        let url = self.object_url(bucket, path);
        tracing::debug!("[Storage] download {}", url);
        let response = self.transport.send(None, |c| c.get(&url)).await?;
        Ok(response.bytes().await?)
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        public_url(&self.transport.config().url, bucket, path)
    }
}

pub fn public_url(base: &str, bucket: &str, path: &str) -> String {
    format!(
        "{}/storage/v1/object/public/{}/{}",
        base,
        bucket,
        encode_object_path(path)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("https://x.supabase.co", "profile-pictures", "u1/17_me.png"),
            "https://x.supabase.co/storage/v1/object/public/profile-pictures/u1/17_me.png"
        );
    }

    #[test]
    fn test_path_encoding_keeps_slashes() {
        assert_eq!(encode_object_path("/u1/my photo#1.png"), "u1/my%20photo%231.png");
    }
}
