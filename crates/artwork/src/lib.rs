use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("nowplaying-bridge/", env!("CARGO_PKG_VERSION"));
const DATA_URI_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

#[derive(Debug, thiserror::Error)]
pub enum ArtworkError {
    #[error("artwork request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("inline artwork payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("unsupported artwork reference")]
    UnsupportedReference,
}

// Failures resolve to None after logging; missing artwork never blocks a snapshot.
#[async_trait]
pub trait ArtworkResolver: Send + Sync {
    async fn resolve(&self, reference: Option<&str>) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct ThumbnailFetcher {
    client: reqwest::Client,
}

impl ThumbnailFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ArtworkError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, ArtworkError> {
        if let Some(inline) = reference.strip_prefix(DATA_URI_PREFIX) {
            let payload = inline
                .split_once(BASE64_MARKER)
                .map(|(_, payload)| payload)
                .ok_or(ArtworkError::UnsupportedReference)?;
            return Ok(STANDARD.decode(payload)?);
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            let response = self
                .client
                .get(reference)
                .send()
                .await?
                .error_for_status()?;
            return Ok(response.bytes().await?.to_vec());
        }
        Err(ArtworkError::UnsupportedReference)
    }
}

#[async_trait]
impl ArtworkResolver for ThumbnailFetcher {
    async fn resolve(&self, reference: Option<&str>) -> Option<Vec<u8>> {
        let reference = reference?;
        if reference.is_empty() {
            return None;
        }
        match self.fetch(reference).await {
            Ok(bytes) => Some(bytes),
            Err(ArtworkError::UnsupportedReference) => {
                debug!("ignoring artwork reference with unsupported shape");
                None
            }
            Err(err) => {
                warn!(error = %err, "thumbnail fetch failed");
                None
            }
        }
    }
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn to_data_uri(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}
