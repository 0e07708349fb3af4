//! HTTP(S) image downloads

use crate::error::{FetchError, Result};
use async_trait::async_trait;
use image_cache::{Fetched, Transport, TransportError};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str = "image-cache/0.1";

/// Downloads images with a shared reqwest client
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the default timeout and user agent
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Self::with_timeout_and_user_agent(timeout, DEFAULT_USER_AGENT)
    }

    pub fn with_timeout_and_user_agent(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Download the body at `uri`
    ///
    /// Only `http` and `https` URLs are accepted; any non-success status is
    /// an error.
    pub async fn download(&self, uri: &str) -> Result<Fetched> {
        let url = parse_image_url(uri)?;
        debug!(url = %url, "Fetching image");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, uri, "Failed to fetch image");
            return Err(FetchError::Status(status.as_u16()));
        }

        let reported = response.content_length();
        let bytes = response.bytes().await?.to_vec();

        debug!(uri, size = bytes.len(), "Fetched image");
        Ok(Fetched {
            bytes,
            size: reported,
        })
    }
}

fn parse_image_url(uri: &str) -> Result<Url> {
    let url = Url::parse(uri).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", uri, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FetchError::InvalidUrl(format!(
            "unsupported scheme {} in {}",
            scheme, uri
        ))),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, uri: &str) -> std::result::Result<Fetched, TransportError> {
        self.download(uri).await.map_err(|e| {
            let err = TransportError::new(uri, e.to_string());
            match e.status() {
                Some(status) => err.with_status(status),
                None => err,
            }
        })
    }
}
