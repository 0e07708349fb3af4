//! Network transport collaborator

use async_trait::async_trait;
use std::fmt;

/// Bytes retrieved for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    /// Size reported by the origin, if any
    pub size: Option<u64>,
}

impl Fetched {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, size: None }
    }
}

/// Failure to retrieve the bytes for a URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub uri: String,
    /// HTTP status, when the origin answered
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.uri, status, self.message),
            None => write!(f, "{}: {}", self.uri, self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Retrieves bytes from a remote origin
///
/// Timeouts and retries belong to the implementation; the cache runs every
/// fetch to completion.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Fetched, TransportError>;
}
