//! Error types for the image cache proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use image_cache::CacheError;
use image_fetcher::FetchError;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    Cache(CacheError),
    Fetch(FetchError),
    NotFound(String),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            ProxyError::Fetch(err) => write!(f, "Fetch error: {}", err),
            ProxyError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Cache(err) => Some(err),
            ProxyError::Fetch(err) => Some(err),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<CacheError> for ProxyError {
    fn from(err: CacheError) -> Self {
        ProxyError::Cache(err)
    }
}

impl From<FetchError> for ProxyError {
    fn from(err: FetchError) -> Self {
        ProxyError::Fetch(err)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ProxyError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ProxyError::Cache(CacheError::Transport(err)) => match err.status {
                Some(404) => (StatusCode::NOT_FOUND, "Image not found".to_string()),
                _ => {
                    tracing::warn!(error = %err, "Upstream fetch failed");
                    (StatusCode::BAD_GATEWAY, "Failed to fetch image".to_string())
                }
            },
            ProxyError::Cache(err @ CacheError::EntryTooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            other => {
                tracing::error!(error = %other, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use image_cache::TransportError;

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::Config("bad PORT".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad PORT");
    }

    #[test]
    fn test_upstream_404_maps_to_not_found() {
        let err = ProxyError::Cache(CacheError::Transport(
            TransportError::new("https://img.test/a.png", "gone").with_status(404),
        ));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_upstream_failure_maps_to_bad_gateway() {
        let err = ProxyError::Cache(CacheError::Transport(TransportError::new(
            "https://img.test/a.png",
            "connection refused",
        )));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_oversized_maps_to_payload_too_large() {
        let err = ProxyError::Cache(CacheError::EntryTooLarge {
            size: 10,
            max_size: 5,
        });
        assert_eq!(err.into_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
