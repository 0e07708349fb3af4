//! Request, response and configuration types for the image cache proxy

use image_cache::{CacheConfig, CacheStats, PreloadReport};
use serde::{Deserialize, Serialize};

/// Configuration for the proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub fetch_timeout_secs: u64,
    pub cache: CacheConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            fetch_timeout_secs: 30,
            cache: CacheConfig::default(),
        }
    }
}

/// `?url=` query of the image endpoints
#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct CachedResponse {
    pub url: String,
    pub cached: bool,
}

#[derive(Debug, Deserialize)]
pub struct PreloadRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PreloadFailure {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct PreloadResponse {
    pub cached: Vec<String>,
    pub failed: Vec<PreloadFailure>,
}

impl From<PreloadReport> for PreloadResponse {
    fn from(report: PreloadReport) -> Self {
        Self {
            cached: report.cached,
            failed: report
                .failed
                .into_iter()
                .map(|(url, err)| PreloadFailure {
                    url,
                    error: err.to_string(),
                })
                .collect(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_cache::CacheError;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.cache.max_entries, 500);
    }

    #[test]
    fn test_preload_response_from_report() {
        let report = PreloadReport {
            cached: vec!["https://img.test/a.png".to_string()],
            failed: vec![(
                "https://img.test/b.png".to_string(),
                CacheError::EntryTooLarge {
                    size: 2,
                    max_size: 1,
                },
            )],
        };

        let json = serde_json::to_value(PreloadResponse::from(report)).unwrap();
        assert_eq!(json["cached"][0], "https://img.test/a.png");
        assert_eq!(json["failed"][0]["url"], "https://img.test/b.png");
        assert!(json["failed"][0]["error"]
            .as_str()
            .unwrap()
            .contains("exceeds"));
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 3600,
            cache: CacheStats::default(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["uptime_secs"], 3600);
        assert_eq!(json["cache"]["entry_count"], 0);
    }
}
