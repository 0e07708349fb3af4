//! HTTP server for the image cache
//!
//! Provides /health, /image, /cached, /preload, /clear and /reconcile.

use crate::error::{ProxyError, Result};
use crate::types::{CachedResponse, HealthResponse, ImageQuery, PreloadRequest, PreloadResponse};
use axum::{
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use image_cache::{CacheManager, ReconcileReport};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: CacheManager,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: CacheManager) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/image", get(get_image).delete(delete_image))
        .route("/cached", get(is_cached))
        .route("/preload", post(preload))
        .route("/clear", post(clear))
        .route("/reconcile", post(reconcile))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache_stats = state.cache.stats().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: cache_stats,
    })
}

/// Serve an image from the cache, fetching it first on a miss
async fn get_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Result<Response> {
    let (path, hit) = match state.cache.get(&query.url).await {
        Some(path) => (path, true),
        None => {
            state.cache.set(&query.url, None).await?;
            let path = state
                .cache
                .get(&query.url)
                .await
                .ok_or_else(|| ProxyError::NotFound(query.url.clone()))?;
            (path, false)
        }
    };

    // The file can be evicted between lookup and read
    let data = tokio::fs::read(&path).await.map_err(|e| {
        warn!(url = %query.url, path = ?path, error = %e, "Cached file vanished before read");
        ProxyError::NotFound(query.url.clone())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&path)),
            (header::CACHE_CONTROL, "public, max-age=86400"),
            (X_CACHE, if hit { "HIT" } else { "MISS" }),
        ],
        data,
    )
        .into_response())
}

async fn delete_image(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Result<StatusCode> {
    state.cache.remove(&query.url).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn is_cached(
    State(state): State<SharedState>,
    Query(query): Query<ImageQuery>,
) -> Json<CachedResponse> {
    let cached = state.cache.is_cached(&query.url).await;
    Json(CachedResponse {
        url: query.url,
        cached,
    })
}

async fn preload(
    State(state): State<SharedState>,
    Json(request): Json<PreloadRequest>,
) -> Json<PreloadResponse> {
    let report = state.cache.preload(request.urls).await;
    Json(report.into())
}

async fn clear(State(state): State<SharedState>) -> Result<StatusCode> {
    state.cache.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reconcile(State(state): State<SharedState>) -> Result<Json<ReconcileReport>> {
    Ok(Json(state.cache.reconcile().await?))
}

/// Content type from the cached file's extension
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use image_cache::{CacheConfig, Fetched, Transport, TransportError};
    use tempfile::tempdir;
    use tower::ServiceExt;

    const CAT: &str = "https://img.test/cat.png";
    const CAT_QUERY: &str = "url=https%3A%2F%2Fimg.test%2Fcat.png";

    struct OneImage;

    #[async_trait]
    impl Transport for OneImage {
        async fn fetch(&self, uri: &str) -> std::result::Result<Fetched, TransportError> {
            if uri == CAT {
                Ok(Fetched::new(b"meow".to_vec()))
            } else {
                Err(TransportError::new(uri, "not found").with_status(404))
            }
        }
    }

    fn create_test_state(root: &Path) -> SharedState {
        let cache = CacheManager::new(CacheConfig::with_root(root), Arc::new(OneImage));
        Arc::new(ServerState::new(cache))
    }

    fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path());
        state.cache.initialize().await.unwrap();
        let router = create_router(state);

        let response = router
            .oneshot(request(Method::GET, "/health", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_u64().is_some());
        assert_eq!(json["cache"]["entry_count"], 0);
    }

    #[tokio::test]
    async fn test_image_miss_then_hit() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()));
        let uri = format!("/image?{}", CAT_QUERY);

        let first = router
            .clone()
            .oneshot(request(Method::GET, &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert_eq!(first.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(first.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"meow");

        let second = router
            .oneshot(request(Method::GET, &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()["x-cache"], "HIT");
    }

    #[tokio::test]
    async fn test_image_upstream_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()));

        let response = router
            .oneshot(request(
                Method::GET,
                "/image?url=https%3A%2F%2Fimg.test%2Fdog.png",
                Body::empty(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_image_requires_url() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()));

        let response = router
            .oneshot(request(Method::GET, "/image", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cached_and_delete() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path());
        state.cache.set(CAT, None).await.unwrap();
        let router = create_router(state);
        let cached_uri = format!("/cached?{}", CAT_QUERY);

        let response = router
            .clone()
            .oneshot(request(Method::GET, &cached_uri, Body::empty()))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["url"], CAT);
        assert_eq!(json["cached"], true);

        let response = router
            .clone()
            .oneshot(request(
                Method::DELETE,
                &format!("/image?{}", CAT_QUERY),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router
            .oneshot(request(Method::GET, &cached_uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["cached"], false);
    }

    #[tokio::test]
    async fn test_preload_reports_failures() {
        let dir = tempdir().unwrap();
        let router = create_router(create_test_state(dir.path()));
        let body = serde_json::json!({ "urls": [CAT, "https://img.test/dog.png"] });

        let response = router
            .oneshot(request(
                Method::POST,
                "/preload",
                Body::from(body.to_string()),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["cached"], serde_json::json!([CAT]));
        assert_eq!(json["failed"][0]["url"], "https://img.test/dog.png");
    }

    #[tokio::test]
    async fn test_clear_and_reconcile() {
        let dir = tempdir().unwrap();
        let state = create_test_state(dir.path());
        state.cache.set(CAT, None).await.unwrap();
        let router = create_router(Arc::clone(&state));

        let response = router
            .clone()
            .oneshot(request(Method::POST, "/clear", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.cache.stats().await.entry_count, 0);

        let response = router
            .oneshot(request(Method::POST, "/reconcile", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["missing_entries"], 0);
        assert_eq!(json["orphan_files"], 0);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("/c/abc.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("/c/abc.webp")), "image/webp");
        assert_eq!(
            content_type_for(Path::new("/c/abc.bin")),
            "application/octet-stream"
        );
    }
}
