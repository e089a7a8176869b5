use crate::config::HostConfig;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HostConfig>,
}

impl AppState {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let enable_cors = state.config.enable_cors;
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/config/{company}/{file}", get(get_widget_config))
        .route(
            "/empresas/{company}/bots/{bot}/config.json",
            get(get_appearance),
        )
        .route("/wids/{file}", get(get_icon))
        .route("/chat.html", get(get_chat_document))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

pub async fn run(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "widget host listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down widget host");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_widget_config(
    State(state): State<AppState>,
    Path((company, file)): Path<(String, String)>,
) -> Response {
    let Some(bot) = file.strip_suffix(".json") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(path) = under_root(&state.config.config_root, &[&company, &file]) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    tracing::debug!(%company, %bot, path = %path.display(), "serving widget config");
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => with_content_type(body, "application/json"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            tracing::warn!(?err, path = %path.display(), "failed to read widget config");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Mirrors the real-time database: a missing document reads as `null`.
async fn get_appearance(
    State(state): State<AppState>,
    Path((company, bot)): Path<(String, String)>,
) -> Response {
    let file = format!("{bot}.appearance.json");
    let Some(path) = under_root(&state.config.config_root, &[&company, &file]) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => with_content_type(body, "application/json"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            with_content_type("null".to_string(), "application/json")
        }
        Err(err) => {
            tracing::warn!(?err, path = %path.display(), "failed to read appearance");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_icon(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let Some(path) = under_root(&state.config.asset_root, &["wids", &file]) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(svg) => with_content_type(svg, "image/svg+xml"),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_chat_document(State(state): State<AppState>) -> Response {
    let path = state.config.asset_root.join("chat.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => with_content_type(html, "text/html; charset=utf-8"),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn with_content_type(body: String, content_type: &'static str) -> Response {
    let mut resp = Response::new(body.into());
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// Joins request segments under `root`, refusing anything that could walk
/// out of it.
fn under_root(root: &std::path::Path, segments: &[&str]) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in segments {
        if !is_safe_segment(segment) {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(root: &std::path::Path) -> AppState {
        let config_root = root.join("config");
        let asset_root = root.join("assets");
        std::fs::create_dir_all(config_root.join("acme")).unwrap();
        std::fs::create_dir_all(asset_root.join("wids")).unwrap();
        std::fs::write(
            config_root.join("acme/sales.json"),
            r#"{"allowedOrigins":["https://shop.example"],"welcome":"Hi"}"#,
        )
        .unwrap();
        std::fs::write(
            config_root.join("acme/sales.appearance.json"),
            r#"{"widgetPosition":"left"}"#,
        )
        .unwrap();
        std::fs::write(asset_root.join("wids/6.svg"), "<svg></svg>").unwrap();
        AppState::new(HostConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            config_root,
            asset_root,
            enable_cors: true,
        })
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, Option<String>, String) {
        let resp = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn serves_widget_config() {
        let dir = tempfile::tempdir().unwrap();
        let (status, content_type, body) = get(state(dir.path()), "/config/acme/sales.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert!(body.contains("shop.example"));
    }

    #[tokio::test]
    async fn missing_config_is_404_and_non_json_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let (status, _, _) = get(state.clone(), "/config/acme/support.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = get(state, "/config/acme/sales.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn appearance_reads_null_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let (status, _, body) = get(
            state.clone(),
            "/empresas/acme/bots/sales/config.json?shallow=false",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("left"));
        let (status, _, body) = get(state, "/empresas/acme/bots/other/config.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "null");
    }

    #[tokio::test]
    async fn serves_icons_as_svg() {
        let dir = tempfile::tempdir().unwrap();
        let (status, content_type, body) = get(state(dir.path()), "/wids/6.svg").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/svg+xml"));
        assert_eq!(body, "<svg></svg>");
    }

    #[tokio::test]
    async fn rejects_hidden_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, _) = get(state(dir.path()), "/config/..hidden/sales.json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_check_sets_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let resp = router(state(dir.path()))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
    }

    #[test]
    fn safe_segments() {
        assert!(is_safe_segment("sales.json"));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment("a\\b"));
    }
}
