use axum::{
    middleware,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use super::handlers;
use crate::auth::auth_middleware;
use crate::state::AppState;

/// Create the configuration server router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status))
        .route(
            "/config",
            get(handlers::config::get_config).post(handlers::config::update_config),
        );

    // Everything outside /api comes from the document root; directories
    // resolve to their index.html and are never listed
    let document_root = state.config.get().web.document_root.clone();

    Router::new()
        .nest("/api", api_routes)
        .fallback_service(ServeDir::new(document_root))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::auth::{authorization, DigestAuth, DEFAULT_REALM};
    use crate::bluetooth::DisabledBluetooth;
    use crate::config::{AppConfig, ConfigStore, ConnectionStrategy};
    use crate::orchestrator::RuntimeStatus;
    use crate::otg::gadget::tests::controller_with;
    use crate::otg::UeventDispatcher;
    use crate::proxy::ProxyStats;

    fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        state_with_auth(dir, None)
    }

    fn state_with_auth(dir: &tempfile::TempDir, auth: Option<Arc<DigestAuth>>) -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.wifi.ssid = "AndroidAutoGW".to_string();
        config.wifi.password = "secret-pass".to_string();
        config.web.document_root = dir.path().join("www").to_string_lossy().into_owned();
        let store = ConfigStore::with_config(&dir.path().join("config.json"), config);

        let (gadgets, _binding) = controller_with(Arc::new(UeventDispatcher::new()));
        AppState::new(
            store,
            gadgets,
            Arc::new(DisabledBluetooth),
            Arc::new(RuntimeStatus::new(ConnectionStrategy::default())),
            Arc::new(ProxyStats::new()),
            auth,
        )
    }

    fn authenticated_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let auth = DigestAuth::load_or_create(&dir.path().join("htdigest"), DEFAULT_REALM).unwrap();
        state_with_auth(dir, Some(Arc::new(auth)))
    }

    async fn send(router: Router, method: Method, uri: &str, body: &str) -> Value {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(&dir));

        let json = send(router, Method::GET, "/api/health", "").await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_reports_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(&dir));

        let json = send(router, Method::GET, "/api/status", "").await;
        assert_eq!(json["success"], true);
        assert_eq!(json["wifiSsid"], "AndroidAutoGW");
        assert_eq!(json["gadgetState"], "all_disabled");
        assert_eq!(json["udc"], "udc0");
        assert_eq!(json["bluetoothPowered"], false);
        assert_eq!(json["orchestrator"]["cycle_state"], "idle");
    }

    #[tokio::test]
    async fn test_get_config_hides_password() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(&dir));

        let json = send(router, Method::GET, "/api/config", "").await;
        assert_eq!(json["success"], true);
        assert_eq!(json["wifiSsid"], "AndroidAutoGW");
        assert!(json.get("wifiPassword").is_none());
        assert!(json.get("connectionStrategy").is_some());
    }

    #[tokio::test]
    async fn test_update_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let router = create_router(state.clone());

        let json = send(
            router,
            Method::POST,
            "/api/config",
            r#"{"wifiSsid":"CarGW","connectionStrategy":"PHONE_FIRST"}"#,
        )
        .await;
        assert_eq!(json["success"], true);

        let config = state.config.get();
        assert_eq!(config.wifi.ssid, "CarGW");
        assert_eq!(config.connection_strategy, ConnectionStrategy::PhoneFirst);

        let saved = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(saved.contains("CarGW"));
    }

    #[tokio::test]
    async fn test_update_config_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let json = send(
            create_router(state.clone()),
            Method::POST,
            "/api/config",
            r#"{"bluetoothDiscoverable":"yes"}"#,
        )
        .await;
        assert_eq!(json["success"], false);
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains("bluetoothDiscoverable"));

        let json = send(create_router(state.clone()), Method::POST, "/api/config", "{not json").await;
        assert_eq!(json["success"], false);

        assert_eq!(state.config.get().wifi.ssid, "AndroidAutoGW");
        assert!(!dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn test_config_requires_digest_auth() {
        let dir = tempfile::tempdir().unwrap();
        let state = authenticated_state(&dir);
        let body = r#"{"wifiSsid":"CarGW"}"#;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/config")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(challenge.starts_with("Digest realm=\"AAWG WebUI\""));
        assert_eq!(state.config.get().wifi.ssid, "AndroidAutoGW");

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/config")
            .header("content-type", "application/json")
            .header(
                header::AUTHORIZATION,
                authorization(&challenge, "admin", "admin", "POST", "/api/config"),
            )
            .body(Body::from(body))
            .unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.config.get().wifi.ssid, "CarGW");
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = authenticated_state(&dir);

        let response = create_router(state.clone())
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let challenge = response.headers()[header::WWW_AUTHENTICATE]
            .to_str()
            .unwrap()
            .to_string();

        let request = Request::get("/api/status")
            .header(
                header::AUTHORIZATION,
                authorization(&challenge, "admin", "letmein", "GET", "/api/status"),
            )
            .body(Body::empty())
            .unwrap();
        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(authenticated_state(&dir));

        let json = send(router, Method::GET, "/api/health", "").await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_serves_document_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("www/css")).unwrap();
        std::fs::write(dir.path().join("www/index.html"), "<h1>AAWG</h1>").unwrap();
        std::fs::write(dir.path().join("www/css/site.css"), "body {}").unwrap();
        let state = test_state(&dir);

        let response = create_router(state.clone())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"<h1>AAWG</h1>");

        let response = create_router(state.clone())
            .oneshot(Request::get("/css/site.css").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = create_router(state)
            .oneshot(Request::get("/missing.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
