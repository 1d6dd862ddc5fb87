//! Route definitions and router construction.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers;
use crate::state::{AppState, AxumContext};

/// Build all API routes without the `/api` prefix.
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/info", get(handlers::admin::info))
        .route("/compact", post(handlers::admin::compact_all))
        .route("/compact/{*vpath}", post(handlers::admin::compact_one))
        .route("/realm/{*vpath}", delete(handlers::admin::delete_realm))
}

/// Create the main router: `/health`, `/sync`, and `/api/*`.
pub fn create_router(ctx: AxumContext) -> Router {
    let state: AppState = Arc::new(ctx);
    Router::new()
        .route("/health", get(handlers::admin::health_check))
        .route("/sync", get(handlers::sync_ws::sync_ws))
        .nest("/api", api_routes())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    use syncd_core::ports::access::AllowAll;
    use syncd_core::ports::metrics::NoopMetrics;
    use syncd_core::ServerConfig;
    use syncd_server::SyncServer;
    use syncd_store::FileHistoryFactory;

    fn router_with(config_admin_token: Option<String>) -> (Router, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            root_dir: Some(root.path().to_path_buf()),
            admin_token: config_admin_token,
            ..ServerConfig::with_defaults()
        };
        let server = SyncServer::start(
            config,
            Arc::new(AllowAll),
            Arc::new(NoopMetrics),
            Arc::new(FileHistoryFactory),
        )
        .unwrap();
        (create_router(AxumContext { server }), root)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (router, _root) = router_with(None);
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn info_lists_open_realms() {
        let (router, _root) = router_with(None);
        let response = router
            .oneshot(Request::get("/api/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["num_connections"], 0);
        assert!(info["realms"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_routes_require_the_token_when_configured() {
        let (router, _root) = router_with(Some("sekrit".to_owned()));

        let response = router
            .clone()
            .oneshot(Request::get("/api/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::get("/api/info")
                    .header("authorization", "Bearer sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn compact_all_with_no_realms_succeeds() {
        let (router, _root) = router_with(None);
        let response = router
            .oneshot(Request::post("/api/compact").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn deleting_a_missing_realm_is_not_found() {
        let (router, _root) = router_with(None);
        let response = router
            .oneshot(
                Request::delete("/api/realm/no/such/realm")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_vpath_is_a_bad_request() {
        let (router, _root) = router_with(None);
        let response = router
            .oneshot(
                Request::delete("/api/realm/..%2Fescape")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
