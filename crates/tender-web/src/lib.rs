//! Axum JSON surface: the sync trigger plus read-only operator endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tender_core::SyncRequest;
use tender_store::{RunLedger, SourceRegistry};
use tender_sync::{Coordinator, SyncError};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "tender-web";

const RECENT_RUNS_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("TENDER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tender-web listening");
    axum::serve(listener, app(AppState { coordinator })).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// The `run_sync` trigger. Per-source problems come back inside the report;
/// only a fatal selection failure surfaces as an error status.
async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    match state.coordinator.run_sync(request).await {
        Ok(report) => Json(report).into_response(),
        Err(err @ SyncError::UnknownSource(_)) => error_response(StatusCode::NOT_FOUND, err),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.registry().list_all().await {
        Ok(sources) => Json(sources).into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.runs().list_recent(RECENT_RUNS_LIMIT).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tender_adapters::AdapterRegistry;
    use tender_core::{Source, SourceKind};
    use tender_store::MemoryStore;
    use tender_sync::SyncConfig;
    use tower::util::ServiceExt;

    async fn test_app(seed: &[(&str, bool, Option<u32>)]) -> Router {
        let store = Arc::new(MemoryStore::new());
        for (name, enabled, interval) in seed {
            let mut source = Source::new(*name, name.to_uppercase(), SourceKind::Scrape);
            source.enabled = *enabled;
            source.interval_minutes = *interval;
            store.upsert_source(source).await.unwrap();
        }
        let coordinator = Coordinator::new(
            SyncConfig::default(),
            store.clone(),
            store.clone(),
            store,
            AdapterRegistry::new(),
        )
        .unwrap();
        app(AppState {
            coordinator: Arc::new(coordinator),
        })
    }

    fn post_sync(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/sync")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = test_app(&[]).await;
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_trigger_returns_a_full_report() {
        let app = test_app(&[("new_portal", true, Some(60))]).await;
        let response = app.oneshot(post_sync("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report = body_json(response).await;
        assert_eq!(report["success"], json!(true));
        assert_eq!(report["triggered_by"], json!("manual"));
        assert_eq!(report["sources_processed"], json!(1));
        // No adapter is registered, so the source reports a soft success.
        assert_eq!(report["results"][0]["status"], json!("success"));
        assert_eq!(report["results"][0]["found"], json!(0));
        assert!(!report["results"][0]["errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_trigger_with_no_due_sources_reports_zeroes() {
        let app = test_app(&[("manual_only", true, None)]).await;
        let response = app
            .oneshot(post_sync(r#"{"triggered_by": "ops"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report = body_json(response).await;
        assert_eq!(report["triggered_by"], json!("ops"));
        assert_eq!(report["sources_processed"], json!(0));
        assert_eq!(report["results"], json!([]));
    }

    #[tokio::test]
    async fn unknown_single_source_maps_to_not_found() {
        let app = test_app(&[]).await;
        let response = app
            .oneshot(post_sync(r#"{"source": "ghost"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn sources_endpoint_lists_registry_rows() {
        let app = test_app(&[("alpha", true, Some(60)), ("beta", false, None)]).await;
        let response = app
            .oneshot(Request::builder().uri("/api/sources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sources = body_json(response).await;
        let rows = sources.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("alpha"));
        assert_eq!(rows[1]["enabled"], json!(false));
    }

    #[tokio::test]
    async fn runs_endpoint_reflects_completed_invocations() {
        let app = test_app(&[("new_portal", true, Some(60))]).await;
        let sync_response = app.clone().oneshot(post_sync("{}")).await.unwrap();
        assert_eq!(sync_response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/api/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let runs = body_json(response).await;
        let rows = runs.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["source"], json!("new_portal"));
        assert_eq!(rows[0]["status"], json!("completed"));
    }
}
