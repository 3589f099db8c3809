//! Axum JSON admin API over the sync engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use catsync_core::{CatalogScope, MergeOptions, ProviderItem, SyncMode};
use catsync_storage::ResetOutcome;
use catsync_sync::{SyncEngine, SyncError, SyncRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "catsync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
}

impl AppState {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct SyncBody {
    tenant_id: String,
    vertical: String,
    #[serde(default)]
    mode: SyncMode,
    items: Vec<ProviderItem>,
    #[serde(default)]
    options: MergeOptions,
}

#[derive(Debug, Serialize)]
struct ResetResponse<'a> {
    reset: bool,
    state: &'a catsync_core::SyncRunState,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/providers/status", get(list_status_handler))
        .route("/providers/{id}/status", get(status_handler))
        .route("/providers/{id}/reset", post(reset_handler))
        .route("/providers/{id}/sync", post(sync_handler))
        .route("/priorities/invalidate", post(invalidate_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("CATSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.tracker().list_states().await {
        Ok(states) => Json(states).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.tracker().current_state(&id).await {
        Ok(Some(run_state)) => Json(run_state).into_response(),
        Ok(None) => sync_error(SyncError::UnknownProvider(id)),
        Err(err) => sync_error(err),
    }
}

async fn reset_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.tracker().reset(&id).await {
        Ok(ResetOutcome::Reset(run_state)) => Json(ResetResponse {
            reset: true,
            state: &run_state,
        })
        .into_response(),
        Ok(ResetOutcome::NotRunning(run_state)) => Json(ResetResponse {
            reset: false,
            state: &run_state,
        })
        .into_response(),
        Ok(ResetOutcome::UnknownProvider) => sync_error(SyncError::UnknownProvider(id)),
        Err(err) => sync_error(err),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SyncBody>,
) -> Response {
    let request = SyncRequest::new(
        id,
        CatalogScope::new(body.tenant_id, body.vertical),
        body.mode,
        body.items,
    )
    .with_options(body.options);
    match state.engine.run_sync(request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn invalidate_handler(State(state): State<Arc<AppState>>) -> Response {
    state.engine.priorities().invalidate().await;
    Json(json!({ "invalidated": true })).into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::AlreadyRunning { .. } => StatusCode::CONFLICT,
        SyncError::UnknownProvider(_) => StatusCode::NOT_FOUND,
        SyncError::ProviderDisabled(_) => StatusCode::FORBIDDEN,
        SyncError::Write { .. } | SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "admin request failed");
    }
    let body = match err.run_result() {
        Some(result) => json!({ "error": err.to_string(), "result": result }),
        None => json!({ "error": err.to_string() }),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::Request;
    use catsync_core::ProviderConfig;
    use catsync_storage::MemoryStore;
    use catsync_sync::SyncConfig;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn config() -> SyncConfig {
        SyncConfig {
            database_url: String::new(),
            db_max_connections: 1,
            providers_file: PathBuf::from("providers.yaml"),
            max_batch_size: 100,
            priority_ttl_secs: 60,
            max_run_minutes: 60,
            watchdog_enabled: false,
            watchdog_cron: "0 */5 * * * *".to_string(),
        }
    }

    async fn test_app() -> (MemoryStore, SyncEngine, Router) {
        let store = MemoryStore::with_providers(&[
            ProviderConfig {
                provider_id: "P1".into(),
                display_name: "Distributor".into(),
                priority: 1,
                enabled: true,
            },
            ProviderConfig {
                provider_id: "OFF".into(),
                display_name: "Retired feed".into(),
                priority: 4,
                enabled: false,
            },
        ])
        .await
        .unwrap();
        let engine = SyncEngine::with_store(Arc::new(store.clone()), &config());
        let router = app(AppState::new(engine.clone()));
        (store, engine, router)
    }

    fn sync_request(provider: &str) -> Request<Body> {
        let body = json!({
            "tenant_id": "acme",
            "vertical": "hardware",
            "mode": "full",
            "items": [
                { "natural_key": "000381201669", "name": "Claw Hammer", "brand": "Stanley" },
                { "natural_key": "000381201670", "name": "Tack Hammer" }
            ]
        });
        Request::builder()
            .method("POST")
            .uri(format!("/providers/{provider}/sync"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (_, _, app) = test_app().await;
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn sync_then_status_reflects_the_run() {
        let (store, _, app) = test_app().await;
        let resp = app.clone().oneshot(sync_request("P1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result = json_body(resp).await;
        assert_eq!(result["added"], 2);
        assert_eq!(result["status"], "success");
        assert_eq!(
            store
                .records(&CatalogScope::new("acme", "hardware"))
                .await
                .len(),
            2
        );

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/providers/P1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let state = json_body(resp).await;
        assert_eq!(state["status"], "success");
        assert_eq!(state["records_added"], 2);
        assert_eq!(state["last_success_stats"]["added"], 2);

        let resp = app
            .oneshot(Request::builder().uri("/providers/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn sync_maps_errors_to_statuses() {
        let (_, engine, app) = test_app().await;
        let resp = app.clone().oneshot(sync_request("NOPE")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.clone().oneshot(sync_request("OFF")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        engine
            .tracker()
            .begin("P1", SyncMode::Full)
            .await
            .unwrap();
        let resp = app.oneshot(sync_request("P1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn write_failure_returns_the_partial_result() {
        let (store, _, app) = test_app().await;
        store.fail_after_writes(0).await;
        let resp = app.oneshot(sync_request("P1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert_eq!(body["result"]["status"], "error");
        assert_eq!(body["result"]["processed"], 2);
    }

    #[tokio::test]
    async fn reset_unsticks_a_running_provider() {
        let (_, engine, app) = test_app().await;
        engine
            .tracker()
            .begin("P1", SyncMode::Full)
            .await
            .unwrap();

        let reset = || {
            Request::builder()
                .method("POST")
                .uri("/providers/P1/reset")
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(reset()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["reset"], true);
        assert_eq!(body["state"]["status"], "error");

        let resp = app.oneshot(reset()).await.unwrap();
        assert_eq!(json_body(resp).await["reset"], false);
    }

    #[tokio::test]
    async fn unknown_provider_status_is_404() {
        let (_, _, app) = test_app().await;
        let resp = app
            .oneshot(Request::builder().uri("/providers/NOPE/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn priorities_can_be_invalidated() {
        let (_, _, app) = test_app().await;
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/priorities/invalidate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
