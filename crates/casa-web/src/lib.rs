//! Axum API surface for CASA: date listing, CSV retrieval and the
//! token-guarded administrative crawl trigger.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use casa_core::SheetDate;
use casa_ingest::{ArchiveConfig, ArchiveService, IngestError};
use casa_storage::{FetchError, StorageError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "casa-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ArchiveService>,
}

impl AppState {
    pub fn new(service: Arc<ArchiveService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CrawlQuery {
    /// Optional YYMMDD override for the claimed sheet date.
    date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/dates", get(dates_handler))
        .route("/api/csv/{date}", get(csv_handler))
        .route("/api/admin/crawl", post(admin_crawl_handler))
        .route("/api/admin/ensure/{date}", get(admin_ensure_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CASA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let service = Arc::new(ArchiveService::from_config(ArchiveConfig::from_env()).await?);
    serve(AppState::new(service), port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving archive api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn dates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.list_dates().await {
        Ok(dates) => {
            let dates: Vec<String> = dates.iter().map(SheetDate::yymmdd).collect();
            Json(dates).into_response()
        }
        Err(err) => detail_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to list dates: {err}"),
        ),
    }
}

async fn csv_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> Response {
    let Ok(date) = date.parse::<SheetDate>() else {
        return detail_response(StatusCode::BAD_REQUEST, "invalid date, expected YYMMDD");
    };
    match state.service.get_csv(date).await {
        Ok((content, filename)) => (
            [
                (
                    header::CONTENT_TYPE,
                    "text/csv; charset=utf-8".to_string(),
                ),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                ),
            ],
            content,
        )
            .into_response(),
        Err(StorageError::NotFound(_)) => detail_response(StatusCode::NOT_FOUND, "CSV not found"),
        Err(err) => detail_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch CSV: {err}"),
        ),
    }
}

async fn admin_crawl_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CrawlQuery>,
    headers: HeaderMap,
) -> Response {
    if !admin_authorized(&state, &headers) {
        return detail_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if state.service.config().source_url.is_empty() {
        return detail_response(StatusCode::BAD_REQUEST, "source URL not configured");
    }

    let claimed_override = match query.date.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<SheetDate>() {
            Ok(date) => Some(date),
            Err(_) => {
                return detail_response(StatusCode::BAD_REQUEST, "invalid date, expected YYMMDD")
            }
        },
    };

    match state.service.trigger_ingestion(claimed_override).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            let status = match &err {
                IngestError::Fetch(FetchError::Upstream { .. }) => StatusCode::BAD_GATEWAY,
                IngestError::Fetch(FetchError::Network(_)) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            detail_response(status, format!("crawl failed: {err}"))
        }
    }
}

async fn admin_ensure_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if !admin_authorized(&state, &headers) {
        return detail_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Ok(date) = date.parse::<SheetDate>() else {
        return detail_response(StatusCode::BAD_REQUEST, "invalid date, expected YYMMDD");
    };
    match state.service.ensure_date(date).await {
        Ok(exists) => Json(json!({"date": date.yymmdd(), "exists": exists})).into_response(),
        Err(err) => detail_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to check date: {err}"),
        ),
    }
}

/// Admin requests pass with a bearer token or an `x-admin-token` header
/// matching the configured token. With no token configured every request
/// is rejected.
fn admin_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.service.config().admin_token.as_deref() else {
        return false;
    };
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let mut parts = v.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => {
                    Some(token)
                }
                _ => None,
            }
        });
    let provided = bearer.or_else(|| headers.get("x-admin-token").and_then(|v| v.to_str().ok()));
    provided == Some(expected)
}

fn detail_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({"detail": detail.into()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use casa_core::SourceDocument;
    use casa_ingest::BackendChoice;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn sample_csv() -> Vec<u8> {
        format!(
            "{}\n1001,Lotte,12가3456,VIN0001,2021 Avante,Avante,2021,45000,1250,white,gasoline,auto,A,http://img/1.jpg\n",
            casa_core::SHEET_COLUMNS.join(",")
        )
        .into_bytes()
    }

    async fn state_with_admin(root: &Path, admin_token: Option<&str>) -> AppState {
        let config = ArchiveConfig {
            source_url: "http://127.0.0.1:9/auction.csv".to_string(),
            backend: BackendChoice::Files,
            files_root: root.to_path_buf(),
            sqlite_path: root.join("unused.db"),
            history_enabled: false,
            cache_path: root.join(".crawl_cache.json"),
            user_agent: "casa-test/0".to_string(),
            http_timeout_secs: 5,
            admin_token: admin_token.map(str::to_string),
        };
        let service = ArchiveService::from_config(config).await.expect("service");
        AppState::new(Arc::new(service))
    }

    async fn ingest_sample(state: &AppState) {
        let claimed = SheetDate::parse_yymmdd("250905").expect("date");
        state
            .service
            .ingest_document(SourceDocument {
                filename: claimed.sheet_filename(),
                claimed_date: claimed,
                body: sample_csv(),
                etag: None,
                last_modified: None,
            })
            .await
            .expect("ingest");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempdir().expect("tempdir");
        let app = app(state_with_admin(dir.path(), None).await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dates_lists_stored_batches() {
        let dir = tempdir().expect("tempdir");
        let state = state_with_admin(dir.path(), None).await;
        ingest_sample(&state).await;

        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/dates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let dates: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(dates, vec!["250908".to_string()]);
    }

    #[tokio::test]
    async fn csv_round_trips_through_the_api() {
        let dir = tempdir().expect("tempdir");
        let state = state_with_admin(dir.path(), None).await;
        ingest_sample(&state).await;

        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/csv/250908")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.to_vec(), sample_csv());
    }

    #[tokio::test]
    async fn missing_csv_is_404_and_bad_date_is_400() {
        let dir = tempdir().expect("tempdir");
        let app = app(state_with_admin(dir.path(), None).await);

        let missing = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/csv/250908")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/csv/not-a-date")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_reject_missing_or_wrong_token() {
        let dir = tempdir().expect("tempdir");
        let app = app(state_with_admin(dir.path(), Some("sekrit")).await);

        let no_token = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/admin/crawl")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(no_token.status(), StatusCode::UNAUTHORIZED);

        let wrong_token = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/admin/crawl")
                    .header("x-admin-token", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong_token.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_reject_everything_without_configured_token() {
        let dir = tempdir().expect("tempdir");
        let app = app(state_with_admin(dir.path(), None).await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/admin/crawl")
                    .header(header::AUTHORIZATION, "Bearer anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_ensure_reports_existence() {
        let dir = tempdir().expect("tempdir");
        let state = state_with_admin(dir.path(), Some("sekrit")).await;
        ingest_sample(&state).await;
        let app = app(state);

        let present = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/admin/ensure/250908")
                    .header(header::AUTHORIZATION, "Bearer sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(present.status(), StatusCode::OK);
        let body = present.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["exists"], serde_json::Value::Bool(true));

        let absent = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/admin/ensure/250901")
                    .header("x-admin-token", "sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = absent.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["exists"], serde_json::Value::Bool(false));
    }
}
