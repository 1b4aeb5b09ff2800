mod metrics;
mod models;
mod queries;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use askama::Template;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use rusqlite::Connection;
use serde::Deserialize;
use std::net::SocketAddr;

use crate::models::ControlResponse;

pub struct AppState {
    pub db_path: String,
    pub flag_path: PathBuf,
    pub prometheus: Option<PrometheusHandle>,
}

/// Open a read-only connection to the loader's store. Each request gets a
/// fresh connection — WAL handles concurrent reads alongside the single
/// writer, so the dashboard can never block an ingestion transaction.
fn open_readonly(state: &AppState) -> Result<Connection> {
    common::db::Database::open_readonly(&state.db_path)
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate;

async fn index() -> impl IntoResponse {
    Html(DashboardTemplate.to_string())
}

async fn api_overview(
    State(state): State<Arc<AppState>>,
) -> Result<Json<models::Overview>, (StatusCode, String)> {
    ::metrics::counter!("dashboard_requests_total", "endpoint" => "overview").increment(1);
    let conn = open_readonly(&state).map_err(internal)?;
    let shutdown_requested = common::flag::flag_exists(&state.flag_path);
    let overview = queries::overview(&conn, shutdown_requested).map_err(internal)?;
    Ok(Json(overview))
}

async fn api_progress_detail(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<models::DailyStatsRow>>, (StatusCode, String)> {
    ::metrics::counter!("dashboard_requests_total", "endpoint" => "progress_detail").increment(1);
    let conn = open_readonly(&state).map_err(internal)?;
    Ok(Json(queries::progress_detail(&conn).map_err(internal)?))
}

#[derive(Debug, Deserialize)]
struct ErrorsParams {
    limit: Option<i64>,
}

async fn api_errors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ErrorsParams>,
) -> Result<Json<Vec<models::ErrorRow>>, (StatusCode, String)> {
    ::metrics::counter!("dashboard_requests_total", "endpoint" => "errors").increment(1);
    let limit = params.limit.unwrap_or(50).clamp(1, 1000);
    let conn = open_readonly(&state).map_err(internal)?;
    Ok(Json(queries::recent_errors(&conn, limit).map_err(internal)?))
}

async fn api_statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<models::Statistics>, (StatusCode, String)> {
    ::metrics::counter!("dashboard_requests_total", "endpoint" => "statistics").increment(1);
    let conn = open_readonly(&state).map_err(internal)?;
    Ok(Json(queries::statistics(&conn).map_err(internal)?))
}

async fn control_shutdown(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ControlResponse>, (StatusCode, String)> {
    let created = common::flag::create_flag(&state.flag_path).map_err(internal)?;
    tracing::info!(created, flag = %state.flag_path.display(), "shutdown requested via dashboard");
    Ok(Json(ControlResponse {
        shutdown_requested: true,
    }))
}

async fn control_resume(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ControlResponse>, (StatusCode, String)> {
    let removed = common::flag::remove_flag(&state.flag_path).map_err(internal)?;
    tracing::info!(removed, flag = %state.flag_path.display(), "resume requested via dashboard");
    Ok(Json(ControlResponse {
        shutdown_requested: false,
    }))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> String {
    state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/overview", get(api_overview))
        .route("/api/progress_detail", get(api_progress_detail))
        .route("/api/errors", get(api_errors))
        .route("/api/statistics", get(api_statistics))
        .route("/control/shutdown", post(control_shutdown))
        .route("/control/resume", post(control_resume))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = common::config::Config::load()?;

    // Ensure the store file and schema exist so a dashboard started before
    // the first load still serves empty views instead of 500s.
    let db = common::db::Database::open(&config.database.path)?;
    db.init_schema()?;
    drop(db);

    let state = Arc::new(AppState {
        db_path: config.database.path.clone(),
        flag_path: PathBuf::from(&config.shutdown.flag_path),
        prometheus: Some(metrics::install()?),
    });

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.dashboard.port));
    tracing::info!("dashboard listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct TestEnv {
        state: Arc<AppState>,
        _dir: tempfile::TempDir,
    }

    fn env() -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir
            .path()
            .join("multi_exchange_data_lake.db")
            .to_str()
            .unwrap()
            .to_string();
        let db = common::db::Database::open(&db_path).unwrap();
        db.init_schema().unwrap();
        let state = Arc::new(AppState {
            db_path,
            flag_path: dir.path().join("shutdown_load_january.flag"),
            prometheus: None,
        });
        TestEnv { state, _dir: dir }
    }

    fn seed(env: &TestEnv) {
        let db = common::db::Database::open(&env.state.db_path).unwrap();
        db.conn
            .execute_batch(
                "INSERT INTO load_progress
                    (exchange, data_date, file_path, file_size_bytes, start_time, end_time,
                     status, records_loaded, error_message)
                 VALUES
                    ('LSE', '2025-01-15', 'k1', 10, '2025-01-15 08:00:00.000',
                     '2025-01-15 08:05:00.000', 'completed', 1000, NULL),
                    ('CME', '2025-01-15', 'k2', 20, '2025-01-15 08:10:00.000',
                     '2025-01-15 08:11:00.000', 'failed', NULL, 'bad row at line 3');
                 INSERT INTO gold_daily_stats
                    (stats_date, exchange, total_files, successful_files, failed_files,
                     total_records, avg_records_per_file, total_processing_time_seconds,
                     total_file_size_bytes, avg_file_size_bytes, updated_at)
                 VALUES
                    ('2025-01-15', 'LSE', 1, 1, 0, 1000, '1000.00', 300.0, 10, 10.0,
                     '2025-01-15 08:05:00.000');
                 INSERT INTO gold_weekly_stats
                    (week_ending, exchange, total_files, successful_files, failed_files,
                     total_records, active_days, avg_daily_records,
                     total_processing_time_seconds, total_file_size_bytes, updated_at)
                 VALUES
                    ('2025-01-19', 'LSE', 1, 1, 0, 1000, 1, '1000.00', 300.0, 10,
                     '2025-01-15 08:05:00.000');",
            )
            .unwrap();
    }

    async fn get_json(env: &TestEnv, uri: &str) -> serde_json::Value {
        let app = create_router(env.state.clone());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_index_returns_dashboard_page() {
        let env = env();
        let app = create_router(env.state.clone());
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("Multi-Exchange Data Lake"));
        assert!(html.contains("5000"), "the page polls every 5 seconds");
    }

    #[tokio::test]
    async fn test_overview_counts_by_status() {
        let env = env();
        seed(&env);

        let body = get_json(&env, "/api/overview").await;
        assert_eq!(body["total_records"], 1000);
        assert_eq!(body["shutdown_requested"], false);
        assert_eq!(body["remote_state"], "disabled");

        let exchanges = body["exchanges"].as_array().unwrap();
        assert_eq!(exchanges.len(), 3);
        let lse = &exchanges[0];
        assert_eq!(lse["exchange"], "LSE");
        assert_eq!(lse["completed"], 1);
        let cme = &exchanges[1];
        assert_eq!(cme["failed"], 1);
    }

    #[tokio::test]
    async fn test_overview_is_running_reflects_recent_started() {
        let env = env();
        let db = common::db::Database::open(&env.state.db_path).unwrap();
        let now = common::types::format_ts(chrono::Utc::now());
        db.conn
            .execute(
                "INSERT INTO load_progress (exchange, data_date, file_path, start_time, status)
                 VALUES ('NYQ', '2025-01-15', 'k', ?1, 'started')",
                rusqlite::params![now],
            )
            .unwrap();

        let body = get_json(&env, "/api/overview").await;
        assert_eq!(body["is_running"], true);
    }

    #[tokio::test]
    async fn test_errors_endpoint_returns_failed_records() {
        let env = env();
        seed(&env);

        let body = get_json(&env, "/api/errors?limit=10").await;
        let errors = body.as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["exchange"], "CME");
        assert!(errors[0]["error_message"]
            .as_str()
            .unwrap()
            .contains("bad row"));
    }

    #[tokio::test]
    async fn test_statistics_and_progress_detail() {
        let env = env();
        seed(&env);

        let stats = get_json(&env, "/api/statistics").await;
        assert_eq!(stats["daily"].as_array().unwrap().len(), 1);
        assert_eq!(stats["weekly"][0]["week_ending"], "2025-01-19");
        assert_eq!(stats["daily"][0]["avg_records_per_file"], "1000.00");

        let detail = get_json(&env, "/api/progress_detail").await;
        assert_eq!(detail.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_control_endpoints_toggle_flag() {
        let env = env();

        let app = create_router(env.state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/control/shutdown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(common::flag::flag_exists(&env.state.flag_path));

        // Overview reflects the flag.
        let body = get_json(&env, "/api/overview").await;
        assert_eq!(body["shutdown_requested"], true);

        let app = create_router(env.state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/control/resume")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!common::flag::flag_exists(&env.state.flag_path));
    }
}
