// =============================================================================
// server.rs - THE HTTP SURFACE
// =============================================================================
//
//   GET  /sync?secret=&parallel=&concurrency=   batch trigger for the scheduler
//   POST /cases/sync                            single-case handler
//   POST /session/challenge                     fetch a challenge for the operator
//   POST /session/establish                     bind the operator's answer
//   GET  /session                               active session status
//   POST /session/invalidate                    drop the active session
//   GET  /sync/logs                             recent batch runs
//   GET  /cases/classify?caseNumber=            parse + category + party labels
//   GET  /cases/{id}/updates                    unread update records
//   POST /cases/{id}/updates/read               mark them read
//   PUT  /cases/{id}/active                     include or exclude from batches
//   GET  /layouts/{*key}                        cached portal layout document
//   GET  /metrics                               engine, pool, breaker, publisher
//
// The trigger always answers 200 with a summary once it has started, even
// when every case failed. Only a bad secret or a store that cannot list
// candidates gets anything else.
// =============================================================================

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::browser_pool::{BrowserPool, PoolStatus};
use crate::case_number;
use crate::case_sync::CaseSyncer;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::classifier::{classify, party_labels, portal_route};
use crate::error::SyncError;
use crate::lock::DownloadLocks;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::models::{BatchReport, CaseSyncOutcome, CaseSyncRequest, ParseFailure, SyncMode, SyncResult};
use crate::orchestrator::SyncOrchestrator;
use crate::publisher::{PublisherSnapshot, PublisherStats};
use crate::session::{SessionManager, SessionStatus};
use crate::store::Store;

const MAX_TRIGGER_CONCURRENCY: usize = 8;
const MAX_LOG_PAGE: usize = 100;

/// Everything the handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub cron_secret: Arc<str>,
    pub response_result_sample: usize,
    pub store: Store,
    pub locks: DownloadLocks,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub syncer: Arc<dyn CaseSyncer>,
    pub sessions: Arc<SessionManager>,
    pub pool: BrowserPool,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<MetricsCollector>,
    pub publisher: Arc<PublisherStats>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync", get(trigger_sync))
        .route("/sync/logs", get(sync_logs))
        .route("/cases/sync", post(sync_case))
        .route("/cases/classify", get(classify_case))
        .route("/cases/{case_id}/updates", get(case_updates))
        .route("/cases/{case_id}/updates/read", post(mark_case_updates_read))
        .route("/cases/{case_id}/active", put(set_case_active))
        .route("/layouts/{*key}", get(cached_layout))
        .route("/session", get(session_status))
        .route("/session/challenge", post(begin_challenge))
        .route("/session/establish", post(establish_session))
        .route("/session/invalidate", post(invalidate_session))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until the shutdown flag flips.
pub async fn serve(state: AppState, bind: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

// =============================================================================
// ERRORS
// =============================================================================

fn error_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::Parse(_) => StatusCode::BAD_REQUEST,
        SyncError::NotFound => StatusCode::NOT_FOUND,
        SyncError::NoSession | SyncError::SessionExpired | SyncError::ChallengeRejected => StatusCode::CONFLICT,
        SyncError::SlotTimeout(_) | SyncError::PoolShutdown => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SyncError::Portal(_) | SyncError::Network(_) | SyncError::Driver(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &SyncError) -> Response {
    (error_status(error), Json(json!({"success": false, "error": error.to_string()}))).into_response()
}

// =============================================================================
// BATCH TRIGGER
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TriggerQuery {
    pub secret: Option<String>,
    pub parallel: Option<String>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
    pub mode: SyncMode,
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub total_updates: usize,
    pub duration_ms: u64,
    pub avg_time_per_case: u64,
    pub skipped_recent: usize,
    pub aborted: bool,
    pub results: Vec<SyncResult>,
    pub parse_errors: Vec<ParseFailure>,
}

impl TriggerResponse {
    fn from_report(report: BatchReport, result_sample: usize) -> Self {
        let message = if report.aborted {
            "batch aborted: no portal session"
        } else if report.total_count() == 0 {
            "no cases to sync"
        } else {
            "batch sync complete"
        };
        let avg_time_per_case = report.avg_time_per_case_ms();

        Self {
            success: !report.aborted,
            message: message.to_string(),
            mode: report.log.mode,
            total_count: report.total_count(),
            success_count: report.log.cases_synced,
            failed_count: report.log.cases_failed,
            total_updates: report.log.total_updates,
            duration_ms: report.log.duration_ms,
            avg_time_per_case,
            skipped_recent: report.skipped_recent,
            aborted: report.aborted,
            results: report.results.into_iter().take(result_sample).collect(),
            parse_errors: report.parse_errors,
        }
    }
}

fn secret_matches(provided: Option<&str>, expected: &str) -> bool {
    match provided {
        Some(provided) if !expected.is_empty() => {
            constant_time_eq::constant_time_eq(provided.as_bytes(), expected.as_bytes())
        }
        _ => false,
    }
}

pub async fn trigger_sync(State(state): State<AppState>, Query(query): Query<TriggerQuery>) -> Response {
    if !secret_matches(query.secret.as_deref(), &state.cron_secret) {
        warn!("Sync trigger rejected: bad secret");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response();
    }

    let mode = if query.parallel.as_deref() == Some("true") {
        SyncMode::Parallel
    } else {
        SyncMode::Sequential
    };
    let concurrency = query.concurrency.map(|c| c.clamp(1, MAX_TRIGGER_CONCURRENCY));

    match state.orchestrator.run_scheduled(mode, concurrency).await {
        Ok(report) => Json(TriggerResponse::from_report(report, state.response_result_sample)).into_response(),
        Err(e) => {
            error!(error = %e, "Batch sync could not start");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": "batch sync failed", "details": e.to_string()})),
            )
                .into_response()
        }
    }
}

// =============================================================================
// SINGLE CASE
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaseSyncResponse {
    success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    skipped: bool,
    update_count: usize,
}

pub async fn sync_case(State(state): State<AppState>, Json(request): Json<CaseSyncRequest>) -> Response {
    match state.syncer.sync_case(&request).await {
        Ok(CaseSyncOutcome::Synced { update_count }) => {
            Json(CaseSyncResponse { success: true, skipped: false, update_count }).into_response()
        }
        Ok(CaseSyncOutcome::Skipped) => {
            Json(CaseSyncResponse { success: true, skipped: true, update_count: 0 }).into_response()
        }
        Err(e) => {
            warn!(case_id = %request.case_id, error = %e, "Single-case sync failed");
            error_response(&e)
        }
    }
}

// =============================================================================
// CASE ADMIN
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyQuery {
    pub case_number: String,
}

pub async fn classify_case(Query(query): Query<ClassifyQuery>) -> Response {
    let id = match case_number::parse(&query.case_number) {
        Ok(id) => id,
        Err(e) => return error_response(&SyncError::Parse(e)),
    };
    let classification = classify(&id);
    let labels = party_labels(&id);
    Json(json!({
        "caseKey": id.case_key(),
        "portalCaseNo": id.portal_case_no(),
        "category": classification.category,
        "isCriminal": classification.is_criminal,
        "isApplicationType": classification.is_application_type,
        "plaintiffLabel": labels.plaintiff_label(),
        "defendantLabel": labels.defendant_label(),
        "screen": portal_route(&id.type_code).screen(),
    }))
    .into_response()
}

pub async fn case_updates(State(state): State<AppState>, Path(case_id): Path<String>) -> Response {
    match state.store.unread_updates(&case_id).await {
        Ok(updates) => Json(updates).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn mark_case_updates_read(State(state): State<AppState>, Path(case_id): Path<String>) -> Response {
    match state.store.mark_updates_read(&case_id, Utc::now()).await {
        Ok(marked) => Json(json!({"success": true, "marked": marked})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

pub async fn set_case_active(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Json(body): Json<ActiveRequest>,
) -> Response {
    match state.store.set_case_active(&case_id, body.active).await {
        Ok(()) => Json(json!({"success": true, "active": body.active})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

pub async fn sync_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_LOG_PAGE);
    match state.store.recent_sync_logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn cached_layout(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.locks.read_cached(&key).await {
        Ok(Some(xml)) => ([(axum::http::header::CONTENT_TYPE, "application/xml; charset=utf-8")], xml).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "layout not cached"}))).into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishRequest {
    pub answer: String,
    /// Case the operator was looking at when the challenge came up.
    #[serde(default)]
    pub case_id: Option<String>,
}

pub async fn session_status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.sessions.status().await)
}

pub async fn begin_challenge(State(state): State<AppState>) -> Response {
    match state.sessions.begin_challenge().await {
        Ok(challenge) => Json(json!({
            "imageBase64": challenge.image_base64,
            "issuedAt": challenge.issued_at,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn invalidate_session(State(state): State<AppState>) -> Json<SessionStatus> {
    state.sessions.invalidate().await;
    info!("Session invalidated by operator");
    Json(state.sessions.status().await)
}

pub async fn establish_session(State(state): State<AppState>, Json(body): Json<EstablishRequest>) -> Response {
    let answer = body.answer.trim();
    if answer.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"success": false, "error": "answer is empty"}))).into_response();
    }
    match state.sessions.establish(answer, body.case_id.as_deref()).await {
        Ok(_) => Json(state.sessions.status().await).into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub engine: MetricsSnapshot,
    pub pool: PoolStatus,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub publisher: PublisherSnapshot,
    pub session: SessionStatus,
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(MetricsReport {
        engine: state.metrics.snapshot(),
        pool: state.pool.status(),
        circuit_breaker: state.breaker.snapshot(),
        publisher: state.publisher.snapshot(),
        session: state.sessions.status().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_detector::build_snapshot;
    use crate::classifier::CaseCategory;
    use crate::config::{OrchestratorConfig, PoolConfig, SessionConfig};
    use crate::driver::test_support::MockDriver;
    use crate::models::{CaseUpdate, CaseUpdateRecord, Importance, RawCaseDocument, UpdateType};
    use crate::store::test_support::temp_store;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSyncer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CaseSyncer for CountingSyncer {
        async fn sync_case(&self, request: &CaseSyncRequest) -> Result<CaseSyncOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            crate::case_number::parse(&request.case_number)?;
            if request.case_number.ends_with("9999") {
                Err(SyncError::NotFound)
            } else if !request.force_refresh && request.case_number.ends_with("5555") {
                Ok(CaseSyncOutcome::Skipped)
            } else {
                Ok(CaseSyncOutcome::Synced { update_count: 1 })
            }
        }
    }

    async fn state(syncer: Arc<CountingSyncer>) -> (AppState, Store, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let metrics = Arc::new(MetricsCollector::new());
        let pool = BrowserPool::new(Arc::new(MockDriver::default()), PoolConfig::default(), metrics.clone());
        let breaker = Arc::new(CircuitBreaker::new("portal", 5, Duration::from_secs(60), 1));
        let sessions = Arc::new(SessionManager::new(
            pool.clone(),
            SessionConfig::default(),
            breaker.clone(),
            metrics.clone(),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            syncer.clone(),
            store.clone(),
            OrchestratorConfig {
                item_delay: Duration::from_millis(1),
                chunk_delay: Duration::from_millis(1),
                ..OrchestratorConfig::default()
            },
            metrics.clone(),
        ));
        let state = AppState {
            cron_secret: Arc::from("s3cret"),
            response_result_sample: 20,
            store: store.clone(),
            locks: DownloadLocks::new(&store, Duration::from_secs(300), metrics.clone()),
            orchestrator,
            syncer,
            sessions,
            pool,
            breaker,
            metrics,
            publisher: Arc::new(PublisherStats::new()),
        };
        (state, store, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn query(secret: Option<&str>, parallel: Option<&str>, concurrency: Option<usize>) -> Query<TriggerQuery> {
        Query(TriggerQuery {
            secret: secret.map(str::to_string),
            parallel: parallel.map(str::to_string),
            concurrency,
        })
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected_without_work() {
        let syncer = Arc::new(CountingSyncer::default());
        let (state, store, _dir) = state(syncer.clone()).await;
        store.upsert_case("a", "2024가단1").await.unwrap();

        for secret in [None, Some("wrong"), Some("")] {
            let response = trigger_sync(State(state.clone()), query(secret, None, None)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(syncer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_secret_config_rejects_everything() {
        assert!(!secret_matches(Some(""), ""));
        assert!(!secret_matches(None, ""));
        assert!(secret_matches(Some("abc"), "abc"));
        assert!(!secret_matches(Some("abd"), "abc"));
    }

    #[tokio::test]
    async fn test_trigger_with_no_cases() {
        let (state, _store, _dir) = state(Arc::new(CountingSyncer::default())).await;
        let response = trigger_sync(State(state), query(Some("s3cret"), None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["totalCount"], 0);
        assert_eq!(body["mode"], "sequential");
        assert_eq!(body["message"], "no cases to sync");
    }

    #[tokio::test]
    async fn test_trigger_reports_partial_failure_as_200() {
        let syncer = Arc::new(CountingSyncer::default());
        let (state, store, _dir) = state(syncer.clone()).await;
        store.upsert_case("a", "2024가단1").await.unwrap();
        store.upsert_case("b", "2024가단9999").await.unwrap();
        store.upsert_case("c", "2024가단5555").await.unwrap();
        store.upsert_case("d", "garbage").await.unwrap();

        let response = trigger_sync(State(state), query(Some("s3cret"), Some("true"), Some(50))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["mode"], "parallel");
        assert_eq!(body["totalCount"], 3);
        assert_eq!(body["successCount"], 2);
        assert_eq!(body["failedCount"], 1);
        assert_eq!(body["totalUpdates"], 1);
        assert_eq!(body["parseErrors"].as_array().unwrap().len(), 1);
        assert_eq!(body["parseErrors"][0]["raw"], "garbage");
        assert_eq!(body["results"].as_array().unwrap().len(), 3);
        assert_eq!(syncer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_case_endpoint_shapes() {
        let (state, _store, _dir) = state(Arc::new(CountingSyncer::default())).await;

        let synced = sync_case(
            State(state.clone()),
            Json(CaseSyncRequest { case_id: "a".into(), case_number: "2024가단1".into(), force_refresh: true }),
        )
        .await;
        assert_eq!(synced.status(), StatusCode::OK);
        assert_eq!(body_json(synced).await, json!({"success": true, "updateCount": 1}));

        let skipped = sync_case(
            State(state.clone()),
            Json(CaseSyncRequest { case_id: "b".into(), case_number: "2024가단5555".into(), force_refresh: false }),
        )
        .await;
        assert_eq!(body_json(skipped).await, json!({"success": true, "skipped": true, "updateCount": 0}));

        let malformed = sync_case(
            State(state.clone()),
            Json(CaseSyncRequest { case_id: "c".into(), case_number: "nope".into(), force_refresh: false }),
        )
        .await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(malformed).await["success"], false);

        let missing = sync_case(
            State(state),
            Json(CaseSyncRequest { case_id: "d".into(), case_number: "2024가단9999".into(), force_refresh: false }),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_establish_without_challenge_conflicts() {
        let (state, _store, _dir) = state(Arc::new(CountingSyncer::default())).await;

        let empty = establish_session(State(state.clone()), Json(EstablishRequest { answer: "  ".into(), case_id: None })).await;
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let response = establish_session(State(state), Json(EstablishRequest { answer: "12345".into(), case_id: Some("case-1".into()) })).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_metrics_report_sections() {
        let (state, _store, _dir) = state(Arc::new(CountingSyncer::default())).await;
        let Json(report) = metrics(State(state)).await;
        let body = serde_json::to_value(&report).unwrap();

        assert_eq!(body["engine"]["status"], "operational");
        assert_eq!(body["pool"]["max_instances"], 4);
        assert_eq!(body["circuitBreaker"]["state"], "Closed");
        assert_eq!(body["session"]["active"], false);
        assert!(body["publisher"].is_object());
    }

    #[tokio::test]
    async fn test_classify_endpoint() {
        let response = classify_case(Query(ClassifyQuery { case_number: "2025즈기1108".into() })).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["category"], "family_non_litigation");
        assert_eq!(body["plaintiffLabel"], "신청인");
        assert_eq!(body["defendantLabel"], "피신청인");
        assert_eq!(body["screen"], "ssgo102");

        let bad = classify_case(Query(ClassifyQuery { case_number: "즈기1108".into() })).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_updates_are_listed_then_marked_read() {
        let (state, store, _dir) = state(Arc::new(CountingSyncer::default())).await;
        store.upsert_case("a", "2024가단1").await.unwrap();
        let document = RawCaseDocument {
            case_key: "2024가단1".into(),
            enc: None,
            basic: BTreeMap::from([("종국결과".to_string(), "원고승".to_string())]),
            hearings: vec![],
            progress: vec![],
        };
        let snapshot = build_snapshot("a", CaseCategory::Civil, document, Utc::now());
        let record = CaseUpdateRecord::new(
            "a",
            CaseUpdate {
                update_type: UpdateType::ResultAnnounced,
                summary: "종국결과: 원고승".into(),
                importance: Importance::High,
                old_value: None,
                new_value: Some("원고승".into()),
            },
            Utc::now(),
        );
        store.save_snapshot_with_updates(&snapshot, &[record]).await.unwrap();

        let listed = body_json(case_updates(State(state.clone()), Path("a".into())).await).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["update_type"], "result_announced");

        let marked = body_json(mark_case_updates_read(State(state.clone()), Path("a".into())).await).await;
        assert_eq!(marked["marked"], 1);

        let after = body_json(case_updates(State(state), Path("a".into())).await).await;
        assert!(after.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_cases_drop_out_of_the_batch() {
        let syncer = Arc::new(CountingSyncer::default());
        let (state, store, _dir) = state(syncer.clone()).await;
        store.upsert_case("a", "2024가단1").await.unwrap();
        store.upsert_case("b", "2024가단2").await.unwrap();

        let response = set_case_active(
            State(state.clone()),
            Path("b".into()),
            Json(ActiveRequest { active: false }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(trigger_sync(State(state.clone()), query(Some("s3cret"), None, None)).await).await;
        assert_eq!(body["totalCount"], 1);

        let logs = body_json(sync_logs(State(state), Query(LogQuery { limit: Some(500) })).await).await;
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["cases_synced"], 1);
    }

    #[tokio::test]
    async fn test_cached_layout_lookup() {
        let (state, _store, _dir) = state(Arc::new(CountingSyncer::default())).await;
        let missing = cached_layout(State(state.clone()), Path("ssgo101/SSGO101F01.xml".into())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        state.locks.try_acquire("ssgo101/SSGO101F01.xml").await.unwrap();
        state.locks.complete("ssgo101/SSGO101F01.xml", "<layout/>").await.unwrap();
        let hit = cached_layout(State(state), Path("ssgo101/SSGO101F01.xml".into())).await;
        assert_eq!(hit.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(hit.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"<layout/>");
    }

    #[tokio::test]
    async fn test_invalidate_without_session_is_harmless() {
        let (state, _store, _dir) = state(Arc::new(CountingSyncer::default())).await;
        let Json(status) = invalidate_session(State(state)).await;
        assert!(!status.active);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(error_status(&SyncError::NoSession), StatusCode::CONFLICT);
        assert_eq!(error_status(&SyncError::SlotTimeout(Duration::from_secs(1))), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_status(&SyncError::Portal("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(error_status(&SyncError::WorkerPanicked), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
