// =============================================================================
// case_sync.rs - ONE CASE, END TO END
// =============================================================================
//
// The single-case handler. Everything between "here is a case number" and
// "its updates are in the database and on the wire" happens here:
//
//   1. parse         reject malformed numbers before touching anything
//   2. skip window   a case synced minutes ago is left alone unless forced
//   3. limiter       take a global concurrency slot
//   4. lookup        session manager, on a pooled page
//   5. layout        make sure the route's layout document is cached
//   6. diff          snapshot vs. the previous one
//   7. persist       snapshot + updates in one transaction, case marked synced
//   8. notify        updates go to the Redis publisher
//
// The batch orchestrator only ever sees the CaseSyncer trait.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::case_number::{self, CaseIdentifier};
use crate::change_detector::{build_snapshot, detect_changes};
use crate::classifier::{classify_with_hint, portal_route};
use crate::error::SyncError;
use crate::layout_cache::LayoutCache;
use crate::lock::ConcurrencyLimiter;
use crate::metrics::MetricsCollector;
use crate::models::{CaseSyncOutcome, CaseSyncRequest, CaseUpdateRecord, EncBinding, RawCaseDocument};
use crate::publisher::UpdateNotifier;
use crate::session::{LookupOutcome, LookupParams, SessionManager};
use crate::store::Store;

/// Portal dates are Korean local dates.
const PORTAL_UTC_OFFSET_SECS: i32 = 9 * 3600;

#[async_trait]
pub trait CaseSyncer: Send + Sync {
    async fn sync_case(&self, request: &CaseSyncRequest) -> Result<CaseSyncOutcome, SyncError>;
}

pub struct PortalCaseSyncer {
    store: Store,
    sessions: Arc<SessionManager>,
    limiter: ConcurrencyLimiter,
    layouts: Arc<LayoutCache>,
    notifier: UpdateNotifier,
    metrics: Arc<MetricsCollector>,
    skip_window: Duration,
}

impl PortalCaseSyncer {
    pub fn new(
        store: Store,
        sessions: Arc<SessionManager>,
        limiter: ConcurrencyLimiter,
        layouts: Arc<LayoutCache>,
        notifier: UpdateNotifier,
        metrics: Arc<MetricsCollector>,
        skip_window: Duration,
    ) -> Self {
        Self { store, sessions, limiter, layouts, notifier, metrics, skip_window }
    }

    async fn synced_recently(&self, case_id: &str, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let Some(last) = self.store.case_last_synced(case_id).await? else {
            return Ok(false);
        };
        // A timestamp in the future counts as recent.
        Ok(now
            .signed_duration_since(last)
            .to_std()
            .map(|age| age < self.skip_window)
            .unwrap_or(true))
    }

    /// Lookup and layout, both inside one concurrency slot.
    async fn fetch(&self, id: &CaseIdentifier, enc: Option<EncBinding>) -> Result<RawCaseDocument, SyncError> {
        let mut params = LookupParams::new(id.clone());
        params.enc = enc;

        self.limiter
            .run(async {
                let document = match self.sessions.lookup(params).await? {
                    LookupOutcome::Found(document) => document,
                    LookupOutcome::NotFound => return Err(SyncError::NotFound),
                    LookupOutcome::SessionExpired => return Err(SyncError::SessionExpired),
                };

                // The layout only matters to whoever renders the case later.
                // A failure here is not a failed sync.
                if let Err(e) = self.layouts.ensure(portal_route(&id.type_code)).await {
                    warn!(case = %id, error = %e, "Layout document unavailable");
                }
                Ok(document)
            })
            .await
    }

    async fn persist(
        &self,
        request: &CaseSyncRequest,
        id: &CaseIdentifier,
        document: RawCaseDocument,
        now: DateTime<Utc>,
    ) -> Result<Vec<CaseUpdateRecord>, SyncError> {
        let case_type_name = document.basic.get("사건구분").cloned();
        let category = classify_with_hint(id, case_type_name.as_deref()).category;
        let enc = document.enc.clone();

        let previous = self.store.latest_snapshot(&request.case_id).await?;
        let snapshot = build_snapshot(&request.case_id, category, document, now);
        let records: Vec<CaseUpdateRecord> = detect_changes(previous.as_ref(), &snapshot, portal_today(now))
            .into_iter()
            .map(|update| CaseUpdateRecord::new(&request.case_id, update, now))
            .collect();

        self.store.save_snapshot_with_updates(&snapshot, &records).await?;
        self.store
            .mark_case_synced(&request.case_id, now, enc.as_ref())
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl CaseSyncer for PortalCaseSyncer {
    async fn sync_case(&self, request: &CaseSyncRequest) -> Result<CaseSyncOutcome, SyncError> {
        let id = case_number::parse(&request.case_number)?;
        self.metrics.increment_lookups_attempted();

        if !request.force_refresh && self.synced_recently(&request.case_id, Utc::now()).await? {
            self.metrics.increment_lookups_skipped();
            debug!(case_id = %request.case_id, case = %id, "Synced recently, skipping");
            return Ok(CaseSyncOutcome::Skipped);
        }

        self.store.upsert_case(&request.case_id, &request.case_number).await?;
        let enc = self.store.case_enc_binding(&request.case_id).await?;
        let had_enc = enc.is_some();

        let document = match self.fetch(&id, enc).await {
            Ok(document) => document,
            Err(e) => {
                self.metrics.increment_lookups_failed();
                if matches!(e, SyncError::NotFound) && had_enc {
                    if let Err(clear_err) = self.store.clear_case_enc(&request.case_id).await {
                        warn!(case_id = %request.case_id, error = %clear_err, "Failed to clear stored encrypted number");
                    }
                }
                return Err(e);
            }
        };

        let records = match self.persist(request, &id, document, Utc::now()).await {
            Ok(records) => records,
            Err(e) => {
                self.metrics.increment_lookups_failed();
                return Err(e);
            }
        };

        self.metrics.increment_lookups_succeeded();
        self.metrics.add_updates_detected(records.len() as u64);
        if !records.is_empty() {
            let queued = self.notifier.notify(&records);
            info!(
                case_id = %request.case_id,
                case = %id,
                updates = records.len(),
                queued = queued,
                "Case updates detected"
            );
        }

        Ok(CaseSyncOutcome::Synced { update_count: records.len() })
    }
}

fn portal_today(now: DateTime<Utc>) -> NaiveDate {
    match FixedOffset::east_opt(PORTAL_UTC_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::LimiterConfig;
    use crate::layout_cache::PollPolicy;
    use crate::lock::{ConcurrencySlot, DownloadLocks};
    use crate::models::UpdateType;
    use crate::session::test_support::{manager, mount_found, portal};
    use crate::store::test_support::temp_store;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LAYOUT: &str = r#"<w2:layout><group id="basic"/></w2:layout>"#;

    struct Harness {
        syncer: PortalCaseSyncer,
        store: Store,
        slot: ConcurrencySlot,
        sessions: Arc<SessionManager>,
        updates: crossbeam_channel::Receiver<CaseUpdateRecord>,
        metrics: Arc<MetricsCollector>,
        _dir: tempfile::TempDir,
    }

    async fn harness(server: &MockServer) -> Harness {
        let (store, dir) = temp_store().await;
        let metrics = Arc::new(MetricsCollector::new());
        let sessions = Arc::new(manager(server, 50));
        let slot = ConcurrencySlot::new(&store, Duration::from_secs(300));
        let limiter = ConcurrencyLimiter::new(slot.clone(), LimiterConfig::default(), metrics.clone());
        let layouts = Arc::new(LayoutCache::new(
            DownloadLocks::new(&store, Duration::from_secs(300), metrics.clone()),
            sessions.pool().clone(),
            Arc::new(CircuitBreaker::new("portal", 5, Duration::from_secs(60), 1)),
            metrics.clone(),
            PollPolicy::default(),
        ));
        let (notifier, updates) = UpdateNotifier::channel(16, metrics.clone());
        let syncer = PortalCaseSyncer::new(
            store.clone(),
            sessions.clone(),
            limiter,
            layouts,
            notifier,
            metrics.clone(),
            Duration::from_secs(300),
        );
        Harness { syncer, store, slot, sessions, updates, metrics, _dir: dir }
    }

    fn request(case_id: &str, case_number: &str, force_refresh: bool) -> CaseSyncRequest {
        CaseSyncRequest {
            case_id: case_id.into(),
            case_number: case_number.into(),
            force_refresh,
        }
    }

    async fn mount_layout(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/ssgo/ui/ssgo102/SSGO102F01.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LAYOUT))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_full_sync_persists_and_notifies() {
        let server = portal().await;
        mount_found(&server).await;
        mount_layout(&server).await;
        let h = harness(&server).await;
        h.sessions.begin_challenge().await.unwrap();
        h.sessions.establish("12345", None).await.unwrap();

        let outcome = h.syncer.sync_case(&request("case-1", "2024드단26718", false)).await.unwrap();
        assert_eq!(outcome, CaseSyncOutcome::Synced { update_count: 1 });

        let snapshot = h.store.latest_snapshot("case-1").await.unwrap().unwrap();
        assert_eq!(snapshot.hearings.len(), 1);
        let enc = h.store.case_enc_binding("case-1").await.unwrap().unwrap();
        assert_eq!((enc.enc_case_no.as_str(), enc.monitor_id.as_str()), ("ENC123", "w1"));

        let unread = h.store.unread_updates("case-1").await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].update_type, UpdateType::HearingNew);

        let published: Vec<_> = h.updates.try_iter().collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, unread[0].id);

        assert_eq!(h.slot.current().await.unwrap(), 0);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.lookups_succeeded, 1);
        assert_eq!(snap.updates_detected, 1);
    }

    #[tokio::test]
    async fn test_unchanged_case_reports_no_updates() {
        let server = portal().await;
        mount_found(&server).await;
        mount_layout(&server).await;
        let h = harness(&server).await;
        h.sessions.begin_challenge().await.unwrap();
        h.sessions.establish("12345", None).await.unwrap();

        h.syncer.sync_case(&request("case-1", "2024드단26718", false)).await.unwrap();
        let again = h.syncer.sync_case(&request("case-1", "2024드단26718", true)).await.unwrap();
        assert_eq!(again, CaseSyncOutcome::Synced { update_count: 0 });
        assert_eq!(h.store.unread_updates("case-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_stored_enc_is_replaced_by_fresh_search() {
        let server = portal().await;
        Mock::given(method("POST"))
            .and(path("/ssgo/ssgo102/selectHmpgFmlyCsGnrlCtt.on"))
            .and(body_partial_json(json!({"dma_search": {"encCsNo": "STALE"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;
        mount_found(&server).await;
        mount_layout(&server).await;
        let h = harness(&server).await;
        h.store.upsert_case("case-1", "2024드단26718").await.unwrap();
        let stale = EncBinding { enc_case_no: "STALE".into(), monitor_id: "w1".into() };
        let long_ago = Utc::now() - chrono::Duration::days(1);
        h.store.mark_case_synced("case-1", long_ago, Some(&stale)).await.unwrap();
        h.sessions.begin_challenge().await.unwrap();
        h.sessions.establish("12345", None).await.unwrap();

        for force_refresh in [false, true] {
            let outcome = h.syncer.sync_case(&request("case-1", "2024드단26718", force_refresh)).await.unwrap();
            assert!(matches!(outcome, CaseSyncOutcome::Synced { .. }), "{outcome:?}");
        }

        let enc = h.store.case_enc_binding("case-1").await.unwrap().unwrap();
        assert_eq!(enc.enc_case_no, "ENC123");
        let requests = server.received_requests().await.unwrap_or_default();
        let searches = requests.iter().filter(|r| r.url.path() == "/ssgo/ssgo10l/selectHmpgMain.on").count();
        // the second run reuses the fresh number
        assert_eq!(searches, 1);
    }

    #[tokio::test]
    async fn test_not_found_clears_stored_enc() {
        let server = portal().await;
        Mock::given(method("POST"))
            .and(path("/ssgo/ssgo102/selectHmpgFmlyCsGnrlCtt.on"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ssgo/ssgo10l/selectHmpgMain.on"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"dlt_csNoHistLst": []}})))
            .mount(&server)
            .await;
        let h = harness(&server).await;
        h.store.upsert_case("case-1", "2024드단26718").await.unwrap();
        let stale = EncBinding { enc_case_no: "STALE".into(), monitor_id: "w1".into() };
        h.store.mark_case_synced("case-1", Utc::now() - chrono::Duration::days(1), Some(&stale)).await.unwrap();
        h.sessions.begin_challenge().await.unwrap();
        h.sessions.establish("12345", None).await.unwrap();

        let err = h.syncer.sync_case(&request("case-1", "2024드단26718", true)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound));
        assert_eq!(h.store.case_enc_binding("case-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recent_sync_is_skipped_without_force() {
        let server = portal().await;
        let h = harness(&server).await;
        h.store.upsert_case("case-1", "2024드단26718").await.unwrap();
        h.store.mark_case_synced("case-1", Utc::now(), None).await.unwrap();

        let outcome = h.syncer.sync_case(&request("case-1", "2024드단26718", false)).await.unwrap();
        assert_eq!(outcome, CaseSyncOutcome::Skipped);
        assert_eq!(h.metrics.snapshot().lookups_skipped, 1);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_number_fails_before_any_work() {
        let server = portal().await;
        let h = harness(&server).await;
        let err = h.syncer.sync_case(&request("case-1", "2024-xyz", false)).await.unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
        assert_eq!(h.metrics.snapshot().lookups_attempted, 0);
    }

    #[tokio::test]
    async fn test_missing_session_releases_the_slot() {
        let server = portal().await;
        let h = harness(&server).await;
        let err = h.syncer.sync_case(&request("case-1", "2024드단26718", true)).await.unwrap_err();
        assert!(matches!(err, SyncError::NoSession));
        assert_eq!(h.slot.current().await.unwrap(), 0);
        assert_eq!(h.metrics.snapshot().lookups_failed, 1);
    }

    #[test]
    fn test_portal_today_uses_korean_date() {
        let late_utc = Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).unwrap();
        assert_eq!(portal_today(late_utc), NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
    }
}
