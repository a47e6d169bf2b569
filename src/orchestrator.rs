// =============================================================================
// orchestrator.rs - THE BATCH RUN
// =============================================================================
//
// Takes a list of candidate cases and pushes every eligible one through the
// single-case handler, either one at a time or in fixed-size chunks.
//
//   parse        malformed numbers become ParseFailures and are never sent;
//                the store sorts them behind good candidates next time
//   eligibility  cases synced within the re-sync interval are left out
//   dispatch     sequential: one item, item delay, next item
//                parallel:   one chunk concurrently, chunk delay, next chunk
//   record       one SyncLogEntry per run, with a truncated result sample
//
// Every item is isolated. An error or even a panic inside one lookup becomes
// a failed SyncResult and the run moves on. The one exception is NoSession:
// without a session nothing else can succeed, so the run stops there.
// =============================================================================

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::case_number;
use crate::case_sync::CaseSyncer;
use crate::config::OrchestratorConfig;
use crate::error::SyncError;
use crate::metrics::MetricsCollector;
use crate::models::{
    BatchReport, CaseSyncOutcome, CaseSyncRequest, ParseFailure, SyncCandidate, SyncLogEntry, SyncMode,
    SyncResult, SyncStatus,
};
use crate::store::Store;

const BATCH_ACTION: &str = "batch_sync";

pub struct SyncOrchestrator {
    syncer: Arc<dyn CaseSyncer>,
    store: Store,
    config: OrchestratorConfig,
    metrics: Arc<MetricsCollector>,
}

/// One dispatched item's result, plus whether the run must stop after it.
struct ItemRun {
    result: SyncResult,
    aborts_run: bool,
}

impl SyncOrchestrator {
    pub fn new(
        syncer: Arc<dyn CaseSyncer>,
        store: Store,
        config: OrchestratorConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { syncer, store, config, metrics }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Load candidates from the store and run them.
    pub async fn run_scheduled(&self, mode: SyncMode, concurrency: Option<usize>) -> Result<BatchReport, SyncError> {
        let candidates = self.store.list_sync_candidates(self.config.max_cases_per_run).await?;
        Ok(self.run(candidates, mode, concurrency).await)
    }

    pub async fn run(&self, candidates: Vec<SyncCandidate>, mode: SyncMode, concurrency: Option<usize>) -> BatchReport {
        let started = Instant::now();
        let now = Utc::now();

        let mut parse_errors = Vec::new();
        let mut skipped_recent = 0;
        let mut requests = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if let Err(e) = case_number::parse(&candidate.case_number) {
                debug!(case_id = %candidate.case_id, raw = %candidate.case_number, error = %e, "Rejected case number");
                parse_errors.push(ParseFailure {
                    case_id: candidate.case_id,
                    raw: candidate.case_number,
                    reason: e.to_string(),
                });
                continue;
            }

            let recent = candidate.last_synced_at.is_some_and(|last| {
                now.signed_duration_since(last)
                    .to_std()
                    .map(|age| age < self.config.min_resync_interval)
                    .unwrap_or(true)
            });
            if recent {
                skipped_recent += 1;
                continue;
            }

            if requests.len() < self.config.max_cases_per_run {
                requests.push(CaseSyncRequest {
                    case_id: candidate.case_id,
                    case_number: candidate.case_number,
                    force_refresh: false,
                });
            }
        }

        info!(
            mode = %mode,
            eligible = requests.len(),
            parse_errors = parse_errors.len(),
            skipped_recent = skipped_recent,
            "Batch sync starting"
        );

        let (results, aborted) = match mode {
            SyncMode::Sequential => self.run_sequential(requests).await,
            SyncMode::Parallel => {
                let chunk_size = concurrency.unwrap_or(self.config.default_concurrency).max(1);
                self.run_parallel(requests, chunk_size).await
            }
        };

        for failure in &parse_errors {
            if let Err(e) = self.store.mark_number_rejected(&failure.case_id, &failure.raw).await {
                warn!(case_id = %failure.case_id, error = %e, "Failed to flag rejected case number");
            }
        }

        let report = self.finish(mode, results, parse_errors, skipped_recent, aborted, started).await;
        self.metrics.increment_batches_run();
        report
    }

    async fn run_sequential(&self, requests: Vec<CaseSyncRequest>) -> (Vec<SyncResult>, bool) {
        let total = requests.len();
        let mut results = Vec::with_capacity(total);

        for (index, request) in requests.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.item_delay).await;
            }
            debug!(position = index + 1, total = total, case = %request.case_number, "Syncing case");

            let item = self.run_item(request).await;
            results.push(item.result);
            if item.aborts_run {
                warn!(processed = results.len(), total = total, "No portal session, aborting batch");
                return (results, true);
            }
        }
        (results, false)
    }

    async fn run_parallel(&self, requests: Vec<CaseSyncRequest>, chunk_size: usize) -> (Vec<SyncResult>, bool) {
        let total = requests.len();
        let chunk_count = total.div_ceil(chunk_size);
        let mut results = Vec::with_capacity(total);

        info!(chunks = chunk_count, chunk_size = chunk_size, "Parallel batch dispatch");

        for (index, chunk) in requests.chunks(chunk_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            debug!(chunk = index + 1, chunks = chunk_count, size = chunk.len(), "Dispatching chunk");

            // join_all yields in input order, whatever order the lookups finish in.
            let items = join_all(chunk.iter().cloned().map(|request| self.run_item(request))).await;
            let mut aborted = false;
            for item in items {
                aborted |= item.aborts_run;
                results.push(item.result);
            }
            if aborted {
                warn!(processed = results.len(), total = total, "No portal session, aborting batch");
                return (results, true);
            }
        }
        (results, false)
    }

    async fn run_item(&self, request: CaseSyncRequest) -> ItemRun {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.syncer.sync_case(&request)).catch_unwind().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = SyncResult {
            case_id: request.case_id,
            case_number: request.case_number,
            success: false,
            skipped: false,
            update_count: 0,
            error: None,
            duration_ms,
        };
        let mut aborts_run = false;

        match outcome {
            Ok(Ok(CaseSyncOutcome::Synced { update_count })) => {
                result.success = true;
                result.update_count = update_count;
            }
            Ok(Ok(CaseSyncOutcome::Skipped)) => {
                result.success = true;
                result.skipped = true;
            }
            Ok(Err(e)) => {
                aborts_run = matches!(e, SyncError::NoSession);
                warn!(case_id = %result.case_id, case = %result.case_number, error = %e, "Case sync failed");
                result.error = Some(e.to_string());
            }
            Err(_) => {
                error!(case_id = %result.case_id, case = %result.case_number, "Case sync panicked");
                result.error = Some(SyncError::WorkerPanicked.to_string());
            }
        }

        ItemRun { result, aborts_run }
    }

    async fn finish(
        &self,
        mode: SyncMode,
        results: Vec<SyncResult>,
        parse_errors: Vec<ParseFailure>,
        skipped_recent: usize,
        aborted: bool,
        started: Instant,
    ) -> BatchReport {
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        let total_updates = results.iter().map(|r| r.update_count).sum();

        let log = SyncLogEntry {
            id: Uuid::new_v4(),
            action: BATCH_ACTION.to_string(),
            status: if failed == 0 { SyncStatus::Success } else { SyncStatus::Partial },
            mode,
            total_cases: results.len(),
            cases_synced: succeeded,
            cases_failed: failed,
            total_updates,
            duration_ms: started.elapsed().as_millis() as u64,
            results: results.iter().take(self.config.log_result_sample).cloned().collect(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_sync_log(&log).await {
            error!(error = %e, log_id = %log.id, "Failed to persist sync log");
        }

        info!(
            mode = %mode,
            succeeded = succeeded,
            failed = failed,
            updates = total_updates,
            duration_ms = log.duration_ms,
            aborted = aborted,
            "Batch sync finished"
        );

        BatchReport { log, results, parse_errors, skipped_recent, aborted }
    }
}
