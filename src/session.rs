// =============================================================================
// session.rs - ONE CHALLENGE, MANY LOOKUPS
// =============================================================================
//
// The portal gates searches behind a visual challenge. Solving it is slow and
// needs a human (or an external solver), so the engine solves it once and
// then rides the resulting cookie pair for as many lookups as the portal's
// saved-results list will hold.
//
// Lifecycle:
//
//   begin_challenge   open a portal session, fetch the challenge image and
//                     its token, park both as the pending challenge
//   establish         bind the operator's answer to the pending challenge;
//                     the result is the active SessionHandle
//   lookup            search + detail through a pooled page carrying the
//                     session cookies; returns a tagged LookupOutcome. A
//                     stored encrypted number skips the search, but only
//                     under the WMONID it was issued with
//   invalidate        drop the active handle
//
// The manager never re-solves on its own. A SessionExpired outcome goes back
// to the caller, who decides whether to ask the operator or give up.
//
// Only known portal fields are extracted. Strings are length-bounded and
// lists are capped.
// =============================================================================

use aho_corasick::AhoCorasick;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser_pool::BrowserPool;
use crate::case_number::CaseIdentifier;
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::portal_route;
use crate::config::SessionConfig;
use crate::driver::{Page, PageResponse};
use crate::error::SyncError;
use crate::metrics::MetricsCollector;
use crate::models::{EncBinding, HearingEntry, ProgressEntry, RawCaseDocument};

const ENTRY_PATH: &str = "/ssgo/index.on?cortId=www";
const CHALLENGE_PATH: &str = "/ssgo/ssgo10l/getCaptchaInf.on";
const SEARCH_PATH: &str = "/ssgo/ssgo10l/selectHmpgMain.on";

const CHALLENGE_SUBMISSION: &str = "mf_ssgoTopMainTab_contents_content1_body_sbm_captcha";
const SEARCH_SUBMISSION: &str = "mf_ssgoTopMainTab_contents_content1_body_sbm_search";

const SESSION_COOKIE: &str = "JSESSIONID";
const MONITOR_COOKIE: &str = "WMONID";

/// A pending challenge older than this cannot be answered anymore.
const CHALLENGE_TTL: Duration = Duration::from_secs(10 * 60);

const MAX_IMAGE_BYTES: usize = 512 * 1024;
const MAX_FIELD_CHARS: usize = 2_000;
const MAX_TOKEN_CHARS: usize = 256;
const MAX_HEARINGS: usize = 200;
const MAX_PROGRESS: usize = 1_000;

/// Substrings in portal error messages that mean the challenge answer (and
/// with it the session) is no good.
static CHALLENGE_FAILURE_SIGNATURES: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["캡챠", "captcha", "자동입력", "보안문자", "일치하지"])
        .expect("Failed to build challenge signature automaton")
});

/// Portal field name → label stored in the case snapshot. Anything not
/// listed here is ignored.
const BASIC_FIELDS: &[(&[&str], &str)] = &[
    (&["userCsNo", "csNo"], "사건번호"),
    (&["csNm"], "사건명"),
    (&["csDvsNm"], "사건구분"),
    (&["cortNm"], "법원"),
    (&["jdbnNm", "ultmtJdbnNm", "jdgNm"], "재판부"),
    (&["jdbnTelno", "jdgTelno"], "재판부전화번호"),
    (&["csRcptYmd", "rcptDt"], "접수일"),
    (&["csUltmtYmd", "endDt"], "종국일"),
    (&["csUltmtDtlCtt", "endRslt"], "종국결과"),
    (&["csCfmtnYmd", "cfrmDt"], "확정일"),
    (&["prcdStsNm"], "진행상태"),
    (&["aplNm", "rprsClmntNm"], "원고"),
    (&["rspNm", "rprsAcsdNm"], "피고"),
    (&["stmpAtchAmt", "stmpAmnt"], "인지액"),
    (&["aplYmd", "aplDt"], "상소일"),
    (&["adjdocRchYmd", "jdgArvDt"], "판결도달일"),
    (&["exmnrNm"], "조사관"),
];

// =============================================================================
// TYPES
// =============================================================================

/// Challenge handed to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub image_base64: String,
    pub issued_at: DateTime<Utc>,
}

struct PendingChallenge {
    cookies: BTreeMap<String, String>,
    token: String,
    issued_at: DateTime<Utc>,
}

/// The reusable credential produced by one solved challenge.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    monitor_id: String,
    session_id: String,
    challenge_answer: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Case keys saved into the portal's result list under this session.
    pub saved_keys: Vec<String>,
    /// Set once the portal has accepted the answer on a search.
    pub verified: bool,
    /// Case whose lookup prompted the challenge, when the operator said so.
    pub source_case_id: Option<String>,
}

impl SessionHandle {
    fn cookies(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MONITOR_COOKIE.to_string(), self.monitor_id.clone()),
            (SESSION_COOKIE.to_string(), self.session_id.clone()),
        ])
    }

    fn same_session(&self, other: &SessionHandle) -> bool {
        self.session_id == other.session_id && self.monitor_id == other.monitor_id
    }

    pub fn knows(&self, case_key: &str) -> bool {
        self.saved_keys.iter().any(|k| k == case_key)
    }

    fn is_expired(&self, validity: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_used_at);
        age.to_std().map(|age| age > validity).unwrap_or(false)
    }
}

/// What the operator sees about the active session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: bool,
    pub verified: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub saved_count: usize,
    pub saved_cap: usize,
    pub challenge_pending: bool,
    pub source_case_id: Option<String>,
}

/// Everything a lookup needs besides the session.
#[derive(Debug, Clone)]
pub struct LookupParams {
    pub identifier: CaseIdentifier,
    pub party_name: Option<String>,
    /// Encrypted case number from an earlier search. Skips the search step
    /// when it was issued under the current session's monitor cookie.
    pub enc: Option<EncBinding>,
}

impl LookupParams {
    pub fn new(identifier: CaseIdentifier) -> Self {
        Self { identifier, party_name: None, enc: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(RawCaseDocument),
    NotFound,
    SessionExpired,
}

/// Result of one `reuse` call, with what it learned about the saved list.
#[derive(Debug, Clone)]
pub struct ReuseReport {
    pub outcome: LookupOutcome,
    /// The case was already in the session's saved list.
    pub already_known: bool,
    /// Newly saved case key, if the list grew.
    pub newly_saved: Option<String>,
}

// =============================================================================
// MANAGER
// =============================================================================

pub struct SessionManager {
    pool: BrowserPool,
    config: SessionConfig,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsCollector>,
    active: Mutex<Option<SessionHandle>>,
    pending: Mutex<Option<PendingChallenge>>,
}

impl SessionManager {
    pub fn new(
        pool: BrowserPool,
        config: SessionConfig,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pool,
            config,
            breaker,
            metrics,
            active: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    /// Open a fresh portal session and fetch a challenge for it. Replaces any
    /// previously pending challenge.
    pub async fn begin_challenge(&self) -> Result<Challenge, SyncError> {
        let breaker = self.breaker.clone();
        let (cookies, image, token) = self
            .pool
            .with_page(|page| async move {
                breaker
                    .call(async {
                        let response = page.get(ENTRY_PATH).await?;
                        if !response.is_success() {
                            return Err(SyncError::Portal(format!("portal returned HTTP {}", response.status)));
                        }
                        Ok(())
                    })
                    .await?;
                let cookies = page.cookies();
                let (image, token) = breaker
                    .call(async {
                        let response = page
                            .post_json(
                                CHALLENGE_PATH,
                                &[("submissionid", CHALLENGE_SUBMISSION.to_string())],
                                &json!({}),
                            )
                            .await?;
                        parse_challenge_response(&response)
                    })
                    .await?;
                Ok((cookies, image, token))
            })
            .await?;

        if !cookies.contains_key(SESSION_COOKIE) || !cookies.contains_key(MONITOR_COOKIE) {
            return Err(SyncError::Portal("portal did not issue session cookies".into()));
        }

        let issued_at = Utc::now();
        *self.pending.lock().await = Some(PendingChallenge { cookies, token, issued_at });
        self.metrics.increment_challenges_issued();
        info!("Challenge issued, waiting for operator answer");

        Ok(Challenge { image_base64: image, issued_at })
    }

    /// Bind an answer to the pending challenge. The portal checks the answer
    /// on the first search; a rejection there surfaces as ChallengeRejected.
    pub async fn establish(&self, answer: &str, source_case_id: Option<&str>) -> Result<SessionHandle, SyncError> {
        let answer = answer.trim();
        if answer.is_empty() || answer.chars().count() > MAX_TOKEN_CHARS {
            return Err(SyncError::ChallengeRejected);
        }

        let pending = self.pending.lock().await.take().ok_or(SyncError::NoSession)?;
        let age = Utc::now().signed_duration_since(pending.issued_at);
        if age.to_std().map(|age| age > CHALLENGE_TTL).unwrap_or(false) {
            warn!("Challenge answered too late");
            return Err(SyncError::ChallengeRejected);
        }

        let cookie = |name: &str| pending.cookies.get(name).cloned().ok_or(SyncError::NoSession);
        let now = Utc::now();
        let handle = SessionHandle {
            monitor_id: cookie(MONITOR_COOKIE)?,
            session_id: cookie(SESSION_COOKIE)?,
            challenge_answer: format!("{answer}{}", pending.token),
            created_at: now,
            last_used_at: now,
            saved_keys: Vec::new(),
            verified: false,
            source_case_id: source_case_id.map(str::to_string),
        };

        *self.active.lock().await = Some(handle.clone());
        self.metrics.increment_sessions_established();
        info!(source_case = ?handle.source_case_id, "Portal session established");
        Ok(handle)
    }

    /// The live session, if any. An idle session past its validity window is
    /// dropped here.
    pub async fn current(&self) -> Option<SessionHandle> {
        let mut active = self.active.lock().await;
        let expired = active
            .as_ref()
            .map(|h| h.is_expired(self.config.validity, Utc::now()))
            .unwrap_or(false);
        if expired {
            info!("Portal session aged out");
            self.metrics.increment_sessions_expired();
            *active = None;
        }
        active.clone()
    }

    pub async fn invalidate(&self) {
        if self.active.lock().await.take().is_some() {
            info!("Portal session invalidated");
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let pending = self.pending.lock().await.is_some();
        let active = self.active.lock().await;
        SessionStatus {
            active: active.is_some(),
            verified: active.as_ref().map(|h| h.verified).unwrap_or(false),
            created_at: active.as_ref().map(|h| h.created_at),
            last_used_at: active.as_ref().map(|h| h.last_used_at),
            saved_count: active.as_ref().map(|h| h.saved_keys.len()).unwrap_or(0),
            saved_cap: self.config.saved_results_cap,
            challenge_pending: pending,
            source_case_id: active.as_ref().and_then(|h| h.source_case_id.clone()),
        }
    }

    /// Look one case up with the active session, on a pooled page.
    pub async fn lookup(&self, params: LookupParams) -> Result<LookupOutcome, SyncError> {
        let handle = self.current().await.ok_or(SyncError::NoSession)?;
        self.lookup_with(&handle, params).await
    }

    async fn lookup_with(&self, handle: &SessionHandle, params: LookupParams) -> Result<LookupOutcome, SyncError> {
        let result = self
            .pool
            .with_page(|page| async move { self.reuse(page.as_ref(), handle, &params).await })
            .await;
        self.settle(handle, result).await
    }

    /// Fold a lookup result back into the shared session state.
    async fn settle(
        &self,
        used: &SessionHandle,
        result: Result<ReuseReport, SyncError>,
    ) -> Result<LookupOutcome, SyncError> {
        let mut active = self.active.lock().await;
        let is_current = active.as_ref().map(|h| h.same_session(used)).unwrap_or(false);

        match result {
            Ok(report) => {
                match &report.outcome {
                    LookupOutcome::SessionExpired => {
                        if is_current {
                            *active = None;
                            self.metrics.increment_sessions_expired();
                            warn!("Portal reports session expired");
                        }
                    }
                    LookupOutcome::Found(_) | LookupOutcome::NotFound => {
                        if let Some(handle) = active.as_mut().filter(|_| is_current) {
                            handle.last_used_at = Utc::now();
                            handle.verified = true;
                            if let Some(key) = report.newly_saved {
                                if !handle.knows(&key) {
                                    handle.saved_keys.push(key);
                                }
                            }
                        }
                    }
                }
                Ok(report.outcome)
            }
            Err(e) => {
                if is_current && e.is_session_failure() {
                    *active = None;
                    self.metrics.increment_sessions_expired();
                    warn!(error = %e, "Dropping session after failure");
                }
                Err(e)
            }
        }
    }

    /// Run one lookup on `page` using `handle`. Pure with respect to the
    /// manager's state; `settle` applies what it learned.
    pub async fn reuse(
        &self,
        page: &dyn Page,
        handle: &SessionHandle,
        params: &LookupParams,
    ) -> Result<ReuseReport, SyncError> {
        let id = &params.identifier;
        let case_key = id.case_key();
        page.add_cookies(&handle.cookies());

        let mut already_known = handle.knows(&case_key);
        let mut newly_saved = None;

        let stored = params.enc.as_ref().filter(|b| b.monitor_id == handle.monitor_id);
        if let Some(binding) = stored {
            match self.fetch_detail(page, handle, params, &case_key, &binding.enc_case_no).await? {
                LookupOutcome::NotFound => {
                    debug!(case = %case_key, "Stored encrypted number no longer resolves, searching again");
                }
                outcome => return Ok(ReuseReport { outcome, already_known, newly_saved }),
            }
        }

        if !already_known && handle.saved_keys.len() >= self.config.saved_results_cap {
            debug!(saved = handle.saved_keys.len(), "Saved-results list is full");
            return Ok(ReuseReport { outcome: LookupOutcome::SessionExpired, already_known, newly_saved });
        }

        let search = search_body(params, &handle.challenge_answer);
        let reply = match self.exchange(page, SEARCH_PATH, &search, handle.verified).await? {
            PortalReply::Ok(body) => parse_search_response(&body, &id.portal_case_no()),
            PortalReply::SessionExpired => {
                return Ok(ReuseReport { outcome: LookupOutcome::SessionExpired, already_known, newly_saved })
            }
        };

        let Some(enc_case_no) = reply.enc_case_no else {
            return Ok(ReuseReport { outcome: LookupOutcome::NotFound, already_known, newly_saved });
        };

        // The portal exposes no "already saved" flag. The list not growing
        // past what we saved means this case was in it.
        already_known = already_known && reply.list_len <= handle.saved_keys.len();
        if !already_known {
            newly_saved = Some(case_key.clone());
        }

        let outcome = self.fetch_detail(page, handle, params, &case_key, &enc_case_no).await?;
        debug!(case = %case_key, known = already_known, "Portal lookup finished");
        Ok(ReuseReport { outcome, already_known, newly_saved })
    }

    async fn fetch_detail(
        &self,
        page: &dyn Page,
        handle: &SessionHandle,
        params: &LookupParams,
        case_key: &str,
        enc_case_no: &str,
    ) -> Result<LookupOutcome, SyncError> {
        let detail_path = format!("/ssgo/{}/selectHmpgFmlyCsGnrlCtt.on", portal_route(&params.identifier.type_code).screen());
        let body = detail_body(params, enc_case_no, &handle.challenge_answer);
        let binding = EncBinding { enc_case_no: enc_case_no.to_string(), monitor_id: handle.monitor_id.clone() };

        Ok(match self.exchange(page, &detail_path, &body, true).await? {
            PortalReply::SessionExpired => LookupOutcome::SessionExpired,
            PortalReply::Ok(body) => match parse_detail_response(case_key, binding, &body) {
                Some(document) => LookupOutcome::Found(document),
                None => LookupOutcome::NotFound,
            },
        })
    }

    /// One portal POST. Status and body are checked inside the breaker so a
    /// 5xx or a garbage body counts against the portal.
    async fn exchange(
        &self,
        page: &dyn Page,
        path: &str,
        body: &Value,
        verified: bool,
    ) -> Result<PortalReply, SyncError> {
        self.breaker
            .call(async {
                let response = page
                    .post_json(path, &[("submissionid", SEARCH_SUBMISSION.to_string())], body)
                    .await?;
                read_portal_json(&response, verified)
            })
            .await
    }
}

// =============================================================================
// WIRE HELPERS
// =============================================================================

enum PortalReply {
    Ok(Value),
    SessionExpired,
}

/// Check status and error fields. `verified` says whether the session has
/// already passed one search: an unverified session hitting a challenge
/// error means the answer was wrong, a verified one means it expired.
fn read_portal_json(response: &PageResponse, verified: bool) -> Result<PortalReply, SyncError> {
    if matches!(response.status, 401 | 403) {
        return Ok(PortalReply::SessionExpired);
    }
    if !response.is_success() {
        return Err(SyncError::Portal(format!("portal returned HTTP {}", response.status)));
    }
    let body: Value = serde_json::from_str(&response.body)
        .map_err(|_| SyncError::Portal("portal returned a non-JSON body".into()))?;

    if let Some(message) = portal_error(&body) {
        if CHALLENGE_FAILURE_SIGNATURES.is_match(&message) {
            return if verified {
                Ok(PortalReply::SessionExpired)
            } else {
                Err(SyncError::ChallengeRejected)
            };
        }
        return Err(SyncError::Portal(bounded(&message, MAX_FIELD_CHARS)));
    }
    Ok(PortalReply::Ok(body))
}

fn portal_error(body: &Value) -> Option<String> {
    ["error", "errMsg"]
        .iter()
        .filter_map(|k| body.get(*k))
        .chain(body.pointer("/errors/errorMessage"))
        .filter_map(scalar_text)
        .find(|s| !s.is_empty())
}

fn parse_challenge_response(response: &PageResponse) -> Result<(String, String), SyncError> {
    let body = response.json().map_err(|_| SyncError::Portal("challenge response is not JSON".into()))?;
    let info = body
        .pointer("/data/dma_captchaInf")
        .ok_or_else(|| SyncError::Portal("challenge response has no challenge".into()))?;

    let image = info.get("image").and_then(Value::as_str).unwrap_or_default();
    let image = image.split_once("base64,").map(|(_, data)| data).unwrap_or(image).trim();
    if image.is_empty() || image.len() > MAX_IMAGE_BYTES * 4 / 3 + 4 {
        return Err(SyncError::Portal("challenge image missing or oversized".into()));
    }
    BASE64
        .decode(image)
        .map_err(|e| SyncError::Portal(format!("challenge image is not base64: {e}")))?;

    let token = info.get("answer").and_then(Value::as_str).unwrap_or_default();
    if token.chars().count() > MAX_TOKEN_CHARS {
        return Err(SyncError::Portal("challenge token oversized".into()));
    }
    Ok((image.to_string(), token.to_string()))
}

fn search_body(params: &LookupParams, answer: &str) -> Value {
    let id = &params.identifier;
    json!({
        "dma_search": {
            "cortCd": id.court_code.clone().unwrap_or_default(),
            "cdScope": "ALL",
            "csNoHistLst": id.portal_case_no(),
            "csDvsCd": id.type_code,
            "csYr": id.year.to_string(),
            "csSerial": id.serial.to_string(),
            "btprNm": params.party_name.clone().unwrap_or_default(),
            "answer": answer,
            "fullCsNo": "",
        }
    })
}

fn detail_body(params: &LookupParams, enc_case_no: &str, answer: &str) -> Value {
    let id = &params.identifier;
    json!({
        "dma_search": {
            "cortCd": id.court_code.clone().unwrap_or_default(),
            "csNo": id.portal_case_no(),
            "encCsNo": enc_case_no,
            "csYear": id.year.to_string(),
            "csDvsCd": id.type_code,
            "csSerial": id.padded_serial(),
            "btprtNm": params.party_name.clone().unwrap_or_default(),
            "captchaAnswer": answer,
        }
    })
}

struct SearchReply {
    enc_case_no: Option<String>,
    list_len: usize,
}

/// Pull the encrypted case number out of the saved-results list. Prefers the
/// entry whose case number matches ours, falls back to the head.
fn parse_search_response(body: &Value, portal_case_no: &str) -> SearchReply {
    let list = body
        .pointer("/data/dlt_csNoHistLst")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let matching = list
        .iter()
        .find(|entry| entry.get("csNo").and_then(scalar_text).as_deref() == Some(portal_case_no))
        .or_else(|| list.first());

    let enc_case_no = matching
        .and_then(|entry| entry.get("encCsNo"))
        .and_then(scalar_text)
        .filter(|enc| is_plausible_token(enc));

    SearchReply { enc_case_no, list_len: list.len() }
}

fn is_plausible_token(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TOKEN_CHARS
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'))
}

fn parse_detail_response(case_key: &str, enc: EncBinding, body: &Value) -> Option<RawCaseDocument> {
    let data = body.get("data")?;
    let info = data
        .get("dma_csBasCtt")
        .or_else(|| data.get("dma_csBsCtt"))
        .or_else(|| data.get("dma_gnrlCtt"))?;

    let mut basic = BTreeMap::new();
    for (keys, label) in BASIC_FIELDS {
        if let Some(value) = keys.iter().filter_map(|k| info.get(*k)).filter_map(scalar_text).find(|v| !v.is_empty()) {
            basic.insert(label.to_string(), bounded(&value, MAX_FIELD_CHARS));
        }
    }
    if basic.is_empty() {
        return None;
    }

    let hearings = list_field(data, &["dlt_rcntDxdyLst", "dlt_csSchdCtt"])
        .iter()
        .take(MAX_HEARINGS)
        .filter_map(|h| {
            let date = first_text(h, &["dxdyYmd", "trmDt"])?;
            Some(HearingEntry {
                date,
                time: first_text(h, &["dxdyHm", "trmHm"]).unwrap_or_default(),
                kind: first_text(h, &["dxdyKndNm", "trmNm"]).unwrap_or_default(),
                place: first_text(h, &["dxdyPlcNm", "trmPntNm"]).unwrap_or_default(),
                result: first_text(h, &["dxdyRsltNm", "rslt"]),
            })
        })
        .collect();

    let progress = list_field(data, &["dlt_csProgCtt", "dlt_csProgCttLst"])
        .iter()
        .take(MAX_PROGRESS)
        .filter_map(|p| {
            Some(ProgressEntry {
                date: first_text(p, &["progYmd", "prcdDt"])?,
                content: first_text(p, &["progCtt", "prcdNm"])?,
                result: first_text(p, &["progRslt", "prcdRslt"]),
            })
        })
        .collect();

    Some(RawCaseDocument {
        case_key: case_key.to_string(),
        enc: Some(enc),
        basic,
        hearings,
        progress,
    })
}

fn list_field<'a>(data: &'a Value, keys: &[&str]) -> &'a [Value] {
    keys.iter()
        .filter_map(|k| data.get(*k).and_then(Value::as_array))
        .next()
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn first_text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .filter_map(scalar_text)
        .find(|s| !s.is_empty())
        .map(|s| bounded(&s, MAX_FIELD_CHARS))
}

/// Strings and numbers only. Objects, arrays and nulls are not field values.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bounded(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::{manager, mount_found, portal, PNG_STUB};
    use super::*;
    use crate::case_number::parse;
    use crate::circuit_breaker::CircuitState;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(raw: &str) -> LookupParams {
        LookupParams::new(parse(raw).unwrap())
    }

    fn with_enc(raw: &str, enc: &str, monitor: &str) -> LookupParams {
        let mut params = params(raw);
        params.enc = Some(EncBinding { enc_case_no: enc.into(), monitor_id: monitor.into() });
        params
    }

    async fn searches(server: &MockServer) -> usize {
        let requests = server.received_requests().await.unwrap_or_default();
        requests.iter().filter(|r| r.url.path() == SEARCH_PATH).count()
    }

    #[tokio::test]
    async fn test_lookup_without_session_fails() {
        let server = portal().await;
        let sessions = manager(&server, 50);
        let err = sessions.lookup(params("2024드단26718")).await.unwrap_err();
        assert!(matches!(err, SyncError::NoSession));
    }

    #[tokio::test]
    async fn test_establish_requires_pending_challenge() {
        let server = portal().await;
        let sessions = manager(&server, 50);
        assert!(matches!(sessions.establish("12345", None).await, Err(SyncError::NoSession)));

        let challenge = sessions.begin_challenge().await.unwrap();
        assert_eq!(challenge.image_base64, PNG_STUB);
        assert!(sessions.status().await.challenge_pending);

        let handle = sessions.establish("12345", None).await.unwrap();
        assert_eq!(handle.challenge_answer, "12345TOKEN");
        assert!(!sessions.status().await.challenge_pending);
        // the challenge is spent
        assert!(matches!(sessions.establish("12345", None).await, Err(SyncError::NoSession)));
    }

    #[tokio::test]
    async fn test_lookup_found_then_known() {
        let server = portal().await;
        mount_found(&server).await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        let outcome = sessions.lookup(params("2024드단26718")).await.unwrap();
        let LookupOutcome::Found(doc) = outcome else {
            panic!("expected a document, got {outcome:?}");
        };
        let enc = doc.enc.as_ref().unwrap();
        assert_eq!((enc.enc_case_no.as_str(), enc.monitor_id.as_str()), ("ENC123", "w1"));
        assert_eq!(doc.basic.get("재판부").map(String::as_str), Some("가사2단독"));
        assert_eq!(doc.basic.len(), 3);
        assert_eq!(doc.hearings.len(), 1);
        assert_eq!(doc.hearings[0].kind, "변론기일");
        assert_eq!(doc.progress[0].content, "소장접수");

        let status = sessions.status().await;
        assert!(status.verified);
        assert_eq!(status.saved_count, 1);

        // same case again: the list did not grow, nothing new is saved
        sessions.lookup(params("2024드단26718")).await.unwrap();
        assert_eq!(sessions.status().await.saved_count, 1);
    }

    #[tokio::test]
    async fn test_stored_enc_skips_search_under_same_monitor() {
        let server = portal().await;
        mount_found(&server).await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        let outcome = sessions.lookup(with_enc("2024드단26718", "ENC123", "w1")).await.unwrap();
        assert!(matches!(outcome, LookupOutcome::Found(_)));
        assert_eq!(searches(&server).await, 0);
    }

    #[tokio::test]
    async fn test_stored_enc_from_another_monitor_is_ignored() {
        let server = portal().await;
        mount_found(&server).await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        let outcome = sessions.lookup(with_enc("2024드단26718", "ENC123", "w0")).await.unwrap();
        assert!(matches!(outcome, LookupOutcome::Found(_)));
        assert_eq!(searches(&server).await, 1);
    }

    #[tokio::test]
    async fn test_stale_enc_falls_back_to_fresh_search() {
        let server = portal().await;
        Mock::given(method("POST"))
            .and(path("/ssgo/ssgo102/selectHmpgFmlyCsGnrlCtt.on"))
            .and(body_partial_json(json!({"dma_search": {"encCsNo": "STALE"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;
        mount_found(&server).await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        let outcome = sessions.lookup(with_enc("2024드단26718", "STALE", "w1")).await.unwrap();
        let LookupOutcome::Found(doc) = outcome else {
            panic!("expected a document, got {outcome:?}");
        };
        assert_eq!(doc.enc.unwrap().enc_case_no, "ENC123");
        assert_eq!(searches(&server).await, 1);
        assert_eq!(sessions.status().await.saved_count, 1);
    }

    #[tokio::test]
    async fn test_repeated_server_errors_open_the_breaker() {
        let server = portal().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        for _ in 0..5 {
            let err = sessions.lookup(params("2024드단26718")).await.unwrap_err();
            assert!(matches!(err, SyncError::Portal(_)), "{err}");
        }
        assert_eq!(sessions.breaker.state(), CircuitState::Open);

        let err = sessions.lookup(params("2024드단26718")).await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
        assert_eq!(searches(&server).await, 5);
    }

    #[tokio::test]
    async fn test_status_reports_source_case() {
        let server = portal().await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        let handle = sessions.establish("12345", Some("case-7")).await.unwrap();
        assert_eq!(handle.source_case_id.as_deref(), Some("case-7"));
        assert_eq!(sessions.status().await.source_case_id.as_deref(), Some("case-7"));

        sessions.invalidate().await;
        assert_eq!(sessions.status().await.source_case_id, None);
    }

    #[tokio::test]
    async fn test_full_saved_list_reports_expired() {
        let server = portal().await;
        mount_found(&server).await;
        let sessions = manager(&server, 1);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        sessions.lookup(params("2024드단26718")).await.unwrap();
        let outcome = sessions.lookup(params("2024드단99")).await.unwrap();
        assert_eq!(outcome, LookupOutcome::SessionExpired);
        assert!(sessions.current().await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_answer_is_rejected_and_session_dropped() {
        let server = portal().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": {"errorMessage": "자동입력 방지문자가 일치하지 않습니다."}
            })))
            .mount(&server)
            .await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("wrong", None).await.unwrap();

        let err = sessions.lookup(params("2024드단26718")).await.unwrap_err();
        assert!(matches!(err, SyncError::ChallengeRejected));
        assert!(sessions.current().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_result_list_is_not_found() {
        let server = portal().await;
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"dlt_csNoHistLst": []}})))
            .mount(&server)
            .await;
        let sessions = manager(&server, 50);
        sessions.begin_challenge().await.unwrap();
        sessions.establish("12345", None).await.unwrap();

        let outcome = sessions.lookup(params("2024드단26718")).await.unwrap();
        assert_eq!(outcome, LookupOutcome::NotFound);
        assert!(sessions.current().await.is_some());
    }

    #[test]
    fn test_detail_parser_bounds_and_filters_fields() {
        let long = "가".repeat(5_000);
        let body = json!({
            "data": {
                "dma_csBasCtt": {"csNm": long, "stmpAtchAmt": 15000, "jdbnNm": null},
                "dlt_csProgCtt": [{"progYmd": "20240101"}, {"progYmd": "20240102", "progCtt": "변론기일 지정"}]
            }
        });
        let enc = EncBinding { enc_case_no: "E".into(), monitor_id: "w1".into() };
        let doc = parse_detail_response("2024가단1", enc, &body).unwrap();
        assert_eq!(doc.basic["사건명"].chars().count(), MAX_FIELD_CHARS);
        assert_eq!(doc.basic["인지액"], "15000");
        assert!(!doc.basic.contains_key("재판부"));
        assert_eq!(doc.progress.len(), 1);
    }

    #[test]
    fn test_search_parser_prefers_matching_entry() {
        let body = json!({"data": {"dlt_csNoHistLst": [
            {"csNo": "20240010000001", "encCsNo": "OTHER"},
            {"csNo": "20241500026718", "encCsNo": "MINE"}
        ]}});
        let reply = parse_search_response(&body, "20241500026718");
        assert_eq!(reply.enc_case_no.as_deref(), Some("MINE"));
        assert_eq!(reply.list_len, 2);

        let hostile = json!({"data": {"dlt_csNoHistLst": [{"encCsNo": "<script>"}]}});
        assert!(parse_search_response(&hostile, "x").enc_case_no.is_none());
    }

    #[test]
    fn test_challenge_signatures() {
        for msg in ["캡챠 오류", "Captcha mismatch", "보안문자를 확인하세요"] {
            assert!(CHALLENGE_FAILURE_SIGNATURES.is_match(msg), "{msg}");
        }
        assert!(!CHALLENGE_FAILURE_SIGNATURES.is_match("사건이 존재하지 않습니다"));
    }
}
