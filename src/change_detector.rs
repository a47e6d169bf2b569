// =============================================================================
// change_detector.rs - WHAT'S NEW SINCE LAST TIME
// =============================================================================
//
// Turns two snapshots of the same case into a list of update deltas. The
// portal gives us no change feed, so everything here is a diff:
//
//   hearings  keyed by date + time + kind
//   progress  keyed by date + first 50 characters of content, and each new
//             line is classified by keyword
//   basic     only the final result and the assigned bench are watched
//
// A first sync has nothing to diff against. It reports the next upcoming
// hearing and any final result already on record, nothing else, so a newly
// added case doesn't bury the reader under its entire history.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::classifier::CaseCategory;
use crate::models::{
    CaseSnapshot, CaseUpdate, HearingEntry, Importance, ProgressEntry, RawCaseDocument, UpdateType,
};

const FINAL_RESULT: &str = "종국결과";
const BENCH: &str = "재판부";

/// Progress keywords, checked top to bottom against the content of a new
/// progress line. First hit wins.
const PROGRESS_RULES: &[(&[&str], UpdateType, Importance)] = &[
    (&["송달"], UpdateType::DocumentServed, Importance::Normal),
    (&["제출", "접수"], UpdateType::DocumentFiled, Importance::Normal),
    (&["판결", "결정", "선고"], UpdateType::ResultAnnounced, Importance::High),
    (&["항소", "상고", "항고"], UpdateType::AppealFiled, Importance::High),
    (&["기일"], UpdateType::HearingChanged, Importance::High),
];

#[derive(Serialize)]
struct HashedContent<'a> {
    basic: &'a BTreeMap<String, String>,
    hearings: &'a [HearingEntry],
    progress: &'a [ProgressEntry],
}

/// Hex sha256 over the parts of a snapshot that come from the portal.
pub fn content_hash(
    basic: &BTreeMap<String, String>,
    hearings: &[HearingEntry],
    progress: &[ProgressEntry],
) -> String {
    let content = HashedContent { basic, hearings, progress };
    // Serializing borrowed maps and vecs of strings cannot fail.
    let bytes = serde_json::to_vec(&content).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

pub fn build_snapshot(
    case_id: &str,
    category: CaseCategory,
    document: RawCaseDocument,
    captured_at: DateTime<Utc>,
) -> CaseSnapshot {
    let content_hash = content_hash(&document.basic, &document.hearings, &document.progress);
    CaseSnapshot {
        case_id: case_id.to_string(),
        category,
        basic: document.basic,
        hearings: document.hearings,
        progress: document.progress,
        content_hash,
        captured_at,
    }
}

/// Diff `new` against `old`. `today` decides which hearings are upcoming.
pub fn detect_changes(old: Option<&CaseSnapshot>, new: &CaseSnapshot, today: NaiveDate) -> Vec<CaseUpdate> {
    let Some(old) = old else {
        return initial_updates(new, today);
    };
    if old.content_hash == new.content_hash {
        return Vec::new();
    }

    let mut updates = hearing_changes(&old.hearings, &new.hearings, today);
    updates.extend(progress_changes(&old.progress, &new.progress));
    updates.extend(basic_changes(&old.basic, &new.basic));
    updates
}

fn initial_updates(snapshot: &CaseSnapshot, today: NaiveDate) -> Vec<CaseUpdate> {
    let mut updates = Vec::new();

    if let Some(next) = next_hearing(&snapshot.hearings, today) {
        updates.push(CaseUpdate {
            update_type: UpdateType::HearingNew,
            summary: format!("{} {} {}", next.date, next.time, next.kind),
            importance: Importance::High,
            old_value: None,
            new_value: Some(next.key()),
        });
    }

    if let Some(result) = non_blank(snapshot.basic.get(FINAL_RESULT)) {
        updates.push(CaseUpdate {
            update_type: UpdateType::ResultAnnounced,
            summary: result.to_string(),
            importance: Importance::High,
            old_value: None,
            new_value: Some(result.to_string()),
        });
    }

    updates
}

fn hearing_changes(old: &[HearingEntry], new: &[HearingEntry], today: NaiveDate) -> Vec<CaseUpdate> {
    let old_by_key: HashMap<String, &HearingEntry> = old.iter().map(|h| (h.key(), h)).collect();
    let new_keys: HashSet<String> = new.iter().map(HearingEntry::key).collect();
    let mut updates = Vec::new();

    for hearing in new {
        match old_by_key.get(&hearing.key()) {
            None => updates.push(CaseUpdate {
                update_type: UpdateType::HearingNew,
                summary: format!("{} {} {} 지정", hearing.date, hearing.time, hearing.kind),
                importance: Importance::High,
                old_value: None,
                new_value: Some(hearing.key()),
            }),
            Some(previous) => {
                let had_result = non_blank(previous.result.as_ref()).is_some();
                if let Some(result) = non_blank(hearing.result.as_ref()).filter(|_| !had_result) {
                    updates.push(CaseUpdate {
                        update_type: UpdateType::HearingResult,
                        summary: format!("{} {}: {}", hearing.date, hearing.kind, result),
                        importance: Importance::High,
                        old_value: None,
                        new_value: Some(result.to_string()),
                    });
                }
            }
        }
    }

    for hearing in old {
        let upcoming = parse_date(&hearing.date).map(|d| d >= today).unwrap_or(false);
        if upcoming && !new_keys.contains(&hearing.key()) {
            updates.push(CaseUpdate {
                update_type: UpdateType::HearingCanceled,
                summary: format!("{} {} 취소", hearing.date, hearing.kind),
                importance: Importance::High,
                old_value: Some(hearing.key()),
                new_value: None,
            });
        }
    }

    updates
}

fn progress_changes(old: &[ProgressEntry], new: &[ProgressEntry]) -> Vec<CaseUpdate> {
    let seen: HashSet<String> = old.iter().map(ProgressEntry::key).collect();
    new.iter()
        .filter(|entry| !seen.contains(&entry.key()))
        .map(classify_progress)
        .collect()
}

/// Classify one new progress line.
pub fn classify_progress(entry: &ProgressEntry) -> CaseUpdate {
    if let Some(result) = entry.result.as_deref().filter(|r| r.contains("도달")) {
        return CaseUpdate {
            update_type: UpdateType::Served,
            summary: format!("{} ({})", entry.content, result),
            importance: Importance::Normal,
            old_value: None,
            new_value: Some(result.to_string()),
        };
    }

    let (update_type, importance) = PROGRESS_RULES
        .iter()
        .find(|(words, _, _)| words.iter().any(|w| entry.content.contains(w)))
        .map(|(_, kind, importance)| (*kind, *importance))
        .unwrap_or((UpdateType::Other, Importance::Low));

    CaseUpdate {
        update_type,
        summary: entry.content.clone(),
        importance,
        old_value: None,
        new_value: Some(entry.date.clone()),
    }
}

fn basic_changes(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<CaseUpdate> {
    let mut updates = Vec::new();

    let watched = [
        (FINAL_RESULT, UpdateType::ResultAnnounced, Importance::High, "종국결과"),
        (BENCH, UpdateType::StatusChanged, Importance::Normal, "재판부 변경"),
    ];
    for (field, update_type, importance, prefix) in watched {
        let before = old.get(field);
        let Some(after) = non_blank(new.get(field)) else { continue };
        if before.map(String::as_str) != Some(after) {
            updates.push(CaseUpdate {
                update_type,
                summary: format!("{prefix}: {after}"),
                importance,
                old_value: before.cloned(),
                new_value: Some(after.to_string()),
            });
        }
    }

    updates
}

/// Earliest hearing on or after `today` that has no result yet.
pub fn next_hearing(hearings: &[HearingEntry], today: NaiveDate) -> Option<&HearingEntry> {
    hearings
        .iter()
        .filter(|h| non_blank(h.result.as_ref()).is_none())
        .filter_map(|h| parse_date(&h.date).filter(|d| *d >= today).map(|d| (d, h)))
        .min_by(|(a, ha), (b, hb)| a.cmp(b).then_with(|| ha.time.cmp(&hb.time)))
        .map(|(_, h)| h)
}

/// Accepts `YYYYMMDD`, `YYYY.MM.DD` and `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(&digits, "%Y%m%d").ok()
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}
