//! Dimensional memory records, the friction counter that scaffolds them,
//! the auto-promotion lane, and the human override drop folder.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::error::WardenErr;

const MEMORY_SUBDIR: &str = "memory";
const RECORDS_FILE: &str = "records.json";
const PROCESSED_SUFFIX: &str = ".processed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementType {
    FewShot,
    PlanRule,
    StrategySignal,
    Informational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLifecycle {
    Pending,
    Provisional,
    Approved,
    Rejected,
    Expired,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// What caused this record to exist (e.g. a rejection code, or
    /// `human_override`).
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub enforcement_type: EnforcementType,
    pub lifecycle: MemoryLifecycle,
    /// Folder-derived scopes this record attaches to. Empty means global.
    #[serde(default)]
    pub anchors: Vec<String>,
    /// Enforcement payload; shape depends on the enforcement type. Blank
    /// for friction scaffolds awaiting human completion.
    #[serde(default)]
    pub payload: JsonValue,
    pub provenance: Provenance,
}

impl MemoryRecord {
    pub fn is_active(&self) -> bool {
        matches!(
            self.lifecycle,
            MemoryLifecycle::Provisional | MemoryLifecycle::Approved
        )
    }

    /// Whether this record attaches to any of the given anchors.
    pub fn attaches_to(&self, anchors: &[String]) -> bool {
        self.anchors.is_empty() || self.anchors.iter().any(|a| anchors.contains(a))
    }

    /// Low-risk records auto-promote; `plan_rule` and anything flagged
    /// destructive waits for a human.
    fn is_auto_promotable(&self) -> bool {
        if self.enforcement_type == EnforcementType::PlanRule {
            return false;
        }
        !self
            .payload
            .get("destructive")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}

/// Shape accepted from the override drop folder.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct OverrideFile {
    enforcement_type: EnforcementType,
    #[serde(default)]
    anchors: Vec<String>,
    payload: JsonValue,
}

/// JSON-backed store under `<state>/memory/records.json`. The whole record
/// set is small enough to rewrite on every mutation.
pub struct MemoryStore {
    path: PathBuf,
    records: Mutex<Vec<MemoryRecord>>,
}

impl MemoryStore {
    pub fn load(state_root: &Path) -> Result<Self> {
        let dir = state_root.join(MEMORY_SUBDIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(RECORDS_FILE);
        let records = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| WardenErr::MemoryStore(format!("corrupt records file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &[MemoryRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Active (approved or provisional) records attached to the anchors.
    pub fn active_for_anchors(&self, anchors: &[String]) -> Vec<MemoryRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| r.is_active() && r.attaches_to(anchors))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<MemoryRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.clone()
    }

    pub fn append(&self, record: MemoryRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record);
        self.persist(&records)
    }

    /// Scaffold a pending candidate after repeated rejections. The payload
    /// is intentionally left blank for human completion.
    pub fn scaffold_friction_candidate(
        &self,
        rejection_code: &str,
        anchors: Vec<String>,
        trace_ref: &str,
    ) -> Result<MemoryRecord> {
        let now = Utc::now();
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            enforcement_type: EnforcementType::Informational,
            lifecycle: MemoryLifecycle::Pending,
            anchors,
            payload: JsonValue::Null,
            provenance: Provenance {
                trigger: rejection_code.to_string(),
                trace_ref: Some(trace_ref.to_string()),
                created_at: now,
                updated_at: now,
            },
        };
        self.append(record.clone())?;
        Ok(record)
    }

    /// Promote pending records whose contest window has elapsed to
    /// provisional, low-risk types only. Returns `(id, trigger)` per
    /// promoted record.
    pub fn promote_elapsed(&self, contest_window_hours: i64) -> Result<Vec<(String, String)>> {
        let now = Utc::now();
        let window = Duration::hours(contest_window_hours);
        let mut promoted = Vec::new();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        for record in records.iter_mut() {
            if record.lifecycle == MemoryLifecycle::Pending
                && record.is_auto_promotable()
                && now - record.provenance.created_at >= window
            {
                record.lifecycle = MemoryLifecycle::Provisional;
                record.provenance.updated_at = now;
                promoted.push((record.id.clone(), record.provenance.trigger.clone()));
            }
        }
        if !promoted.is_empty() {
            self.persist(&records)?;
        }
        Ok(promoted)
    }

    /// Scan the drop folder, append each valid override as an approved
    /// record, and rename the source file with a processed suffix. Invalid
    /// files are left in place and logged.
    pub fn ingest_overrides(&self, overrides_dir: &Path) -> Result<Vec<MemoryRecord>> {
        let entries = match std::fs::read_dir(overrides_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ingested = Vec::new();
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && !p.to_string_lossy().ends_with(PROCESSED_SUFFIX)
            })
            .collect();
        paths.sort();

        for path in paths {
            let contents = std::fs::read_to_string(&path)?;
            let parsed: OverrideFile = match serde_json::from_str(&contents) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("skipping invalid override {}: {e}", path.display());
                    continue;
                }
            };
            let now = Utc::now();
            let record = MemoryRecord {
                id: Uuid::new_v4().to_string(),
                enforcement_type: parsed.enforcement_type,
                // Human overrides bypass the contest window entirely.
                lifecycle: MemoryLifecycle::Approved,
                anchors: parsed.anchors,
                payload: parsed.payload,
                provenance: Provenance {
                    trigger: "human_override".to_string(),
                    trace_ref: Some(path.display().to_string()),
                    created_at: now,
                    updated_at: now,
                },
            };
            self.append(record.clone())?;

            let mut processed = path.clone().into_os_string();
            processed.push(PROCESSED_SUFFIX);
            if let Err(e) = std::fs::rename(&path, &processed) {
                tracing::warn!("failed to mark override processed {}: {e}", path.display());
            }
            ingested.push(record);
        }
        Ok(ingested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::load(dir.path()).expect("load");
        (dir, store)
    }

    fn pending_record(enforcement_type: EnforcementType, age_hours: i64) -> MemoryRecord {
        let created = Utc::now() - Duration::hours(age_hours);
        MemoryRecord {
            id: Uuid::new_v4().to_string(),
            enforcement_type,
            lifecycle: MemoryLifecycle::Pending,
            anchors: vec![],
            payload: JsonValue::Null,
            provenance: Provenance {
                trigger: "PLAN_SCOPE_VIOLATION".to_string(),
                trace_ref: None,
                created_at: created,
                updated_at: created,
            },
        }
    }

    #[test]
    fn promotion_skips_plan_rules_and_fresh_records() {
        let (_dir, store) = store();
        store
            .append(pending_record(EnforcementType::StrategySignal, 72))
            .expect("append");
        store
            .append(pending_record(EnforcementType::PlanRule, 72))
            .expect("append");
        store
            .append(pending_record(EnforcementType::StrategySignal, 1))
            .expect("append");

        let promoted = store.promote_elapsed(48).expect("promote");
        assert_eq!(promoted.len(), 1);

        let records = store.all();
        let provisional = records
            .iter()
            .filter(|r| r.lifecycle == MemoryLifecycle::Provisional)
            .count();
        assert_eq!(provisional, 1);
    }

    #[test]
    fn destructive_payloads_stay_pending() {
        let (_dir, store) = store();
        let mut record = pending_record(EnforcementType::StrategySignal, 72);
        record.payload = serde_json::json!({"destructive": true});
        store.append(record).expect("append");

        let promoted = store.promote_elapsed(48).expect("promote");
        assert!(promoted.is_empty());
    }

    #[test]
    fn overrides_are_ingested_and_marked_processed() {
        let (dir, store) = store();
        let overrides = dir.path().join("overrides");
        std::fs::create_dir_all(&overrides).expect("mkdir");
        std::fs::write(
            overrides.join("alias.json"),
            r#"{"enforcementType":"strategy_signal","anchors":["src"],"payload":{"feature":"uiGrid","value":true}}"#,
        )
        .expect("write");
        std::fs::write(overrides.join("broken.json"), "{not json").expect("write");

        let ingested = store.ingest_overrides(&overrides).expect("ingest");
        assert_eq!(ingested.len(), 1);
        assert_eq!(ingested[0].lifecycle, MemoryLifecycle::Approved);
        assert!(overrides.join("alias.json.processed").exists());
        assert!(overrides.join("broken.json").exists());

        // A second scan must not double-ingest.
        let again = store.ingest_overrides(&overrides).expect("ingest");
        assert!(again.is_empty());
    }

    #[test]
    fn anchor_filtering_respects_attachment() {
        let (_dir, store) = store();
        let mut record = pending_record(EnforcementType::Informational, 0);
        record.lifecycle = MemoryLifecycle::Approved;
        record.anchors = vec!["src/grid".to_string()];
        store.append(record).expect("append");

        let hits = store.active_for_anchors(&["src/grid".to_string()]);
        assert_eq!(hits.len(), 1);
        let misses = store.active_for_anchors(&["docs".to_string()]);
        assert!(misses.is_empty());
    }
}
