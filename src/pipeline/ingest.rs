//! Structured report → persisted labs, once per distinct visit.
//!
//! A visit is identified by `(pet_id, visit_date, source_path)`. For each
//! visit the ingestor looks the key up and skips it when present; otherwise
//! it inserts a lab plus its tests. All visits of one document share one
//! unit of work, so a bad date in visit 3 leaves visits 1 and 2 unwritten.
//!
//! Two writers racing on the same key are resolved by the store's unique
//! index: the loser sees [`InsertOutcome::Conflict`] and skips the visit.

use crate::error::{IngestError, PersistenceError, SchemaError};
use crate::model::{LabReport, LabWithTests, NewLab, TestRecord, UNKNOWN_DATE};
use crate::progress::ProgressCallback;
use crate::store::{InsertOutcome, LabStore};
use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a visit was not inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// `find_by` returned an existing lab.
    AlreadyPresent { lab_id: i64 },
    /// The unique index rejected the insert (concurrent writer).
    Conflict,
}

/// A visit that was not inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedVisit {
    /// Position of the visit in the report.
    pub index: usize,
    pub visit_date: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// What one ingestion wrote and what it skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestSummary {
    pub inserted: Vec<LabWithTests>,
    pub skipped: Vec<SkippedVisit>,
}

/// Persists visits with deduplication.
#[derive(Clone)]
pub struct DeduplicatingIngestor {
    store: Arc<dyn LabStore>,
    progress: Option<ProgressCallback>,
}

impl DeduplicatingIngestor {
    pub fn new(store: Arc<dyn LabStore>) -> Self {
        Self {
            store,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Persist every visit of `report` for `subject_id`. Blocking.
    ///
    /// # Errors
    /// - [`SchemaError::InvalidVisitDate`] when any visit carries a date that
    ///   is neither `YYYY-MM-DD` nor "unknown"; nothing is written.
    /// - [`PersistenceError`] on any database failure; nothing is written.
    pub fn ingest(
        &self,
        report: &LabReport,
        subject_id: i64,
        source_path: &str,
    ) -> Result<IngestSummary, IngestError> {
        let dates = report
            .visits
            .iter()
            .enumerate()
            .map(|(index, visit)| normalize_visit_date(&visit.visit_date, index))
            .collect::<Result<Vec<_>, _>>()?;

        let mut uow = self.store.begin()?;
        let mut summary = IngestSummary::default();

        for (index, (visit, visit_date)) in report.visits.iter().zip(dates).enumerate() {
            let label = visit_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| UNKNOWN_DATE.to_string());

            if let Some(existing) = uow.find_by(subject_id, visit_date, source_path)? {
                if summary.inserted.iter().any(|l| l.lab.id == existing.id) {
                    warn!(
                        "Visit {} repeats the key of an earlier visit in {} (pet {}, {}); skipping",
                        index, source_path, subject_id, label
                    );
                } else {
                    info!(
                        "Duplicate lab for pet {} on {} from {}; skipping",
                        subject_id, label, source_path
                    );
                }
                self.record_skip(
                    &mut summary,
                    index,
                    label,
                    SkipReason::AlreadyPresent {
                        lab_id: existing.id,
                    },
                );
                continue;
            }

            let new_lab = NewLab {
                pet_id: subject_id,
                visit_date,
                content_hash: content_hash(&visit.records)?,
                source_path: source_path.to_string(),
            };

            match uow.insert_lab(&new_lab, &visit.records)? {
                InsertOutcome::Inserted(lab) => {
                    debug!(
                        "Inserted lab {} (pet {}, {}, {} tests)",
                        lab.lab.id,
                        subject_id,
                        label,
                        lab.tests.len()
                    );
                    summary.inserted.push(lab);
                }
                InsertOutcome::Conflict => {
                    info!(
                        "Lab for pet {} on {} was written concurrently; skipping",
                        subject_id, label
                    );
                    self.record_skip(&mut summary, index, label, SkipReason::Conflict);
                }
            }
        }

        uow.commit()?;
        info!(
            "Ingested {} of {} visits for pet {} ({} skipped)",
            summary.inserted.len(),
            report.visits.len(),
            subject_id,
            summary.skipped.len()
        );
        Ok(summary)
    }

    fn record_skip(
        &self,
        summary: &mut IngestSummary,
        index: usize,
        visit_date: String,
        reason: SkipReason,
    ) {
        if let Some(ref cb) = self.progress {
            cb.on_visit_skipped(index, &visit_date);
        }
        summary.skipped.push(SkippedVisit {
            index,
            visit_date,
            reason,
        });
    }
}

/// `"unknown"` (any case), empty or blank → `None`; otherwise `YYYY-MM-DD`.
pub fn normalize_visit_date(raw: &str, index: usize) -> Result<Option<NaiveDate>, SchemaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_DATE) {
        return Ok(None);
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| SchemaError::InvalidVisitDate {
            index,
            value: raw.to_string(),
        })
}

/// SHA-256 (hex) of the records' canonical JSON, independent of their order.
pub fn content_hash(records: &[TestRecord]) -> Result<String, PersistenceError> {
    let mut sorted = records.to_vec();
    sorted.sort();
    let canonical =
        serde_json::to_vec(&sorted).map_err(|e| PersistenceError::Encode(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Lab, Visit};
    use crate::store::{LabUnitOfWork, SqliteLabStore};

    fn visit(date: &str, records: Vec<TestRecord>) -> Visit {
        Visit {
            visit_date: date.to_string(),
            records,
            notes: String::new(),
        }
    }

    fn report(visits: Vec<Visit>) -> LabReport {
        LabReport { pet_id: 1, visits }
    }

    fn glucose() -> TestRecord {
        TestRecord::new("Glucose", "95", "mg/dL", "70-110")
    }

    fn alt() -> TestRecord {
        TestRecord::new("ALT", "40", "U/L", "10-100")
    }

    fn ingestor() -> (DeduplicatingIngestor, Arc<SqliteLabStore>) {
        let store = Arc::new(SqliteLabStore::open_in_memory().unwrap());
        (DeduplicatingIngestor::new(store.clone()), store)
    }

    #[test]
    fn hash_is_order_independent() {
        assert_eq!(
            content_hash(&[glucose(), alt()]).unwrap(),
            content_hash(&[alt(), glucose()]).unwrap()
        );
        assert_ne!(
            content_hash(&[glucose()]).unwrap(),
            content_hash(&[alt()]).unwrap()
        );
        assert_eq!(content_hash(&[]).unwrap().len(), 64);
    }

    #[test]
    fn same_name_different_values_hash_stably() {
        let a = TestRecord::new("WBC", "5.1", "K/uL", "");
        let b = TestRecord::new("WBC", "6.2", "K/uL", "");
        assert_eq!(
            content_hash(&[a.clone(), b.clone()]).unwrap(),
            content_hash(&[b, a]).unwrap()
        );
    }

    #[test]
    fn date_normalisation() {
        assert_eq!(normalize_visit_date("unknown", 0).unwrap(), None);
        assert_eq!(normalize_visit_date("UNKNOWN", 0).unwrap(), None);
        assert_eq!(normalize_visit_date("  ", 0).unwrap(), None);
        assert_eq!(
            normalize_visit_date("2024-01-05", 0).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert!(matches!(
            normalize_visit_date("05/01/2024", 3),
            Err(SchemaError::InvalidVisitDate { index: 3, .. })
        ));
    }

    #[test]
    fn second_ingestion_is_skipped() {
        let (ingestor, store) = ingestor();
        let r = report(vec![visit("2024-01-05", vec![glucose()])]);

        let first = ingestor.ingest(&r, 1, "files/1/a.json").unwrap();
        assert_eq!(first.inserted.len(), 1);

        let second = ingestor.ingest(&r, 1, "files/1/a.json").unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.skipped.len(), 1);
        assert!(matches!(
            second.skipped[0].reason,
            SkipReason::AlreadyPresent { lab_id } if lab_id == first.inserted[0].lab.id
        ));

        let labs = store.labs_for_subject(1).unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].tests.len(), 1);
    }

    #[test]
    fn different_source_is_a_new_lab() {
        let (ingestor, store) = ingestor();
        let r = report(vec![visit("2024-01-05", vec![glucose()])]);
        ingestor.ingest(&r, 1, "files/1/a.json").unwrap();
        ingestor.ingest(&r, 1, "files/1/b.json").unwrap();
        assert_eq!(store.labs_for_subject(1).unwrap().len(), 2);
    }

    #[test]
    fn bad_date_rolls_back_whole_document() {
        let (ingestor, store) = ingestor();
        let r = report(vec![
            visit("2024-01-05", vec![glucose()]),
            visit("not a date", vec![alt()]),
        ]);
        let err = ingestor.ingest(&r, 1, "a.json").unwrap_err();
        assert!(matches!(
            err,
            IngestError::Schema(SchemaError::InvalidVisitDate { index: 1, .. })
        ));
        assert!(store.labs_for_subject(1).unwrap().is_empty());
    }

    #[test]
    fn repeated_unknown_visit_in_one_document_is_skipped() {
        let (ingestor, store) = ingestor();
        let r = report(vec![
            visit("unknown", vec![glucose()]),
            visit("unknown", vec![alt()]),
        ]);
        let summary = ingestor.ingest(&r, 1, "a.json").unwrap();
        assert_eq!(summary.inserted.len(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].index, 1);
        assert_eq!(summary.skipped[0].visit_date, "unknown");

        let labs = store.labs_for_subject(1).unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].lab.visit_date, None);
        assert_eq!(labs[0].tests[0].test_name, "Glucose");
    }

    /// Store whose unique index "loses the race" for the given dates:
    /// `find_by` sees nothing, then `insert_lab` reports a conflict.
    struct RacingStore {
        contested: Vec<Option<NaiveDate>>,
        committed: std::sync::Mutex<Vec<NewLab>>,
        commits: std::sync::atomic::AtomicUsize,
    }

    struct RacingUnit<'a> {
        store: &'a RacingStore,
        pending: Vec<NewLab>,
    }

    impl LabStore for RacingStore {
        fn begin(&self) -> Result<Box<dyn LabUnitOfWork + '_>, PersistenceError> {
            Ok(Box::new(RacingUnit {
                store: self,
                pending: Vec::new(),
            }))
        }

        fn labs_for_subject(&self, _pet_id: i64) -> Result<Vec<LabWithTests>, PersistenceError> {
            Ok(Vec::new())
        }

        fn delete_subject(&self, _pet_id: i64) -> Result<usize, PersistenceError> {
            Ok(0)
        }
    }

    impl LabUnitOfWork for RacingUnit<'_> {
        fn find_by(
            &mut self,
            _pet_id: i64,
            _visit_date: Option<NaiveDate>,
            _source_path: &str,
        ) -> Result<Option<Lab>, PersistenceError> {
            Ok(None)
        }

        fn insert_lab(
            &mut self,
            lab: &NewLab,
            _records: &[TestRecord],
        ) -> Result<InsertOutcome, PersistenceError> {
            if self.store.contested.contains(&lab.visit_date) {
                return Ok(InsertOutcome::Conflict);
            }
            self.pending.push(lab.clone());
            Ok(InsertOutcome::Inserted(LabWithTests {
                lab: Lab {
                    id: self.pending.len() as i64,
                    pet_id: lab.pet_id,
                    visit_date: lab.visit_date,
                    created_at: chrono::Utc::now(),
                    content_hash: lab.content_hash.clone(),
                    source_path: lab.source_path.clone(),
                },
                tests: Vec::new(),
            }))
        }

        fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
            let RacingUnit { store, pending } = *self;
            store.commits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            store.committed.lock().unwrap().extend(pending);
            Ok(())
        }
    }

    #[test]
    fn concurrent_conflict_skips_visit_and_keeps_the_rest() {
        let contested = NaiveDate::from_ymd_opt(2024, 1, 5);
        let store = Arc::new(RacingStore {
            contested: vec![contested],
            committed: std::sync::Mutex::new(Vec::new()),
            commits: std::sync::atomic::AtomicUsize::new(0),
        });
        let ingestor = DeduplicatingIngestor::new(store.clone());
        let r = report(vec![
            visit("2024-01-05", vec![glucose()]),
            visit("2024-03-09", vec![alt()]),
        ]);

        let summary = ingestor.ingest(&r, 1, "files/1/a.json").unwrap();

        assert_eq!(
            summary.skipped,
            vec![SkippedVisit {
                index: 0,
                visit_date: "2024-01-05".to_string(),
                reason: SkipReason::Conflict,
            }]
        );
        assert_eq!(summary.inserted.len(), 1);
        assert_eq!(
            summary.inserted[0].lab.visit_date,
            NaiveDate::from_ymd_opt(2024, 3, 9)
        );
        assert_eq!(store.commits.load(std::sync::atomic::Ordering::SeqCst), 1);
        let committed = store.committed.lock().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].visit_date, NaiveDate::from_ymd_opt(2024, 3, 9));
    }

    #[test]
    fn skipped_visits_reach_the_progress_callback() {
        use crate::progress::IngestProgressCallback;
        use std::sync::Mutex;

        struct Skips(Mutex<Vec<(usize, String)>>);
        impl IngestProgressCallback for Skips {
            fn on_visit_skipped(&self, visit_index: usize, visit_date: &str) {
                self.0.lock().unwrap().push((visit_index, visit_date.to_string()));
            }
        }

        let skips = Arc::new(Skips(Mutex::new(Vec::new())));
        let store = Arc::new(SqliteLabStore::open_in_memory().unwrap());
        let ingestor = DeduplicatingIngestor::new(store).with_progress(Some(skips.clone()));
        let r = report(vec![visit("2024-02-02", vec![alt()])]);
        ingestor.ingest(&r, 4, "a.json").unwrap();
        ingestor.ingest(&r, 4, "a.json").unwrap();

        assert_eq!(
            *skips.0.lock().unwrap(),
            vec![(0, "2024-02-02".to_string())]
        );
    }
}
