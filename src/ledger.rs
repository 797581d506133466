//! Persistent bookkeeping of a grading session.
//!
//! The ledger is read and written as a whole: callers load it, mutate it in
//! memory, and save it back. Saves go through a temporary file and a rename so
//! an interrupted write never leaves a truncated ledger behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::identity::IdentityCode;

/// The full persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// Page number -> maximum achievable score (0 = no score table).
    #[serde(default)]
    pub max_score_per_page: BTreeMap<u32, u32>,
    /// Scan batch file names already folded into the pipeline.
    #[serde(default)]
    pub processed_scans: BTreeSet<String>,
    /// Aggregate document name -> ordered constituent page document names.
    #[serde(default)]
    pub aggregate_page_lists: BTreeMap<String, Vec<String>>,
    /// Pages still waiting for a code and/or a student id, in carryover order.
    #[serde(default)]
    pub pending_pages: Vec<PendingPage>,
    /// Addresses already notified about their graded exam.
    #[serde(default)]
    pub notified_recipients: BTreeSet<String>,
}

/// A scanned page whose identity is not fully resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPage {
    pub source_file: String,
    pub source_page_index: usize,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
}

impl PendingPage {
    pub fn is_from(&self, source_file: &str, source_page_index: usize) -> bool {
        self.source_file == source_file && self.source_page_index == source_page_index
    }
}

impl Ledger {
    pub fn is_pending(&self, source_file: &str, source_page_index: usize) -> bool {
        self.pending_pages
            .iter()
            .any(|p| p.is_from(source_file, source_page_index))
    }

    /// Name of the aggregate that already holds a page with this code, if any.
    pub fn aggregate_holding(&self, code: &IdentityCode) -> Option<&str> {
        let wanted = code.without_table();
        self.aggregate_page_lists
            .iter()
            .find(|(_, pages)| {
                pages.iter().any(|p| {
                    IdentityCode::from_file_name(p)
                        .map(|c| c.without_table() == wanted)
                        .unwrap_or(false)
                })
            })
            .map(|(name, _)| name.as_str())
    }
}

/// File-backed store for the [`Ledger`].
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
    carryover: PathBuf,
}

impl LedgerStore {
    /// `carryover` is the pending-data scratch file discarded on reset.
    pub fn new(path: impl Into<PathBuf>, carryover: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            carryover: carryover.into(),
        }
    }

    /// Current persisted state, or the initial empty state if none exists yet.
    pub fn load(&self) -> Result<Ledger> {
        if !self.path.exists() {
            debug!("No ledger at {:?}, starting empty", self.path);
            return Ok(Ledger::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Atomically replace the persisted state.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let json = serde_json::to_vec_pretty(ledger)?;
        write_atomic(&self.path, &json)
    }

    /// Restore the initial state and discard the pending-data scratch file.
    pub fn reset(&self) -> Result<Ledger> {
        let ledger = Ledger::default();
        self.save(&ledger)?;
        if self.carryover.exists() {
            fs::remove_file(&self.carryover)?;
        }
        info!("Ledger reset: {:?}", self.path);
        Ok(ledger)
    }
}

/// Write `bytes` next to `path` and rename over it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> LedgerStore {
        LedgerStore::new(dir.join("grading_data.json"), dir.join("missing_data.pdf"))
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = store(dir.path()).load().unwrap();
        assert_eq!(ledger, Ledger::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut ledger = Ledger::default();
        ledger.max_score_per_page.insert(3, 10);
        ledger.processed_scans.insert("batch1.pdf".to_string());
        ledger.aggregate_page_lists.insert(
            "MTH309_page_3.pdf".to_string(),
            vec!["t_MTH309-C001-P03.pdf".to_string()],
        );
        ledger.pending_pages.push(PendingPage {
            source_file: "batch1.pdf".to_string(),
            source_page_index: 4,
            code: Some("MTH309-C002-P00".to_string()),
            student_id: None,
        });
        store.save(&ledger).unwrap();

        assert_eq!(store.load().unwrap(), ledger);
        // No temporary file is left behind
        assert!(!dir.path().join("grading_data.json.tmp").exists());
    }

    #[test]
    fn test_reset_discards_carryover() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut ledger = Ledger::default();
        ledger.processed_scans.insert("a.pdf".to_string());
        store.save(&ledger).unwrap();
        fs::write(dir.path().join("missing_data.pdf"), b"%PDF").unwrap();

        let ledger = store.reset().unwrap();
        assert_eq!(ledger, Ledger::default());
        assert_eq!(store.load().unwrap(), Ledger::default());
        assert!(!dir.path().join("missing_data.pdf").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("grading_data.json"), b"{not json").unwrap();
        assert!(store(dir.path()).load().is_err());
    }

    #[test]
    fn test_missing_fields_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("grading_data.json"),
            br#"{"processed_scans": ["x.pdf"]}"#,
        )
        .unwrap();
        let ledger = store(dir.path()).load().unwrap();
        assert!(ledger.processed_scans.contains("x.pdf"));
        assert!(ledger.pending_pages.is_empty());
    }

    #[test]
    fn test_aggregate_holding_ignores_table_marker() {
        let mut ledger = Ledger::default();
        ledger.aggregate_page_lists.insert(
            "MTH309_page_3.pdf".to_string(),
            vec!["t_MTH309-C001-P03.pdf".to_string()],
        );
        let code = IdentityCode::parse("MTH309-C001-P03").unwrap();
        assert_eq!(ledger.aggregate_holding(&code), Some("MTH309_page_3.pdf"));
        let other = IdentityCode::parse("MTH309-C002-P03").unwrap();
        assert_eq!(ledger.aggregate_holding(&other), None);
    }
}
