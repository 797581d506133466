//! An open grading session: layout, tunables and the two persisted stores.

use tracing::{debug, warn};

use crate::config::{GradingConfig, Layout};
use crate::error::Result;
use crate::ledger::{Ledger, LedgerStore};
use crate::roster::Roster;

/// In-memory state of a grading session.
///
/// Engines mutate `ledger` and `roster` in place and call [`Session::flush`]
/// right after every commit, so an interruption loses at most the page being
/// worked on.
pub struct Session {
    pub layout: Layout,
    pub config: GradingConfig,
    pub ledger: Ledger,
    pub roster: Roster,
    store: LedgerStore,
}

impl Session {
    /// Load the ledger and the gradebook of the session at `layout`.
    pub fn open(layout: Layout, config: GradingConfig) -> Result<Self> {
        layout.ensure_dirs()?;
        let store = LedgerStore::new(&layout.ledger, &layout.carryover);
        let ledger = store.load()?;
        let roster = Roster::load(&layout.gradebook)?;
        if roster.is_empty() {
            warn!("Gradebook {:?} lists no students", layout.gradebook);
        }
        debug!(
            "Opened session {:?}: {} students, {} pending pages",
            layout.main_dir,
            roster.len(),
            ledger.pending_pages.len()
        );
        Ok(Self {
            layout,
            config,
            ledger,
            roster,
            store,
        })
    }

    /// Persist the ledger only.
    pub fn save_ledger(&self) -> Result<()> {
        self.store.save(&self.ledger)
    }

    /// Persist the ledger and the roster.
    pub fn flush(&self) -> Result<()> {
        self.store.save(&self.ledger)?;
        self.roster.save(&self.layout.gradebook)
    }

    /// Discard in-memory ledger changes and re-read the persisted state.
    pub fn reload(&mut self) -> Result<()> {
        self.ledger = self.store.load()?;
        self.roster = Roster::load(&self.layout.gradebook)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    pub(crate) const GRADEBOOK: &str =
        "person_number,name,qr_code\n12345678,Ada,\n50012345,Grace,\n";

    /// A session in `dir` with a two-student gradebook for exam `MTH309`.
    pub(crate) fn open_session(dir: &Path) -> Session {
        let layout = Layout::new(dir, None);
        std::fs::write(&layout.gradebook, GRADEBOOK).unwrap();
        let config = GradingConfig {
            exam_name: Some("MTH309".to_string()),
            max_points: vec![10],
            ..Default::default()
        };
        Session::open(layout, config).unwrap()
    }

    #[test]
    fn test_open_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let session = open_session(dir.path());
        assert!(session.layout.pages_dir.is_dir());
        assert!(session.layout.scans_dir.is_dir());
        assert!(session.ledger.pending_pages.is_empty());
        assert_eq!(session.roster.len(), 2);
    }

    #[test]
    fn test_flush_persists_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = open_session(dir.path());
        session.ledger.processed_scans.insert("batch.pdf".to_string());
        session.roster.assign_code("12345678", "MTH309-C002").unwrap();
        session.flush().unwrap();

        session.ledger = Ledger::default();
        session.reload().unwrap();
        assert!(session.ledger.processed_scans.contains("batch.pdf"));
        assert_eq!(session.roster.code_of("12345678"), Some("MTH309-C002"));
    }

    #[test]
    fn test_open_without_gradebook_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path(), None);
        assert!(Session::open(layout, GradingConfig::default()).is_err());
    }
}
