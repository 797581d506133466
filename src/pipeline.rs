//! The grading preparation pass, end to end.
//!
//! scans -> committed pages (or pending) -> score tables -> aggregates

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::aggregate::{AggregateReport, AggregationEngine};
use crate::config::Layout;
use crate::error::Result;
use crate::ledger::LedgerStore;
use crate::reconcile::{BatchReport, ReconciliationEngine, Resolver};
use crate::score_table;
use crate::session::Session;

/// Which scan batches a preparation pass reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSelection {
    /// Batches not yet marked processed in the ledger.
    New,
    /// Every batch in `scans/`, processed or not.
    All,
    /// The named batches, looked up in `scans/`.
    Only(Vec<String>),
}

/// What a preparation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrepareReport {
    /// Batches read, in the order they were processed.
    pub scans: Vec<String>,
    pub pages: BatchReport,
    /// Table-marked page copies written.
    pub stamped: usize,
    pub aggregates: AggregateReport,
    /// Pages still waiting for a code or a student after the pass.
    pub pending: usize,
}

/// Scan batches in `scans/`, sorted by name, without the carryover bundle.
pub fn list_scans(layout: &Layout) -> Result<Vec<String>> {
    let carryover = layout.carryover_name();
    let mut names = Vec::new();
    if !layout.scans_dir.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(&layout.scans_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(".pdf") && name != carryover {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn select_scans(session: &Session, selection: &ScanSelection) -> Result<Vec<PathBuf>> {
    let layout = &session.layout;
    let names = match selection {
        ScanSelection::New => list_scans(layout)?
            .into_iter()
            .filter(|n| !session.ledger.processed_scans.contains(n))
            .collect(),
        ScanSelection::All => list_scans(layout)?,
        ScanSelection::Only(names) => {
            let mut names: Vec<String> = names
                .iter()
                .filter_map(|n| {
                    let base = PathBuf::from(n).file_name()?.to_string_lossy().into_owned();
                    if layout.scans_dir.join(&base).exists() {
                        Some(base)
                    } else {
                        warn!("Scan file {:?} not found, omitting", n);
                        None
                    }
                })
                .collect();
            names.sort();
            names.dedup();
            names
        }
    };
    Ok(names.into_iter().map(|n| layout.scans_dir.join(n)).collect())
}

/// Read the selected scan batches, revisit the pending pages, stamp score
/// tables and bring the aggregates up to date.
///
/// Batches are always read in batch mode. The pending pages, including the
/// ones just deferred, are then visited once more, interactively when a
/// resolver is given.
pub fn prepare_grading(
    session: &mut Session,
    engine: &ReconciliationEngine,
    selection: &ScanSelection,
    resolver: Option<&mut dyn Resolver>,
) -> Result<PrepareReport> {
    let scans = select_scans(session, selection)?;
    let mut report = PrepareReport {
        scans: scans
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect(),
        ..Default::default()
    };
    info!("Reading {} scan files", scans.len());

    report.pages = engine.process_scans(session, &scans, None)?;
    let resolved = engine.resolve_pending(session, resolver)?;
    report.pages.committed.extend(resolved.committed);
    report.pages.already_committed.extend(resolved.already_committed);

    let (stamped, aggregates) = finish_pass(session)?;
    report.stamped = stamped;
    report.aggregates = aggregates;
    report.pending = session.ledger.pending_pages.len();
    report.pages.deferred = report.pending;

    if report.pending > 0 {
        warn!(
            "{} pages are missing an identity code or a person number",
            report.pending
        );
    } else {
        info!("All pages were processed successfully");
    }
    Ok(report)
}

/// Stamp score tables on newly committed pages and fold them into the
/// aggregates.
pub fn finish_pass(session: &mut Session) -> Result<(usize, AggregateReport)> {
    let stamped = score_table::add_score_tables(session)?;
    let aggregates = AggregationEngine::sync(session)?;
    Ok((stamped, aggregates))
}

/// Forget all progress: empty ledger, no carryover, no committed pages.
///
/// The aggregates the ledger lists go too, since a page list is what lets a
/// later pass extend them. The gradebook is left on disk.
pub fn reset(layout: &Layout) -> Result<()> {
    let store = LedgerStore::new(&layout.ledger, &layout.carryover);
    for name in store.load()?.aggregate_page_lists.keys() {
        let path = layout.for_grading_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            debug!("Removed {:?}", path);
        }
    }
    store.reset()?;
    if layout.pages_dir.exists() {
        std::fs::remove_dir_all(&layout.pages_dir)?;
    }
    info!("Reset grading state in {:?}", layout.main_dir);
    Ok(())
}
