//! Per-problem aggregate documents.
//!
//! Every committed page that carries a score table (`t_<code>.pdf`) belongs
//! to the aggregate of its exam name and page number. An aggregate holds its
//! pages in ascending identity order and the ledger records that order.
//! Aggregates may already be partly graded, so new pages are spliced in
//! without touching the pages already there.

use std::collections::BTreeMap;
use std::path::Path;

use lopdf::{Document, ObjectId};
use tracing::{debug, info, warn};

use crate::error::{GradingError, Result};
use crate::identity::{AggregateKey, IdentityCode};
use crate::pdf::{self, PdfBundle};
use crate::session::Session;

/// What a synchronisation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    /// Aggregates written from scratch.
    pub built: Vec<String>,
    /// Aggregates that received new pages, with the number inserted.
    pub extended: Vec<(String, usize)>,
}

/// Keeps the aggregate documents in step with the committed pages.
pub struct AggregationEngine;

impl AggregationEngine {
    /// Fold every committed table page into its aggregate.
    ///
    /// Aggregates known to the ledger receive only their missing pages;
    /// aggregates not yet known are built from scratch.
    pub fn sync(session: &mut Session) -> Result<AggregateReport> {
        let mut report = AggregateReport::default();
        for (key, codes) in table_pages(&session.layout.pages_dir)? {
            let name = key.document_name();
            let path = session.layout.for_grading_dir.join(&name);
            let known = session.ledger.aggregate_page_lists.get(&name).cloned();

            match (known, path.exists()) {
                (Some(list), true) => {
                    let listed = parse_list(&name, &list)?;
                    let fresh: Vec<IdentityCode> = codes
                        .into_iter()
                        .filter(|c| listed.binary_search(c).is_err())
                        .collect();
                    if fresh.is_empty() {
                        continue;
                    }
                    let inserted = Self::insert(session, &name, &fresh)?;
                    report.extended.push((name, inserted));
                }
                (Some(_), false) => {
                    return Err(GradingError::MissingPrerequisite(format!(
                        "aggregate {} is in the ledger but {:?} is missing",
                        name, path
                    )));
                }
                (None, true) => {
                    return Err(GradingError::corrupt(
                        name,
                        "aggregate exists but the ledger has no page list for it",
                    ));
                }
                (None, false) => {
                    Self::build(session, &name, codes)?;
                    report.built.push(name);
                }
            }
        }
        if !report.built.is_empty() || !report.extended.is_empty() {
            info!(
                "Aggregates: {} built, {} extended",
                report.built.len(),
                report.extended.len()
            );
        }
        Ok(report)
    }

    /// Rebuild every aggregate from the committed pages, discarding the
    /// existing aggregate documents (and any grading done on them).
    pub fn rebuild_all(session: &mut Session) -> Result<AggregateReport> {
        let mut report = AggregateReport::default();
        let groups = table_pages(&session.layout.pages_dir)?;
        for name in std::mem::take(&mut session.ledger.aggregate_page_lists).into_keys() {
            let path = session.layout.for_grading_dir.join(&name);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        session.save_ledger()?;

        for (key, codes) in groups {
            let name = key.document_name();
            Self::build(session, &name, codes)?;
            report.built.push(name);
        }
        info!("Rebuilt {} aggregates", report.built.len());
        Ok(report)
    }

    /// Concatenate `codes` in identity order into a fresh aggregate.
    pub fn build(session: &mut Session, name: &str, mut codes: Vec<IdentityCode>) -> Result<()> {
        codes.sort();
        codes.dedup();
        let bundles = open_pages(&session.layout.pages_dir, &codes)?;
        let docs: Vec<&Document> = bundles.iter().map(|b| b.document()).collect();
        let order = bundles
            .iter()
            .enumerate()
            .map(|(i, b)| b.page_id(0).map(|id| (i, id)))
            .collect::<Result<Vec<_>>>()?;

        let mut doc = pdf::assemble(&docs, &order)?;
        pdf::save_document(&mut doc, &session.layout.for_grading_dir.join(name))?;
        session
            .ledger
            .aggregate_page_lists
            .insert(name.to_string(), codes.iter().map(|c| c.file_name()).collect());
        session.save_ledger()?;
        debug!("Built {} with {} pages", name, codes.len());
        Ok(())
    }

    /// Splice pages into an existing aggregate at their sorted positions.
    ///
    /// Pages already listed are skipped. Returns the number inserted.
    pub fn insert(session: &mut Session, name: &str, codes: &[IdentityCode]) -> Result<usize> {
        let path = session.layout.for_grading_dir.join(name);
        if !path.exists() {
            return Err(GradingError::MissingPrerequisite(format!(
                "aggregate {:?} not found",
                path
            )));
        }
        let list = session
            .ledger
            .aggregate_page_lists
            .get(name)
            .cloned()
            .ok_or_else(|| GradingError::corrupt(name, "no page list in the ledger"))?;
        let listed = parse_list(name, &list)?;
        let aggregate = PdfBundle::open(&path)?;
        verify_page_count(name, &aggregate, listed.len())?;

        // (code, source index, page id); source 0 is the aggregate itself
        let mut merged: Vec<(IdentityCode, usize, ObjectId)> = Vec::with_capacity(listed.len());
        for (i, code) in listed.into_iter().enumerate() {
            merged.push((code, 0, aggregate.page_id(i)?));
        }

        let mut fresh: Vec<IdentityCode> = codes.to_vec();
        fresh.sort();
        fresh.dedup();
        fresh.retain(|c| merged.binary_search_by(|(m, _, _)| m.cmp(c)).is_err());
        if fresh.is_empty() {
            return Ok(0);
        }
        let bundles = open_pages(&session.layout.pages_dir, &fresh)?;
        for (j, (code, bundle)) in fresh.iter().zip(&bundles).enumerate() {
            let at = merged.partition_point(|(m, _, _)| m <= code);
            debug!("Inserting {} into {} at {}", code, name, at);
            merged.insert(at, (code.clone(), j + 1, bundle.page_id(0)?));
        }

        let mut docs: Vec<&Document> = vec![aggregate.document()];
        docs.extend(bundles.iter().map(|b| b.document()));
        let order: Vec<(usize, ObjectId)> = merged.iter().map(|(_, s, id)| (*s, *id)).collect();
        let mut doc = pdf::assemble(&docs, &order)?;
        pdf::save_document(&mut doc, &path)?;

        session.ledger.aggregate_page_lists.insert(
            name.to_string(),
            merged.iter().map(|(c, _, _)| c.file_name()).collect(),
        );
        session.save_ledger()?;
        info!("Inserted {} pages into {}", fresh.len(), name);
        Ok(fresh.len())
    }

    /// Write every aggregate page back out as a single-page document named
    /// by its ledger entry. Returns the number of pages written.
    pub fn split_aggregates(session: &Session, dest: &Path) -> Result<usize> {
        std::fs::create_dir_all(dest)?;
        let mut written = 0;
        for (name, list) in &session.ledger.aggregate_page_lists {
            let bundle = open_aggregate(session, name, list.len())?;
            for (i, page_name) in list.iter().enumerate() {
                let mut doc = bundle.extract_page(i)?;
                pdf::save_document(&mut doc, &dest.join(page_name))?;
                written += 1;
            }
        }
        info!("Split aggregates into {} pages in {:?}", written, dest);
        Ok(written)
    }
}

/// Open an aggregate and check it against its ledger page list.
pub(crate) fn open_aggregate(session: &Session, name: &str, expected: usize) -> Result<PdfBundle> {
    let path = session.layout.for_grading_dir.join(name);
    if !path.exists() {
        return Err(GradingError::MissingPrerequisite(format!(
            "aggregate {:?} not found",
            path
        )));
    }
    let bundle = PdfBundle::open(&path)?;
    verify_page_count(name, &bundle, expected)?;
    Ok(bundle)
}

fn verify_page_count(name: &str, bundle: &PdfBundle, expected: usize) -> Result<()> {
    if bundle.page_count() != expected {
        return Err(GradingError::corrupt(
            name,
            format!(
                "{} pages on file, {} in the ledger",
                bundle.page_count(),
                expected
            ),
        ));
    }
    Ok(())
}

/// Parse a ledger page list; it must be strictly ascending.
pub(crate) fn parse_list(name: &str, list: &[String]) -> Result<Vec<IdentityCode>> {
    let codes = list
        .iter()
        .map(|entry| {
            IdentityCode::from_file_name(entry)
                .map_err(|_| GradingError::corrupt(name, format!("bad page entry {:?}", entry)))
        })
        .collect::<Result<Vec<_>>>()?;
    if codes.windows(2).any(|w| w[0] >= w[1]) {
        return Err(GradingError::corrupt(name, "page list is not in identity order"));
    }
    Ok(codes)
}

/// Committed table pages grouped by aggregate, each group sorted.
fn table_pages(pages_dir: &Path) -> Result<BTreeMap<AggregateKey, Vec<IdentityCode>>> {
    let mut groups: BTreeMap<AggregateKey, Vec<IdentityCode>> = BTreeMap::new();
    if !pages_dir.exists() {
        return Ok(groups);
    }
    for entry in std::fs::read_dir(pages_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".pdf") {
            continue;
        }
        match IdentityCode::from_file_name(&name) {
            Ok(code) if code.has_table() => {
                groups.entry(code.aggregate_key()).or_default().push(code)
            }
            Ok(_) => {}
            Err(_) => warn!("Ignoring unexpected file {:?} in pages dir", name),
        }
    }
    for codes in groups.values_mut() {
        codes.sort();
    }
    Ok(groups)
}

fn open_pages(pages_dir: &Path, codes: &[IdentityCode]) -> Result<Vec<PdfBundle>> {
    codes
        .iter()
        .map(|code| {
            let bundle = PdfBundle::open(&pages_dir.join(code.file_name()))?;
            if bundle.page_count() != 1 {
                return Err(GradingError::Pdf(format!(
                    "{} has {} pages, expected 1",
                    code.file_name(),
                    bundle.page_count()
                )));
            }
            Ok(bundle)
        })
        .collect()
}
