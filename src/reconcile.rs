//! Matching scanned pages back to exam copies and students.
//!
//! Every page goes through the same steps: find its identity code, and for
//! cover pages find the student whose bubble-grid id is marked on it. A page
//! whose code or student cannot be established is deferred: it is appended to
//! the pending list of the ledger and to the carryover bundle, and a later
//! resolution pass visits it again. A resolved page is committed as a
//! single-page document named by its code.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use lopdf::ObjectId;
use tracing::{debug, info, warn};

use crate::config::GradingConfig;
use crate::error::{GradingError, Result};
use crate::identity::IdentityCode;
use crate::ledger::PendingPage;
use crate::pdf::{self, PdfBundle};
use crate::readers::{CodeReader, ContourBubbleReader, QrCodeReader, StudentIdReader};
use crate::session::Session;

/// A human (or scripted) answer to a [`Prompt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A value typed in: an identity code or a person number.
    Provide(String),
    /// Add the candidate person number to the roster.
    AddToRoster,
    /// Leave the page pending.
    Skip,
}

/// Where a page came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOrigin {
    pub source_file: String,
    pub page_index: usize,
}

/// A question about one unresolved page.
#[derive(Debug)]
pub enum Prompt<'a> {
    /// The page has no usable identity code.
    MissingCode {
        origin: &'a PageOrigin,
        image: Option<&'a DynamicImage>,
        /// The last value that was rejected, if any.
        rejected: Option<String>,
    },
    /// The cover page's student could not be matched to the roster.
    UnknownStudent {
        origin: &'a PageOrigin,
        image: Option<&'a DynamicImage>,
        code: &'a IdentityCode,
        /// Candidate person number: the last value read or entered.
        candidate: Option<String>,
    },
}

impl Prompt<'_> {
    pub fn origin(&self) -> &PageOrigin {
        match self {
            Prompt::MissingCode { origin, .. } | Prompt::UnknownStudent { origin, .. } => origin,
        }
    }

    pub fn image(&self) -> Option<&DynamicImage> {
        match self {
            Prompt::MissingCode { image, .. } | Prompt::UnknownStudent { image, .. } => *image,
        }
    }
}

/// Answers prompts about unresolved pages.
pub trait Resolver {
    fn resolve(&mut self, prompt: &Prompt<'_>) -> Decision;
}

/// What became of the pages of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Codes of the pages committed in this pass.
    pub committed: Vec<String>,
    /// Codes of pages that were already committed earlier.
    pub already_committed: Vec<String>,
    /// Pages deferred in this pass.
    pub deferred: usize,
    /// Pages skipped because they are already pending.
    pub already_pending: usize,
    /// Pages for which no raster could be decoded.
    pub unreadable: usize,
}

impl BatchReport {
    pub fn absorb(&mut self, other: BatchReport) {
        self.committed.extend(other.committed);
        self.already_committed.extend(other.already_committed);
        self.deferred += other.deferred;
        self.already_pending += other.already_pending;
        self.unreadable += other.unreadable;
    }
}

/// What is already known about a page from an earlier pass.
#[derive(Debug, Default)]
struct Hints {
    code: Option<IdentityCode>,
    student_id: Option<String>,
}

enum Outcome {
    Committed(IdentityCode),
    AlreadyCommitted(IdentityCode),
    Deferred(PendingPage),
}

/// Drives pages from decoding to commit or deferral.
pub struct ReconciliationEngine {
    code_reader: Box<dyn CodeReader>,
    id_reader: Box<dyn StudentIdReader>,
}

impl ReconciliationEngine {
    pub fn new(code_reader: Box<dyn CodeReader>, id_reader: Box<dyn StudentIdReader>) -> Self {
        Self {
            code_reader,
            id_reader,
        }
    }

    /// The QR and bubble-grid readers, tuned by `config`.
    pub fn from_config(config: &GradingConfig) -> Self {
        Self::new(
            Box::new(QrCodeReader::new(&config.code_reader)),
            Box::new(ContourBubbleReader::new(config.bubble_grid.clone())),
        )
    }

    /// Process every page of a scan batch.
    ///
    /// Without a resolver this is batch mode: unresolved pages are deferred
    /// without prompting. Pages already pending from an earlier run of the
    /// same batch are left alone, and pages already committed are not
    /// written again.
    pub fn process_scan(
        &self,
        session: &mut Session,
        path: &Path,
        mut resolver: Option<&mut dyn Resolver>,
    ) -> Result<BatchReport> {
        let bundle = PdfBundle::open(path)?;
        let source_file = file_name(path);
        info!("Processing {} ({} pages)", source_file, bundle.page_count());

        let mut report = BatchReport::default();
        let mut unreadable = Unreadable::default();
        let mut deferred: Vec<(PendingPage, ObjectId)> = Vec::new();
        for index in 0..bundle.page_count() {
            if session.ledger.is_pending(&source_file, index) {
                report.already_pending += 1;
                continue;
            }
            let origin = PageOrigin {
                source_file: source_file.clone(),
                page_index: index,
            };
            let image = raster(session, &bundle, index, &mut unreadable);
            let outcome = self.reconcile_page(
                session,
                &bundle,
                index,
                image,
                &origin,
                Hints::default(),
                resolver.as_mut().map(|r| -> &mut dyn Resolver { &mut **r }),
            )?;
            match outcome {
                Outcome::Committed(code) => report.committed.push(code.code()),
                Outcome::AlreadyCommitted(code) => report.already_committed.push(code.code()),
                Outcome::Deferred(record) => deferred.push((record, bundle.page_id(index)?)),
            }
        }

        report.deferred = deferred.len();
        report.unreadable = unreadable.report(&source_file);
        if !deferred.is_empty() {
            append_to_carryover(session, &bundle, &deferred)?;
            session
                .ledger
                .pending_pages
                .extend(deferred.into_iter().map(|(record, _)| record));
            session.save_ledger()?;
        }
        info!(
            "{}: {} committed, {} already committed, {} deferred",
            source_file,
            report.committed.len(),
            report.already_committed.len(),
            report.deferred
        );
        Ok(report)
    }

    /// Visit every pending page again, reusing what earlier passes learned.
    ///
    /// Resolved pages are committed; the rest stay pending and the carryover
    /// bundle is regenerated to hold exactly them.
    pub fn resolve_pending(
        &self,
        session: &mut Session,
        mut resolver: Option<&mut dyn Resolver>,
    ) -> Result<BatchReport> {
        let carryover = session.layout.carryover.clone();
        let mut report = BatchReport::default();
        if session.ledger.pending_pages.is_empty() {
            if carryover.exists() {
                std::fs::remove_file(&carryover)?;
            }
            return Ok(report);
        }
        if !carryover.exists() {
            return Err(GradingError::MissingPrerequisite(format!(
                "{} pending pages but no carryover file {:?}",
                session.ledger.pending_pages.len(),
                carryover
            )));
        }

        let bundle = PdfBundle::open(&carryover)?;
        let pending = session.ledger.pending_pages.clone();
        if bundle.page_count() != pending.len() {
            return Err(GradingError::corrupt(
                session.layout.carryover_name(),
                format!(
                    "{} pages on file, {} pending records",
                    bundle.page_count(),
                    pending.len()
                ),
            ));
        }
        info!("Resolving {} pending pages", pending.len());

        let mut unreadable = Unreadable::default();
        let mut remaining: Vec<(PendingPage, ObjectId)> = Vec::new();
        for (index, record) in pending.iter().enumerate() {
            let origin = PageOrigin {
                source_file: record.source_file.clone(),
                page_index: record.source_page_index,
            };
            let hints = Hints {
                code: record
                    .code
                    .as_deref()
                    .and_then(|c| IdentityCode::parse(c).ok()),
                student_id: record.student_id.clone(),
            };
            let image = raster(session, &bundle, index, &mut unreadable);
            let outcome = self.reconcile_page(
                session,
                &bundle,
                index,
                image,
                &origin,
                hints,
                resolver.as_mut().map(|r| -> &mut dyn Resolver { &mut **r }),
            )?;
            match outcome {
                Outcome::Committed(code) => report.committed.push(code.code()),
                Outcome::AlreadyCommitted(code) => report.already_committed.push(code.code()),
                Outcome::Deferred(updated) => remaining.push((updated, bundle.page_id(index)?)),
            }
        }

        report.deferred = remaining.len();
        report.unreadable = unreadable.report(&session.layout.carryover_name());
        if remaining.is_empty() {
            std::fs::remove_file(&carryover)?;
        } else {
            let order: Vec<(usize, ObjectId)> = remaining.iter().map(|(_, id)| (0, *id)).collect();
            let mut doc = pdf::assemble(&[bundle.document()], &order)?;
            pdf::save_document(&mut doc, &carryover)?;
        }
        session.ledger.pending_pages = remaining.into_iter().map(|(record, _)| record).collect();
        session.save_ledger()?;
        info!(
            "Resolution pass: {} committed, {} still pending",
            report.committed.len(),
            report.deferred
        );
        Ok(report)
    }

    /// Process scan batches in order, marking each one processed as soon as
    /// its pages are committed or deferred.
    pub fn process_scans(
        &self,
        session: &mut Session,
        paths: &[PathBuf],
        mut resolver: Option<&mut dyn Resolver>,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for path in paths {
            let resolver = resolver.as_mut().map(|r| -> &mut dyn Resolver { &mut **r });
            report.absorb(self.process_scan(session, path, resolver)?);
            session.ledger.processed_scans.insert(file_name(path));
            session.save_ledger()?;
        }
        Ok(report)
    }

    fn reconcile_page(
        &self,
        session: &mut Session,
        bundle: &PdfBundle,
        index: usize,
        image: Option<DynamicImage>,
        origin: &PageOrigin,
        hints: Hints,
        mut resolver: Option<&mut dyn Resolver>,
    ) -> Result<Outcome> {
        let deferred = |code: Option<&IdentityCode>, student_id: Option<String>| {
            Outcome::Deferred(PendingPage {
                source_file: origin.source_file.clone(),
                source_page_index: origin.page_index,
                code: code.map(|c| c.code()),
                student_id,
            })
        };

        // DECODING
        let decoded = match hints.code {
            Some(code) => Some(code),
            None => image
                .as_ref()
                .and_then(|img| self.code_reader.read_code(img))
                .and_then(|raw| accept_code(&session.config, &raw)),
        };
        let code = match decoded {
            Some(code) => code,
            None => {
                // CODE_MISSING
                match resolver.as_deref_mut() {
                    Some(r) => match prompt_for_code(r, &session.config, origin, image.as_ref()) {
                        Some(code) => code,
                        None => return Ok(deferred(None, None)),
                    },
                    None => {
                        debug!(
                            "{} found no code on page {} of {}",
                            self.code_reader.name(),
                            origin.page_index,
                            origin.source_file
                        );
                        return Ok(deferred(None, None));
                    }
                }
            }
        };

        // CODE_FOUND
        if is_committed(session, &code) {
            debug!("{} already committed", code);
            return Ok(Outcome::AlreadyCommitted(code));
        }
        if !code.is_cover() {
            return self.commit(session, bundle, index, code, None);
        }

        // READING_STUDENT_ID
        let mut candidate = hints.student_id;
        if candidate.is_none() {
            candidate = match image.as_ref().map(|img| self.id_reader.read_student_id(img)) {
                Some(Ok(id)) => Some(id),
                Some(Err(failure)) => {
                    debug!("{} could not read {}: {}", self.id_reader.name(), code, failure);
                    None
                }
                None => None,
            };
        }
        if let Some(id) = candidate.as_deref().filter(|id| session.roster.contains(id)) {
            // ID_MATCHED
            let id = id.to_string();
            return self.commit(session, bundle, index, code, Some(id));
        }

        // ID_UNMATCHED
        let Some(r) = resolver.as_deref_mut() else {
            return Ok(deferred(Some(&code), candidate));
        };
        loop {
            let prompt = Prompt::UnknownStudent {
                origin,
                image: image.as_ref(),
                code: &code,
                candidate: candidate.clone(),
            };
            match r.resolve(&prompt) {
                Decision::Provide(value) => {
                    let value = value.trim().to_string();
                    if session.roster.contains(&value) {
                        return self.commit(session, bundle, index, code, Some(value));
                    }
                    warn!("Person number {:?} is not in the roster", value);
                    candidate = Some(value).filter(|v| !v.is_empty()).or(candidate);
                }
                Decision::AddToRoster => match candidate.clone() {
                    // ID_ADDED_TO_ROSTER
                    Some(id) => {
                        session.roster.add_student(&id)?;
                        return self.commit(session, bundle, index, code, Some(id));
                    }
                    None => warn!("No person number to add to the roster"),
                },
                // SKIPPED
                Decision::Skip => return Ok(deferred(Some(&code), candidate)),
            }
        }
    }

    /// Write the page out under its code and, for cover pages, assign the
    /// exam copy to the student.
    fn commit(
        &self,
        session: &mut Session,
        bundle: &PdfBundle,
        index: usize,
        code: IdentityCode,
        student_id: Option<String>,
    ) -> Result<Outcome> {
        let target = session.layout.pages_dir.join(code.file_name());
        let mut doc = bundle.extract_page(index)?;
        if let Some(degrees) = session.config.rotate.filter(|d| d % 360 != 0) {
            let page_id = pdf::first_page_id(&doc)?;
            pdf::rotate_page(&mut doc, page_id, degrees)?;
        }
        pdf::save_document(&mut doc, &target)?;

        if let Some(student) = student_id.as_deref() {
            let exam_code = code.exam_code();
            if let Some(previous) = session.roster.code_of(student).filter(|c| *c != exam_code) {
                warn!("{} held {} before; now holds {}", student, previous, exam_code);
            }
            session.roster.assign_code(student, &exam_code)?;
            info!("{} -> {}", exam_code, student);
        }
        session.flush()?;
        debug!("Committed {}", code);
        Ok(Outcome::Committed(code))
    }
}

/// A decoded or typed code is usable if it parses and carries the exam name
/// of the session. The table marker is never part of a printed code.
fn accept_code(config: &GradingConfig, raw: &str) -> Option<IdentityCode> {
    let code = match IdentityCode::parse(raw) {
        Ok(code) => code.without_table(),
        Err(e) => {
            debug!("{}", e);
            return None;
        }
    };
    match config.exam_name.as_deref() {
        Some(name) if code.exam_name() != name => {
            debug!("{} does not belong to exam {}", code, name);
            None
        }
        _ => Some(code),
    }
}

/// Ask for a code until a valid one is given or the page is skipped.
fn prompt_for_code(
    resolver: &mut dyn Resolver,
    config: &GradingConfig,
    origin: &PageOrigin,
    image: Option<&DynamicImage>,
) -> Option<IdentityCode> {
    let mut rejected = None;
    loop {
        let prompt = Prompt::MissingCode {
            origin,
            image,
            rejected: rejected.take(),
        };
        match resolver.resolve(&prompt) {
            Decision::Provide(value) => match accept_code(config, &value) {
                Some(code) => return Some(code),
                None => {
                    warn!("Rejected identity code {:?}", value);
                    rejected = Some(value);
                }
            },
            Decision::AddToRoster => rejected = Some("add".to_string()),
            Decision::Skip => return None,
        }
    }
}

pub(crate) fn rotate_image(image: DynamicImage, rotate: Option<i32>) -> DynamicImage {
    match rotate.unwrap_or(0).rem_euclid(360) {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    }
}

/// A code is committed once its page file exists, with or without a score
/// table, or once the page has been merged into an aggregate.
fn is_committed(session: &Session, code: &IdentityCode) -> bool {
    let pages_dir = &session.layout.pages_dir;
    pages_dir.join(code.file_name()).exists()
        || pages_dir.join(code.with_table().file_name()).exists()
        || session.ledger.aggregate_holding(code).is_some()
}

/// Pages of one pass for which no raster could be decoded.
#[derive(Debug, Default)]
struct Unreadable {
    count: usize,
    reasons: Vec<String>,
}

impl Unreadable {
    /// Warn once for the whole pass and return the number of pages.
    fn report(self, source: &str) -> usize {
        if self.count > 0 {
            warn!(
                "{} page(s) of {} have no readable raster and were left to manual \
                 resolution: {}",
                self.count,
                source,
                self.reasons.join("; ")
            );
        }
        self.count
    }
}

/// Raster of a page, turned upright by the configured rotation.
fn raster(
    session: &Session,
    bundle: &PdfBundle,
    index: usize,
    unreadable: &mut Unreadable,
) -> Option<DynamicImage> {
    match bundle.page_image(index) {
        Ok(image) => Some(rotate_image(image, session.config.rotate)),
        Err(e) => {
            debug!("No raster for page {}: {}", index, e);
            let reason = e.to_string();
            if !unreadable.reasons.contains(&reason) {
                unreadable.reasons.push(reason);
            }
            unreadable.count += 1;
            None
        }
    }
}

/// Add deferred pages of `bundle` to the end of the carryover bundle.
fn append_to_carryover(
    session: &Session,
    bundle: &PdfBundle,
    deferred: &[(PendingPage, ObjectId)],
) -> Result<()> {
    let carryover = &session.layout.carryover;
    let existing = if carryover.exists() {
        Some(PdfBundle::open(carryover)?)
    } else {
        None
    };

    let mut sources = vec![bundle.document()];
    let mut order = Vec::new();
    if let Some(existing) = existing.as_ref() {
        sources.push(existing.document());
        for i in 0..existing.page_count() {
            order.push((1, existing.page_id(i)?));
        }
    }
    order.extend(deferred.iter().map(|(_, id)| (0, *id)));

    let mut doc = pdf::assemble(&sources, &order)?;
    pdf::save_document(&mut doc, carryover)?;
    debug!("Carryover now holds {} pages", order.len());
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
