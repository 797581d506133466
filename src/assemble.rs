//! Graded exams regrouped by student.
//!
//! After grading, each aggregate holds one problem for every copy. This pass
//! turns them back into one document per exam copy. Once scores have been
//! read into the gradebook, the copies of assigned students also show their
//! score on every graded page and a summary on the cover.

use std::collections::BTreeMap;
use std::path::PathBuf;

use lopdf::{Document, ObjectId};
use tracing::{debug, info, warn};

use crate::aggregate::{open_aggregate, parse_list};
use crate::error::Result;
use crate::identity::IdentityCode;
use crate::pdf::{self, ContentBuilder, PdfBundle};
use crate::roster::Roster;
use crate::score_table::score_box;
use crate::scores::{page_column, page_columns, GRADE_COLUMN, TOTAL_COLUMN};
use crate::session::Session;

const LABEL_FONT: (&str, &str) = ("SH", "Helvetica");
const MARK_FONT: (&str, &str) = ("SB", "Helvetica-Bold");
const VALUE_FONT: (&str, &str) = ("SC", "Courier");

const MARK_INSET: f64 = 0.72;
const MARK_LABEL_SIZE: f64 = 10.0;
const MARK_LABEL_RISE: f64 = 3.6;

const SUMMARY_MARGIN: f64 = 3.6;
const SUMMARY_HEIGHT: f64 = 57.6;
const SUMMARY_SPACING: f64 = 4.32;
const SUMMARY_BOX_MAX_WIDTH: f64 = 108.0;
const SUMMARY_BOX_HEIGHT: f64 = 25.2;
const SUMMARY_BOX_BOTTOM: f64 = 28.8;
const SUMMARY_LABEL_BASELINE: f64 = 14.4;
const SUMMARY_VALUE_BASELINE: f64 = 36.72;
const SUMMARY_VALUE_SIZE: f64 = 16.0;
/// Courier advance per character, as a fraction of the font size.
const COURIER_ADVANCE: f64 = 0.6;

/// One assembled exam copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradedExam {
    pub exam_code: String,
    /// Person number of the student holding the copy, if known.
    pub student: Option<String>,
    pub path: PathBuf,
}

/// Write `graded/<exam code>.pdf` for every exam copy found in the
/// aggregates, pages in identity order.
///
/// Every aggregate is checked against its ledger page list first; a
/// mismatch aborts before anything is written.
pub fn assemble_by_student(session: &Session) -> Result<Vec<GradedExam>> {
    let mut bundles: Vec<PdfBundle> = Vec::new();
    // exam code -> (page code, aggregate index, page id)
    let mut copies: BTreeMap<String, Vec<(IdentityCode, usize, ObjectId)>> = BTreeMap::new();

    for (name, list) in &session.ledger.aggregate_page_lists {
        let codes = parse_list(name, list)?;
        let bundle = open_aggregate(session, name, codes.len())?;
        let source = bundles.len();
        for (i, code) in codes.into_iter().enumerate() {
            let page_id = bundle.page_id(i)?;
            copies
                .entry(code.exam_code())
                .or_default()
                .push((code, source, page_id));
        }
        bundles.push(bundle);
    }

    std::fs::create_dir_all(&session.layout.graded_dir)?;
    let score_columns = page_columns(&session.roster);
    let docs: Vec<&Document> = bundles.iter().map(|b| b.document()).collect();
    let mut written = Vec::with_capacity(copies.len());
    for (exam_code, mut pages) in copies {
        pages.sort_by(|a, b| a.0.cmp(&b.0));
        let order: Vec<(usize, ObjectId)> = pages.iter().map(|(_, s, id)| (*s, *id)).collect();
        let mut doc = pdf::assemble(&docs, &order)?;
        if session.roster.student_with_code(&exam_code).is_some() && !score_columns.is_empty() {
            let codes: Vec<&IdentityCode> = pages.iter().map(|(code, _, _)| code).collect();
            let marked = mark_scores(session, &mut doc, &exam_code, &codes, &score_columns)?;
            debug!("Marked scores on {} pages of {}", marked, exam_code);
        }
        let dest = session.layout.graded_dir.join(format!("{}.pdf", exam_code));
        pdf::save_document(&mut doc, &dest)?;

        let student = session.roster.student_with_code(&exam_code).map(str::to_string);
        match &student {
            Some(id) => debug!("Assembled {} ({} pages) for {}", exam_code, pages.len(), id),
            None => warn!("Assembled {}, which is not assigned to any student", exam_code),
        }
        written.push(GradedExam {
            exam_code,
            student,
            path: dest,
        });
    }
    info!("Assembled {} graded exams", written.len());
    Ok(written)
}

/// Draw the gradebook scores of `exam_code` on its assembled pages, whose
/// identities are `codes` in page order. Returns the number of pages marked.
fn mark_scores(
    session: &Session,
    doc: &mut Document,
    exam_code: &str,
    codes: &[&IdentityCode],
    score_columns: &[(u32, String)],
) -> Result<usize> {
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let mut marked = 0;
    for (code, page_id) in codes.iter().zip(page_ids) {
        if code.is_cover() {
            let (width, _) = pdf::displayed_size(doc, page_id)?;
            let cells = summary_cells(&session.roster, exam_code, score_columns);
            overlay(doc, page_id, &[LABEL_FONT, VALUE_FONT], &summary_content(width, &cells))?;
            marked += 1;
            continue;
        }
        let column = page_column(code.page_number());
        let score = session
            .roster
            .value_for_code(exam_code, &column)
            .and_then(|v| v.parse::<u32>().ok());
        let max_points = session
            .ledger
            .max_score_per_page
            .get(&code.page_number())
            .copied()
            .unwrap_or(0);
        match score {
            Some(score) if score <= max_points && max_points > 0 => {
                overlay(doc, page_id, &[MARK_FONT], &mark_content(score))?;
                marked += 1;
            }
            Some(score) => {
                warn!("{}: score {} is outside the table, page left unmarked", code, score);
            }
            None => {}
        }
    }
    Ok(marked)
}

fn overlay(
    doc: &mut Document,
    page_id: ObjectId,
    fonts: &[(&str, &str)],
    content: &[u8],
) -> Result<()> {
    for (name, base_font) in fonts {
        pdf::add_page_font(doc, page_id, name, base_font)?;
    }
    pdf::overlay_page(doc, page_id, content)?;
    Ok(())
}

/// The score label drawn over the box of `score` on a stamped page.
fn mark_content(score: u32) -> Vec<u8> {
    let [x, y, size, _] = score_box(score);
    let label = score.to_string();
    let label_x = x + (size - helvetica_width(&label, MARK_LABEL_SIZE)) / 2.0;
    let mut content = ContentBuilder::new();
    content
        .op(&[], "q")
        .op(&[0.5], "w")
        .op(&[0.0, 0.0, 0.0], "RG")
        .op(&[1.0, 1.0, 1.0], "rg")
        .op(&[x, y, size, size], "re")
        .op(&[], "B")
        .op(&[0.5, 0.0, 0.0], "rg")
        .op(
            &[x + MARK_INSET, y + MARK_INSET, size - 2.0 * MARK_INSET, size - 2.0 * MARK_INSET],
            "re",
        )
        .op(&[], "f")
        .op(&[1.0, 1.0, 1.0], "rg")
        .text(MARK_FONT.0, MARK_LABEL_SIZE, label_x, y + MARK_LABEL_RISE, &label)
        .op(&[], "Q");
    content.into_bytes()
}

/// One summary cell: label, value and whether it is highlighted.
type SummaryCell = (String, String, bool);

/// `P<n>` for every page column, then the total and the grade. Scores that
/// are not whole numbers show as `--`.
fn summary_cells(roster: &Roster, exam_code: &str, columns: &[(u32, String)]) -> Vec<SummaryCell> {
    let value = |column: &str| roster.value_for_code(exam_code, column).unwrap_or("").trim();
    let number = |column: &str| match value(column).parse::<i64>() {
        Ok(n) => n.to_string(),
        Err(_) => "--".to_string(),
    };

    let mut cells: Vec<SummaryCell> = columns
        .iter()
        .map(|(page, column)| (format!("P{}", page), number(column), false))
        .collect();
    cells.push((TOTAL_COLUMN.to_uppercase(), number(TOTAL_COLUMN), true));
    let grade = match value(GRADE_COLUMN) {
        "" => "--".to_string(),
        g => g.to_string(),
    };
    cells.push((GRADE_COLUMN.to_uppercase(), grade, true));
    cells
}

/// A row of labelled boxes along the bottom of a page `width` points wide.
fn summary_content(width: f64, cells: &[SummaryCell]) -> Vec<u8> {
    let table_width = width - 2.0 * SUMMARY_MARGIN;
    let n = cells.len().max(1) as f64;
    let box_width =
        ((table_width - SUMMARY_SPACING) / n - SUMMARY_SPACING).min(SUMMARY_BOX_MAX_WIDTH);
    let label_size = if cells.len() >= 14 { 9.0 } else { 10.0 };

    let mut content = ContentBuilder::new();
    content
        .op(&[], "q")
        .op(&[0.75], "w")
        .op(&[1.0, 0.0, 0.0], "RG")
        .op(&[1.0, 0.85, 0.85], "rg")
        .op(&[SUMMARY_MARGIN, SUMMARY_MARGIN, table_width, SUMMARY_HEIGHT], "re")
        .op(&[], "B")
        .op(&[0.0, 0.0, 0.0], "RG");

    for (i, (label, value, highlight)) in cells.iter().enumerate() {
        let x = SUMMARY_MARGIN + SUMMARY_SPACING + i as f64 * (box_width + SUMMARY_SPACING);
        let label_x = x + (box_width - helvetica_width(label, label_size)) / 2.0;
        let value_width = COURIER_ADVANCE * SUMMARY_VALUE_SIZE * value.chars().count() as f64;
        let value_x = x + (box_width - value_width) / 2.0;
        let value_color = if *highlight { [1.0, 0.0, 0.0] } else { [0.0, 0.0, 0.0] };
        content
            .op(&[1.0, 1.0, 1.0], "rg")
            .op(&[x, SUMMARY_BOX_BOTTOM, box_width, SUMMARY_BOX_HEIGHT], "re")
            .op(&[], "B")
            .op(&[0.0, 0.0, 0.0], "rg")
            .text(LABEL_FONT.0, label_size, label_x, SUMMARY_LABEL_BASELINE, label)
            .op(&value_color, "rg")
            .text(VALUE_FONT.0, SUMMARY_VALUE_SIZE, value_x, SUMMARY_VALUE_BASELINE, value);
    }
    content.op(&[], "Q");
    content.into_bytes()
}

/// Advance of `text` in Helvetica at `size` points.
fn helvetica_width(text: &str, size: f64) -> f64 {
    let units: u32 = text
        .chars()
        .map(|c| match c {
            ' ' => 278,
            '-' => 333,
            'I' => 278,
            'J' => 500,
            'L' | '0'..='9' => 556,
            'F' | 'T' | 'Z' => 611,
            'A' | 'B' | 'E' | 'K' | 'P' | 'S' | 'V' | 'X' | 'Y' => 667,
            'C' | 'D' | 'H' | 'N' | 'R' | 'U' => 722,
            'G' | 'O' | 'Q' => 778,
            'M' => 833,
            'W' => 944,
            _ => 556,
        })
        .sum();
    units as f64 * size / 1000.0
}
