//! Scores read back from graded aggregates.
//!
//! A grader marks a page by drawing an annotation over one box of its score
//! table. The box holding the centre of an annotation is the marked score.
//! Marks flattened into the page content are not seen.

use std::collections::BTreeMap;
use std::fmt;

use lopdf::{Document, ObjectId};
use tracing::{debug, info, warn};

use crate::aggregate::{open_aggregate, parse_list};
use crate::error::Result;
use crate::pdf;
use crate::roster::Roster;
use crate::score_table::score_cell;
use crate::session::Session;

pub const TOTAL_COLUMN: &str = "total";
pub const GRADE_COLUMN: &str = "grade";
const PAGE_COLUMN_PREFIX: &str = "page_";

/// What a grader marked on one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScore {
    Score(u32),
    Unmarked,
    /// More than one box marked, in ascending order.
    Multiple(Vec<u32>),
}

impl PageScore {
    pub fn points(&self) -> Option<u32> {
        match self {
            PageScore::Score(points) => Some(*points),
            _ => None,
        }
    }
}

impl fmt::Display for PageScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageScore::Score(points) => write!(f, "{}", points),
            PageScore::Unmarked => f.write_str("NONE"),
            PageScore::Multiple(marked) => write!(f, "MULTI: {:?}", marked),
        }
    }
}

/// Scores of every graded page, by exam copy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScoreSheet {
    /// Graded page numbers, ascending.
    pub pages: Vec<u32>,
    /// exam code -> page number -> score
    pub scores: BTreeMap<String, BTreeMap<u32, PageScore>>,
}

/// Gradebook column of a page score.
pub fn page_column(page: u32) -> String {
    format!("{}{}", PAGE_COLUMN_PREFIX, page)
}

/// Page number of a `page_<n>` column.
pub fn page_of_column(name: &str) -> Option<u32> {
    name.strip_prefix(PAGE_COLUMN_PREFIX)?.parse().ok()
}

/// Page score columns of the roster as `(page, column)`, by page number.
pub fn page_columns(roster: &Roster) -> Vec<(u32, String)> {
    let mut columns: Vec<(u32, String)> = roster
        .columns()
        .iter()
        .filter_map(|c| Some((page_of_column(c)?, c.clone())))
        .collect();
    columns.sort();
    columns
}

/// The score marked on a page whose table has boxes `0..=max_points`.
pub fn read_page_score(doc: &Document, page_id: ObjectId, max_points: u32) -> Result<PageScore> {
    let centres: Vec<(f64, f64)> = pdf::annotation_rects(doc, page_id)?
        .iter()
        .map(|[x0, y0, x1, y1]| ((x0 + x1) / 2.0, (y0 + y1) / 2.0))
        .collect();
    let marked: Vec<u32> = (0..=max_points)
        .filter(|&score| {
            let [x0, y0, x1, y1] = score_cell(score);
            centres
                .iter()
                .any(|&(x, y)| x >= x0 && x < x1 && y >= y0 && y < y1)
        })
        .collect();

    Ok(match marked.len() {
        0 => PageScore::Unmarked,
        1 => PageScore::Score(marked[0]),
        _ => PageScore::Multiple(marked),
    })
}

/// Read the marked score of every page in the graded aggregates.
///
/// Cover aggregates and pages without a positive maximum are skipped.
pub fn read_scores(session: &Session) -> Result<ScoreSheet> {
    let mut sheet = ScoreSheet::default();
    let (mut unmarked, mut multiple) = (0, 0);

    for (name, list) in &session.ledger.aggregate_page_lists {
        let codes = parse_list(name, list)?;
        let Some(page) = codes.first().map(|c| c.page_number()) else {
            continue;
        };
        let max_points = match session.ledger.max_score_per_page.get(&page) {
            Some(&max) if max > 0 && page > 0 => max,
            _ => {
                debug!("Skipping {}: page {} is not graded", name, page);
                continue;
            }
        };

        let bundle = open_aggregate(session, name, codes.len())?;
        for (i, code) in codes.iter().enumerate() {
            let score = read_page_score(bundle.document(), bundle.page_id(i)?, max_points)?;
            match score {
                PageScore::Unmarked => unmarked += 1,
                PageScore::Multiple(_) => multiple += 1,
                PageScore::Score(_) => {}
            }
            sheet
                .scores
                .entry(code.exam_code())
                .or_default()
                .insert(page, score);
        }
        sheet.pages.push(page);
    }
    sheet.pages.sort_unstable();
    sheet.pages.dedup();

    if unmarked > 0 {
        warn!("{} pages have no score marked", unmarked);
    }
    if multiple > 0 {
        warn!("{} pages have more than one score marked", multiple);
    }
    info!(
        "Read scores of {} pages for {} exam copies",
        sheet.pages.len(),
        sheet.scores.len()
    );
    Ok(sheet)
}

/// Write `sheet` into the roster as one `page_<n>` column per graded page
/// and a `total`, replacing the columns of an earlier reading. The `grade`
/// column is kept last.
///
/// Returns the number of students whose exam copy was scored.
pub fn record_scores(roster: &mut Roster, sheet: &ScoreSheet) -> Result<usize> {
    let stale: Vec<String> = roster
        .columns()
        .iter()
        .filter(|c| page_of_column(c).is_some() || c.as_str() == TOTAL_COLUMN)
        .cloned()
        .collect();
    roster.remove_columns(&stale)?;

    let mut names: Vec<String> = sheet.pages.iter().map(|&p| page_column(p)).collect();
    names.push(TOTAL_COLUMN.to_string());
    let values: BTreeMap<String, Vec<String>> = sheet
        .scores
        .iter()
        .map(|(exam_code, scores)| {
            let mut cells: Vec<String> = sheet
                .pages
                .iter()
                .map(|p| scores.get(p).map(|s| s.to_string()).unwrap_or_default())
                .collect();
            let total: u32 = scores.values().filter_map(PageScore::points).sum();
            cells.push(total.to_string());
            (exam_code.clone(), cells)
        })
        .collect();

    let matched = roster.merge_by_code(&names, &values);
    roster.move_column_last(GRADE_COLUMN)?;
    if matched < values.len() {
        warn!(
            "{} scored exam copies are not assigned to any student",
            values.len() - matched
        );
    }
    Ok(matched)
}
