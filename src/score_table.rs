//! Score tables stamped along the bottom edge of committed pages.
//!
//! A stamped page shows its original content, turned upright and shrunk to
//! 95%, above a strip of numbered boxes `0..=max` the grader marks.

use std::path::Path;

use lopdf::Object;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identity::IdentityCode;
use crate::ledger::write_atomic;
use crate::pdf::{self, ContentBuilder, PdfBundle};
use crate::session::Session;

const CONTENT_SCALE: f64 = 0.95;
const CONTENT_OFFSET: (f64, f64) = (14.4, 43.2);

const TABLE_MARGIN: f64 = 3.6;
const TABLE_HEIGHT: f64 = 36.0;
const BOX_SIZE: f64 = 13.68;
const BOX_SPACING: f64 = 7.92;
const BOX_LEFT_PAD: f64 = 10.8;
const BOX_BOTTOM: f64 = 20.16;
const LABEL_BASELINE: f64 = 8.64;
const LABEL_SIZE: f64 = 10.0;
/// Helvetica digit advance at `LABEL_SIZE`.
const DIGIT_WIDTH: f64 = 5.56;

const TABLE_FONT: &str = "FT";

/// `[x, y, width, height]` of the box for `score` on a stamped page, in
/// points from the bottom-left corner.
pub fn score_box(score: u32) -> [f64; 4] {
    let x = TABLE_MARGIN + BOX_LEFT_PAD + score as f64 * (BOX_SIZE + BOX_SPACING);
    [x, BOX_BOTTOM, BOX_SIZE, BOX_SIZE]
}

/// `[x0, y0, x1, y1]` of the area that counts as marking `score`: its box
/// grown by half the gap to the neighbouring boxes.
pub fn score_cell(score: u32) -> [f64; 4] {
    let [x, y, w, h] = score_box(score);
    let pad = BOX_SPACING / 2.0;
    [x - pad, y - pad, x + w + pad, y + h + pad]
}

/// Content stream drawing a table with boxes `0..=max_points` for a page
/// `page_width` points wide.
pub fn table_content(max_points: u32, page_width: f64) -> Vec<u8> {
    let mut content = ContentBuilder::new();
    content
        .op(&[], "q")
        .op(&[0.5], "w")
        .op(&[1.0, 0.0, 0.0], "RG")
        .op(&[1.0, 0.85, 0.85], "rg")
        .op(
            &[TABLE_MARGIN, TABLE_MARGIN, page_width - 2.0 * TABLE_MARGIN, TABLE_HEIGHT],
            "re",
        )
        .op(&[], "B")
        .op(&[0.0, 0.0, 0.0], "RG");

    for score in 0..=max_points {
        let [x, _, _, _] = score_box(score);
        let label = score.to_string();
        let label_x = x + (BOX_SIZE - DIGIT_WIDTH * label.len() as f64) / 2.0;
        content
            .op(&[1.0, 1.0, 1.0], "rg")
            .op(&score_box(score), "re")
            .op(&[], "B")
            .op(&[0.0, 0.0, 0.0], "rg")
            .text(TABLE_FONT, LABEL_SIZE, label_x, LABEL_BASELINE, &label);
    }
    content.op(&[], "Q");
    content.into_bytes()
}

/// Write a copy of the single-page document `source` to `dest` with a score
/// table for `max_points`.
///
/// The stamped page is upright: its `/Rotate` is folded into the content
/// transform and its media box becomes the displayed size.
pub fn stamp_page(source: &Path, dest: &Path, max_points: u32) -> Result<()> {
    let bundle = PdfBundle::open(source)?;
    let mut doc = bundle.extract_page(0)?;
    let page_id = pdf::first_page_id(&doc)?;

    let [x0, y0, x1, y1] = pdf::page_box(&doc, page_id)?;
    let (w, h) = (x1 - x0, y1 - y0);
    let rotation = pdf::page_rotation(&doc, page_id)?;
    let (upright, (width, height)) = match rotation {
        90 => ([0.0, -1.0, 1.0, 0.0, 0.0, w], (h, w)),
        180 => ([-1.0, 0.0, 0.0, -1.0, w, h], (w, h)),
        270 => ([0.0, 1.0, -1.0, 0.0, h, 0.0], (h, w)),
        _ => ([1.0, 0.0, 0.0, 1.0, 0.0, 0.0], (w, h)),
    };

    let mut before = ContentBuilder::new();
    before
        .op(&[], "q")
        .op(
            &[CONTENT_SCALE, 0.0, 0.0, CONTENT_SCALE, CONTENT_OFFSET.0, CONTENT_OFFSET.1],
            "cm",
        )
        .op(&upright, "cm")
        .op(&[1.0, 0.0, 0.0, 1.0, -x0, -y0], "cm");
    let mut after = b"Q\n".to_vec();
    after.extend(table_content(max_points, width));

    pdf::wrap_page_content(&mut doc, page_id, before.into_bytes(), after)?;
    pdf::add_page_font(&mut doc, page_id, TABLE_FONT, "Helvetica")?;

    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    page.set(
        "MediaBox",
        vec![
            Object::Integer(0),
            Object::Integer(0),
            pdf::pdf_number(width),
            pdf::pdf_number(height),
        ],
    );
    page.remove(b"CropBox");
    page.set("Rotate", Object::Integer(0));

    pdf::save_document(&mut doc, dest)
}

/// Give every committed page a table-marked copy.
///
/// Cover pages and pages worth 0 points are copied unchanged; the latter are
/// recorded with a maximum of 0 so they read as ungraded. Pages that
/// already have a table-marked copy are left alone. Returns the number of
/// copies written.
pub fn add_score_tables(session: &mut Session) -> Result<usize> {
    let pages_dir = session.layout.pages_dir.clone();
    let mut written = 0;
    for code in committed_pages(&pages_dir)? {
        let dest = pages_dir.join(code.with_table().file_name());
        if dest.exists() {
            continue;
        }
        let source = pages_dir.join(code.file_name());
        let max_points = session.config.max_points_for(code.page_number());
        if max_points == 0 {
            write_atomic(&dest, &std::fs::read(&source)?)?;
            if !code.is_cover() {
                session.ledger.max_score_per_page.insert(code.page_number(), 0);
            }
            debug!("Copied {} without a score table", code);
        } else {
            stamp_page(&source, &dest, max_points)?;
            session
                .ledger
                .max_score_per_page
                .insert(code.page_number(), max_points);
            debug!("Stamped {} with a 0..={} table", code, max_points);
        }
        written += 1;
    }
    if written > 0 {
        session.save_ledger()?;
        info!("Added score tables to {} pages", written);
    }
    Ok(written)
}

/// Committed pages without the table marker, in identity order.
fn committed_pages(pages_dir: &Path) -> Result<Vec<IdentityCode>> {
    let mut codes = Vec::new();
    if !pages_dir.exists() {
        return Ok(codes);
    }
    for entry in std::fs::read_dir(pages_dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".pdf") {
            continue;
        }
        match IdentityCode::from_file_name(&name) {
            Ok(code) if !code.has_table() => codes.push(code),
            Ok(_) => {}
            Err(_) => warn!("Ignoring unexpected file {:?} in pages dir", name),
        }
    }
    codes.sort();
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{label_document, page_contents, page_labels};
    use crate::session::tests::open_session;

    fn write_page(dir: &Path, code: &str, rotate: Option<i64>) {
        let mut doc = label_document(&[code]);
        if let Some(degrees) = rotate {
            let page_id = pdf::first_page_id(&doc).unwrap();
            pdf::rotate_page(&mut doc, page_id, degrees as i32).unwrap();
        }
        pdf::save_document(&mut doc, &dir.join(format!("{}.pdf", code))).unwrap();
    }

    fn boxes(content: &[u8]) -> usize {
        String::from_utf8_lossy(content).matches(" re\n").count()
    }

    #[test]
    fn test_table_content_box_count() {
        assert_eq!(boxes(&table_content(10, 612.0)), 12);
        assert_eq!(boxes(&table_content(0, 612.0)), 2);
    }

    #[test]
    fn test_neighbouring_cells_touch() {
        let [_, _, right, _] = score_cell(3);
        let [left, bottom, _, top] = score_cell(4);
        assert!((right - left).abs() < 1e-9);
        assert!(bottom < BOX_BOTTOM && top > BOX_BOTTOM + BOX_SIZE);
    }

    #[test]
    fn test_largest_table_fits_letter_width() {
        let last = TABLE_MARGIN
            + BOX_LEFT_PAD
            + crate::config::MAX_TABLE_POINTS as f64 * (BOX_SIZE + BOX_SPACING)
            + BOX_SIZE;
        assert!(last < 612.0 - TABLE_MARGIN);
    }

    #[test]
    fn test_stamp_keeps_content_and_adds_table() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "MTH309-C001-P01", None);
        let dest = dir.path().join("t_MTH309-C001-P01.pdf");
        stamp_page(&dir.path().join("MTH309-C001-P01.pdf"), &dest, 5).unwrap();

        let bundle = PdfBundle::open(&dest).unwrap();
        let doc = bundle.document();
        assert_eq!(bundle.page_count(), 1);
        let content = &page_contents(doc)[0];
        let text = String::from_utf8_lossy(content);
        assert!(text.contains("(MTH309-C001-P01) Tj"));
        assert!(text.contains("0.95 0 0 0.95 14.4 43.2 cm"));
        assert!(text.contains("(5) Tj"));
        assert_eq!(boxes(content), 7);

        let page_id = bundle.page_id(0).unwrap();
        assert_eq!(pdf::page_box(doc, page_id).unwrap(), [0.0, 0.0, 612.0, 792.0]);
        let page = doc.get_dictionary(page_id).unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        assert!(resources.get(b"Font").unwrap().as_dict().unwrap().has(b"FT"));
    }

    #[test]
    fn test_stamp_turns_rotated_page_upright() {
        let dir = tempfile::tempdir().unwrap();
        write_page(dir.path(), "MTH309-C001-P02", Some(90));
        let dest = dir.path().join("t_MTH309-C001-P02.pdf");
        stamp_page(&dir.path().join("MTH309-C001-P02.pdf"), &dest, 3).unwrap();

        let bundle = PdfBundle::open(&dest).unwrap();
        let page_id = bundle.page_id(0).unwrap();
        assert_eq!(pdf::page_rotation(bundle.document(), page_id).unwrap(), 0);
        assert_eq!(pdf::page_box(bundle.document(), page_id).unwrap(), [0.0, 0.0, 792.0, 612.0]);
        let text = String::from_utf8_lossy(&page_contents(bundle.document())[0]).into_owned();
        assert!(text.contains("0 -1 1 0 0 612 cm"));
    }

    #[test]
    fn test_add_score_tables_records_max_and_copies_covers() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = open_session(dir.path());
        let pages = session.layout.pages_dir.clone();
        write_page(&pages, "MTH309-C001-P00", None);
        write_page(&pages, "MTH309-C001-P01", None);
        write_page(&pages, "MTH309-C002-P01", None);

        assert_eq!(add_score_tables(&mut session).unwrap(), 3);
        assert_eq!(session.ledger.max_score_per_page.get(&1), Some(&10));
        assert!(!session.ledger.max_score_per_page.contains_key(&0));

        let cover = std::fs::read(pages.join("MTH309-C001-P00.pdf")).unwrap();
        let cover_copy = std::fs::read(pages.join("t_MTH309-C001-P00.pdf")).unwrap();
        assert_eq!(cover, cover_copy);

        let stamped = PdfBundle::open(&pages.join("t_MTH309-C002-P01.pdf")).unwrap();
        assert_eq!(page_labels(stamped.document()), vec!["MTH309-C002-P01"]);

        session.reload().unwrap();
        assert_eq!(session.ledger.max_score_per_page.get(&1), Some(&10));
    }

    #[test]
    fn test_add_score_tables_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = open_session(dir.path());
        write_page(&session.layout.pages_dir.clone(), "MTH309-C001-P01", None);

        assert_eq!(add_score_tables(&mut session).unwrap(), 1);
        let stamped = session.layout.pages_dir.join("t_MTH309-C001-P01.pdf");
        let first = std::fs::read(&stamped).unwrap();
        assert_eq!(add_score_tables(&mut session).unwrap(), 0);
        assert_eq!(std::fs::read(&stamped).unwrap(), first);
    }

    #[test]
    fn test_zero_point_pages_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = open_session(dir.path());
        session.config.max_points = vec![10, 0];
        write_page(&session.layout.pages_dir.clone(), "MTH309-C001-P02", None);

        assert_eq!(add_score_tables(&mut session).unwrap(), 1);
        assert_eq!(session.ledger.max_score_per_page.get(&2), Some(&0));
        let path = session.layout.pages_dir.join("t_MTH309-C001-P02.pdf");
        let copy = PdfBundle::open(&path).unwrap();
        assert_eq!(boxes(&page_contents(copy.document())[0]), 0);
    }
}
