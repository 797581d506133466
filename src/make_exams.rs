//! Printable exam copies with an identity code on every page.

use std::path::{Path, PathBuf};

use lopdf::ObjectId;
use qrcode::{Color, EcLevel, QrCode};
use tracing::{debug, info};

use crate::error::{GradingError, Result};
use crate::identity::IdentityCode;
use crate::pdf::{self, ContentBuilder, PdfBundle};

const INCH: f64 = 72.0;
const LETTER: (f64, f64) = (8.5 * INCH, 11.0 * INCH);

/// Lower-left corner and side of the QR code.
const QR_ORIGIN: (f64, f64) = (6.65 * INCH, 9.4 * INCH);
const QR_SIDE: f64 = 80.0;
/// Light modules around the symbol.
const QR_QUIET_ZONE: usize = 4;

/// Right end of the code's baseline.
const CODE_TEXT_END: (f64, f64) = (6.6 * INCH, 9.54 * INCH);
const CODE_TEXT_SIZE: f64 = 11.5;
/// Courier advance per character at `CODE_TEXT_SIZE`.
const CODE_CHAR_WIDTH: f64 = 0.6 * CODE_TEXT_SIZE;

const CODE_FONT: &str = "FQ";
const BACK_FONT: &str = "F1";
const BACK_TEXT_SIZE: f64 = 12.0;
const BACK_LINES: [(&str, f64); 2] = [
    ("THIS PAGE WILL NOT BE GRADED", 8.0 * INCH),
    ("USE IT FOR SCRATCHWORK ONLY", 7.8 * INCH),
];

/// Options for [`make_exams`].
#[derive(Debug, Clone)]
pub struct ExamCopies {
    pub template: PathBuf,
    pub copies: u32,
    /// Exam name printed in front of every code; empty for none.
    pub prefix: String,
    pub output_dir: PathBuf,
    /// Follow every page with a "not graded" page for two-sided printing.
    pub backpages: bool,
}

/// Write `copies` tagged copies of the template, `<stem>_<n:03>.pdf`.
///
/// Page `k` of copy `n` carries the code `[prefix-]C<n>-P<k>` as a QR code
/// and as text in its top-right corner.
pub fn make_exams(options: &ExamCopies) -> Result<Vec<PathBuf>> {
    let template = PdfBundle::open(&options.template)?;
    let stem = options
        .template
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "exam".to_string());
    std::fs::create_dir_all(&options.output_dir)?;

    let back = back_page()?;
    let mut written = Vec::with_capacity(options.copies as usize);
    for copy in 1..=options.copies {
        let codes = (0..template.page_count())
            .map(|page| IdentityCode::new(&options.prefix, copy, page as u32))
            .collect::<Result<Vec<_>>>()?;
        let dest = options.output_dir.join(format!("{}_{:03}.pdf", stem, copy));
        write_copy(&template, &back, &codes, options.backpages, &dest)?;
        debug!("Wrote exam copy {:?}", dest);
        written.push(dest);
    }
    info!(
        "Wrote {} copies of {:?} to {:?}",
        written.len(),
        options.template,
        options.output_dir
    );
    Ok(written)
}

fn write_copy(
    template: &PdfBundle,
    back: &lopdf::Document,
    codes: &[IdentityCode],
    backpages: bool,
    dest: &Path,
) -> Result<()> {
    let back_id = pdf::first_page_id(back)?;
    let mut order: Vec<(usize, ObjectId)> = Vec::new();
    for index in 0..codes.len() {
        order.push((0, template.page_id(index)?));
        if backpages {
            order.push((1, back_id));
        }
    }
    let mut doc = pdf::assemble(&[template.document(), back], &order)?;

    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let stride = if backpages { 2 } else { 1 };
    for (code, &page_id) in codes.iter().zip(page_ids.iter().step_by(stride)) {
        let mut after = b"Q\n".to_vec();
        after.extend(code_stamp(&code.code())?);
        pdf::wrap_page_content(&mut doc, page_id, b"q\n".to_vec(), after)?;
        pdf::add_page_font(&mut doc, page_id, CODE_FONT, "Courier")?;
    }
    pdf::save_document(&mut doc, dest)
}

/// Content drawing `code` as a QR symbol plus right-aligned text.
fn code_stamp(code: &str) -> Result<Vec<u8>> {
    let symbol = QrCode::with_error_correction_level(code.as_bytes(), EcLevel::H)
        .map_err(|e| GradingError::MalformedCode(format!("{}: {}", code, e)))?;
    let width = symbol.width();
    let colors = symbol.to_colors();
    let module = QR_SIDE / (width + 2 * QR_QUIET_ZONE) as f64;

    let mut content = ContentBuilder::new();
    content.op(&[], "q").op(&[0.0, 0.0, 0.0], "rg");
    for (idx, color) in colors.iter().enumerate() {
        if *color != Color::Dark {
            continue;
        }
        let (col, row) = (idx % width, idx / width);
        let x = QR_ORIGIN.0 + (QR_QUIET_ZONE + col) as f64 * module;
        let y = QR_ORIGIN.1 + QR_SIDE - (QR_QUIET_ZONE + row + 1) as f64 * module;
        content.op(&[x, y, module, module], "re");
    }
    content.op(&[], "f");

    let text_x = CODE_TEXT_END.0 - CODE_CHAR_WIDTH * code.chars().count() as f64;
    content
        .text(CODE_FONT, CODE_TEXT_SIZE, text_x, CODE_TEXT_END.1, code)
        .op(&[], "Q");
    Ok(content.into_bytes())
}

/// A letter page telling the grader to ignore it.
fn back_page() -> Result<lopdf::Document> {
    let mut content = ContentBuilder::new();
    content.op(&[0.0, 0.0, 0.0], "rg");
    for (line, baseline) in BACK_LINES {
        let x = LETTER.0 / 2.0 - helvetica_width(line, BACK_TEXT_SIZE) / 2.0;
        content.text(BACK_FONT, BACK_TEXT_SIZE, x, baseline, line);
    }
    Ok(pdf::single_page_document(
        LETTER.0,
        LETTER.1,
        content.into_bytes(),
        &[(BACK_FONT, "Helvetica")],
    ))
}

/// Rendered width of upper-case Helvetica text.
fn helvetica_width(text: &str, size: f64) -> f64 {
    let units: u32 = text
        .chars()
        .map(|c| match c {
            ' ' | 'I' => 278,
            'J' => 500,
            'L' => 556,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{label_document, page_contents};

    fn template(dir: &Path) -> PathBuf {
        let path = dir.join("midterm.pdf");
        pdf::save_document(&mut label_document(&["cover", "problem 1"]), &path).unwrap();
        path
    }

    fn options(dir: &Path, backpages: bool) -> ExamCopies {
        ExamCopies {
            template: template(dir),
            copies: 2,
            prefix: "MTH309".to_string(),
            output_dir: dir.join("copies"),
            backpages,
        }
    }

    #[test]
    fn test_make_exams_tags_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let written = make_exams(&options(dir.path(), false)).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("copies/midterm_001.pdf"),
                dir.path().join("copies/midterm_002.pdf"),
            ]
        );

        let copy = PdfBundle::open(&written[1]).unwrap();
        assert_eq!(copy.page_count(), 2);
        let contents = page_contents(copy.document());
        let first = String::from_utf8_lossy(&contents[0]);
        let second = String::from_utf8_lossy(&contents[1]);
        assert!(first.contains("(cover) Tj"));
        assert!(first.contains("(MTH309-C002-P00) Tj"));
        assert!(second.contains("(problem 1) Tj"));
        assert!(second.contains("(MTH309-C002-P01) Tj"));
    }

    #[test]
    fn test_make_exams_interleaves_back_pages() {
        let dir = tempfile::tempdir().unwrap();
        let written = make_exams(&options(dir.path(), true)).unwrap();
        let copy = PdfBundle::open(&written[0]).unwrap();
        assert_eq!(copy.page_count(), 4);

        let contents = page_contents(copy.document());
        for back in [&contents[1], &contents[3]] {
            let text = String::from_utf8_lossy(back);
            assert!(text.contains("(THIS PAGE WILL NOT BE GRADED) Tj"));
            assert!(!text.contains("MTH309"));
        }
        assert!(String::from_utf8_lossy(&contents[2]).contains("(MTH309-C001-P01) Tj"));
    }

    #[test]
    fn test_code_stamp_draws_each_dark_module() {
        let code = "MTH309-C001-P03";
        let symbol = QrCode::with_error_correction_level(code.as_bytes(), EcLevel::H).unwrap();
        let dark = symbol.to_colors().iter().filter(|c| **c == Color::Dark).count();
        let stamp = String::from_utf8(code_stamp(code).unwrap()).unwrap();
        assert_eq!(stamp.matches(" re\n").count(), dark);
        assert!(stamp.contains("/FQ 11.5 Tf"));
    }

    #[test]
    fn test_codes_without_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), false);
        opts.prefix = String::new();
        opts.copies = 1;
        let written = make_exams(&opts).unwrap();
        let copy = PdfBundle::open(&written[0]).unwrap();
        let text = String::from_utf8_lossy(&page_contents(copy.document())[1]).into_owned();
        assert!(text.contains("(C001-P01) Tj"));
    }

    #[test]
    fn test_helvetica_width() {
        assert!((helvetica_width("AB", 10.0) - 13.34).abs() < 1e-9);
    }
}
