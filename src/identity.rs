//! Identity codes printed on every exam page.
//!
//! Grammar: `[t_][PREFIX-]C<copy:3 digits>-P<page:2 digits>`. The optional
//! `t_` marker flags a page copy that already carries a score table; the
//! prefix (exam name) may itself contain `-`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{GradingError, Result};

/// Marker prepended to codes (and file names) of pages with a score table.
pub const TABLE_MARKER: &str = "t_";

const SEPARATOR: char = '-';

static CODE_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<prefix>[^\s/\\]+?)-)?C(?P<copy>\d{3})-P(?P<page>\d{2})$")
        .expect("identity code grammar is a valid regex")
});

static EXAM_NAME_GRAMMAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s/\\]+$").expect("exam name grammar is a valid regex"));

/// A validated page identity code.
///
/// Construction validates the grammar, so every derived field is always
/// available and an invalid code can never be classified as cover/non-cover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityCode {
    exam_name: String,
    copy: u32,
    page: u32,
    has_table: bool,
}

impl IdentityCode {
    /// Build a code from its fields (used when tagging exam copies).
    pub fn new(exam_name: &str, copy: u32, page: u32) -> Result<Self> {
        if copy > 999 || page > 99 {
            return Err(GradingError::MalformedCode(format!(
                "copy {} / page {} out of range",
                copy, page
            )));
        }
        if !exam_name.is_empty() && !EXAM_NAME_GRAMMAR.is_match(exam_name) {
            return Err(GradingError::MalformedCode(exam_name.to_string()));
        }
        Ok(Self {
            exam_name: exam_name.to_string(),
            copy,
            page,
            has_table: false,
        })
    }

    /// Parse a raw code. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (has_table, body) = match trimmed.strip_prefix(TABLE_MARKER) {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let caps = CODE_GRAMMAR
            .captures(body)
            .ok_or_else(|| GradingError::MalformedCode(raw.to_string()))?;

        // Both groups are \d{2,3}, so these parses cannot overflow
        let copy = caps["copy"]
            .parse()
            .map_err(|_| GradingError::MalformedCode(raw.to_string()))?;
        let page = caps["page"]
            .parse()
            .map_err(|_| GradingError::MalformedCode(raw.to_string()))?;

        Ok(Self {
            exam_name: caps
                .name("prefix")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            copy,
            page,
            has_table,
        })
    }

    /// Parse the code a single-page document is named after
    /// (`pages/t_MTH309-C002-P03.pdf` -> `t_MTH309-C002-P03`).
    pub fn from_file_name(name: &str) -> Result<Self> {
        let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
        let stem = base.strip_suffix(".pdf").unwrap_or(base);
        Self::parse(stem)
    }

    /// Copy-independent exam name; empty when the code has no prefix.
    pub fn exam_name(&self) -> &str {
        &self.exam_name
    }

    pub fn page_number(&self) -> u32 {
        self.page
    }

    pub fn is_cover(&self) -> bool {
        self.page == 0
    }

    pub fn has_table(&self) -> bool {
        self.has_table
    }

    /// Identity of the physical exam copy: the code with the page suffix stripped.
    pub fn exam_code(&self) -> String {
        if self.exam_name.is_empty() {
            format!("C{:03}", self.copy)
        } else {
            format!("{}{}C{:03}", self.exam_name, SEPARATOR, self.copy)
        }
    }

    /// The code without the table marker.
    pub fn code(&self) -> String {
        format!("{}{}P{:02}", self.exam_code(), SEPARATOR, self.page)
    }

    pub fn with_table(&self) -> Self {
        Self {
            has_table: true,
            ..self.clone()
        }
    }

    pub fn without_table(&self) -> Self {
        Self {
            has_table: false,
            ..self.clone()
        }
    }

    /// Name of the single-page document holding this page.
    pub fn file_name(&self) -> String {
        format!("{}.pdf", self)
    }

    /// Grouping key of the per-problem aggregate this page belongs to.
    pub fn aggregate_key(&self) -> AggregateKey {
        AggregateKey {
            exam_name: self.exam_name.clone(),
            page: self.page,
        }
    }

    fn sort_key(&self) -> (&str, u32, u32, bool) {
        (&self.exam_name, self.copy, self.page, self.has_table)
    }
}

impl fmt::Display for IdentityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_table {
            f.write_str(TABLE_MARKER)?;
        }
        f.write_str(&self.code())
    }
}

impl FromStr for IdentityCode {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Ord for IdentityCode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for IdentityCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The identity minus the copy number: one aggregate document per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub exam_name: String,
    pub page: u32,
}

impl AggregateKey {
    /// File name of the aggregate document, e.g. `MTH309_page_3.pdf`.
    pub fn document_name(&self) -> String {
        if self.exam_name.is_empty() {
            format!("page_{}.pdf", self.page)
        } else {
            format!("{}_page_{}.pdf", self.exam_name, self.page)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_prefix() {
        let code = IdentityCode::parse("MTH309-C002-P03").unwrap();
        assert_eq!(code.exam_name(), "MTH309");
        assert_eq!(code.page_number(), 3);
        assert_eq!(code.exam_code(), "MTH309-C002");
        assert!(!code.has_table());
        assert!(!code.is_cover());
    }

    #[test]
    fn test_parse_prefix_with_separator() {
        let code = IdentityCode::parse("MTH309-FALL-C017-P00").unwrap();
        assert_eq!(code.exam_name(), "MTH309-FALL");
        assert_eq!(code.exam_code(), "MTH309-FALL-C017");
        assert!(code.is_cover());
    }

    #[test]
    fn test_parse_without_prefix_and_marker() {
        let code = IdentityCode::parse("t_C004-P12").unwrap();
        assert_eq!(code.exam_name(), "");
        assert!(code.has_table());
        assert_eq!(code.exam_code(), "C004");
        assert_eq!(code.code(), "C004-P12");
        assert_eq!(code.to_string(), "t_C004-P12");
    }

    #[test]
    fn test_malformed_codes_rejected() {
        for raw in [
            "",
            "C04-P03",
            "MTH309-C04-P03",
            "MTH309-C004-P3",
            "MTH309_C002_P03",
            "MTH309-C002-P03x",
            "MTH309-XC002-P03",
            "MTH 309-C002-P03",
            "-C002-P03",
        ] {
            assert!(IdentityCode::parse(raw).is_err(), "{:?} should be invalid", raw);
        }
    }

    #[test]
    fn test_roundtrip_of_derived_fields() {
        for raw in ["MTH309-C002-P00", "t_MTH309-C002-P03", "C999-P99", "A-B-C001-P01"] {
            let parsed = IdentityCode::parse(raw).unwrap();
            let again = IdentityCode::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, again);
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn test_cover_iff_page_zero() {
        assert!(IdentityCode::parse("MTH309-C002-P00").unwrap().is_cover());
        assert!(!IdentityCode::parse("MTH309-C002-P01").unwrap().is_cover());
        assert!(!IdentityCode::parse("MTH309-C002-P10").unwrap().is_cover());
    }

    #[test]
    fn test_from_file_name() {
        let code = IdentityCode::from_file_name("pages/t_MTH309-C005-P03.pdf").unwrap();
        assert!(code.has_table());
        assert_eq!(code.code(), "MTH309-C005-P03");
        assert_eq!(code.file_name(), "t_MTH309-C005-P03.pdf");
        assert_eq!(code.without_table().file_name(), "MTH309-C005-P03.pdf");
    }

    #[test]
    fn test_aggregate_key_ignores_copy() {
        let a = IdentityCode::parse("MTH309-C001-P03").unwrap();
        let b = IdentityCode::parse("t_MTH309-C042-P03").unwrap();
        assert_eq!(a.aggregate_key(), b.aggregate_key());
        assert_eq!(a.aggregate_key().document_name(), "MTH309_page_3.pdf");

        let bare = IdentityCode::parse("C001-P00").unwrap();
        assert_eq!(bare.aggregate_key().document_name(), "page_0.pdf");
    }

    #[test]
    fn test_aggregate_document_names() {
        let key = IdentityCode::parse("MTH309-FALL-C004-P12").unwrap().aggregate_key();
        assert_eq!(key.document_name(), "MTH309-FALL_page_12.pdf");
        let bare = IdentityCode::parse("C004-P00").unwrap().aggregate_key();
        assert_eq!(bare.document_name(), "page_0.pdf");
    }

    #[test]
    fn test_ordering_by_copy_number() {
        let mut codes: Vec<IdentityCode> = ["MTH309-C010-P03", "MTH309-C002-P03", "MTH309-C001-P03"]
            .iter()
            .map(|s| IdentityCode::parse(s).unwrap())
            .collect();
        codes.sort();
        let copies: Vec<String> = codes.iter().map(|c| c.exam_code()).collect();
        assert_eq!(copies, vec!["MTH309-C001", "MTH309-C002", "MTH309-C010"]);
    }

    #[test]
    fn test_new_validates_ranges() {
        assert_eq!(
            IdentityCode::new("MTH309", 2, 3).unwrap().to_string(),
            "MTH309-C002-P03"
        );
        assert!(IdentityCode::new("MTH309", 1000, 3).is_err());
        assert!(IdentityCode::new("MTH 309", 1, 3).is_err());
        assert_eq!(IdentityCode::new("", 7, 0).unwrap().to_string(), "C007-P00");
    }
}
