//! The student roster (gradebook).
//!
//! One row per student, keyed by the person number. The `qr_code` column
//! holds the exam copy assigned to the student once their cover page has been
//! matched; a copy is assigned to at most one student at a time. Columns the
//! pipeline does not know about are carried through untouched.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;

use calamine::{open_workbook_from_rs, Data, Range, Reader, Xlsb, Xlsx};
use chrono::{Duration, Local, NaiveDate};
use tracing::{info, warn};

use crate::error::{GradingError, Result};
use crate::ledger::write_atomic;

pub const ID_COLUMN: &str = "person_number";
pub const CODE_COLUMN: &str = "qr_code";
pub const ADDED_COLUMN: &str = "person_num_added";
pub const EMAIL_COLUMN: &str = "email";

/// Timestamp format of the `person_num_added` column.
const ADDED_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct Roster {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    id_col: usize,
    code_col: usize,
}

impl Roster {
    /// Build a roster from a header row and data rows.
    ///
    /// The id column is mandatory and its values must be unique. The code
    /// and email columns are added when absent.
    pub fn from_table(mut headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        for h in headers.iter_mut() {
            *h = h.trim().to_string();
        }
        let id_col = headers
            .iter()
            .position(|h| h == ID_COLUMN)
            .ok_or_else(|| {
                GradingError::Roster(format!("missing required column '{}'", ID_COLUMN))
            })?;
        for column in [CODE_COLUMN, EMAIL_COLUMN] {
            if !headers.iter().any(|h| h == column) {
                headers.push(column.to_string());
            }
        }
        let code_col = headers
            .iter()
            .position(|h| h == CODE_COLUMN)
            .ok_or_else(|| GradingError::Roster(format!("missing column '{}'", CODE_COLUMN)))?;

        let width = headers.len();
        let mut roster = Self {
            headers,
            rows: Vec::with_capacity(rows.len()),
            id_col,
            code_col,
        };
        for mut row in rows {
            if row.iter().all(|v| v.trim().is_empty()) {
                continue;
            }
            row.resize(width, String::new());
            for value in row.iter_mut() {
                *value = value.trim().to_string();
            }
            let id = &row[id_col];
            if id.is_empty() {
                return Err(GradingError::Roster("row without a person number".to_string()));
            }
            if roster.find(id).is_some() {
                return Err(GradingError::Roster(format!("duplicate person number {}", id)));
            }
            let code = &row[code_col];
            if !code.is_empty() && roster.student_with_code(code).is_some() {
                return Err(GradingError::Roster(format!("exam copy {} assigned twice", code)));
            }
            roster.rows.push(row);
        }
        Ok(roster)
    }

    /// Parse gradebook CSV data.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(GradingError::Roster("roster has no header row".to_string()));
        }
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(|f| f.to_string()).collect());
        }
        Self::from_table(headers, rows)
    }

    /// Load the session gradebook.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GradingError::MissingPrerequisite(format!(
                "gradebook {:?} not found",
                path
            )));
        }
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Read a roster from `.csv`, `.xlsx`/`.xlsm` or `.xlsb`.
    /// Spreadsheets are read from their first worksheet.
    pub fn import(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let data = std::fs::read(path)?;

        let roster = match ext.as_str() {
            "csv" => Self::from_reader(data.as_slice())?,
            "xlsx" | "xlsm" => {
                let mut workbook: Xlsx<Cursor<Vec<u8>>> = open_workbook_from_rs(Cursor::new(data))
                    .map_err(|e: calamine::XlsxError| GradingError::Spreadsheet(e.to_string()))?;
                let range = first_sheet::<Cursor<Vec<u8>>, _>(&mut workbook)?;
                Self::from_range(&range)?
            }
            "xlsb" => {
                let mut workbook: Xlsb<Cursor<Vec<u8>>> = open_workbook_from_rs(Cursor::new(data))
                    .map_err(|e: calamine::XlsbError| GradingError::Spreadsheet(e.to_string()))?;
                let range = first_sheet::<Cursor<Vec<u8>>, _>(&mut workbook)?;
                Self::from_range(&range)?
            }
            _ => {
                return Err(GradingError::Spreadsheet(format!(
                    "unsupported roster type .{} (expected .csv, .xlsx, .xlsm or .xlsb)",
                    ext
                )))
            }
        };
        info!("Imported {} students from {:?}", roster.len(), path);
        Ok(roster)
    }

    fn from_range(range: &Range<Data>) -> Result<Self> {
        let mut rows = range.rows();
        let headers: Vec<String> = rows
            .next()
            .ok_or_else(|| GradingError::Spreadsheet("worksheet is empty".to_string()))?
            .iter()
            .map(cell_to_string)
            .collect();
        let rows = rows.map(|r| r.iter().map(cell_to_string).collect()).collect();
        Self::from_table(headers, rows)
    }

    /// Atomically write the roster as CSV.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| GradingError::Roster(format!("failed to flush roster: {}", e)))?;
        write_atomic(path, &bytes)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.find(student_id).is_some()
    }

    /// Exam copy assigned to a student, if any.
    pub fn code_of(&self, student_id: &str) -> Option<&str> {
        let row = self.find(student_id)?;
        Some(self.rows[row][self.code_col].as_str()).filter(|c| !c.is_empty())
    }

    /// Student currently holding an exam copy.
    pub fn student_with_code(&self, exam_code: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|r| r[self.code_col] == exam_code)
            .map(|r| r[self.id_col].as_str())
    }

    /// Assign an exam copy to a student, releasing it from any other student.
    pub fn assign_code(&mut self, student_id: &str, exam_code: &str) -> Result<()> {
        let row = self
            .find(student_id)
            .ok_or_else(|| GradingError::Roster(format!("unknown person number {}", student_id)))?;
        for (i, r) in self.rows.iter_mut().enumerate() {
            if i != row && r[self.code_col] == exam_code {
                warn!(
                    "Exam copy {} moves from {} to {}",
                    exam_code, r[self.id_col], student_id
                );
                r[self.code_col].clear();
            }
        }
        self.rows[row][self.code_col] = exam_code.to_string();
        Ok(())
    }

    /// Add a student not listed in the roster, stamped with the current time.
    pub fn add_student(&mut self, student_id: &str) -> Result<()> {
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return Err(GradingError::Roster("empty person number".to_string()));
        }
        if self.contains(student_id) {
            return Err(GradingError::Roster(format!(
                "person number {} already in roster",
                student_id
            )));
        }
        let added_col = match self.headers.iter().position(|h| h == ADDED_COLUMN) {
            Some(col) => col,
            None => {
                self.headers.push(ADDED_COLUMN.to_string());
                for row in self.rows.iter_mut() {
                    row.push(String::new());
                }
                self.headers.len() - 1
            }
        };

        let mut row = vec![String::new(); self.headers.len()];
        row[self.id_col] = student_id.to_string();
        row[added_col] = Local::now().format(ADDED_FORMAT).to_string();
        self.rows.push(row);
        info!("Added person number {} to the roster", student_id);
        Ok(())
    }

    /// Header row, in file order.
    pub fn columns(&self) -> &[String] {
        &self.headers
    }

    /// Value of `column` for the student holding `exam_code`.
    pub fn value_for_code(&self, exam_code: &str, column: &str) -> Option<&str> {
        if exam_code.is_empty() {
            return None;
        }
        let col = self.headers.iter().position(|h| h == column)?;
        self.rows
            .iter()
            .find(|r| r[self.code_col] == exam_code)
            .map(|r| r[col].as_str())
    }

    /// Drop the named columns. The id and code columns cannot be dropped.
    pub fn remove_columns(&mut self, names: &[String]) -> Result<()> {
        if let Some(key) = names.iter().find(|n| *n == ID_COLUMN || *n == CODE_COLUMN) {
            return Err(GradingError::Roster(format!("column '{}' cannot be removed", key)));
        }
        let keep: Vec<bool> = self.headers.iter().map(|h| !names.contains(h)).collect();
        retain_columns(&mut self.headers, &keep);
        for row in self.rows.iter_mut() {
            retain_columns(row, &keep);
        }
        self.locate_key_columns()
    }

    /// Append columns filled from `values`, keyed by the exam copy in the
    /// code column. Students without an entry get empty cells. Returns the
    /// number of students that received values.
    pub fn merge_by_code(
        &mut self,
        names: &[String],
        values: &BTreeMap<String, Vec<String>>,
    ) -> usize {
        let code_col = self.code_col;
        let mut matched = 0;
        self.headers.extend(names.iter().cloned());
        for row in self.rows.iter_mut() {
            let cells = match row[code_col].as_str() {
                "" => None,
                code => values.get(code),
            };
            match cells {
                Some(cells) => {
                    matched += 1;
                    let filled = (0..names.len())
                        .map(|i| cells.get(i).cloned().unwrap_or_default());
                    row.extend(filled);
                }
                None => row.resize(row.len() + names.len(), String::new()),
            }
        }
        matched
    }

    /// Move `name` to the last column, adding it empty when absent.
    pub fn move_column_last(&mut self, name: &str) -> Result<()> {
        match self.headers.iter().position(|h| h == name) {
            Some(col) => {
                let header = self.headers.remove(col);
                self.headers.push(header);
                for row in self.rows.iter_mut() {
                    let value = row.remove(col);
                    row.push(value);
                }
            }
            None => {
                self.headers.push(name.to_string());
                for row in self.rows.iter_mut() {
                    row.push(String::new());
                }
            }
        }
        self.locate_key_columns()
    }

    fn locate_key_columns(&mut self) -> Result<()> {
        let position = |name: &str| {
            self.headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| GradingError::Roster(format!("missing column '{}'", name)))
        };
        let (id_col, code_col) = (position(ID_COLUMN)?, position(CODE_COLUMN)?);
        self.id_col = id_col;
        self.code_col = code_col;
        Ok(())
    }

    fn find(&self, student_id: &str) -> Option<usize> {
        let wanted = canonical_id(student_id);
        self.rows
            .iter()
            .position(|r| canonical_id(&r[self.id_col]) == wanted)
    }
}

/// Person numbers compare without surrounding whitespace or leading zeros,
/// so a bubble read of `01234567` matches a stored `1234567`.
fn canonical_id(id: &str) -> &str {
    let trimmed = id.trim();
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() && !trimmed.is_empty() {
        "0"
    } else {
        stripped
    }
}

fn retain_columns(cells: &mut Vec<String>, keep: &[bool]) {
    let mut col = 0;
    cells.retain(|_| {
        let kept = keep.get(col).copied().unwrap_or(true);
        col += 1;
        kept
    });
}

fn first_sheet<RS, R>(workbook: &mut R) -> Result<Range<Data>>
where
    RS: std::io::Read + std::io::Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    let name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| GradingError::Spreadsheet("workbook has no worksheets".to_string()))?;
    workbook
        .worksheet_range(&name)
        .map_err(|e| GradingError::Spreadsheet(format!("sheet '{}': {}", name, e)))
}

/// Render a spreadsheet cell the way it would appear in a CSV export.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Person numbers are often stored as floats
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

/// Excel serial date (days since 1899-12-30) in the roster timestamp format.
fn excel_serial_to_string(serial: f64) -> String {
    let seconds = (serial * 86_400.0).round() as i64;
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|epoch| epoch.checked_add_signed(Duration::seconds(seconds)))
        .map(|dt| dt.format(ADDED_FORMAT).to_string())
        .unwrap_or_else(|| serial.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRADEBOOK: &str =
        "person_number,name,qr_code\n12345678,Ada,\n50012345,Grace,MTH309-C007\n";

    fn field<'a>(roster: &'a Roster, student_id: &str, column: &str) -> Option<&'a str> {
        let col = roster.headers.iter().position(|h| h == column)?;
        let row = roster.find(student_id)?;
        Some(roster.rows[row][col].as_str())
    }

    fn roster() -> Roster {
        Roster::from_reader(GRADEBOOK.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_and_lookup() {
        let roster = roster();
        assert_eq!(roster.len(), 2);
        assert!(roster.contains("12345678"));
        assert!(!roster.contains("99999999"));
        assert_eq!(roster.code_of("12345678"), None);
        assert_eq!(roster.code_of("50012345"), Some("MTH309-C007"));
        assert_eq!(roster.student_with_code("MTH309-C007"), Some("50012345"));
        assert_eq!(field(&roster, "12345678", "name"), Some("Ada"));
        assert!(roster.headers.iter().any(|h| h == EMAIL_COLUMN));
    }

    #[test]
    fn test_missing_code_column_is_added() {
        let roster = Roster::from_reader("person_number,name\n1,A\n".as_bytes()).unwrap();
        assert!(roster.headers.iter().any(|h| h == CODE_COLUMN));
        assert_eq!(roster.code_of("1"), None);
    }

    #[test]
    fn test_missing_id_column_rejected() {
        let err = Roster::from_reader("name,qr_code\nAda,\n".as_bytes()).unwrap_err();
        assert!(matches!(err, GradingError::Roster(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let data = "person_number\n12\n012\n";
        assert!(Roster::from_reader(data.as_bytes()).is_err());
    }

    #[test]
    fn test_leading_zeros_ignored_in_lookup() {
        let roster = Roster::from_reader("person_number\n1234567\n0\n".as_bytes()).unwrap();
        assert!(roster.contains("01234567"));
        assert!(roster.contains("00000000"));
    }

    #[test]
    fn test_assign_code_is_one_to_one() {
        let mut roster = roster();
        roster.assign_code("12345678", "MTH309-C007").unwrap();
        assert_eq!(roster.student_with_code("MTH309-C007"), Some("12345678"));
        assert_eq!(roster.code_of("50012345"), None);
        assert_eq!(roster.student_with_code("MTH309-C002"), None);
        assert!(roster.assign_code("11111111", "MTH309-C001").is_err());
    }

    #[test]
    fn test_add_student_stamps_time() {
        let mut roster = roster();
        roster.add_student("77777777").unwrap();
        assert!(roster.contains("77777777"));
        let stamp = field(&roster, "77777777", ADDED_COLUMN).unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, ADDED_FORMAT).is_ok());
        assert_eq!(field(&roster, "12345678", ADDED_COLUMN), Some(""));
        assert!(roster.add_student("77777777").is_err());
    }

    #[test]
    fn test_merge_by_code_fills_assigned_students() {
        let mut roster = roster();
        let names = vec!["page_1".to_string(), "total".to_string()];
        let values = BTreeMap::from([
            ("MTH309-C007".to_string(), vec!["4".to_string(), "4".to_string()]),
            ("MTH309-C099".to_string(), vec!["1".to_string(), "1".to_string()]),
        ]);
        assert_eq!(roster.merge_by_code(&names, &values), 1);
        assert_eq!(field(&roster, "50012345", "page_1"), Some("4"));
        assert_eq!(field(&roster, "12345678", "total"), Some(""));
        assert_eq!(roster.value_for_code("MTH309-C007", "total"), Some("4"));
        assert_eq!(roster.value_for_code("MTH309-C099", "total"), None);
    }

    #[test]
    fn test_remove_and_move_columns_keep_keys() {
        let data = "name,grade,person_number,qr_code\nAda,B,1,MTH309-C001\n";
        let mut roster = Roster::from_reader(data.as_bytes()).unwrap();
        roster.remove_columns(&["name".to_string()]).unwrap();
        roster.move_column_last("grade").unwrap();
        roster.move_column_last("total").unwrap();
        assert_eq!(roster.columns(), ["person_number", "qr_code", "email", "grade", "total"]);
        assert_eq!(roster.code_of("1"), Some("MTH309-C001"));
        assert_eq!(field(&roster, "1", "grade"), Some("B"));

        let err = roster.remove_columns(&[CODE_COLUMN.to_string()]).unwrap_err();
        assert!(matches!(err, GradingError::Roster(_)));
        assert_eq!(roster.code_of("1"), Some("MTH309-C001"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradebook.csv");
        let mut roster = roster();
        roster.assign_code("12345678", "MTH309-C002").unwrap();
        roster.save(&path).unwrap();

        let reloaded = Roster::load(&path).unwrap();
        assert_eq!(reloaded, roster);
        assert_eq!(field(&reloaded, "50012345", "name"), Some("Grace"));
    }

    #[test]
    fn test_load_missing_gradebook() {
        let dir = tempfile::tempdir().unwrap();
        let err = Roster::load(&dir.path().join("gradebook.csv")).unwrap_err();
        assert!(matches!(err, GradingError::MissingPrerequisite(_)));
    }

    #[test]
    fn test_import_csv_and_reject_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("students.csv");
        std::fs::write(&csv_path, GRADEBOOK).unwrap();
        assert_eq!(Roster::import(&csv_path).unwrap().len(), 2);

        let txt_path = dir.path().join("students.txt");
        std::fs::write(&txt_path, GRADEBOOK).unwrap();
        assert!(matches!(
            Roster::import(&txt_path).unwrap_err(),
            GradingError::Spreadsheet(_)
        ));
    }

    #[test]
    fn test_cell_to_string() {
        assert_eq!(cell_to_string(&Data::Float(12345678.0)), "12345678");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::Empty), "");
        assert_eq!(excel_serial_to_string(45000.5), "15/03/2023 12:00:00");
    }
}
