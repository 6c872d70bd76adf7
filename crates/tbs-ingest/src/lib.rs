//! Workbook parsing and per-row normalization/validation for hierarchy uploads.

use std::io::Cursor;
use std::sync::LazyLock;

use calamine::{Data, Reader};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tbs_core::{HierarchyRow, ManagerIdentity, RoleSlot, RowError};
use thiserror::Error;

pub const CRATE_NAME: &str = "tbs-ingest";

/// Sentinel cell value meaning "this role is explicitly unfilled".
pub const VACANT_SENTINEL: &str = "vacant";

/// Domain appended when a manager has a username but no email cell.
pub const DERIVED_EMAIL_DOMAIN: &str = "thebedshop.co.za";

/// Fixed header row the upload must carry, in no particular column order.
pub const EXPECTED_HEADERS: [&str; 14] = [
    "rm_name",
    "rm_surname",
    "rm_email",
    "rm_username",
    "am_name",
    "am_surname",
    "am_email",
    "am_username",
    "sm_name",
    "sm_email",
    "sm_username",
    "store_name",
    "store_code",
    "region",
];

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("invalid email pattern"));

static STORE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{3,10}$").expect("invalid store code pattern"));

/// Whole-file failure. Aborts the run before anything is written.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unable to open workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("workbook has no worksheets")]
    NoWorksheet,
    #[error("worksheet has no header row")]
    MissingHeader,
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// One worksheet row as uploaded: trimmed strings, zero interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawRow {
    /// 1-based worksheet position, header row counted.
    pub row_number: usize,
    pub rm_name: String,
    pub rm_surname: String,
    pub rm_email: String,
    pub rm_username: String,
    pub am_name: String,
    pub am_surname: String,
    pub am_email: String,
    pub am_username: String,
    pub sm_name: String,
    pub sm_email: String,
    pub sm_username: String,
    pub store_name: String,
    pub store_code: String,
    pub region: String,
}

impl RawRow {
    fn is_blank(&self) -> bool {
        [
            &self.rm_name,
            &self.rm_surname,
            &self.rm_email,
            &self.rm_username,
            &self.am_name,
            &self.am_surname,
            &self.am_email,
            &self.am_username,
            &self.sm_name,
            &self.sm_email,
            &self.sm_username,
            &self.store_name,
            &self.store_code,
            &self.region,
        ]
        .iter()
        .all(|cell| cell.is_empty())
    }
}

/// Open a binary workbook (xlsx/xls autodetected) and return its data rows in
/// worksheet order. Fully blank rows are dropped; everything else is kept
/// verbatim for validation.
pub fn parse_workbook(bytes: &[u8]) -> Result<Vec<RawRow>, ParseError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ParseError::NoWorksheet)?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let grid = range
        .rows()
        .map(|cells| cells.iter().map(cell_to_string).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    rows_from_grid(grid)
}

/// Map a rendered cell grid (header row first) into raw rows. Split out from
/// [`parse_workbook`] so the header contract is testable without workbook
/// fixtures.
pub fn rows_from_grid(grid: Vec<Vec<String>>) -> Result<Vec<RawRow>, ParseError> {
    let mut iter = grid.into_iter();
    let header = iter.next().ok_or(ParseError::MissingHeader)?;
    if header.iter().all(|cell| cell.is_empty()) {
        return Err(ParseError::MissingHeader);
    }

    let missing = EXPECTED_HEADERS
        .iter()
        .filter(|expected| !header.iter().any(|cell| cell == *expected))
        .map(|expected| expected.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ParseError::MissingColumns(missing));
    }

    let index_of = |name: &str| -> usize {
        header
            .iter()
            .position(|cell| cell == name)
            .expect("presence checked above")
    };
    let columns: Vec<usize> = EXPECTED_HEADERS.iter().map(|h| index_of(h)).collect();

    let mut rows = Vec::new();
    for (offset, cells) in iter.enumerate() {
        let cell = |slot: usize| -> String {
            cells
                .get(columns[slot])
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };
        let row = RawRow {
            row_number: offset + 2,
            rm_name: cell(0),
            rm_surname: cell(1),
            rm_email: cell(2),
            rm_username: cell(3),
            am_name: cell(4),
            am_surname: cell(5),
            am_email: cell(6),
            am_username: cell(7),
            sm_name: cell(8),
            sm_email: cell(9),
            sm_username: cell(10),
            store_name: cell(11),
            store_code: cell(12),
            region: cell(13),
        };
        if !row.is_blank() {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        // Store codes and usernames frequently arrive as numeric cells.
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Normalized content of one cell: blank, the `vacant` sentinel, or a value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CellText {
    NotProvided,
    Vacant,
    Value(String),
}

impl CellText {
    fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            CellText::NotProvided
        } else if trimmed.eq_ignore_ascii_case(VACANT_SENTINEL) {
            CellText::Vacant
        } else {
            CellText::Value(trimmed.to_string())
        }
    }

    fn value(&self) -> Option<&str> {
        match self {
            CellText::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Validate one raw row. Produces either a normalized [`HierarchyRow`] or a
/// [`RowError`]; never both, and never a batch-level failure.
pub fn validate_row(raw: &RawRow) -> Result<HierarchyRow, RowError> {
    let fail = |message: String| RowError {
        row_number: raw.row_number,
        message,
    };

    let store_name = match CellText::classify(&raw.store_name) {
        CellText::Value(name) => name,
        _ => {
            return Err(fail("store name and store code are required".into()));
        }
    };
    let store_code = match CellText::classify(&raw.store_code) {
        CellText::Value(code) => code.to_ascii_uppercase(),
        _ => {
            return Err(fail("store name and store code are required".into()));
        }
    };
    if !STORE_CODE_RE.is_match(&store_code) {
        return Err(fail(format!(
            "store code {store_code} must be 3-10 letters or digits"
        )));
    }

    let regional_manager = build_slot(
        raw.row_number,
        "regional manager",
        &raw.rm_name,
        Some(&raw.rm_surname),
        &raw.rm_email,
        &raw.rm_username,
    )?;
    let area_manager = build_slot(
        raw.row_number,
        "area manager",
        &raw.am_name,
        Some(&raw.am_surname),
        &raw.am_email,
        &raw.am_username,
    )?;
    let store_manager = build_slot(
        raw.row_number,
        "store manager",
        &raw.sm_name,
        None,
        &raw.sm_email,
        &raw.sm_username,
    )?;

    Ok(HierarchyRow {
        row_number: raw.row_number,
        store_code,
        store_name,
        region: CellText::classify(&raw.region).value().map(str::to_string),
        regional_manager,
        area_manager,
        store_manager,
    })
}

/// Validate a whole batch, partitioning good rows from per-row errors. One bad
/// row never blocks the others.
pub fn validate_rows(raw_rows: &[RawRow]) -> (Vec<HierarchyRow>, Vec<RowError>) {
    let mut rows = Vec::with_capacity(raw_rows.len());
    let mut errors = Vec::new();
    for raw in raw_rows {
        match validate_row(raw) {
            Ok(row) => rows.push(row),
            Err(err) => errors.push(err),
        }
    }
    (rows, errors)
}

fn build_slot(
    row_number: usize,
    role_label: &str,
    name: &str,
    surname: Option<&str>,
    email: &str,
    username: &str,
) -> Result<RoleSlot, RowError> {
    let fail = |message: String| RowError {
        row_number,
        message,
    };

    let name = CellText::classify(name);
    let surname_cell = surname.map(CellText::classify);
    let email = CellText::classify(email);
    let username = CellText::classify(username);

    // Any explicit sentinel wins over partial data on the same row.
    if [Some(&name), surname_cell.as_ref(), Some(&email), Some(&username)]
        .into_iter()
        .flatten()
        .any(|cell| *cell == CellText::Vacant)
    {
        return Ok(RoleSlot::Vacant);
    }

    // Either cell can stand in for the other; with neither there is no
    // identity to key on and the slot stays unprovided.
    let (email, username) = match (email.value(), username.value()) {
        (None, None) => return Ok(RoleSlot::NotProvided),
        (Some(addr), username) => {
            if !EMAIL_RE.is_match(addr) {
                return Err(fail(format!(
                    "invalid email format for {role_label}: {addr}"
                )));
            }
            let addr = addr.to_ascii_lowercase();
            let username = username
                .map(str::to_string)
                .unwrap_or_else(|| addr.split('@').next().unwrap_or(&addr).to_string());
            (addr, username)
        }
        (None, Some(username)) => (
            format!("{}@{}", username.to_ascii_lowercase(), DERIVED_EMAIL_DOMAIN),
            username.to_string(),
        ),
    };

    let (first_name, last_name) = match (name.value(), surname_cell.as_ref()) {
        // Separate name/surname columns (regional and area managers).
        (Some(first), Some(surname_cell)) => match surname_cell.value() {
            Some(last) => (first.to_string(), last.to_string()),
            None => {
                return Err(fail(format!(
                    "{role_label} surname is required when an email is provided"
                )))
            }
        },
        // Single full-name column (store managers): first token, then the rest.
        (Some(full), None) => {
            let mut parts = full.split_whitespace();
            let first = parts.next().unwrap_or(full).to_string();
            let rest = parts.collect::<Vec<_>>().join(" ");
            let last = if rest.is_empty() { first.clone() } else { rest };
            (first, last)
        }
        (None, _) => {
            return Err(fail(format!(
                "{role_label} name is required when an email is provided"
            )))
        }
    };

    Ok(RoleSlot::Assigned(ManagerIdentity {
        email,
        username,
        first_name,
        last_name,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<String> {
        EXPECTED_HEADERS.iter().map(|h| h.to_string()).collect()
    }

    fn row(cells: [&str; 14]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn full_row() -> [&'static str; 14] {
        [
            "Rita",
            "Mokoena",
            "rita@x.com",
            "rmokoena",
            "Andre",
            "Botha",
            "andre@x.com",
            "abotha",
            "Sam Naidoo",
            "sam@x.com",
            "snaidoo",
            "Cape Town",
            "BED001",
            "Western Cape",
        ]
    }

    #[test]
    fn grid_mapping_reports_missing_columns() {
        let mut header = header();
        header.retain(|h| h != "store_code" && h != "rm_email");
        let err = rows_from_grid(vec![header]).unwrap_err();
        match err {
            ParseError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["rm_email".to_string(), "store_code".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn grid_mapping_tolerates_column_reordering() {
        let mut shuffled = header();
        shuffled.reverse();
        let mut cells = row(full_row());
        cells.reverse();
        let rows = rows_from_grid(vec![shuffled, cells]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].store_code, "BED001");
        assert_eq!(rows[0].rm_email, "rita@x.com");
        assert_eq!(rows[0].row_number, 2);
    }

    #[test]
    fn blank_rows_are_dropped_but_order_is_preserved() {
        let blank = row([""; 14]);
        let rows = rows_from_grid(vec![header(), row(full_row()), blank, row(full_row())]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 2);
        assert_eq!(rows[1].row_number, 4);
    }

    #[test]
    fn empty_grid_is_a_missing_header() {
        assert!(matches!(
            rows_from_grid(vec![]).unwrap_err(),
            ParseError::MissingHeader
        ));
    }

    fn raw(mutate: impl FnOnce(&mut RawRow)) -> RawRow {
        let cells = full_row();
        let mut raw = RawRow {
            row_number: 2,
            rm_name: cells[0].into(),
            rm_surname: cells[1].into(),
            rm_email: cells[2].into(),
            rm_username: cells[3].into(),
            am_name: cells[4].into(),
            am_surname: cells[5].into(),
            am_email: cells[6].into(),
            am_username: cells[7].into(),
            sm_name: cells[8].into(),
            sm_email: cells[9].into(),
            sm_username: cells[10].into(),
            store_name: cells[11].into(),
            store_code: cells[12].into(),
            region: cells[13].into(),
        };
        mutate(&mut raw);
        raw
    }

    #[test]
    fn valid_row_normalizes_code_and_emails() {
        let row = validate_row(&raw(|r| {
            r.store_code = "bed001".into();
            r.rm_email = "Rita@X.com".into();
        }))
        .unwrap();
        assert_eq!(row.store_code, "BED001");
        assert_eq!(row.regional_manager.assigned().unwrap().email, "rita@x.com");
    }

    #[test]
    fn missing_store_fields_fail_the_row() {
        let err = validate_row(&raw(|r| r.store_code = String::new())).unwrap_err();
        assert_eq!(err.row_number, 2);
        assert!(err.message.contains("required"));

        let err = validate_row(&raw(|r| r.store_name = String::new())).unwrap_err();
        assert!(err.message.contains("required"));
    }

    #[test]
    fn malformed_store_code_fails_the_row() {
        let err = validate_row(&raw(|r| r.store_code = "B-1".into())).unwrap_err();
        assert!(err.message.contains("3-10"));
    }

    #[test]
    fn vacant_and_blank_both_leave_the_slot_empty_without_error() {
        let vacant = validate_row(&raw(|r| {
            r.sm_name = "Vacant".into();
            r.sm_email = String::new();
            r.sm_username = String::new();
        }))
        .unwrap();
        assert_eq!(vacant.store_manager, RoleSlot::Vacant);

        let blank = validate_row(&raw(|r| {
            r.sm_name = String::new();
            r.sm_email = String::new();
            r.sm_username = String::new();
        }))
        .unwrap();
        assert_eq!(blank.store_manager, RoleSlot::NotProvided);
    }

    #[test]
    fn vacant_sentinel_wins_over_partial_cells() {
        let row = validate_row(&raw(|r| {
            r.am_name = "VACANT".into();
        }))
        .unwrap();
        assert_eq!(row.area_manager, RoleSlot::Vacant);
    }

    #[test]
    fn bad_email_fails_the_row() {
        let err = validate_row(&raw(|r| r.am_email = "not-an-email".into())).unwrap_err();
        assert!(err.message.contains("invalid email format for area manager"));
    }

    #[test]
    fn email_is_derived_from_username_when_blank() {
        let row = validate_row(&raw(|r| r.am_email = String::new())).unwrap();
        let identity = row.area_manager.assigned().unwrap();
        assert_eq!(identity.email, "abotha@thebedshop.co.za");
    }

    #[test]
    fn username_is_derived_from_email_when_blank() {
        let row = validate_row(&raw(|r| r.rm_username = String::new())).unwrap();
        let identity = row.regional_manager.assigned().unwrap();
        assert_eq!(identity.username, "rita");
    }

    #[test]
    fn name_required_when_identity_present() {
        let err = validate_row(&raw(|r| r.sm_name = String::new())).unwrap_err();
        assert!(err.message.contains("store manager name is required"));
    }

    #[test]
    fn store_manager_full_name_splits_into_first_and_last() {
        let row = validate_row(&raw(|r| r.sm_name = "Sam van der Merwe".into())).unwrap();
        let identity = row.store_manager.assigned().unwrap();
        assert_eq!(identity.first_name, "Sam");
        assert_eq!(identity.last_name, "van der Merwe");
    }

    #[test]
    fn single_token_store_manager_name_reuses_first_as_last() {
        let row = validate_row(&raw(|r| r.sm_name = "Sam".into())).unwrap();
        let identity = row.store_manager.assigned().unwrap();
        assert_eq!(identity.first_name, "Sam");
        assert_eq!(identity.last_name, "Sam");
    }

    #[test]
    fn batch_validation_partitions_without_aborting() {
        let good = raw(|_| {});
        let bad = raw(|r| {
            r.row_number = 3;
            r.store_code = String::new();
        });
        let (rows, errors) = validate_rows(&[good, bad]);
        assert_eq!(rows.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_number, 3);
    }
}
