use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use chrono::{Local, NaiveDate, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

use crate::db;
use crate::dues;

/// Every column must be present in the header (any order); a subset match is
/// rejected before any row is processed. The password column is carried by
/// the source files but not consumed here.
pub const EXPECTED_COLUMNS: [&str; 11] = [
    "Name",
    "Index No",
    "Email",
    "Phone",
    "Academic Year",
    "Dues Paid",
    "Receipt No",
    "Programme of Study",
    "payment date",
    "password",
    "position",
];

/// Fatal import faults. Per-row problems never surface here; they land in
/// the report and the run continues.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot open CSV source: {0}")]
    SourceUnavailable(String),

    #[error("CSV header missing expected columns: {}", missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    #[error("import aborted, batch rolled back: {0}")]
    Aborted(#[from] rusqlite::Error),
}

/// One raw data row, header-keyed fields already trimmed. Absent cells
/// (short records) read as empty strings.
#[derive(Debug, Default)]
pub struct ImportRow {
    pub name: String,
    pub index_no: String,
    pub email: String,
    pub phone: String,
    pub academic_year: String,
    pub dues_paid: String,
    pub receipt_no: String,
    pub programme: String,
    pub payment_date: String,
    pub position: String,
}

impl ImportRow {
    fn from_record(rec: &StringRecord, col: &HashMap<String, usize>) -> ImportRow {
        let field = |name: &str| -> String {
            col.get(name)
                .and_then(|i| rec.get(*i))
                .unwrap_or("")
                .trim()
                .to_string()
        };
        ImportRow {
            name: field("Name"),
            index_no: field("Index No"),
            email: field("Email"),
            phone: field("Phone"),
            academic_year: field("Academic Year"),
            dues_paid: field("Dues Paid"),
            receipt_no: field("Receipt No"),
            programme: field("Programme of Study"),
            payment_date: field("payment date"),
            position: field("position"),
        }
    }
}

/// A row that passed validation and is ready to insert.
#[derive(Debug)]
pub struct StudentCandidate {
    pub index_no: String,
    pub first_name: String,
    pub surname: String,
    pub email: String,
    pub phone: String,
    pub academic_year: String,
    pub programme_id: i64,
    pub position: String,
    pub dues_paid: f64,
    pub receipt_no: String,
    pub payment_date: Option<NaiveDate>,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub errors: Vec<String>,
}

enum RowOutcome {
    Imported,
    Skipped(String),
}

/// Split a "Surname, First" name cell once on the first comma. A missing
/// side comes back empty and fails the required-field check downstream.
pub fn split_name(name: &str) -> (String, String) {
    match name.split_once(',') {
        Some((surname, first)) => (surname.trim().to_string(), first.trim().to_string()),
        None => (name.trim().to_string(), String::new()),
    }
}

/// Import students from a CSV file inside one all-or-nothing transaction.
///
/// Validation failures and duplicates are per-row skips recorded in the
/// report; any datastore fault rolls back every insert from this call and
/// surfaces as `ImportError::Aborted`. Bootstrapped payment rows are
/// attributed to `actor_id`, the authenticated importing user.
pub fn import_students_csv(
    conn: &Connection,
    csv_path: &Path,
    actor_id: i64,
) -> Result<ImportReport, ImportError> {
    let file = File::open(csv_path).map_err(|e| {
        ImportError::SourceUnavailable(format!("{}: {e}", csv_path.to_string_lossy()))
    })?;
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(file);

    let headers = rdr
        .headers()
        .map_err(|e| ImportError::SourceUnavailable(e.to_string()))?
        .clone();
    let mut col: HashMap<String, usize> = HashMap::new();
    for (i, h) in headers.iter().enumerate() {
        col.entry(h.trim().to_string()).or_insert(i);
    }
    let missing: Vec<String> = EXPECTED_COLUMNS
        .iter()
        .filter(|c| !col.contains_key(**c))
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ImportError::SchemaMismatch { missing });
    }

    let tx = conn.unchecked_transaction()?;
    let mut report = ImportReport::default();
    let mut row_no = 1usize; // header is row 1

    for rec in rdr.records() {
        row_no += 1;
        let rec = match rec {
            Ok(r) => r,
            Err(e) => {
                report
                    .errors
                    .push(format!("Row {row_no}: malformed CSV record: {e}"));
                continue;
            }
        };
        if rec.iter().all(|f| f.trim().is_empty()) {
            continue;
        }

        let row = ImportRow::from_record(&rec, &col);
        let outcome = match process_row(&tx, row_no, &row, actor_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return Err(ImportError::Aborted(e));
            }
        };
        match outcome {
            RowOutcome::Imported => report.imported += 1,
            RowOutcome::Skipped(reason) => report.errors.push(reason),
        }
    }

    tx.commit()?;
    tracing::info!(
        imported = report.imported,
        skipped = report.errors.len(),
        source = %csv_path.to_string_lossy(),
        "csv import committed"
    );
    Ok(report)
}

fn process_row(
    tx: &Connection,
    row_no: usize,
    row: &ImportRow,
    actor_id: i64,
) -> rusqlite::Result<RowOutcome> {
    let candidate = match validate_row(tx, row_no, row)? {
        Ok(c) => c,
        Err(reason) => return Ok(RowOutcome::Skipped(reason)),
    };
    if let Some(reason) = duplicate_reason(tx, row_no, &candidate)? {
        return Ok(RowOutcome::Skipped(reason));
    }
    insert_candidate(tx, &candidate, actor_id)?;
    Ok(RowOutcome::Imported)
}

/// Validation order, short-circuiting on the first failure:
/// required fields, email shape, dues normalization, programme lookup.
/// An unparsable dues cell silently becomes zero (no payment row), matching
/// the long-standing behavior of the system this replaces.
fn validate_row(
    tx: &Connection,
    row_no: usize,
    row: &ImportRow,
) -> rusqlite::Result<Result<StudentCandidate, String>> {
    let (surname, first_name) = split_name(&row.name);

    if row.index_no.is_empty() || row.email.is_empty() || first_name.is_empty() || surname.is_empty()
    {
        return Ok(Err(format!(
            "Row {row_no}: Missing required fields (Index No, Email, Name)"
        )));
    }

    if !dues::is_valid_email(&row.email) {
        return Ok(Err(format!(
            "Row {row_no}: Invalid email format: {}",
            row.email
        )));
    }

    let dues_paid = dues::parse_dues_amount(&row.dues_paid).unwrap_or(0.0);

    let Some(programme_id) = db::programme_id_by_name(tx, &row.programme)? else {
        return Ok(Err(format!(
            "Row {row_no}: Unknown programme: {}",
            row.programme
        )));
    };

    Ok(Ok(StudentCandidate {
        index_no: row.index_no.clone(),
        first_name,
        surname,
        email: row.email.clone(),
        phone: row.phone.clone(),
        academic_year: row.academic_year.clone(),
        programme_id,
        position: row.position.clone(),
        dues_paid,
        receipt_no: row.receipt_no.clone(),
        payment_date: dues::parse_payment_date(&row.payment_date),
    }))
}

/// Runs inside the ambient transaction, so rows inserted earlier in the same
/// run are visible. A hit skips the row; the stored record is never touched.
fn duplicate_reason(
    tx: &Connection,
    row_no: usize,
    candidate: &StudentCandidate,
) -> rusqlite::Result<Option<String>> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM students WHERE index_no = ? OR email = ?",
            (&candidate.index_no, &candidate.email),
            |r| r.get(0),
        )
        .optional()?;
    Ok(existing.map(|_| {
        format!(
            "Row {row_no}: Student already exists (Index: {}, Email: {})",
            candidate.index_no, candidate.email
        )
    }))
}

fn insert_candidate(
    tx: &Connection,
    candidate: &StudentCandidate,
    actor_id: i64,
) -> rusqlite::Result<()> {
    let start_date = candidate.payment_date.map(|d| d.format("%Y-%m-%d").to_string());
    tx.execute(
        "INSERT INTO students(index_no, first_name, surname, email, phone,
                              academic_year, programme_id, position, start_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &candidate.index_no,
            &candidate.first_name,
            &candidate.surname,
            &candidate.email,
            &candidate.phone,
            &candidate.academic_year,
            candidate.programme_id,
            &candidate.position,
            &start_date,
            Utc::now().to_rfc3339(),
        ),
    )?;
    let student_id = tx.last_insert_rowid();

    if candidate.dues_paid > 0.0 && !candidate.receipt_no.is_empty() {
        let payment_date = candidate
            .payment_date
            .unwrap_or_else(|| Local::now().date_naive())
            .format("%Y-%m-%d")
            .to_string();
        tx.execute(
            "INSERT INTO payments(student_id, amount, receipt_no, payment_date,
                                  academic_year, created_by, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                student_id,
                candidate.dues_paid,
                &candidate.receipt_no,
                &payment_date,
                &candidate.academic_year,
                actor_id,
                Utc::now().to_rfc3339(),
            ),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    const HEADER: &str = "Name,Index No,Email,Phone,Academic Year,Dues Paid,Receipt No,Programme of Study,payment date,password,position";

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn workspace_conn(dir: &Path) -> Connection {
        db::open_db(dir).expect("open workspace db")
    }

    fn write_csv(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("students.csv");
        let mut f = File::create(&path).expect("create csv");
        for line in lines {
            writeln!(f, "{line}").expect("write csv line");
        }
        path
    }

    fn admin_id(conn: &Connection) -> i64 {
        conn.query_row("SELECT id FROM users WHERE username = 'admin'", [], |r| {
            r.get(0)
        })
        .expect("seeded admin")
    }

    fn student_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn split_name_on_first_comma_only() {
        assert_eq!(split_name("Doe, Jane"), ("Doe".into(), "Jane".into()));
        assert_eq!(
            split_name("Doe, Jane, Jr"),
            ("Doe".into(), "Jane, Jr".into())
        );
        assert_eq!(split_name("Doe"), ("Doe".into(), String::new()));
        assert_eq!(split_name(""), (String::new(), String::new()));
    }

    #[test]
    fn happy_path_creates_student_and_payment() {
        let ws = temp_dir("duesd-import-happy");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,0551234567,2024-2025,GH₵ 150.00,R001,Computer Science,2024-09-01,pw,Member",
            ],
        );

        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        assert!(report.errors.is_empty(), "{:?}", report.errors);

        let (first, surname, start): (String, String, Option<String>) = conn
            .query_row(
                "SELECT first_name, surname, start_date FROM students WHERE index_no = 'IDX001'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(first, "Jane");
        assert_eq!(surname, "Doe");
        assert_eq!(start.as_deref(), Some("2024-09-01"));

        let (amount, date, created_by): (f64, String, i64) = conn
            .query_row(
                "SELECT amount, payment_date, created_by FROM payments WHERE receipt_no = 'R001'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert!((amount - 150.0).abs() < f64::EPSILON);
        assert_eq!(date, "2024-09-01");
        assert_eq!(created_by, admin_id(&conn));

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn unknown_programme_is_a_row_skip() {
        let ws = temp_dir("duesd-import-unknown-prog");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,0551234567,2024-2025,GH₵ 150.00,R001,Nonexistent Programme,2024-09-01,pw,Member",
            ],
        );

        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Row 2:"), "{}", report.errors[0]);
        assert!(report.errors[0].contains("Nonexistent Programme"));
        assert_eq!(student_count(&conn), 0);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn validation_skips_keep_source_row_order() {
        let ws = temp_dir("duesd-import-order");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                // row 2: missing index no
                "\"Doe, Jane\",,jane@x.com,055,2024-2025,0,,Computer Science,,,",
                // row 3: fully empty, silently skipped
                ",,,,,,,,,,",
                // row 4: bad email
                "\"Mensah, Kofi\",IDX002,not-an-email,055,2024-2025,0,,Computer Science,,,",
                // row 5: fine
                "\"Owusu, Ama\",IDX003,ama@x.com,055,2024-2025,0,,Computer Science,,,",
            ],
        );

        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].starts_with("Row 2:"));
        assert!(report.errors[0].contains("Missing required fields"));
        assert!(report.errors[1].starts_with("Row 4:"));
        assert!(report.errors[1].contains("Invalid email format"));

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn name_without_comma_has_no_first_name() {
        let ws = temp_dir("duesd-import-name");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "Cher,IDX004,cher@x.com,055,2024-2025,0,,Computer Science,,,",
            ],
        );
        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 0);
        assert!(report.errors[0].contains("Missing required fields"));
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn header_missing_column_is_schema_mismatch() {
        let ws = temp_dir("duesd-import-schema");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &["Name,Index No,Email,Phone", "\"Doe, Jane\",IDX001,jane@x.com,055"],
        );

        match import_students_csv(&conn, &csv, admin_id(&conn)) {
            Err(ImportError::SchemaMismatch { missing }) => {
                assert!(missing.contains(&"Dues Paid".to_string()));
                assert!(missing.contains(&"Programme of Study".to_string()));
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
        assert_eq!(student_count(&conn), 0);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let ws = temp_dir("duesd-import-nofile");
        let conn = workspace_conn(&ws);
        match import_students_csv(&conn, &ws.join("absent.csv"), admin_id(&conn)) {
            Err(ImportError::SourceUnavailable(_)) => {}
            other => panic!("expected SourceUnavailable, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn unparsable_dues_imports_student_without_payment() {
        let ws = temp_dir("duesd-import-silent-zero");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,N/A,R001,Computer Science,,,",
            ],
        );
        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        assert!(report.errors.is_empty());
        let payments: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(payments, 0);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn negative_dues_imports_student_without_payment() {
        let ws = temp_dir("duesd-import-negative");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,GH₵ -150.00,R001,Computer Science,,,",
            ],
        );
        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        assert!(report.errors.is_empty());
        let payments: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(payments, 0);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn paid_dues_without_receipt_creates_no_payment() {
        let ws = temp_dir("duesd-import-noreceipt");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,150,,Computer Science,,,",
            ],
        );
        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        let payments: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(payments, 0);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn second_run_skips_every_row() {
        let ws = temp_dir("duesd-import-idempotent");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,150,R001,Computer Science,2024-09-01,,",
                "\"Owusu, Ama\",IDX003,ama@x.com,055,2024-2025,80,R002,Computer Science,2024-09-02,,",
            ],
        );

        let first = import_students_csv(&conn, &csv, admin_id(&conn)).expect("first run");
        assert_eq!(first.imported, 2);
        assert!(first.errors.is_empty());

        let second = import_students_csv(&conn, &csv, admin_id(&conn)).expect("second run");
        assert_eq!(second.imported, 0);
        assert_eq!(second.errors.len(), 2);
        assert!(second.errors.iter().all(|e| e.contains("already exists")));
        assert_eq!(student_count(&conn), 2);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn duplicate_within_one_file_is_caught_by_the_ambient_transaction() {
        let ws = temp_dir("duesd-import-intra-dup");
        let conn = workspace_conn(&ws);
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,0,,Computer Science,,,",
                "\"Doe, Janet\",IDX001,janet@x.com,055,2024-2025,0,,Computer Science,,,",
            ],
        );
        let report = import_students_csv(&conn, &csv, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Row 3:"));
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn datastore_fault_rolls_back_the_whole_batch() {
        let ws = temp_dir("duesd-import-atomic");
        let conn = workspace_conn(&ws);
        // Both rows validate and dedup cleanly; the second payment insert
        // trips the unique receipt_no constraint mid-loop.
        let csv = write_csv(
            &ws,
            &[
                HEADER,
                "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,150,R001,Computer Science,2024-09-01,,",
                "\"Owusu, Ama\",IDX003,ama@x.com,055,2024-2025,80,R001,Computer Science,2024-09-02,,",
            ],
        );

        match import_students_csv(&conn, &csv, admin_id(&conn)) {
            Err(ImportError::Aborted(_)) => {}
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert_eq!(student_count(&conn), 0);
        let payments: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(payments, 0);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn malformed_record_is_a_row_skip_not_fatal() {
        let ws = temp_dir("duesd-import-malformed");
        let conn = workspace_conn(&ws);
        let path = ws.join("students.csv");
        let mut f = File::create(&path).expect("create csv");
        writeln!(f, "{HEADER}").unwrap();
        // row 2 carries an invalid UTF-8 byte in the name cell
        f.write_all(b"\"Doe, Ja\xffne\",IDX001,jane@x.com,055,2024-2025,0,,Computer Science,,,\n")
            .unwrap();
        writeln!(
            f,
            "\"Owusu, Ama\",IDX003,ama@x.com,055,2024-2025,0,,Computer Science,,,"
        )
        .unwrap();
        drop(f);

        let report = import_students_csv(&conn, &path, admin_id(&conn)).expect("import");
        assert_eq!(report.imported, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Row 2:"), "{}", report.errors[0]);
        assert!(report.errors[0].contains("malformed"));
        let _ = std::fs::remove_dir_all(ws);
    }
}
