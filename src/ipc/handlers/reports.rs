use serde_json::json;
use std::path::PathBuf;

use crate::dues;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

struct SummaryRow {
    index_no: String,
    first_name: String,
    surname: String,
    email: String,
    academic_year: Option<String>,
    programme: String,
    position: Option<String>,
    total_paid: f64,
    payment_count: i64,
    created_at: String,
}

fn payment_summary_rows(conn: &rusqlite::Connection) -> Result<Vec<SummaryRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT s.index_no, s.first_name, s.surname, s.email, s.academic_year, p.name,
                s.position,
                COALESCE(SUM(pay.amount), 0),
                COUNT(pay.id),
                s.created_at
         FROM students s
         JOIN programmes p ON p.id = s.programme_id
         LEFT JOIN payments pay ON pay.student_id = s.id
         GROUP BY s.id
         ORDER BY s.first_name, s.surname",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SummaryRow {
            index_no: row.get(0)?,
            first_name: row.get(1)?,
            surname: row.get(2)?,
            email: row.get(3)?,
            academic_year: row.get(4)?,
            programme: row.get(5)?,
            position: row.get(6)?,
            total_paid: row.get(7)?,
            payment_count: row.get(8)?,
            created_at: row.get(9)?,
        })
    })?;
    rows.collect()
}

fn handle_dashboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_view_reports() {
        return err(&req.id, "permission_denied", "report role required", None);
    }

    let totals = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM students),
                (SELECT COUNT(*) FROM payments),
                (SELECT COALESCE(SUM(amount), 0) FROM payments)",
        [],
        |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, f64>(2)?,
            ))
        },
    );
    match totals {
        Ok((students, payments, collected)) => ok(
            &req.id,
            json!({
                "studentCount": students,
                "paymentCount": payments,
                "totalCollected": collected,
                "totalCollectedFormatted": dues::format_currency(collected),
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_payment_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_view_reports() {
        return err(&req.id, "permission_denied", "report role required", None);
    }

    match payment_summary_rows(conn) {
        Ok(rows) => {
            let out: Vec<_> = rows
                .iter()
                .map(|r| {
                    json!({
                        "indexNo": r.index_no,
                        "name": format!("{}, {}", r.surname, r.first_name),
                        "email": r.email,
                        "academicYear": r.academic_year,
                        "programme": r.programme,
                        "position": r.position,
                        "totalPaid": r.total_paid,
                        "paymentCount": r.payment_count,
                        "createdAt": r.created_at,
                    })
                })
                .collect();
            ok(&req.id, json!({ "rows": out }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Same summary, written as a CSV file for offline use.
fn handle_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_view_reports() {
        return err(&req.id, "permission_denied", "report role required", None);
    }
    let out_path = match helpers::require_str(req, "outputPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    let rows = match payment_summary_rows(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(&req.id, "export_failed", e.to_string(), None);
        }
    }
    let mut wtr = match csv::Writer::from_path(&out_path) {
        Ok(w) => w,
        Err(e) => return err(&req.id, "export_failed", e.to_string(), None),
    };
    let write = (|| -> Result<(), csv::Error> {
        wtr.write_record([
            "Name",
            "Index No",
            "Email",
            "Academic Year",
            "Programme of Study",
            "position",
            "Dues Paid",
            "Payments",
            "Registered",
        ])?;
        for r in &rows {
            wtr.write_record([
                format!("{}, {}", r.surname, r.first_name),
                r.index_no.clone(),
                r.email.clone(),
                r.academic_year.clone().unwrap_or_default(),
                r.programme.clone(),
                r.position.clone().unwrap_or_default(),
                format!("{:.2}", r.total_paid),
                r.payment_count.to_string(),
                r.created_at.clone(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    })();
    if let Err(e) = write {
        return err(&req.id, "export_failed", e.to_string(), None);
    }
    tracing::info!(path = %out_path.to_string_lossy(), rows = rows.len(), "summary exported");

    ok(
        &req.id,
        json!({ "path": out_path.to_string_lossy(), "rows": rows.len() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.dashboard" => Some(handle_dashboard(state, req)),
        "reports.paymentSummary" => Some(handle_payment_summary(state, req)),
        "reports.exportCsv" => Some(handle_export_csv(state, req)),
        _ => None,
    }
}
