use chrono::{Local, Utc};
use rusqlite::OptionalExtension;
use serde_json::json;

use crate::dues;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

const RECEIPT_RETRIES: usize = 5;

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_record_payments() {
        return err(&req.id, "permission_denied", "cashier role required", None);
    }

    let student_id = match helpers::require_i64(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let amount = match helpers::require_f64(req, "amount") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !amount.is_finite() || amount <= 0.0 {
        return err(&req.id, "bad_params", "amount must be a positive number", None);
    }
    let academic_year = helpers::opt_str(req, "academicYear")
        .map(str::to_string)
        .unwrap_or_else(dues::current_academic_year);
    let payment_date = match helpers::opt_str(req, "paymentDate") {
        Some(raw) => match dues::parse_payment_date(raw) {
            Some(d) => d,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unparseable paymentDate: {raw}"),
                    None,
                )
            }
        },
        None => Local::now().date_naive(),
    };

    let student: Result<Option<String>, _> = conn
        .query_row(
            "SELECT index_no FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional();
    let index_no = match student {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", format!("no student {student_id}"), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // The serial is random; retry on the rare collision with an existing
    // receipt in this workspace.
    let mut receipt_no = None;
    for _ in 0..RECEIPT_RETRIES {
        let candidate = dues::generate_receipt_number();
        let taken: Result<Option<i64>, _> = conn
            .query_row(
                "SELECT id FROM payments WHERE receipt_no = ?",
                [&candidate],
                |r| r.get(0),
            )
            .optional();
        match taken {
            Ok(None) => {
                receipt_no = Some(candidate);
                break;
            }
            Ok(Some(_)) => continue,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    let Some(receipt_no) = receipt_no else {
        return err(&req.id, "conflict", "could not allocate a receipt number", None);
    };

    if let Err(e) = conn.execute(
        "INSERT INTO payments(student_id, amount, receipt_no, payment_date,
                              academic_year, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            student_id,
            amount,
            &receipt_no,
            payment_date.format("%Y-%m-%d").to_string(),
            &academic_year,
            ctx.user_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    tracing::info!(receipt = %receipt_no, student = %index_no, amount, "payment recorded");

    ok(
        &req.id,
        json!({
            "paymentId": conn.last_insert_rowid(),
            "receiptNo": receipt_no,
            "amount": amount,
            "amountFormatted": dues::format_currency(amount),
            "paymentDate": payment_date.format("%Y-%m-%d").to_string(),
        }),
    )
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_view_payment_history() {
        return err(&req.id, "permission_denied", "payment history not permitted", None);
    }
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(20)
        .clamp(1, 500);

    let mut stmt = match conn.prepare(
        "SELECT pay.id, pay.receipt_no, pay.amount, pay.payment_date, pay.academic_year,
                s.index_no, s.first_name, s.surname, u.username
         FROM payments pay
         JOIN students s ON s.id = pay.student_id
         JOIN users u ON u.id = pay.created_by
         ORDER BY pay.id DESC
         LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit], |row| {
            let amount: f64 = row.get(2)?;
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "receiptNo": row.get::<_, String>(1)?,
                "amount": amount,
                "amountFormatted": dues::format_currency(amount),
                "paymentDate": row.get::<_, String>(3)?,
                "academicYear": row.get::<_, Option<String>>(4)?,
                "indexNo": row.get::<_, String>(5)?,
                "firstName": row.get::<_, String>(6)?,
                "surname": row.get::<_, String>(7)?,
                "recordedBy": row.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(payments) => ok(&req.id, json!({ "payments": payments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.record" => Some(handle_record(state, req)),
        "payments.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
