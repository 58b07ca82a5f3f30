use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

use crate::db;
use crate::dues;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = helpers::authenticate(conn, req) {
        return resp;
    }

    // Empty/zero filter values match everything, so the statement stays
    // static and every parameter is always bound.
    let search = helpers::opt_str(req, "search").unwrap_or("");
    let programme_id = req
        .params
        .get("programmeId")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let academic_year = helpers::opt_str(req, "academicYear").unwrap_or("");

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.index_no, s.first_name, s.surname, s.email, s.phone,
                s.academic_year, p.id, p.name, s.position, s.start_date,
                COALESCE((SELECT SUM(amount) FROM payments WHERE student_id = s.id), 0)
         FROM students s JOIN programmes p ON p.id = s.programme_id
         WHERE (?1 = '' OR s.index_no LIKE '%' || ?1 || '%'
                        OR s.first_name LIKE '%' || ?1 || '%'
                        OR s.surname LIKE '%' || ?1 || '%'
                        OR s.email LIKE '%' || ?1 || '%')
           AND (?2 = 0 OR s.programme_id = ?2)
           AND (?3 = '' OR s.academic_year = ?3)
         ORDER BY s.surname, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((search, programme_id, academic_year), |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "indexNo": row.get::<_, String>(1)?,
                "firstName": row.get::<_, String>(2)?,
                "surname": row.get::<_, String>(3)?,
                "email": row.get::<_, String>(4)?,
                "phone": row.get::<_, Option<String>>(5)?,
                "academicYear": row.get::<_, Option<String>>(6)?,
                "programmeId": row.get::<_, i64>(7)?,
                "programme": row.get::<_, String>(8)?,
                "position": row.get::<_, Option<String>>(9)?,
                "startDate": row.get::<_, Option<String>>(10)?,
                "totalPaid": row.get::<_, f64>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_manage_data() {
        return err(&req.id, "permission_denied", "data management role required", None);
    }

    let index_no = match helpers::require_str(req, "indexNo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match helpers::require_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match helpers::require_str(req, "email") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !dues::is_valid_email(email) {
        return err(&req.id, "bad_params", format!("invalid email: {email}"), None);
    }
    let surname = helpers::opt_str(req, "surname").unwrap_or("");
    let phone = helpers::opt_str(req, "phone").unwrap_or("");
    let position = helpers::opt_str(req, "position").unwrap_or("");
    let academic_year = helpers::opt_str(req, "academicYear")
        .map(str::to_string)
        .unwrap_or_else(dues::current_academic_year);

    // Accept either a known programme id or a name; a name is auto-created,
    // unlike the CSV import path.
    let programme_id = if let Some(id) = req.params.get("programmeId").and_then(|v| v.as_i64()) {
        let exists: Result<Option<i64>, _> = conn
            .query_row("SELECT id FROM programmes WHERE id = ?", [id], |r| r.get(0))
            .optional();
        match exists {
            Ok(Some(id)) => id,
            Ok(None) => return err(&req.id, "not_found", format!("no programme {id}"), None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    } else if let Some(name) = helpers::opt_str(req, "programmeName") {
        match db::ensure_programme(conn, name) {
            Ok(id) => id,
            Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
        }
    } else {
        return err(
            &req.id,
            "bad_params",
            "missing params.programmeId or params.programmeName",
            None,
        );
    };

    let duplicate: Result<Option<i64>, _> = conn
        .query_row(
            "SELECT id FROM students WHERE index_no = ? OR email = ?",
            (index_no, email),
            |r| r.get(0),
        )
        .optional();
    match duplicate {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "conflict",
                format!("student already exists (Index: {index_no}, Email: {email})"),
                None,
            )
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Err(e) = conn.execute(
        "INSERT INTO students(index_no, first_name, surname, email, phone,
                              academic_year, programme_id, position, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            index_no,
            first_name,
            surname,
            email,
            phone,
            &academic_year,
            programme_id,
            position,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "studentId": conn.last_insert_rowid(), "indexNo": index_no }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_manage_data() {
        return err(&req.id, "permission_denied", "data management role required", None);
    }
    let student_id = match helpers::require_i64(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Checks and field updates share one transaction; an error return drops
    // it and rolls back whatever fields were already written.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let exists: Result<Option<i64>, _> = tx
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", format!("no student {student_id}"), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Uniqueness check excludes the student being edited.
    if let Some(index_no) = helpers::opt_str(req, "indexNo") {
        let taken: Result<Option<i64>, _> = tx
            .query_row(
                "SELECT id FROM students WHERE index_no = ? AND id != ?",
                (index_no, student_id),
                |r| r.get(0),
            )
            .optional();
        match taken {
            Ok(Some(_)) => return err(&req.id, "conflict", "index number already in use", None),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET index_no = ? WHERE id = ?",
            (index_no, student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(email) = helpers::opt_str(req, "email") {
        if !dues::is_valid_email(email) {
            return err(&req.id, "bad_params", format!("invalid email: {email}"), None);
        }
        let taken: Result<Option<i64>, _> = tx
            .query_row(
                "SELECT id FROM students WHERE email = ? AND id != ?",
                (email, student_id),
                |r| r.get(0),
            )
            .optional();
        match taken {
            Ok(Some(_)) => return err(&req.id, "conflict", "email already in use", None),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET email = ? WHERE id = ?",
            (email, student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    for (param, column) in [
        ("firstName", "first_name"),
        ("surname", "surname"),
        ("phone", "phone"),
        ("academicYear", "academic_year"),
        ("position", "position"),
    ] {
        if let Some(value) = helpers::opt_str(req, param) {
            let sql = format!("UPDATE students SET {column} = ? WHERE id = ?");
            if let Err(e) = tx.execute(&sql, (value, student_id)) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Some(programme_id) = req.params.get("programmeId").and_then(|v| v.as_i64()) {
        let exists: Result<Option<i64>, _> = tx
            .query_row(
                "SELECT id FROM programmes WHERE id = ?",
                [programme_id],
                |r| r.get(0),
            )
            .optional();
        match exists {
            Ok(Some(_)) => {}
            Ok(None) => {
                return err(&req.id, "not_found", format!("no programme {programme_id}"), None)
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET programme_id = ? WHERE id = ?",
            (programme_id, student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

/// Deletion is blocked while payment rows reference the student; payments
/// are immutable, so such a record stays for good.
fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_manage_data() {
        return err(&req.id, "permission_denied", "data management role required", None);
    }
    let student_id = match helpers::require_i64(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match db::student_has_payments(conn, student_id) {
        Ok(true) => {
            return err(
                &req.id,
                "has_payments",
                "student has payment records and cannot be deleted",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match conn.execute("DELETE FROM students WHERE id = ?", [student_id]) {
        Ok(0) => err(&req.id, "not_found", format!("no student {student_id}"), None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
