use serde_json::json;

use crate::db;
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

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.name,
           (SELECT COUNT(*) FROM students s WHERE s.programme_id = p.id) AS student_count
         FROM programmes p
         ORDER BY p.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "name": row.get::<_, String>(1)?,
                "studentCount": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(programmes) => ok(&req.id, json!({ "programmes": programmes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Get-or-create by name. This is the manual add path's auto-create,
/// deliberately a separate operation: the CSV import rejects unknown
/// programme names and never lands here.
fn handle_ensure(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let name = match helpers::require_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match db::ensure_programme(conn, name) {
        Ok(id) => ok(&req.id, json!({ "programmeId": id, "name": name })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "programmes.list" => Some(handle_list(state, req)),
        "programmes.ensure" => Some(handle_ensure(state, req)),
        _ => None,
    }
}
