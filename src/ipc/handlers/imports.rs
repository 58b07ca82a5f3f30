use serde_json::json;
use std::path::PathBuf;

use crate::importer::{self, ImportError};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

/// CSV student import. Per-row skips come back in the result; schema,
/// source and datastore faults are request-level errors and, for the
/// datastore case, the whole batch has already been rolled back.
fn handle_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let csv_path = match helpers::require_str(req, "csvPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    match importer::import_students_csv(conn, &csv_path, ctx.user_id) {
        Ok(report) => ok(
            &req.id,
            json!({
                "imported": report.imported,
                "errors": report.errors,
            }),
        ),
        Err(e @ ImportError::SourceUnavailable(_)) => {
            err(&req.id, "import_source_unavailable", e.to_string(), None)
        }
        Err(ImportError::SchemaMismatch { missing }) => err(
            &req.id,
            "import_schema_mismatch",
            "CSV header missing expected columns",
            Some(json!({ "missing": missing })),
        ),
        Err(e @ ImportError::Aborted(_)) => {
            tracing::warn!(error = %e, "csv import rolled back");
            err(&req.id, "import_aborted", e.to_string(), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.importCsv" => Some(handle_import_csv(state, req)),
        _ => None,
    }
}
