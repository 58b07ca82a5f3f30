use serde_json::json;
use std::path::PathBuf;

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_manage_users() {
        return err(&req.id, "permission_denied", "administrator role required", None);
    }
    let out_path = match helpers::require_str(req, "outputPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "path": out_path.to_string_lossy(),
                "bundleFormat": summary.bundle_format,
                "dbSha256": summary.db_sha256,
            }),
        ),
        Err(e) => err(&req.id, "backup_failed", format!("{e:#}"), None),
    }
}

/// Swaps the workspace database for the bundle's copy. The live connection
/// is dropped before the file moves and the workspace is reopened after.
fn handle_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if !ctx.role.can_manage_users() {
        return err(&req.id, "permission_denied", "administrator role required", None);
    }
    let in_path = match helpers::require_str(req, "inputPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    state.db = None;
    let summary = match backup::restore_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => {
            // Reopen whatever is on disk so the daemon stays usable.
            state.db = db::open_db(&workspace).ok();
            return err(&req.id, "restore_failed", format!("{e:#}"), None);
        }
    };
    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            tracing::info!(workspace = %workspace.to_string_lossy(), "workspace restored");
            ok(
                &req.id,
                json!({ "bundleFormat": summary.bundle_format_detected }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workspace.exportBackup" => Some(handle_export(state, req)),
        "workspace.restoreBackup" => Some(handle_restore(state, req)),
        _ => None,
    }
}
