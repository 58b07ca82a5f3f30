use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth::{self, Role};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT u.id, u.username, u.email, r.name, u.is_active, u.last_login, u.created_at
         FROM users u JOIN roles r ON r.id = u.role_id
         ORDER BY u.username",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "username": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "role": row.get::<_, String>(3)?,
                "isActive": row.get::<_, i64>(4)? != 0,
                "lastLogin": row.get::<_, Option<String>>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
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
    if !ctx.role.can_manage_users() {
        return err(&req.id, "permission_denied", "administrator role required", None);
    }

    let username = match helpers::require_str(req, "username") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match helpers::require_str(req, "email") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let password = match helpers::require_str(req, "password") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let role_name = match helpers::require_str(req, "role") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if Role::from_name(role_name).is_none() {
        return err(&req.id, "bad_params", format!("unknown role: {role_name}"), None);
    }

    let taken: Result<Option<i64>, _> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ? OR email = ?",
            (username, email),
            |r| r.get(0),
        )
        .optional();
    match taken {
        Ok(Some(_)) => return err(&req.id, "conflict", "username or email already in use", None),
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let role_id = match db::role_id_by_name(conn, role_name) {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "bad_params", format!("unknown role: {role_name}"), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = conn.execute(
        "INSERT INTO users(username, email, password_hash, role_id, is_active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (
            username,
            email,
            auth::hash_password(password),
            role_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "userId": conn.last_insert_rowid(), "username": username, "role": role_name }),
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
    if !ctx.role.can_manage_users() {
        return err(&req.id, "permission_denied", "administrator role required", None);
    }
    let user_id = match helpers::require_i64(req, "userId") {
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
        .query_row("SELECT id FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", format!("no user {user_id}"), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Some(email) = helpers::opt_str(req, "email") {
        let taken: Result<Option<i64>, _> = tx
            .query_row(
                "SELECT id FROM users WHERE email = ? AND id != ?",
                (email, user_id),
                |r| r.get(0),
            )
            .optional();
        match taken {
            Ok(Some(_)) => return err(&req.id, "conflict", "email already in use", None),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        if let Err(e) = tx.execute(
            "UPDATE users SET email = ? WHERE id = ?",
            (email, user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Some(role_name) = helpers::opt_str(req, "role") {
        let role_id = match db::role_id_by_name(&tx, role_name) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return err(&req.id, "bad_params", format!("unknown role: {role_name}"), None)
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Err(e) = tx.execute(
            "UPDATE users SET role_id = ? WHERE id = ?",
            (role_id, user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Some(active) = req.params.get("isActive").and_then(|v| v.as_bool()) {
        if let Err(e) = tx.execute(
            "UPDATE users SET is_active = ? WHERE id = ?",
            (active as i64, user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Some(password) = helpers::opt_str(req, "password") {
        if let Err(e) = tx.execute(
            "UPDATE users SET password_hash = ? WHERE id = ?",
            (auth::hash_password(password), user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let user_id = match helpers::require_i64(req, "userId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if user_id == ctx.user_id {
        return err(&req.id, "bad_params", "cannot delete the active account", None);
    }

    if let Err(e) = conn.execute("DELETE FROM sessions WHERE user_id = ?", [user_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    match conn.execute("DELETE FROM users WHERE id = ?", [user_id]) {
        Ok(0) => err(&req.id, "not_found", format!("no user {user_id}"), None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_list(state, req)),
        "users.create" => Some(handle_create(state, req)),
        "users.update" => Some(handle_update(state, req)),
        "users.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
