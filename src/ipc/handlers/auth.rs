use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};

const MIN_PASSWORD_LEN: usize = 6;

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let username = match helpers::require_str(req, "username") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let password = match helpers::require_str(req, "password") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row = conn
        .query_row(
            "SELECT u.id, u.password_hash, u.is_active, r.name
             FROM users u JOIN roles r ON r.id = u.role_id
             WHERE u.username = ?",
            [username],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional();

    let row = match row {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((user_id, password_hash, is_active, role_name)) = row else {
        return err(&req.id, "auth_failed", "invalid username or password", None);
    };
    if is_active == 0 || !auth::verify_password(password, &password_hash) {
        return err(&req.id, "auth_failed", "invalid username or password", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE users SET last_login = ? WHERE id = ?",
        (Utc::now().to_rfc3339(), user_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let token = match auth::issue_session(conn, user_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    tracing::info!(username, role = role_name, "login");

    ok(
        &req.id,
        json!({
            "sessionToken": token,
            "user": { "id": user_id, "username": username, "role": role_name }
        }),
    )
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let token = match helpers::require_str(req, "sessionToken") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match auth::revoke_session(conn, token) {
        Ok(revoked) => ok(&req.id, json!({ "loggedOut": revoked })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

/// Self-registration always lands in the student role; staff accounts go
/// through users.create.
fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
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
    if password.len() < MIN_PASSWORD_LEN {
        return err(
            &req.id,
            "bad_params",
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
            None,
        );
    }
    if !crate::dues::is_valid_email(email) {
        return err(&req.id, "bad_params", format!("invalid email: {email}"), None);
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

    let role_id = match db::role_id_by_name(conn, "student") {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "db_query_failed", "student role missing", None),
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
        json!({ "userId": conn.last_insert_rowid(), "username": username, "role": "student" }),
    )
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let current = match helpers::require_str(req, "currentPassword") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let new = match helpers::require_str(req, "newPassword") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if new.len() < MIN_PASSWORD_LEN {
        return err(
            &req.id,
            "bad_params",
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
            None,
        );
    }

    let stored: Result<String, _> = conn.query_row(
        "SELECT password_hash FROM users WHERE id = ?",
        [ctx.user_id],
        |r| r.get(0),
    );
    let stored = match stored {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !auth::verify_password(current, &stored) {
        return err(&req.id, "auth_failed", "current password is incorrect", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (auth::hash_password(new), ctx.user_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "changed": true }))
}

fn handle_whoami(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ctx = match helpers::authenticate(conn, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    ok(
        &req.id,
        json!({ "id": ctx.user_id, "username": ctx.username, "role": ctx.role.name() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.register" => Some(handle_register(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        "auth.whoami" => Some(handle_whoami(state, req)),
        _ => None,
    }
}
