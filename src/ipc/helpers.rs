use rusqlite::Connection;

use crate::auth::{self, AuthContext};
use crate::ipc::error::err;
use crate::ipc::types::Request;

/// Resolve `params.sessionToken` to the request's authenticated identity.
/// Errors come back as ready-to-send responses so handlers can `return` them.
pub fn authenticate(conn: &Connection, req: &Request) -> Result<AuthContext, serde_json::Value> {
    let Some(token) = req.params.get("sessionToken").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", "missing params.sessionToken", None));
    };
    match auth::resolve_session(conn, token) {
        Ok(Some(ctx)) => Ok(ctx),
        Ok(None) => Err(err(
            &req.id,
            "session_expired",
            "session is invalid or expired",
            None,
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

pub fn require_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim()),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("missing params.{key}"),
            None,
        )),
    }
}

pub fn opt_str<'a>(req: &'a Request, key: &str) -> Option<&'a str> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn require_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_i64()) {
        Some(v) => Ok(v),
        None => Err(err(
            &req.id,
            "bad_params",
            format!("missing params.{key}"),
            None,
        )),
    }
}

pub fn require_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_f64()) {
        Some(v) => Ok(v),
        None => Err(err(
            &req.id,
            "bad_params",
            format!("missing params.{key}"),
            None,
        )),
    }
}
