use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sliding session lifetime; refreshed on every authenticated request.
const SESSION_LIFETIME_SECS: i64 = 3600;

/// The five-level role hierarchy. Gates below are per-capability rather than
/// strictly level-ordered: a cashier outranks a lecturer but cannot touch
/// student data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Lecturer,
    Cashier,
    Supervisor,
    Administrator,
}

impl Role {
    pub fn from_name(name: &str) -> Option<Role> {
        match name {
            "student" => Some(Role::Student),
            "lecturer" => Some(Role::Lecturer),
            "cashier" => Some(Role::Cashier),
            "supervisor" => Some(Role::Supervisor),
            "administrator" => Some(Role::Administrator),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Lecturer => "lecturer",
            Role::Cashier => "cashier",
            Role::Supervisor => "supervisor",
            Role::Administrator => "administrator",
        }
    }

    pub fn level(&self) -> i64 {
        match self {
            Role::Student => 1,
            Role::Lecturer => 2,
            Role::Cashier => 3,
            Role::Supervisor => 4,
            Role::Administrator => 5,
        }
    }

    /// Create, update and delete students; run CSV imports.
    pub fn can_manage_data(&self) -> bool {
        matches!(self, Role::Administrator | Role::Supervisor | Role::Lecturer)
    }

    /// Record new dues payments.
    pub fn can_record_payments(&self) -> bool {
        matches!(self, Role::Administrator | Role::Cashier)
    }

    pub fn can_view_payment_history(&self) -> bool {
        matches!(self, Role::Administrator | Role::Cashier | Role::Supervisor)
    }

    pub fn can_view_reports(&self) -> bool {
        matches!(self, Role::Administrator | Role::Supervisor | Role::Lecturer)
    }

    pub fn can_manage_users(&self) -> bool {
        matches!(self, Role::Administrator)
    }
}

/// Request-scoped authenticated identity. Handlers resolve the session token
/// once and pass this value into anything that needs the actor, including the
/// import committer's payment attribution.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
}

/// Salted SHA-256, stored as `v1$<salt>$<hex digest>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = digest_hex(&salt, password);
    format!("v1${salt}${digest}")
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(version), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    version == "v1" && digest_hex(salt, password) == digest
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn issue_session(conn: &Connection, user_id: i64) -> rusqlite::Result<String> {
    let token = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires = now + Duration::seconds(SESSION_LIFETIME_SECS);
    conn.execute(
        "INSERT INTO sessions(token, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (&token, user_id, now.to_rfc3339(), expires.to_rfc3339()),
    )?;
    Ok(token)
}

/// Resolve a token to its user. Expired or unknown tokens yield None; an
/// expired row is deleted on the way out. A live session has its expiry
/// pushed forward.
pub fn resolve_session(conn: &Connection, token: &str) -> rusqlite::Result<Option<AuthContext>> {
    let row = conn
        .query_row(
            "SELECT s.expires_at, u.id, u.username, u.is_active, r.name
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             JOIN roles r ON r.id = u.role_id
             WHERE s.token = ?",
            [token],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((expires_at, user_id, username, is_active, role_name)) = row else {
        return Ok(None);
    };

    let expired = DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t.with_timezone(&Utc) < Utc::now())
        .unwrap_or(true);
    if expired || is_active == 0 {
        conn.execute("DELETE FROM sessions WHERE token = ?", [token])?;
        return Ok(None);
    }

    let Some(role) = Role::from_name(&role_name) else {
        return Ok(None);
    };

    let refreshed = Utc::now() + Duration::seconds(SESSION_LIFETIME_SECS);
    conn.execute(
        "UPDATE sessions SET expires_at = ? WHERE token = ?",
        (refreshed.to_rfc3339(), token),
    )?;

    Ok(Some(AuthContext {
        user_id,
        username,
        role,
    }))
}

pub fn revoke_session(conn: &Connection, token: &str) -> rusqlite::Result<bool> {
    let n = conn.execute("DELETE FROM sessions WHERE token = ?", [token])?;
    Ok(n > 0)
}
