use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::auth;

pub const DB_FILE: &str = "duesd.sqlite3";

/// Programmes the department runs; a fresh workspace starts with these.
const SEED_PROGRAMMES: [&str; 4] = [
    "Computer Science",
    "Information Technology",
    "Computer Networking",
    "Software Engineering",
];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS roles(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            level INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role_id INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_login TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(role_id) REFERENCES roles(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            token TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS programmes(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY,
            index_no TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            surname TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            phone TEXT,
            academic_year TEXT,
            programme_id INTEGER NOT NULL,
            position TEXT,
            start_date TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(programme_id) REFERENCES programmes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_programme ON students(programme_id)",
        [],
    )?;

    // Payment rows are immutable once written; there is no update/delete path.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id INTEGER PRIMARY KEY,
            student_id INTEGER NOT NULL,
            amount REAL NOT NULL,
            receipt_no TEXT NOT NULL UNIQUE,
            payment_date TEXT NOT NULL,
            academic_year TEXT,
            created_by INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;

    seed_roles(&conn)?;
    seed_programmes(&conn)?;
    seed_admin(&conn)?;

    Ok(conn)
}

fn seed_roles(conn: &Connection) -> anyhow::Result<()> {
    let roles: [(&str, &str, i64); 5] = [
        ("administrator", "Full system access", 5),
        ("supervisor", "Oversees data and reports", 4),
        ("cashier", "Records dues payments", 3),
        ("lecturer", "Manages student data", 2),
        ("student", "Views own records", 1),
    ];
    for (name, description, level) in roles {
        conn.execute(
            "INSERT OR IGNORE INTO roles(name, description, level) VALUES(?, ?, ?)",
            (name, description, level),
        )?;
    }
    Ok(())
}

fn seed_programmes(conn: &Connection) -> anyhow::Result<()> {
    for name in SEED_PROGRAMMES {
        conn.execute("INSERT OR IGNORE INTO programmes(name) VALUES(?)", [name])?;
    }
    Ok(())
}

/// Bootstrap administrator for a fresh workspace. Only runs when the users
/// table is empty, so a restored or existing database is left alone.
fn seed_admin(conn: &Connection) -> anyhow::Result<()> {
    let user_count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if user_count > 0 {
        return Ok(());
    }
    let role_id = role_id_by_name(conn, "administrator")?
        .ok_or_else(|| anyhow::anyhow!("administrator role not seeded"))?;
    conn.execute(
        "INSERT INTO users(username, email, password_hash, role_id, is_active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (
            "admin",
            "admin@dues.local",
            auth::hash_password("admin123"),
            role_id,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

pub fn role_id_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM roles WHERE name = ?", [name], |r| r.get(0))
        .optional()
}

pub fn programme_id_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM programmes WHERE name = ?", [name], |r| {
        r.get(0)
    })
    .optional()
}

/// Get-or-create used by the manual add-student path. The CSV import never
/// calls this; it rejects unknown programme names instead.
pub fn ensure_programme(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    if let Some(id) = programme_id_by_name(conn, name)? {
        return Ok(id);
    }
    conn.execute("INSERT INTO programmes(name) VALUES(?)", [name])?;
    Ok(conn.last_insert_rowid())
}

pub fn student_has_payments(conn: &Connection, student_id: i64) -> rusqlite::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM payments WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace() -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "duesd-db-test-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_seeds_roles_programmes_and_admin() {
        let ws = temp_workspace();
        let conn = open_db(&ws).expect("open db");

        let roles: i64 = conn
            .query_row("SELECT COUNT(*) FROM roles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(roles, 5);

        let programmes: i64 = conn
            .query_row("SELECT COUNT(*) FROM programmes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(programmes, 4);

        let admins: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE username = 'admin'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(admins, 1);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn reopen_is_idempotent() {
        let ws = temp_workspace();
        drop(open_db(&ws).expect("first open"));
        let conn = open_db(&ws).expect("second open");
        let admins: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(admins, 1);
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn ensure_programme_reuses_existing_row() {
        let ws = temp_workspace();
        let conn = open_db(&ws).expect("open db");
        let a = ensure_programme(&conn, "Computer Science").unwrap();
        let b = ensure_programme(&conn, "Computer Science").unwrap();
        assert_eq!(a, b);
        let c = ensure_programme(&conn, "Cyber Security").unwrap();
        assert_ne!(a, c);
        let _ = std::fs::remove_dir_all(ws);
    }
}
