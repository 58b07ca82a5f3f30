use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const CSV_HEADER: &str = "Name,Index No,Email,Phone,Academic Year,Dues Paid,Receipt No,Programme of Study,payment date,password,position";

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_duesd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn duesd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

fn login_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let result = request_ok(
        stdin,
        reader,
        "login-admin",
        "auth.login",
        json!({ "username": "admin", "password": "admin123" }),
    );
    result
        .get("sessionToken")
        .and_then(|v| v.as_str())
        .expect("sessionToken")
        .to_string()
}

fn student_count(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
) -> usize {
    let students = request_ok(
        stdin,
        reader,
        id,
        "students.list",
        json!({ "sessionToken": token }),
    );
    students
        .get("students")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .expect("students array")
}

#[test]
fn reimporting_the_same_file_imports_nothing() {
    let workspace = temp_dir("duesd-idempotent");
    let csv_path = workspace.join("students.csv");
    let body = [
        CSV_HEADER,
        "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,150,R001,Computer Science,2024-09-01,,",
        "\"Owusu, Ama\",IDX003,ama@x.com,055,2024-2025,80,R002,Computer Science,2024-09-02,,",
    ]
    .join("\n");
    std::fs::write(&csv_path, body).expect("write csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let token = login_admin(&mut stdin, &mut reader);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.importCsv",
        json!({ "sessionToken": token, "csvPath": csv_path.to_string_lossy() }),
    );
    assert_eq!(first.get("imported").and_then(|v| v.as_u64()), Some(2));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.importCsv",
        json!({ "sessionToken": token, "csvPath": csv_path.to_string_lossy() }),
    );
    assert_eq!(second.get("imported").and_then(|v| v.as_u64()), Some(0));
    let errors = second
        .get("errors")
        .and_then(|v| v.as_array())
        .expect("errors array");
    assert_eq!(errors.len(), 2);
    for e in errors {
        assert!(
            e.as_str().unwrap_or("").contains("already exists"),
            "{e}"
        );
    }

    assert_eq!(student_count(&mut stdin, &mut reader, "4", &token), 2);
}

#[test]
fn datastore_fault_mid_batch_leaves_no_rows_behind() {
    let workspace = temp_dir("duesd-atomic");
    let csv_path = workspace.join("students.csv");
    // Both rows validate cleanly; the second payment insert trips the
    // unique receipt constraint, so the whole batch must roll back.
    let body = [
        CSV_HEADER,
        "\"Doe, Jane\",IDX001,jane@x.com,055,2024-2025,150,R001,Computer Science,2024-09-01,,",
        "\"Owusu, Ama\",IDX003,ama@x.com,055,2024-2025,80,R001,Computer Science,2024-09-02,,",
    ]
    .join("\n");
    std::fs::write(&csv_path, body).expect("write csv");

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let token = login_admin(&mut stdin, &mut reader);

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.importCsv",
        json!({ "sessionToken": token, "csvPath": csv_path.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), "import_aborted");

    assert_eq!(student_count(&mut stdin, &mut reader, "3", &token), 0);
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "payments.history",
        json!({ "sessionToken": token }),
    );
    assert_eq!(
        history
            .get("payments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
}
