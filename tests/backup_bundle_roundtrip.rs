use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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
    let exe = env!("CARGO_BIN_EXE_attaind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attaind");
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

#[test]
fn bundle_export_import_carries_the_workspace() {
    let workspace_a = temp_dir("attaind-backup-a");
    let workspace_b = temp_dir("attaind-backup-b");
    let bundle_path = temp_dir("attaind-backup-out").join("workspace.attaindbundle");

    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace_a.to_string_lossy() }),
    );
    let offering = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "offerings.create",
        json!({ "code": "CS601", "title": "Distributed Systems" }),
    );
    let offering_id = offering
        .get("offeringId")
        .and_then(|v| v.as_str())
        .expect("offeringId")
        .to_string();

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "backup.export",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        export.get("bundleFormat").and_then(|v| v.as_str()),
        Some("attaind-workspace-v1")
    );
    assert!(
        !export
            .get("dbSha256")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .is_empty(),
        "manifest must carry the database checksum"
    );
    assert!(bundle_path.is_file(), "bundle written to disk");

    // A fresh workspace, then the bundle lands on top of it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace_b.to_string_lossy() }),
    );
    let import = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "backup.import",
        json!({ "inPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        import.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("attaind-workspace-v1")
    );

    // The offering created in workspace A is visible after the import.
    let resp = request(
        &mut stdin,
        &mut reader,
        "check",
        "reports.attainment",
        json!({ "offeringId": offering_id }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn garbage_bundle_is_rejected_and_the_workspace_survives() {
    let workspace = temp_dir("attaind-backup-garbage");
    let junk_path = temp_dir("attaind-backup-junk").join("junk.zip");
    // Valid zip signature, invalid bundle contents.
    std::fs::write(&junk_path, [0x50, 0x4B, 0x03, 0x04, 0x00, 0x00]).expect("write junk");

    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let offering = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "offerings.create",
        json!({ "code": "CS602", "title": "Security" }),
    );
    let offering_id = offering
        .get("offeringId")
        .and_then(|v| v.as_str())
        .expect("offeringId")
        .to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "import",
        "backup.import",
        json!({ "inPath": junk_path.to_string_lossy() }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("backup_import_failed")
    );

    // Still serving the original data.
    let resp = request(
        &mut stdin,
        &mut reader,
        "check",
        "reports.attainment",
        json!({ "offeringId": offering_id }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));
}
