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
fn export_then_reimport_is_a_ledger_noop() {
    let workspace = temp_dir("attaind-roundtrip");
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
        json!({ "code": "CS210", "title": "Networks" }),
    );
    let offering_id = offering
        .get("offeringId")
        .and_then(|v| v.as_str())
        .expect("offeringId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "directory.upsertStudents",
        json!({ "students": [
            { "rollNumber": "S1", "lastName": "Ahmed", "firstName": "Sara" },
            { "rollNumber": "S2", "lastName": "Baig", "firstName": "Omar" },
            { "rollNumber": "S3", "lastName": "Chen", "firstName": "Li" }
        ]}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.set",
        json!({ "offeringId": offering_id, "enrollments": [
            { "rollNumber": "S1", "status": "active" },
            { "rollNumber": "S2", "status": "active" },
            { "rollNumber": "S3", "status": "completed" }
        ]}),
    );
    let component = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "components.create",
        json!({ "offeringId": offering_id, "name": "Lab", "sortOrder": 0 }),
    );
    let component_id = component
        .get("componentId")
        .and_then(|v| v.as_str())
        .expect("componentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "questions.create",
        json!({ "componentId": component_id, "questions": [
            { "number": 1, "totalMarks": 10.0 },
            { "number": 2, "totalMarks": 5.0 }
        ]}),
    );

    // S2 skipped q2; S3 has no marks at all (pure template row).
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "marks.importBatch",
        json!({
            "offeringId": offering_id,
            "componentId": component_id,
            "policy": "atomic",
            "rows": [
                { "roll_number": "S1", "q1": 8, "q2": 0 },
                { "roll_number": "S2", "q1": 6.5 }
            ]
        }),
    );

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "q-before",
        "marks.query",
        json!({ "componentId": component_id }),
    );

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "marks.exportSheet",
        json!({ "offeringId": offering_id, "componentId": component_id }),
    );
    let columns = sheet
        .get("columns")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("columns");
    assert_eq!(
        columns,
        vec![json!("roll_number"), json!("name"), json!("q1"), json!("q2")]
    );
    let rows = sheet
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("rows");
    assert_eq!(rows.len(), 3);
    // Blank and never-marked cells export as null, zeros as zeros.
    assert_eq!(rows[0].get("q2"), Some(&json!(0.0)));
    assert_eq!(rows[1].get("q2"), Some(&json!(null)));
    assert_eq!(rows[2].get("q1"), Some(&json!(null)));

    // Feed the sheet straight back in.
    let reimport = request_ok(
        &mut stdin,
        &mut reader,
        "reimport",
        "marks.importBatch",
        json!({
            "offeringId": offering_id,
            "componentId": component_id,
            "policy": "atomic",
            "rows": rows
        }),
    );
    assert_eq!(reimport.get("failed").and_then(|v| v.as_u64()), Some(0));

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "q-after",
        "marks.query",
        json!({ "componentId": component_id }),
    );
    assert_eq!(
        before.get("entries"),
        after.get("entries"),
        "round-trip must not change the ledger"
    );
}
