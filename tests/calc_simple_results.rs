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

struct Fixture {
    offering_id: String,
    component_id: String,
    grade_scale_id: String,
}

/// One component, one 10-mark question, students S1/S2, a standard
/// four-band scale.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let offering = request_ok(
        stdin,
        reader,
        "s-1",
        "offerings.create",
        json!({ "code": "CS201", "title": "Databases", "passingThreshold": 50.0 }),
    );
    let offering_id = offering
        .get("offeringId")
        .and_then(|v| v.as_str())
        .expect("offeringId")
        .to_string();

    let _ = request_ok(
        stdin,
        reader,
        "s-2",
        "directory.upsertStudents",
        json!({ "students": [
            { "rollNumber": "S1", "lastName": "Ahmed", "firstName": "Sara" },
            { "rollNumber": "S2", "lastName": "Baig", "firstName": "Omar" }
        ]}),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s-3",
        "enrollments.set",
        json!({ "offeringId": offering_id, "enrollments": [
            { "rollNumber": "S1", "status": "active" },
            { "rollNumber": "S2", "status": "active" }
        ]}),
    );

    let component = request_ok(
        stdin,
        reader,
        "s-4",
        "components.create",
        json!({ "offeringId": offering_id, "name": "Midterm", "weight": 1.0, "sortOrder": 0 }),
    );
    let component_id = component
        .get("componentId")
        .and_then(|v| v.as_str())
        .expect("componentId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s-5",
        "questions.create",
        json!({ "componentId": component_id, "questions": [
            { "number": 1, "totalMarks": 10.0 }
        ]}),
    );

    let scale = request_ok(
        stdin,
        reader,
        "s-6",
        "gradeScales.create",
        json!({ "name": "standard", "bands": [
            { "lowerBound": 0.0, "letter": "F", "gradePoint": 0.0 },
            { "lowerBound": 50.0, "letter": "C", "gradePoint": 2.0 },
            { "lowerBound": 65.0, "letter": "B", "gradePoint": 3.0 },
            { "lowerBound": 80.0, "letter": "A", "gradePoint": 4.0 }
        ]}),
    );
    let grade_scale_id = scale
        .get("gradeScaleId")
        .and_then(|v| v.as_str())
        .expect("gradeScaleId")
        .to_string();

    Fixture {
        offering_id,
        component_id,
        grade_scale_id,
    }
}

#[test]
fn simple_method_grades_pass_status_and_statistics() {
    let workspace = temp_dir("attaind-calc-simple");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "marks.importBatch",
        json!({
            "offeringId": fx.offering_id,
            "componentId": fx.component_id,
            "policy": "atomic",
            "rows": [
                { "roll_number": "S1", "q1": 8 },
                { "roll_number": "S2", "q1": 6 }
            ]
        }),
    );

    let snapshot = request_ok(
        &mut stdin,
        &mut reader,
        "calc",
        "results.calculate",
        json!({
            "offeringId": fx.offering_id,
            "gradeScaleId": fx.grade_scale_id,
            "method": "simple"
        }),
    );
    assert_eq!(
        snapshot.get("status").and_then(|v| v.as_str()),
        Some("calculated")
    );

    let rows = snapshot
        .get("perStudent")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("perStudent");
    assert_eq!(rows.len(), 2);

    // Rows come back ordered by roll number.
    let s1 = &rows[0];
    assert_eq!(s1.get("rollNumber").and_then(|v| v.as_str()), Some("S1"));
    assert_eq!(s1.get("percentage").and_then(|v| v.as_f64()), Some(80.0));
    // Exactly on the A band's lower bound: the band starting there wins.
    assert_eq!(s1.get("letterGrade").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(s1.get("passStatus").and_then(|v| v.as_str()), Some("Pass"));

    let s2 = &rows[1];
    assert_eq!(s2.get("percentage").and_then(|v| v.as_f64()), Some(60.0));
    assert_eq!(s2.get("letterGrade").and_then(|v| v.as_str()), Some("C"));
    assert_eq!(s2.get("passStatus").and_then(|v| v.as_str()), Some("Pass"));

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "stats",
        "reports.statistics",
        json!({ "offeringId": fx.offering_id }),
    );
    assert_eq!(stats.get("totalStudents").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(stats.get("averageMarks").and_then(|v| v.as_f64()), Some(7.0));
    assert_eq!(stats.get("stdDeviation").and_then(|v| v.as_f64()), Some(1.0));
    assert_eq!(stats.get("medianMarks").and_then(|v| v.as_f64()), Some(7.0));
    assert_eq!(stats.get("passed").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(stats.get("failed").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        stats
            .get("gradeCounts")
            .and_then(|v| v.get("A"))
            .and_then(|v| v.as_u64()),
        Some(1)
    );

    let question_stats = stats
        .get("questionStats")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("questionStats");
    assert_eq!(question_stats.len(), 1);
    assert_eq!(
        question_stats[0].get("average").and_then(|v| v.as_f64()),
        Some(7.0)
    );
    // Both attempts are at or above half of 10.
    assert_eq!(
        question_stats[0].get("passRate").and_then(|v| v.as_f64()),
        Some(1.0)
    );
}

#[test]
fn recalculation_with_unchanged_ledger_is_idempotent() {
    let workspace = temp_dir("attaind-calc-idem");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "marks.importBatch",
        json!({
            "offeringId": fx.offering_id,
            "componentId": fx.component_id,
            "policy": "atomic",
            "rows": [
                { "roll_number": "S1", "q1": 8 },
                { "roll_number": "S2", "q1": 6 }
            ]
        }),
    );

    let params = json!({
        "offeringId": fx.offering_id,
        "gradeScaleId": fx.grade_scale_id,
        "method": "simple"
    });
    let first = request_ok(&mut stdin, &mut reader, "c1", "results.calculate", params.clone());
    let second = request_ok(&mut stdin, &mut reader, "c2", "results.calculate", params);

    assert_eq!(first.get("perStudent"), second.get("perStudent"));
    assert_eq!(
        first.get("courseResultId"),
        second.get("courseResultId"),
        "recalculation must reuse the snapshot row"
    );

    // The persisted snapshot reads back identically.
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "results.get",
        json!({ "offeringId": fx.offering_id }),
    );
    assert_eq!(stored.get("perStudent"), second.get("perStudent"));
    assert_eq!(
        stored.get("status").and_then(|v| v.as_str()),
        Some("calculated")
    );
}

#[test]
fn blank_cells_shrink_the_denominator_but_zeros_do_not() {
    let workspace = temp_dir("attaind-calc-blank-zero");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    // Second question so skip-vs-zero changes the denominator.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "q2",
        "questions.create",
        json!({ "componentId": fx.component_id, "questions": [
            { "number": 2, "totalMarks": 10.0 }
        ]}),
    );

    // S1 skipped q2 (blank); S2 scored an explicit zero on it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "marks.importBatch",
        json!({
            "offeringId": fx.offering_id,
            "componentId": fx.component_id,
            "policy": "atomic",
            "rows": [
                { "roll_number": "S1", "q1": 8, "q2": "" },
                { "roll_number": "S2", "q1": 8, "q2": 0 }
            ]
        }),
    );

    let snapshot = request_ok(
        &mut stdin,
        &mut reader,
        "calc",
        "results.calculate",
        json!({
            "offeringId": fx.offering_id,
            "gradeScaleId": fx.grade_scale_id,
            "method": "simple"
        }),
    );
    let rows = snapshot
        .get("perStudent")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("perStudent");

    let s1 = &rows[0];
    assert_eq!(s1.get("maxMarks").and_then(|v| v.as_f64()), Some(10.0));
    assert_eq!(s1.get("percentage").and_then(|v| v.as_f64()), Some(80.0));

    let s2 = &rows[1];
    assert_eq!(s2.get("maxMarks").and_then(|v| v.as_f64()), Some(20.0));
    assert_eq!(s2.get("percentage").and_then(|v| v.as_f64()), Some(40.0));
    assert_eq!(s2.get("passStatus").and_then(|v| v.as_str()), Some("Fail"));
}

#[test]
fn missing_grade_scale_is_a_computation_error() {
    let workspace = temp_dir("attaind-calc-noscale");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let resp = request(
        &mut stdin,
        &mut reader,
        "calc",
        "results.calculate",
        json!({
            "offeringId": fx.offering_id,
            "gradeScaleId": "no-such-scale",
            "method": "simple"
        }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("missing_grade_scale")
    );
}

#[test]
fn empty_roster_is_a_degenerate_snapshot_not_an_error() {
    let workspace = temp_dir("attaind-calc-empty");
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
        json!({ "code": "CS000", "title": "Empty Offering" }),
    );
    let offering_id = offering
        .get("offeringId")
        .and_then(|v| v.as_str())
        .expect("offeringId")
        .to_string();
    let scale = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "gradeScales.create",
        json!({ "name": "standard", "bands": [
            { "lowerBound": 0.0, "letter": "F", "gradePoint": 0.0 },
            { "lowerBound": 50.0, "letter": "P", "gradePoint": 2.0 }
        ]}),
    );
    let grade_scale_id = scale
        .get("gradeScaleId")
        .and_then(|v| v.as_str())
        .expect("gradeScaleId")
        .to_string();

    let snapshot = request_ok(
        &mut stdin,
        &mut reader,
        "calc",
        "results.calculate",
        json!({
            "offeringId": offering_id,
            "gradeScaleId": grade_scale_id,
            "method": "simple"
        }),
    );
    assert_eq!(
        snapshot
            .get("perStudent")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "stats",
        "reports.statistics",
        json!({ "offeringId": offering_id }),
    );
    assert_eq!(stats.get("totalStudents").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(stats.get("averageMarks").and_then(|v| v.as_f64()), Some(0.0));
}
