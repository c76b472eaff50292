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
    grade_scale_id: String,
}

/// Two components (weights 2 and 1), one 10-mark question each; S1 scores 8
/// on the heavier component and 6 on the lighter one.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let offering = request_ok(
        stdin,
        reader,
        "s-1",
        "offerings.create",
        json!({ "code": "CS301", "title": "Operating Systems" }),
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
            { "rollNumber": "S1", "lastName": "Ahmed", "firstName": "Sara" }
        ]}),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s-3",
        "enrollments.set",
        json!({ "offeringId": offering_id, "enrollments": [
            { "rollNumber": "S1", "status": "active" }
        ]}),
    );

    for (i, (name, weight, score)) in [("Midterm", 2.0, 8.0), ("Quiz", 1.0, 6.0)]
        .iter()
        .enumerate()
    {
        let component = request_ok(
            stdin,
            reader,
            &format!("s-c{}", i),
            "components.create",
            json!({ "offeringId": offering_id, "name": name, "weight": weight, "sortOrder": i }),
        );
        let component_id = component
            .get("componentId")
            .and_then(|v| v.as_str())
            .expect("componentId")
            .to_string();
        let _ = request_ok(
            stdin,
            reader,
            &format!("s-q{}", i),
            "questions.create",
            json!({ "componentId": component_id, "questions": [
                { "number": 1, "totalMarks": 10.0 }
            ]}),
        );
        let _ = request_ok(
            stdin,
            reader,
            &format!("s-m{}", i),
            "marks.importBatch",
            json!({
                "offeringId": offering_id,
                "componentId": component_id,
                "policy": "atomic",
                "rows": [{ "roll_number": "S1", "q1": score }]
            }),
        );
    }

    let scale = request_ok(
        stdin,
        reader,
        "s-gs",
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

    Fixture {
        offering_id,
        grade_scale_id,
    }
}

fn percentage_for(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    fx: &Fixture,
    id: &str,
    method: &str,
    best_of: Option<i64>,
) -> f64 {
    let mut params = json!({
        "offeringId": fx.offering_id,
        "gradeScaleId": fx.grade_scale_id,
        "method": method
    });
    if let Some(n) = best_of {
        params["bestOf"] = json!(n);
    }
    let snapshot = request_ok(stdin, reader, id, "results.calculate", params);
    snapshot
        .get("perStudent")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first().cloned())
        .and_then(|row| row.get("percentage").and_then(|v| v.as_f64()))
        .expect("percentage")
}

#[test]
fn the_three_methods_disagree_exactly_as_configured() {
    let workspace = temp_dir("attaind-calc-methods");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let simple = percentage_for(&mut stdin, &mut reader, &fx, "m1", "simple", None);
    assert!((simple - 70.0).abs() < 1e-9, "simple: {}", simple);

    let weighted = percentage_for(&mut stdin, &mut reader, &fx, "m2", "weighted", None);
    assert!(
        (weighted - 100.0 * 22.0 / 30.0).abs() < 1e-9,
        "weighted: {}",
        weighted
    );

    // N=1 keeps only the weight-2 component.
    let best = percentage_for(&mut stdin, &mut reader, &fx, "m3", "best_of_n", Some(1));
    assert!((best - 80.0).abs() < 1e-9, "best_of_n: {}", best);
}

#[test]
fn best_of_n_without_its_parameter_is_rejected() {
    let workspace = temp_dir("attaind-calc-bestof-missing");
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
            "gradeScaleId": fx.grade_scale_id,
            "method": "best_of_n"
        }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );
}
