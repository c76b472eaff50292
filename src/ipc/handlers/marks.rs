use rusqlite::OptionalExtension;
use serde_json::json;

use crate::ingest::{self, ImportPolicy};
use crate::ipc::error::{err, err_calc, ok};
use crate::ipc::handlers::helpers::{db_conn, optional_str, required_array, required_str};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::validate::{self, QuestionDef};

fn load_question(
    conn: &rusqlite::Connection,
    component_id: &str,
    number: i64,
) -> Result<Option<QuestionDef>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, component_id, number, total_marks
         FROM questions WHERE component_id = ? AND number = ?",
        (component_id, number),
        |r| {
            Ok(QuestionDef {
                id: r.get(0)?,
                component_id: r.get(1)?,
                number: r.get(2)?,
                total_marks: r.get(3)?,
            })
        },
    )
    .optional()
}

fn handle_set_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_ref = match required_str(req, "studentRef") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(question_number) = req.params.get("questionNumber").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing questionNumber", None);
    };
    let raw_value = req.params.get("value").cloned().unwrap_or(serde_json::Value::Null);

    let question = match load_question(conn, &component_id, question_number) {
        Ok(Some(q)) => q,
        Ok(None) => return err(&req.id, "not_found", "question not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = match ingest::load_roster(conn, &offering_id) {
        Ok(r) => r,
        Err(e) => return err_calc(&req.id, e),
    };

    let column = format!("q{}", question_number);
    match validate::validate_candidate(&roster, &question, &student_ref, &raw_value, 0, &column) {
        Ok(Some(entry)) => match ledger::upsert(conn, &entry) {
            Ok(()) => ok(
                &req.id,
                json!({ "written": true, "marksObtained": entry.marks_obtained }),
            ),
            Err(e) => err_calc(&req.id, e),
        },
        // Blank means "no entry": nothing lands in the ledger.
        Ok(None) => ok(&req.id, json!({ "written": false })),
        Err(failure) => err(
            &req.id,
            failure.code(),
            failure.reason(),
            Some(failure.to_json()),
        ),
    }
}

fn handle_import_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let policy_name = optional_str(req, "policy").unwrap_or_else(|| "atomic".to_string());
    let Some(policy) = ImportPolicy::parse(&policy_name) else {
        return err(
            &req.id,
            "bad_params",
            "policy must be one of: atomic, best_effort",
            Some(json!({ "policy": policy_name })),
        );
    };
    let rows = match required_array(req, "rows") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match ingest::import_rows(conn, &offering_id, &component_id, rows, policy) {
        Ok(report) => {
            let errors: Vec<serde_json::Value> =
                report.errors.iter().map(|e| e.to_json()).collect();
            ok(
                &req.id,
                json!({
                    "policy": report.policy.as_str(),
                    "imported": report.imported,
                    "failed": report.failed,
                    "entriesWritten": report.entries_written,
                    "errors": errors,
                }),
            )
        }
        Err(e) => err_calc(&req.id, e),
    }
}

fn handle_query(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let filter = ledger::MarksFilter {
        student_id: optional_str(req, "studentId"),
        question_id: optional_str(req, "questionId"),
        component_id: optional_str(req, "componentId"),
    };
    match ledger::query(conn, &filter) {
        Ok(rows) => {
            let entries: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| {
                    json!({
                        "studentId": r.student_id,
                        "questionId": r.question_id,
                        "componentId": r.component_id,
                        "marksObtained": r.marks_obtained,
                    })
                })
                .collect();
            ok(&req.id, json!({ "entries": entries }))
        }
        Err(e) => err_calc(&req.id, e),
    }
}

fn handle_delete_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match ledger::delete(conn, &student_id, &question_id, &component_id) {
        Ok(deleted) => ok(&req.id, json!({ "deleted": deleted })),
        Err(e) => err_calc(&req.id, e),
    }
}

/// One row per enrolled (non-withdrawn) student with existing marks filled
/// in; with an empty ledger this doubles as the blank template.
fn handle_export_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let questions: Vec<QuestionDef> = {
        let mut stmt = match conn.prepare(
            "SELECT id, component_id, number, total_marks
             FROM questions WHERE component_id = ? ORDER BY number",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let loaded = stmt
            .query_map([&component_id], |r| {
                Ok(QuestionDef {
                    id: r.get(0)?,
                    component_id: r.get(1)?,
                    number: r.get(2)?,
                    total_marks: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match loaded {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let mut students_stmt = match conn.prepare(
        "SELECT s.id, s.roll_number, s.last_name, s.first_name
         FROM students s
         JOIN enrollments e ON e.student_id = s.id
         WHERE e.course_offering_id = ? AND e.status IN ('active', 'completed')
         ORDER BY s.roll_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students: Vec<(String, String, String)> = match students_stmt
        .query_map([&offering_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok((r.get(0)?, r.get(1)?, format!("{}, {}", last, first)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let marks = match ledger::query(
        conn,
        &ledger::MarksFilter {
            component_id: Some(component_id.clone()),
            ..Default::default()
        },
    ) {
        Ok(v) => v,
        Err(e) => return err_calc(&req.id, e),
    };
    let mut by_pair: std::collections::HashMap<(String, String), f64> = std::collections::HashMap::new();
    for m in marks {
        by_pair.insert((m.student_id.clone(), m.question_id.clone()), m.marks_obtained);
    }

    let mut columns: Vec<String> = vec!["roll_number".to_string(), "name".to_string()];
    for q in &questions {
        columns.push(format!("q{}", q.number));
    }

    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|(student_id, roll, name)| {
            let mut row = serde_json::Map::new();
            row.insert("roll_number".to_string(), json!(roll));
            row.insert("name".to_string(), json!(name));
            for q in &questions {
                let cell = by_pair
                    .get(&(student_id.clone(), q.id.clone()))
                    .map(|v| json!(v))
                    .unwrap_or(serde_json::Value::Null);
                row.insert(format!("q{}", q.number), cell);
            }
            serde_json::Value::Object(row)
        })
        .collect();

    ok(&req.id, json!({ "columns": columns, "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.setEntry" => Some(handle_set_entry(state, req)),
        "marks.importBatch" => Some(handle_import_batch(state, req)),
        "marks.query" => Some(handle_query(state, req)),
        "marks.deleteEntry" => Some(handle_delete_entry(state, req)),
        "marks.exportSheet" => Some(handle_export_sheet(state, req)),
        _ => None,
    }
}
