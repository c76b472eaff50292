use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::{db_conn, optional_f64, optional_str, required_array, required_str};
use crate::ipc::types::{AppState, Request};

const ENROLLMENT_STATUSES: [&str; 3] = ["active", "completed", "withdrawn"];

fn handle_offerings_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let term = optional_str(req, "term");
    let passing_threshold = optional_f64(req, "passingThreshold").unwrap_or(50.0);
    if !(0.0..=100.0).contains(&passing_threshold) {
        return err(
            &req.id,
            "bad_params",
            "passingThreshold must be within [0,100]",
            Some(json!({ "passingThreshold": passing_threshold })),
        );
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO course_offerings(id, code, title, term, passing_threshold)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &code, &title, &term, passing_threshold),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "offeringId": id }))
}

fn handle_directory_upsert_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let students = match required_array(req, "students") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut upserted = 0usize;
    for (i, s) in students.iter().enumerate() {
        let Some(obj) = s.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("students[{}] must be an object", i),
                None,
            );
        };
        let roll = obj.get("rollNumber").and_then(|v| v.as_str()).unwrap_or("");
        if roll.trim().is_empty() {
            return err(
                &req.id,
                "bad_params",
                format!("students[{}] missing rollNumber", i),
                None,
            );
        }
        let last = obj.get("lastName").and_then(|v| v.as_str()).unwrap_or("");
        let first = obj.get("firstName").and_then(|v| v.as_str()).unwrap_or("");

        let id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO students(id, roll_number, last_name, first_name)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(roll_number) DO UPDATE SET
               last_name = excluded.last_name,
               first_name = excluded.first_name",
            (&id, roll.trim(), last, first),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        upserted += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "upserted": upserted }))
}

fn resolve_student_id(conn: &Connection, student_ref: &str) -> Result<Option<String>, rusqlite::Error> {
    let by_id: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_ref], |r| {
            r.get(0)
        })
        .optional()?;
    if by_id.is_some() {
        return Ok(by_id);
    }
    conn.query_row(
        "SELECT id FROM students WHERE roll_number = ?",
        [student_ref],
        |r| r.get(0),
    )
    .optional()
}

fn handle_enrollments_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let enrollments = match required_array(req, "enrollments") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut set = 0usize;
    for (i, e_val) in enrollments.iter().enumerate() {
        let Some(obj) = e_val.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("enrollments[{}] must be an object", i),
                None,
            );
        };
        let student_ref = obj
            .get("studentId")
            .or_else(|| obj.get("rollNumber"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let status = obj
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("active");
        if !ENROLLMENT_STATUSES.contains(&status) {
            return err(
                &req.id,
                "bad_params",
                format!("enrollments[{}] has unknown status '{}'", i, status),
                Some(json!({ "allowed": ENROLLMENT_STATUSES })),
            );
        }

        let student_id = match resolve_student_id(&tx, student_ref) {
            Ok(Some(id)) => id,
            Ok(None) => {
                return err(
                    &req.id,
                    "student_not_found",
                    format!("enrollments[{}]: no student matches '{}'", i, student_ref),
                    None,
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        if let Err(e) = tx.execute(
            "INSERT INTO enrollments(course_offering_id, student_id, status)
             VALUES(?, ?, ?)
             ON CONFLICT(course_offering_id, student_id) DO UPDATE SET
               status = excluded.status",
            (&offering_id, &student_id, status),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        set += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "set": set }))
}

fn handle_components_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let weight = optional_f64(req, "weight").unwrap_or(1.0);
    if weight < 0.0 {
        return err(&req.id, "bad_params", "weight must be >= 0", None);
    }
    let sort_order = req
        .params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessment_components(id, course_offering_id, name, weight, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &offering_id, &name, weight, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "componentId": id }))
}

fn handle_questions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let questions = match required_array(req, "questions") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let offering_id: Option<String> = match conn
        .query_row(
            "SELECT course_offering_id FROM assessment_components WHERE id = ?",
            [&component_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(offering_id) = offering_id else {
        return err(&req.id, "not_found", "assessment component not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut question_ids: Vec<String> = Vec::with_capacity(questions.len());
    for (i, q) in questions.iter().enumerate() {
        let Some(obj) = q.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("questions[{}] must be an object", i),
                None,
            );
        };
        let Some(number) = obj.get("number").and_then(|v| v.as_i64()) else {
            return err(
                &req.id,
                "bad_params",
                format!("questions[{}] missing number", i),
                None,
            );
        };
        let Some(total_marks) = obj.get("totalMarks").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                format!("questions[{}] missing totalMarks", i),
                None,
            );
        };
        if total_marks <= 0.0 {
            return err(
                &req.id,
                "bad_params",
                format!("questions[{}] totalMarks must be positive", i),
                Some(json!({ "totalMarks": total_marks })),
            );
        }
        let question_type = obj.get("questionType").and_then(|v| v.as_str());

        let id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO questions(id, component_id, number, total_marks, question_type)
             VALUES(?, ?, ?, ?, ?)",
            (&id, &component_id, number, total_marks, question_type),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }

        if let Some(clo_codes) = obj.get("cloCodes").and_then(|v| v.as_array()) {
            for code_val in clo_codes {
                let Some(code) = code_val.as_str() else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("questions[{}].cloCodes must be strings", i),
                        None,
                    );
                };
                let clo_id: Option<String> = match tx
                    .query_row(
                        "SELECT id FROM clos WHERE course_offering_id = ? AND code = ?",
                        (&offering_id, code),
                        |r| r.get(0),
                    )
                    .optional()
                {
                    Ok(v) => v,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
                let Some(clo_id) = clo_id else {
                    return err(
                        &req.id,
                        "not_found",
                        format!("questions[{}]: CLO '{}' not found for offering", i, code),
                        None,
                    );
                };
                if let Err(e) = tx.execute(
                    "INSERT OR IGNORE INTO question_clos(question_id, clo_id) VALUES(?, ?)",
                    (&id, &clo_id),
                ) {
                    return err(&req.id, "db_insert_failed", e.to_string(), None);
                }
            }
        }

        question_ids.push(id);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "questionIds": question_ids }))
}

fn handle_grade_scales_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let bands = match required_array(req, "bands") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut parsed: Vec<(f64, String, f64)> = Vec::with_capacity(bands.len());
    for (i, b) in bands.iter().enumerate() {
        let Some(obj) = b.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("bands[{}] must be an object", i),
                None,
            );
        };
        let (Some(lower), Some(letter), Some(gp)) = (
            obj.get("lowerBound").and_then(|v| v.as_f64()),
            obj.get("letter").and_then(|v| v.as_str()),
            obj.get("gradePoint").and_then(|v| v.as_f64()),
        ) else {
            return err(
                &req.id,
                "bad_params",
                format!("bands[{}] needs lowerBound, letter, gradePoint", i),
                None,
            );
        };
        parsed.push((lower, letter.to_string(), gp));
    }
    parsed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let bounds: Vec<f64> = parsed.iter().map(|(l, _, _)| *l).collect();
    if let Err(reason) = calc::check_band_bounds(&bounds) {
        return err(&req.id, "bad_params", reason, None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let scale_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO grade_scales(id, name) VALUES(?, ?)",
        (&scale_id, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for (lower, letter, gp) in &parsed {
        let band_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO grade_bands(id, grade_scale_id, lower_bound, letter, grade_point)
             VALUES(?, ?, ?, ?, ?)",
            (&band_id, &scale_id, lower, letter, gp),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "gradeScaleId": scale_id }))
}

fn handle_clos_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let clos = match required_array(req, "clos") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut clo_ids: Vec<String> = Vec::with_capacity(clos.len());
    for (i, c) in clos.iter().enumerate() {
        let Some(obj) = c.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("clos[{}] must be an object", i),
                None,
            );
        };
        let Some(code) = obj.get("code").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("clos[{}] missing code", i),
                None,
            );
        };
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO clos(id, course_offering_id, code, description)
             VALUES(?, ?, ?, ?)",
            (&id, &offering_id, code, description),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        clo_ids.push(id);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "cloIds": clo_ids }))
}

fn handle_plos_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let plos = match required_array(req, "plos") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut plo_ids: Vec<String> = Vec::with_capacity(plos.len());
    for (i, p) in plos.iter().enumerate() {
        let Some(obj) = p.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("plos[{}] must be an object", i),
                None,
            );
        };
        let Some(code) = obj.get("code").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("plos[{}] missing code", i),
                None,
            );
        };
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO plos(id, code, description) VALUES(?, ?, ?)",
            (&id, code, description),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        plo_ids.push(id);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ploIds": plo_ids }))
}

fn handle_plos_map_clos(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let plo_code = match required_str(req, "ploCode") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let clo_codes = match required_array(req, "cloCodes") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let plo_id: Option<String> = match conn
        .query_row("SELECT id FROM plos WHERE code = ?", [&plo_code], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(plo_id) = plo_id else {
        return err(
            &req.id,
            "not_found",
            format!("PLO '{}' not found", plo_code),
            None,
        );
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut mapped = 0usize;
    for code_val in clo_codes {
        let Some(code) = code_val.as_str() else {
            return err(&req.id, "bad_params", "cloCodes must be strings", None);
        };
        let clo_id: Option<String> = match tx
            .query_row(
                "SELECT id FROM clos WHERE course_offering_id = ? AND code = ?",
                (&offering_id, code),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some(clo_id) = clo_id else {
            return err(
                &req.id,
                "not_found",
                format!("CLO '{}' not found for offering", code),
                None,
            );
        };
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO plo_clos(plo_id, clo_id) VALUES(?, ?)",
            (&plo_id, &clo_id),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        mapped += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "mapped": mapped }))
}

fn handle_attainment_set_indirect(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let entries = match required_array(req, "entries") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let mut set = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("entries[{}] must be an object", i),
                None,
            );
        };
        let (Some(code), Some(percentage)) = (
            obj.get("cloCode").and_then(|v| v.as_str()),
            obj.get("percentage").and_then(|v| v.as_f64()),
        ) else {
            return err(
                &req.id,
                "bad_params",
                format!("entries[{}] needs cloCode and percentage", i),
                None,
            );
        };
        if !(0.0..=100.0).contains(&percentage) {
            return err(
                &req.id,
                "bad_params",
                format!("entries[{}] percentage must be within [0,100]", i),
                Some(json!({ "percentage": percentage })),
            );
        }
        let clo_id: Option<String> = match tx
            .query_row(
                "SELECT id FROM clos WHERE course_offering_id = ? AND code = ?",
                (&offering_id, code),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some(clo_id) = clo_id else {
            return err(
                &req.id,
                "not_found",
                format!("entries[{}]: CLO '{}' not found for offering", i, code),
                None,
            );
        };
        if let Err(e) = tx.execute(
            "INSERT INTO indirect_attainment(course_offering_id, clo_id, percentage)
             VALUES(?, ?, ?)
             ON CONFLICT(course_offering_id, clo_id) DO UPDATE SET
               percentage = excluded.percentage",
            (&offering_id, &clo_id, percentage),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        set += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "set": set }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "offerings.create" => Some(handle_offerings_create(state, req)),
        "directory.upsertStudents" => Some(handle_directory_upsert_students(state, req)),
        "enrollments.set" => Some(handle_enrollments_set(state, req)),
        "components.create" => Some(handle_components_create(state, req)),
        "questions.create" => Some(handle_questions_create(state, req)),
        "gradeScales.create" => Some(handle_grade_scales_create(state, req)),
        "clos.create" => Some(handle_clos_create(state, req)),
        "plos.create" => Some(handle_plos_create(state, req)),
        "plos.mapClos" => Some(handle_plos_map_clos(state, req)),
        "attainment.setIndirect" => Some(handle_attainment_set_indirect(state, req)),
        _ => None,
    }
}
