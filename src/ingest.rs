use rusqlite::Connection;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::calc::CalcError;
use crate::ledger;
use crate::validate::{
    parse_cell, validate_value, FailureKind, MarksEntry, QuestionDef, Roster, ValidationFailure,
};

/// Row 1 of the source sheet is the header, so the first data row a human
/// sees is row 2. Reported ordinals must line up with their file.
pub const FIRST_DATA_ROW: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPolicy {
    /// Collect every failure across the whole batch; commit only if clean.
    Atomic,
    /// Commit row by row; failures are reported but do not roll back
    /// earlier rows.
    BestEffort,
}

impl ImportPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportPolicy::Atomic => "atomic",
            ImportPolicy::BestEffort => "best_effort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "atomic" => Some(ImportPolicy::Atomic),
            "best_effort" => Some(ImportPolicy::BestEffort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub policy: ImportPolicy,
    /// Rows fully committed.
    pub imported: usize,
    /// Rows rejected (atomic mode rejects all rows when any fails).
    pub failed: usize,
    /// Ledger rows written.
    pub entries_written: usize,
    /// Ordered row-level failures, ordinals matching the source file.
    pub errors: Vec<ValidationFailure>,
}

/// Enrollment roster for an offering: active and completed students;
/// withdrawn students are not importable targets.
pub fn load_roster(conn: &Connection, course_offering_id: &str) -> Result<Roster, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.roll_number
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
             WHERE e.course_offering_id = ? AND e.status IN ('active', 'completed')",
        )
        .map_err(CalcError::db)?;
    let pairs: Vec<(String, String)> = stmt
        .query_map([course_offering_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(Roster::new(pairs))
}

/// Questions of one component keyed by their sheet column name (`q<n>`).
pub fn load_question_columns(
    conn: &Connection,
    component_id: &str,
) -> Result<HashMap<String, QuestionDef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, component_id, number, total_marks
             FROM questions WHERE component_id = ?
             ORDER BY number",
        )
        .map_err(CalcError::db)?;
    let questions: Vec<QuestionDef> = stmt
        .query_map([component_id], |r| {
            Ok(QuestionDef {
                id: r.get(0)?,
                component_id: r.get(1)?,
                number: r.get(2)?,
                total_marks: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(questions
        .into_iter()
        .map(|q| (format!("q{}", q.number), q))
        .collect())
}

fn question_columns_of(row: &serde_json::Map<String, serde_json::Value>) -> Vec<(i64, String)> {
    let mut cols: Vec<(i64, String)> = row
        .keys()
        .filter_map(|k| {
            let digits = k.strip_prefix('q')?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse::<i64>().ok().map(|n| (n, k.clone()))
        })
        .collect();
    cols.sort();
    cols
}

fn student_ref_of(row: &serde_json::Map<String, serde_json::Value>) -> String {
    for key in ["student_id", "roll_number"] {
        if let Some(v) = row.get(key).and_then(|v| v.as_str()) {
            let t = v.trim();
            if !t.is_empty() {
                return t.to_string();
            }
        }
    }
    String::new()
}

struct ValidatedRow {
    entries: Vec<MarksEntry>,
    errors: Vec<ValidationFailure>,
}

fn validate_row(
    roster: &Roster,
    columns: &HashMap<String, QuestionDef>,
    row: &serde_json::Map<String, serde_json::Value>,
    ordinal: i64,
) -> ValidatedRow {
    let mut out = ValidatedRow {
        entries: Vec::new(),
        errors: Vec::new(),
    };

    let student_ref = student_ref_of(row);
    let Some(student_id) = roster.resolve(&student_ref) else {
        // One failure per unmatched row; its cells are not worth reporting
        // against a student who is not on the roster.
        out.errors.push(ValidationFailure {
            row: ordinal,
            column: "roll_number".to_string(),
            kind: FailureKind::StudentNotFound {
                student_ref: if student_ref.is_empty() {
                    "(blank)".to_string()
                } else {
                    student_ref
                },
            },
        });
        return out;
    };
    let student_id = student_id.to_string();

    for (_, column) in question_columns_of(row) {
        let raw = row.get(&column).cloned().unwrap_or(serde_json::Value::Null);
        let Some(question) = columns.get(&column) else {
            out.errors.push(ValidationFailure {
                row: ordinal,
                column,
                kind: FailureKind::UnknownQuestion,
            });
            continue;
        };

        match parse_cell(&raw, ordinal, &column)
            .and_then(|value| validate_value(&student_id, question, value, ordinal, &column))
        {
            Ok(Some(entry)) => out.entries.push(entry),
            Ok(None) => {
                debug!(row = ordinal, column = %column, "blank cell skipped");
            }
            Err(failure) => out.errors.push(failure),
        }
    }

    out
}

/// Run one tabular batch through validation and the selected commit policy.
/// Rows must be JSON objects; a malformed payload is the caller's bug and
/// fails the whole call regardless of policy.
pub fn import_rows(
    conn: &Connection,
    course_offering_id: &str,
    component_id: &str,
    rows: &[serde_json::Value],
    policy: ImportPolicy,
) -> Result<ImportReport, CalcError> {
    let roster = load_roster(conn, course_offering_id)?;
    let columns = load_question_columns(conn, component_id)?;

    let mut objects: Vec<&serde_json::Map<String, serde_json::Value>> =
        Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            return Err(CalcError::with_details(
                "bad_params",
                format!("row at index {} is not an object", i),
                serde_json::json!({ "index": i }),
            ));
        };
        objects.push(obj);
    }

    let report = match policy {
        ImportPolicy::Atomic => {
            let mut entries: Vec<MarksEntry> = Vec::new();
            let mut errors: Vec<ValidationFailure> = Vec::new();
            let mut clean_rows = 0usize;
            let mut failed_rows = 0usize;

            for (i, obj) in objects.iter().enumerate() {
                let validated = validate_row(&roster, &columns, obj, FIRST_DATA_ROW + i as i64);
                if validated.errors.is_empty() {
                    clean_rows += 1;
                    entries.extend(validated.entries);
                } else {
                    failed_rows += 1;
                    errors.extend(validated.errors);
                }
            }

            if errors.is_empty() {
                let written = ledger::upsert_batch(conn, &entries)?;
                ImportReport {
                    policy,
                    imported: clean_rows,
                    failed: 0,
                    entries_written: written,
                    errors,
                }
            } else {
                // Nothing committed: the caller corrects and resubmits the
                // whole sheet.
                ImportReport {
                    policy,
                    imported: 0,
                    failed: failed_rows,
                    entries_written: 0,
                    errors,
                }
            }
        }
        ImportPolicy::BestEffort => {
            let mut imported = 0usize;
            let mut failed = 0usize;
            let mut entries_written = 0usize;
            let mut errors: Vec<ValidationFailure> = Vec::new();

            for (i, obj) in objects.iter().enumerate() {
                let validated = validate_row(&roster, &columns, obj, FIRST_DATA_ROW + i as i64);
                if validated.errors.is_empty() {
                    entries_written += ledger::upsert_batch(conn, &validated.entries)?;
                    imported += 1;
                } else {
                    failed += 1;
                    errors.extend(validated.errors);
                }
            }

            ImportReport {
                policy,
                imported,
                failed,
                entries_written,
                errors,
            }
        }
    };

    info!(
        offering = course_offering_id,
        component = component_id,
        policy = policy.as_str(),
        imported = report.imported,
        failed = report.failed,
        "marks import finished"
    );
    Ok(report)
}
