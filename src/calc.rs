use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use crate::lifecycle::{self, ResultAction, ResultStatus};

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<lifecycle::TransitionError> for CalcError {
    fn from(e: lifecycle::TransitionError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.message(),
            details: e.details(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcMethod {
    Weighted,
    Simple,
    BestOfN,
}

impl CalcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CalcMethod::Weighted => "weighted",
            CalcMethod::Simple => "simple",
            CalcMethod::BestOfN => "best_of_n",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weighted" => Some(CalcMethod::Weighted),
            "simple" => Some(CalcMethod::Simple),
            "best_of_n" => Some(CalcMethod::BestOfN),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub lower_bound: f64,
    pub letter: String,
    pub grade_point: f64,
}

#[derive(Debug, Clone)]
pub struct GradeScale {
    pub id: String,
    pub name: String,
    /// Sorted ascending by lower_bound; non-empty, first band at 0.
    pub bands: Vec<GradeBand>,
}

impl GradeScale {
    pub fn load(conn: &Connection, grade_scale_id: &str) -> Result<GradeScale, CalcError> {
        let name: Option<String> = conn
            .query_row(
                "SELECT name FROM grade_scales WHERE id = ?",
                [grade_scale_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(CalcError::db)?;
        let Some(name) = name else {
            return Err(CalcError::with_details(
                "missing_grade_scale",
                "grade scale not found",
                serde_json::json!({ "gradeScaleId": grade_scale_id }),
            ));
        };

        let mut stmt = conn
            .prepare(
                "SELECT lower_bound, letter, grade_point
                 FROM grade_bands
                 WHERE grade_scale_id = ?
                 ORDER BY lower_bound",
            )
            .map_err(CalcError::db)?;
        let bands: Vec<GradeBand> = stmt
            .query_map([grade_scale_id], |r| {
                Ok(GradeBand {
                    lower_bound: r.get(0)?,
                    letter: r.get(1)?,
                    grade_point: r.get(2)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CalcError::db)?;

        if bands.is_empty() {
            return Err(CalcError::with_details(
                "missing_grade_scale",
                "grade scale has no bands",
                serde_json::json!({ "gradeScaleId": grade_scale_id }),
            ));
        }

        Ok(GradeScale {
            id: grade_scale_id.to_string(),
            name,
            bands,
        })
    }

    /// The band whose range contains `percentage`: the one with the greatest
    /// lower_bound <= percentage. A score exactly on a boundary belongs to
    /// the band starting there, not the band below.
    pub fn band_for(&self, percentage: f64) -> &GradeBand {
        let mut chosen = &self.bands[0];
        for band in &self.bands {
            if band.lower_bound <= percentage {
                chosen = band;
            } else {
                break;
            }
        }
        chosen
    }
}

/// Creation-time check that a proposed band list is non-overlapping and
/// covers [0,100]: first bound 0, strictly increasing, none above 100.
pub fn check_band_bounds(bounds: &[f64]) -> Result<(), String> {
    let Some(first) = bounds.first() else {
        return Err("a grade scale needs at least one band".to_string());
    };
    if *first != 0.0 {
        return Err("the first band must start at 0".to_string());
    }
    for pair in bounds.windows(2) {
        if pair[1] <= pair[0] {
            return Err(format!(
                "band bounds must strictly increase ({} then {})",
                pair[0], pair[1]
            ));
        }
    }
    if let Some(last) = bounds.last() {
        if *last > 100.0 {
            return Err(format!("band bound {} is above 100", last));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub course_offering_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct CalcRequest {
    pub grade_scale_id: String,
    pub method: CalcMethod,
    pub best_of: Option<i64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResultRow {
    pub student_id: String,
    pub roll_number: String,
    pub display_name: String,
    pub total_marks: f64,
    pub max_marks: f64,
    pub percentage: f64,
    pub letter_grade: String,
    pub grade_point: f64,
    pub pass_status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResultSnapshot {
    pub course_result_id: String,
    pub course_offering_id: String,
    pub grade_scale_id: String,
    pub grade_scale_name: String,
    pub calc_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_of: Option<i64>,
    pub status: String,
    pub calculation_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<String>,
    pub per_student: Vec<StudentResultRow>,
}

/// One component's attempted totals for one student. A question the student
/// never answered contributes to neither field; an explicit zero contributes
/// to `possible` only.
#[derive(Debug, Clone, Copy)]
pub struct ComponentTotals {
    pub weight: f64,
    pub sort_order: i64,
    pub obtained: f64,
    pub possible: f64,
}

/// Combine per-component totals into (total, max) under the configured
/// method. best_of_n ranks by weight desc, ties by sort_order, and sums the
/// chosen components' raw totals so selection is deterministic.
pub fn combine_components(
    components: &[ComponentTotals],
    method: CalcMethod,
    best_of: Option<i64>,
) -> (f64, f64) {
    match method {
        CalcMethod::Weighted => components.iter().fold((0.0, 0.0), |(t, m), c| {
            (t + c.obtained * c.weight, m + c.possible * c.weight)
        }),
        CalcMethod::Simple => components
            .iter()
            .fold((0.0, 0.0), |(t, m), c| (t + c.obtained, m + c.possible)),
        CalcMethod::BestOfN => {
            let n = best_of.unwrap_or(0).max(0) as usize;
            let mut ranked: Vec<&ComponentTotals> = components.iter().collect();
            ranked.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.sort_order.cmp(&b.sort_order))
            });
            ranked
                .into_iter()
                .take(n)
                .fold((0.0, 0.0), |(t, m), c| (t + c.obtained, m + c.possible))
        }
    }
}

pub fn percentage_of(total: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    (100.0 * total / max).clamp(0.0, 100.0)
}

struct RosterRow {
    student_id: String,
    roll_number: String,
    display_name: String,
}

struct QuestionRow {
    id: String,
    component_id: String,
    total_marks: f64,
}

fn load_roster(ctx: &CalcContext<'_>) -> Result<Vec<RosterRow>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT s.id, s.roll_number, s.last_name, s.first_name
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
             WHERE e.course_offering_id = ? AND e.status IN ('active', 'completed')
             ORDER BY s.roll_number",
        )
        .map_err(CalcError::db)?;
    stmt.query_map([ctx.course_offering_id], |r| {
        let last: String = r.get(2)?;
        let first: String = r.get(3)?;
        Ok(RosterRow {
            student_id: r.get(0)?,
            roll_number: r.get(1)?,
            display_name: format!("{}, {}", last, first),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::db)
}

fn load_components(
    ctx: &CalcContext<'_>,
) -> Result<Vec<(String, f64, i64)>, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, weight, sort_order
             FROM assessment_components
             WHERE course_offering_id = ?
             ORDER BY sort_order",
        )
        .map_err(CalcError::db)?;
    stmt.query_map([ctx.course_offering_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?, r.get::<_, i64>(2)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::db)
}

fn load_questions(
    conn: &Connection,
    component_ids: &[String],
) -> Result<Vec<QuestionRow>, CalcError> {
    if component_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?")
        .take(component_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT id, component_id, total_marks FROM questions
         WHERE component_id IN ({})
         ORDER BY component_id, number",
        placeholders
    );
    let bind: Vec<Value> = component_ids
        .iter()
        .map(|id| Value::Text(id.clone()))
        .collect();
    let mut stmt = conn.prepare(&sql).map_err(CalcError::db)?;
    stmt.query_map(params_from_iter(bind), |r| {
        Ok(QuestionRow {
            id: r.get(0)?,
            component_id: r.get(1)?,
            total_marks: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::db)
}

fn load_marks_by_pair(
    conn: &Connection,
    component_ids: &[String],
) -> Result<HashMap<(String, String), f64>, CalcError> {
    let mut by_pair = HashMap::new();
    if component_ids.is_empty() {
        return Ok(by_pair);
    }
    let placeholders = std::iter::repeat("?")
        .take(component_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT student_id, question_id, marks_obtained FROM marks
         WHERE component_id IN ({})",
        placeholders
    );
    let bind: Vec<Value> = component_ids
        .iter()
        .map(|id| Value::Text(id.clone()))
        .collect();
    let mut stmt = conn.prepare(&sql).map_err(CalcError::db)?;
    let rows = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .map_err(CalcError::db)?;
    for row in rows {
        let (student_id, question_id, marks) = row.map_err(CalcError::db)?;
        by_pair.insert((student_id, question_id), marks);
    }
    Ok(by_pair)
}

pub fn current_status(
    conn: &Connection,
    course_offering_id: &str,
) -> Result<Option<(String, ResultStatus)>, CalcError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM course_results WHERE course_offering_id = ?",
            [course_offering_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(CalcError::db)?;
    match row {
        None => Ok(None),
        Some((id, status)) => {
            let parsed = ResultStatus::parse(&status).ok_or_else(|| {
                CalcError::with_details(
                    "db_query_failed",
                    "course result has an unknown status",
                    serde_json::json!({ "status": status }),
                )
            })?;
            Ok(Some((id, parsed)))
        }
    }
}

/// Run the full calculation for one course offering and persist the snapshot
/// in a single transaction. Recalculating with an unchanged ledger yields
/// identical rows; calculation_date is the only field that moves.
pub fn calculate_course_result(
    ctx: &CalcContext<'_>,
    req: &CalcRequest,
) -> Result<CourseResultSnapshot, CalcError> {
    let started = Instant::now();
    let conn = ctx.conn;

    let passing_threshold: Option<f64> = conn
        .query_row(
            "SELECT passing_threshold FROM course_offerings WHERE id = ?",
            [ctx.course_offering_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some(passing_threshold) = passing_threshold else {
        return Err(CalcError::new("not_found", "course offering not found"));
    };

    let existing = current_status(conn, ctx.course_offering_id)?;
    let prior_status = existing
        .as_ref()
        .map(|(_, s)| *s)
        .unwrap_or(ResultStatus::Draft);
    lifecycle::transition(prior_status, ResultAction::Calculate)?;

    if req.method == CalcMethod::BestOfN && req.best_of.map(|n| n < 1).unwrap_or(true) {
        return Err(CalcError::new(
            "bad_params",
            "best_of_n requires bestOf >= 1",
        ));
    }

    let scale = GradeScale::load(conn, &req.grade_scale_id)?;
    let roster = load_roster(ctx)?;
    let components = load_components(ctx)?;
    let component_ids: Vec<String> = components.iter().map(|(id, _, _)| id.clone()).collect();
    let questions = load_questions(conn, &component_ids)?;
    let marks = load_marks_by_pair(conn, &component_ids)?;

    let mut questions_by_component: HashMap<&str, Vec<&QuestionRow>> = HashMap::new();
    for q in &questions {
        questions_by_component
            .entry(q.component_id.as_str())
            .or_default()
            .push(q);
    }

    let timeout = req.timeout_ms.map(std::time::Duration::from_millis);
    let mut per_student: Vec<StudentResultRow> = Vec::with_capacity(roster.len());

    for s in &roster {
        if let Some(limit) = timeout {
            if started.elapsed() > limit {
                return Err(CalcError::with_details(
                    "timeout",
                    "calculation exceeded the caller's time budget",
                    serde_json::json!({ "timeoutMs": req.timeout_ms }),
                ));
            }
        }

        let mut totals: Vec<ComponentTotals> = Vec::with_capacity(components.len());
        for (component_id, weight, sort_order) in &components {
            let mut obtained = 0.0;
            let mut possible = 0.0;
            for q in questions_by_component
                .get(component_id.as_str())
                .map(|v| v.as_slice())
                .unwrap_or(&[])
            {
                // Attempted questions only: a missing ledger row leaves both
                // sums untouched, an explicit zero grows the denominator.
                if let Some(v) = marks.get(&(s.student_id.clone(), q.id.clone())) {
                    obtained += *v;
                    possible += q.total_marks;
                }
            }
            totals.push(ComponentTotals {
                weight: *weight,
                sort_order: *sort_order,
                obtained,
                possible,
            });
        }

        let (total, max) = combine_components(&totals, req.method, req.best_of);
        let percentage = percentage_of(total, max);
        let band = scale.band_for(percentage);
        let pass_status = if percentage >= passing_threshold {
            "Pass"
        } else {
            "Fail"
        };

        per_student.push(StudentResultRow {
            student_id: s.student_id.clone(),
            roll_number: s.roll_number.clone(),
            display_name: s.display_name.clone(),
            total_marks: total,
            max_marks: max,
            percentage,
            letter_grade: band.letter.clone(),
            grade_point: band.grade_point,
            pass_status: pass_status.to_string(),
        });
    }

    let calculation_date = Utc::now().to_rfc3339();
    let course_result_id = existing
        .map(|(id, _)| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let tx = conn.unchecked_transaction().map_err(CalcError::db)?;
    tx.execute(
        "INSERT INTO course_results(
            id, course_offering_id, grade_scale_id, calc_method, best_of,
            status, calculation_date, publish_date)
         VALUES(?, ?, ?, ?, ?, 'calculated', ?, NULL)
         ON CONFLICT(course_offering_id) DO UPDATE SET
           grade_scale_id = excluded.grade_scale_id,
           calc_method = excluded.calc_method,
           best_of = excluded.best_of,
           status = 'calculated',
           calculation_date = excluded.calculation_date,
           publish_date = NULL",
        (
            &course_result_id,
            ctx.course_offering_id,
            &scale.id,
            req.method.as_str(),
            req.best_of,
            &calculation_date,
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM student_results WHERE course_result_id = ?",
        [&course_result_id],
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    for row in &per_student {
        tx.execute(
            "INSERT INTO student_results(
                course_result_id, student_id, total_marks, max_marks,
                percentage, letter_grade, grade_point, pass_status)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &course_result_id,
                &row.student_id,
                row.total_marks,
                row.max_marks,
                row.percentage,
                &row.letter_grade,
                row.grade_point,
                &row.pass_status,
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit().map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;

    Ok(CourseResultSnapshot {
        course_result_id,
        course_offering_id: ctx.course_offering_id.to_string(),
        grade_scale_id: scale.id,
        grade_scale_name: scale.name,
        calc_method: req.method.as_str().to_string(),
        best_of: req.best_of,
        status: ResultStatus::Calculated.as_str().to_string(),
        calculation_date,
        publish_date: None,
        per_student,
    })
}

/// Load the persisted snapshot for an offering, rows ordered by roll_number.
pub fn load_snapshot(
    conn: &Connection,
    course_offering_id: &str,
) -> Result<Option<CourseResultSnapshot>, CalcError> {
    #[allow(clippy::type_complexity)]
    let header: Option<(
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<i64>,
        String,
        Option<String>,
        Option<String>,
    )> = conn
        .query_row(
            "SELECT cr.id, cr.grade_scale_id, gs.name, cr.calc_method, cr.best_of,
                    cr.status, cr.calculation_date, cr.publish_date
             FROM course_results cr
             LEFT JOIN grade_scales gs ON gs.id = cr.grade_scale_id
             WHERE cr.course_offering_id = ?",
            [course_offering_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some((
        id,
        grade_scale_id,
        grade_scale_name,
        calc_method,
        best_of,
        status,
        calculation_date,
        publish_date,
    )) = header
    else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT r.student_id, s.roll_number, s.last_name, s.first_name,
                    r.total_marks, r.max_marks, r.percentage,
                    r.letter_grade, r.grade_point, r.pass_status
             FROM student_results r
             JOIN students s ON s.id = r.student_id
             WHERE r.course_result_id = ?
             ORDER BY s.roll_number",
        )
        .map_err(CalcError::db)?;
    let per_student: Vec<StudentResultRow> = stmt
        .query_map([&id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentResultRow {
                student_id: r.get(0)?,
                roll_number: r.get(1)?,
                display_name: format!("{}, {}", last, first),
                total_marks: r.get(4)?,
                max_marks: r.get(5)?,
                percentage: r.get(6)?,
                letter_grade: r.get(7)?,
                grade_point: r.get(8)?,
                pass_status: r.get(9)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    Ok(Some(CourseResultSnapshot {
        course_result_id: id,
        course_offering_id: course_offering_id.to_string(),
        grade_scale_id: grade_scale_id.unwrap_or_default(),
        grade_scale_name: grade_scale_name.unwrap_or_default(),
        calc_method: calc_method.unwrap_or_default(),
        best_of,
        status,
        calculation_date: calculation_date.unwrap_or_default(),
        publish_date,
        per_student,
    }))
}
