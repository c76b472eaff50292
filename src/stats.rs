use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::calc::{CalcError, StudentResultRow};

pub fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

/// Population standard deviation: the snapshot rows are the whole cohort,
/// not a sample.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStats {
    pub question_id: String,
    pub question_number: i64,
    pub component_id: String,
    pub attempted: usize,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    /// Fraction of attempting students scoring at least half the question's
    /// total marks.
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStatistics {
    pub total_students: usize,
    pub average_marks: f64,
    pub highest_marks: f64,
    pub lowest_marks: f64,
    pub median_marks: f64,
    pub std_deviation: f64,
    pub passed: usize,
    pub failed: usize,
    pub grade_counts: BTreeMap<String, usize>,
    pub question_stats: Vec<QuestionStats>,
}

/// Descriptive statistics over a snapshot's rows. Pure; derived on demand
/// and never persisted, so they can't go stale against the snapshot.
pub fn result_statistics(rows: &[StudentResultRow]) -> CourseStatistics {
    let totals: Vec<f64> = rows.iter().map(|r| r.total_marks).collect();
    let passed = rows.iter().filter(|r| r.pass_status == "Pass").count();

    let mut grade_counts: BTreeMap<String, usize> = BTreeMap::new();
    for r in rows {
        *grade_counts.entry(r.letter_grade.clone()).or_insert(0) += 1;
    }

    let average = if totals.is_empty() {
        0.0
    } else {
        totals.iter().sum::<f64>() / totals.len() as f64
    };

    CourseStatistics {
        total_students: rows.len(),
        average_marks: average,
        highest_marks: if totals.is_empty() {
            0.0
        } else {
            totals.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        },
        lowest_marks: if totals.is_empty() {
            0.0
        } else {
            totals.iter().copied().fold(f64::INFINITY, f64::min)
        },
        median_marks: compute_median(&totals),
        std_deviation: population_std_dev(&totals),
        passed,
        failed: rows.len() - passed,
        grade_counts,
        question_stats: Vec::new(),
    }
}

/// Per-question descriptive stats across the offering's ledger entries,
/// ordered by component then question number.
pub fn question_statistics(
    conn: &Connection,
    course_offering_id: &str,
) -> Result<Vec<QuestionStats>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT q.id, q.number, q.component_id, q.total_marks
             FROM questions q
             JOIN assessment_components c ON c.id = q.component_id
             WHERE c.course_offering_id = ?
             ORDER BY c.sort_order, q.number",
        )
        .map_err(CalcError::db)?;
    let questions: Vec<(String, i64, String, f64)> = stmt
        .query_map([course_offering_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut marks_stmt = conn
        .prepare(
            "SELECT m.question_id, m.marks_obtained
             FROM marks m
             JOIN assessment_components c ON c.id = m.component_id
             WHERE c.course_offering_id = ?",
        )
        .map_err(CalcError::db)?;
    let mut marks_by_question: HashMap<String, Vec<f64>> = HashMap::new();
    let rows = marks_stmt
        .query_map([course_offering_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .map_err(CalcError::db)?;
    for row in rows {
        let (question_id, v) = row.map_err(CalcError::db)?;
        marks_by_question.entry(question_id).or_default().push(v);
    }

    let mut out = Vec::with_capacity(questions.len());
    for (id, number, component_id, total_marks) in questions {
        let values = marks_by_question.remove(&id).unwrap_or_default();
        let attempted = values.len();
        let (average, highest, lowest, pass_rate) = if attempted == 0 {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let sum: f64 = values.iter().sum();
            let highest = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let lowest = values.iter().copied().fold(f64::INFINITY, f64::min);
            let passing = values.iter().filter(|v| **v >= total_marks / 2.0).count();
            (
                sum / attempted as f64,
                highest,
                lowest,
                passing as f64 / attempted as f64,
            )
        };
        out.push(QuestionStats {
            question_id: id,
            question_number: number,
            component_id,
            attempted,
            average,
            highest,
            lowest,
            pass_rate,
        });
    }
    Ok(out)
}
