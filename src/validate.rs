use std::collections::HashMap;

use serde_json::json;

/// Read-only roster view for one course offering. Built by the caller from
/// the enrollment registry and injected here so validation is testable
/// without a database.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    by_id: HashMap<String, String>,
    by_roll: HashMap<String, String>,
}

impl Roster {
    pub fn new<I>(students: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut by_id = HashMap::new();
        let mut by_roll = HashMap::new();
        for (id, roll) in students {
            by_roll.insert(roll.clone(), id.clone());
            by_id.insert(id, roll);
        }
        Roster { by_id, by_roll }
    }

    /// Accepts either an internal student id or a roll number.
    pub fn resolve(&self, student_ref: &str) -> Option<&str> {
        if let Some((id, _)) = self.by_id.get_key_value(student_ref) {
            return Some(id.as_str());
        }
        self.by_roll.get(student_ref).map(|s| s.as_str())
    }
}

/// Question shape the Validation Unit needs; loaded once per batch.
#[derive(Debug, Clone)]
pub struct QuestionDef {
    pub id: String,
    pub component_id: String,
    pub number: i64,
    pub total_marks: f64,
}

/// A normalized, in-bounds marks record. The only way one of these is built
/// is through this module, which keeps the ledger invariant
/// 0 <= marks_obtained <= total_marks in a single place.
#[derive(Debug, Clone, PartialEq)]
pub struct MarksEntry {
    pub student_id: String,
    pub question_id: String,
    pub component_id: String,
    pub marks_obtained: f64,
}

/// Blank cells mean "not attempted" and are skipped, not errored; a literal
/// 0 is a real score. The distinction decides whether the question counts
/// toward the student's denominator later.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Blank,
    Marks(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    StudentNotFound { student_ref: String },
    InvalidValue { raw: String },
    Negative { value: f64 },
    ExceedsMaximum { value: f64, total_marks: f64 },
    UnknownQuestion,
}

/// One row-level validation failure, tagged with its origin in the source
/// sheet so the report matches what the human sees in their file.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub row: i64,
    pub column: String,
    pub kind: FailureKind,
}

impl ValidationFailure {
    pub fn code(&self) -> &'static str {
        match self.kind {
            FailureKind::StudentNotFound { .. } => "student_not_found",
            FailureKind::InvalidValue { .. } => "invalid_value",
            FailureKind::Negative { .. } => "negative",
            FailureKind::ExceedsMaximum { .. } => "exceeds_maximum",
            FailureKind::UnknownQuestion => "not_found",
        }
    }

    /// The failure without its sheet position, for contexts (manual entry)
    /// that have no source row.
    pub fn reason(&self) -> String {
        match &self.kind {
            FailureKind::StudentNotFound { student_ref } => {
                format!("no enrolled student matches '{}'", student_ref)
            }
            FailureKind::InvalidValue { raw } => {
                format!("'{}' in {} is not a number", raw, self.column)
            }
            FailureKind::Negative { value } => {
                format!("{} in {} is negative", value, self.column)
            }
            FailureKind::ExceedsMaximum { value, total_marks } => format!(
                "{} in {} exceeds the question maximum of {}",
                value, self.column, total_marks
            ),
            FailureKind::UnknownQuestion => {
                format!("column {} matches no question in this component", self.column)
            }
        }
    }

    pub fn message(&self) -> String {
        if self.row > 0 {
            format!("Row {}: {}", self.row, self.reason())
        } else {
            self.reason()
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "row": self.row,
            "column": self.column,
            "code": self.code(),
            "message": self.message(),
        })
    }
}

/// Parse one raw cell as supplied by the host's sheet decoder. Accepts JSON
/// numbers and numeric strings; whitespace-only strings and nulls are Blank.
pub fn parse_cell(raw: &serde_json::Value, row: i64, column: &str) -> Result<CellValue, ValidationFailure> {
    let invalid = |raw_text: String| ValidationFailure {
        row,
        column: column.to_string(),
        kind: FailureKind::InvalidValue { raw: raw_text },
    };

    match raw {
        serde_json::Value::Null => Ok(CellValue::Blank),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(v) => Ok(CellValue::Marks(v)),
            None => Err(invalid(n.to_string())),
        },
        serde_json::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return Ok(CellValue::Blank);
            }
            match t.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(CellValue::Marks(v)),
                _ => Err(invalid(t.to_string())),
            }
        }
        other => Err(invalid(other.to_string())),
    }
}

/// Bounds-check a parsed value against its question and build the normalized
/// entry. `student_id` must already be resolved against the roster.
pub fn validate_value(
    student_id: &str,
    question: &QuestionDef,
    value: CellValue,
    row: i64,
    column: &str,
) -> Result<Option<MarksEntry>, ValidationFailure> {
    let v = match value {
        CellValue::Blank => return Ok(None),
        CellValue::Marks(v) => v,
    };

    if v < 0.0 {
        return Err(ValidationFailure {
            row,
            column: column.to_string(),
            kind: FailureKind::Negative { value: v },
        });
    }
    if v > question.total_marks {
        return Err(ValidationFailure {
            row,
            column: column.to_string(),
            kind: FailureKind::ExceedsMaximum {
                value: v,
                total_marks: question.total_marks,
            },
        });
    }

    Ok(Some(MarksEntry {
        student_id: student_id.to_string(),
        question_id: question.id.clone(),
        component_id: question.component_id.clone(),
        marks_obtained: v,
    }))
}

/// Full single-candidate path used by manual entry: resolve the student ref,
/// parse the raw value, bounds-check. Blank raw values return Ok(None).
pub fn validate_candidate(
    roster: &Roster,
    question: &QuestionDef,
    student_ref: &str,
    raw_value: &serde_json::Value,
    row: i64,
    column: &str,
) -> Result<Option<MarksEntry>, ValidationFailure> {
    let Some(student_id) = roster.resolve(student_ref) else {
        return Err(ValidationFailure {
            row,
            column: column.to_string(),
            kind: FailureKind::StudentNotFound {
                student_ref: student_ref.to_string(),
            },
        });
    };
    let student_id = student_id.to_string();
    let value = parse_cell(raw_value, row, column)?;
    validate_value(&student_id, question, value, row, column)
}
