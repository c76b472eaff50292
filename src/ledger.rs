use chrono::Utc;
use rusqlite::{Connection, ToSql};
use uuid::Uuid;

use crate::calc::CalcError;
use crate::validate::MarksEntry;

/// Composite-keyed marks store. One row per (student, question, component);
/// upserts are last-write-wins on that key.
#[derive(Debug, Clone, Default)]
pub struct MarksFilter {
    pub student_id: Option<String>,
    pub question_id: Option<String>,
    pub component_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub student_id: String,
    pub question_id: String,
    pub component_id: String,
    pub marks_obtained: f64,
}

pub fn upsert(conn: &Connection, entry: &MarksEntry) -> Result<(), CalcError> {
    let id = Uuid::new_v4().to_string();
    let updated_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO marks(id, student_id, question_id, component_id, marks_obtained, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, question_id, component_id) DO UPDATE SET
           marks_obtained = excluded.marks_obtained,
           updated_at = excluded.updated_at",
        (
            &id,
            &entry.student_id,
            &entry.question_id,
            &entry.component_id,
            entry.marks_obtained,
            &updated_at,
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

/// All-or-nothing: every entry lands or none does. Used by the atomic
/// ingestion policy, whose contract is that a reported failure implies zero
/// ledger side effects.
pub fn upsert_batch(conn: &Connection, entries: &[MarksEntry]) -> Result<usize, CalcError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    for entry in entries {
        upsert(&tx, entry)?;
    }
    tx.commit()
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    Ok(entries.len())
}

pub fn query(conn: &Connection, filter: &MarksFilter) -> Result<Vec<LedgerRow>, CalcError> {
    let mut sql = String::from(
        "SELECT student_id, question_id, component_id, marks_obtained FROM marks WHERE 1=1",
    );
    let mut bind: Vec<&dyn ToSql> = Vec::new();
    if let Some(student_id) = &filter.student_id {
        sql.push_str(" AND student_id = ?");
        bind.push(student_id);
    }
    if let Some(question_id) = &filter.question_id {
        sql.push_str(" AND question_id = ?");
        bind.push(question_id);
    }
    if let Some(component_id) = &filter.component_id {
        sql.push_str(" AND component_id = ?");
        bind.push(component_id);
    }
    sql.push_str(" ORDER BY component_id, question_id, student_id");

    let mut stmt = conn.prepare(&sql).map_err(CalcError::db)?;
    stmt.query_map(&bind[..], |r| {
        Ok(LedgerRow {
            student_id: r.get(0)?,
            question_id: r.get(1)?,
            component_id: r.get(2)?,
            marks_obtained: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::db)
}

/// Returns whether a row existed.
pub fn delete(
    conn: &Connection,
    student_id: &str,
    question_id: &str,
    component_id: &str,
) -> Result<bool, CalcError> {
    let affected = conn
        .execute(
            "DELETE FROM marks
             WHERE student_id = ? AND question_id = ? AND component_id = ?",
            (student_id, question_id, component_id),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    Ok(affected > 0)
}
