use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

use crate::calc::CalcError;

/// Reports pick one of two label tables over the same attainment number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdTable {
    /// 80/60/50 bands.
    FourTier,
    /// 70/50 bands.
    ThreeTier,
}

impl ThresholdTable {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdTable::FourTier => "four_tier",
            ThresholdTable::ThreeTier => "three_tier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "four_tier" => Some(ThresholdTable::FourTier),
            "three_tier" => Some(ThresholdTable::ThreeTier),
            _ => None,
        }
    }

    pub fn label(self, overall: f64) -> &'static str {
        match self {
            ThresholdTable::FourTier => {
                if overall >= 80.0 {
                    "Excellent"
                } else if overall >= 60.0 {
                    "Good"
                } else if overall >= 50.0 {
                    "Satisfactory"
                } else {
                    "Needs Improvement"
                }
            }
            ThresholdTable::ThreeTier => {
                if overall >= 70.0 {
                    "Achieved"
                } else if overall >= 50.0 {
                    "Partially Achieved"
                } else {
                    "Not Achieved"
                }
            }
        }
    }
}

/// Blend direct (marks-derived) and indirect (survey-supplied) attainment.
/// With only one source present that source is the overall; the default
/// 80/20 split applies when both exist and the caller didn't override it.
pub fn combine_overall(
    direct: Option<f64>,
    indirect: Option<f64>,
    direct_weight: Option<f64>,
) -> Option<f64> {
    match (direct, indirect) {
        (None, None) => None,
        (Some(d), None) => Some(d),
        (None, Some(i)) => Some(i),
        (Some(d), Some(i)) => {
            let w = direct_weight.unwrap_or(0.8).clamp(0.0, 1.0);
            Some(w * d + (1.0 - w) * i)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloAttainment {
    pub clo_code: String,
    pub description: String,
    pub obtained_marks: f64,
    pub total_marks: f64,
    pub direct_attainment: Option<f64>,
    pub indirect_attainment: Option<f64>,
    pub overall_attainment: Option<f64>,
    pub status: Option<String>,
    #[serde(skip)]
    pub clo_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PloAttainment {
    pub plo_code: String,
    pub description: String,
    pub attainment: Option<f64>,
    pub status: Option<String>,
    pub mapped_clos: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttainmentReport {
    pub thresholds: String,
    pub clo_attainment: Vec<CloAttainment>,
    pub plo_attainment: Vec<PloAttainment>,
}

/// Direct attainment per CLO referenced by at least one question: marks
/// summed over existing ledger entries for the mapped questions, against the
/// same entries' question maxima. Unattempted cells dilute nothing.
pub fn clo_attainment(
    conn: &Connection,
    course_offering_id: &str,
    direct_weight: Option<f64>,
    table: ThresholdTable,
) -> Result<Vec<CloAttainment>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT cl.id, cl.code, cl.description
             FROM clos cl
             JOIN question_clos qc ON qc.clo_id = cl.id
             WHERE cl.course_offering_id = ?
             ORDER BY cl.code",
        )
        .map_err(CalcError::db)?;
    let clos: Vec<(String, String, String)> = stmt
        .query_map([course_offering_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut sums_stmt = conn
        .prepare(
            "SELECT qc.clo_id, SUM(m.marks_obtained), SUM(q.total_marks)
             FROM question_clos qc
             JOIN questions q ON q.id = qc.question_id
             JOIN assessment_components c ON c.id = q.component_id
             JOIN marks m ON m.question_id = q.id
             WHERE c.course_offering_id = ?
             GROUP BY qc.clo_id",
        )
        .map_err(CalcError::db)?;
    let mut sums: HashMap<String, (f64, f64)> = HashMap::new();
    let rows = sums_stmt
        .query_map([course_offering_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })
        .map_err(CalcError::db)?;
    for row in rows {
        let (clo_id, obtained, total) = row.map_err(CalcError::db)?;
        sums.insert(clo_id, (obtained, total));
    }

    let mut indirect_stmt = conn
        .prepare(
            "SELECT clo_id, percentage FROM indirect_attainment
             WHERE course_offering_id = ?",
        )
        .map_err(CalcError::db)?;
    let mut indirect: HashMap<String, f64> = HashMap::new();
    let rows = indirect_stmt
        .query_map([course_offering_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .map_err(CalcError::db)?;
    for row in rows {
        let (clo_id, pct) = row.map_err(CalcError::db)?;
        indirect.insert(clo_id, pct);
    }

    let mut out = Vec::with_capacity(clos.len());
    for (id, code, description) in clos {
        let (obtained, total) = sums.get(&id).copied().unwrap_or((0.0, 0.0));
        let direct = if total > 0.0 {
            Some(100.0 * obtained / total)
        } else {
            None
        };
        let ind = indirect.get(&id).copied();
        let overall = combine_overall(direct, ind, direct_weight);
        out.push(CloAttainment {
            clo_code: code,
            description,
            obtained_marks: obtained,
            total_marks: total,
            direct_attainment: direct,
            indirect_attainment: ind,
            overall_attainment: overall,
            status: overall.map(|o| table.label(o).to_string()),
            clo_id: id,
        });
    }
    Ok(out)
}

/// PLO attainment is the arithmetic mean of its mapped CLOs' overall
/// attainment within this offering. Zero mappings reports null ("Not
/// Mapped"), never a divide-by-zero; mapped CLOs without data are excluded
/// from the mean.
pub fn plo_attainment(
    conn: &Connection,
    course_offering_id: &str,
    clos: &[CloAttainment],
    table: ThresholdTable,
) -> Result<Vec<PloAttainment>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id, code, description FROM plos ORDER BY code")
        .map_err(CalcError::db)?;
    let plos: Vec<(String, String, String)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut map_stmt = conn
        .prepare(
            "SELECT pc.plo_id, pc.clo_id
             FROM plo_clos pc
             JOIN clos cl ON cl.id = pc.clo_id
             WHERE cl.course_offering_id = ?",
        )
        .map_err(CalcError::db)?;
    let mut mapped: HashMap<String, Vec<String>> = HashMap::new();
    let rows = map_stmt
        .query_map([course_offering_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .map_err(CalcError::db)?;
    for row in rows {
        let (plo_id, clo_id) = row.map_err(CalcError::db)?;
        mapped.entry(plo_id).or_default().push(clo_id);
    }

    let by_clo_id: HashMap<&str, &CloAttainment> =
        clos.iter().map(|c| (c.clo_id.as_str(), c)).collect();

    let mut out = Vec::with_capacity(plos.len());
    for (id, code, description) in plos {
        let clo_ids = mapped.remove(&id).unwrap_or_default();
        if clo_ids.is_empty() {
            out.push(PloAttainment {
                plo_code: code,
                description,
                attainment: None,
                status: Some("Not Mapped".to_string()),
                mapped_clos: Vec::new(),
            });
            continue;
        }

        let mut mapped_codes: Vec<String> = Vec::with_capacity(clo_ids.len());
        let mut values: Vec<f64> = Vec::new();
        for clo_id in &clo_ids {
            if let Some(clo) = by_clo_id.get(clo_id.as_str()) {
                mapped_codes.push(clo.clo_code.clone());
                if let Some(overall) = clo.overall_attainment {
                    values.push(overall);
                }
            }
        }
        mapped_codes.sort();

        let attainment = if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        };
        out.push(PloAttainment {
            plo_code: code,
            description,
            attainment,
            status: attainment.map(|a| table.label(a).to_string()),
            mapped_clos: mapped_codes,
        });
    }
    Ok(out)
}

pub fn attainment_report(
    conn: &Connection,
    course_offering_id: &str,
    direct_weight: Option<f64>,
    table: ThresholdTable,
) -> Result<AttainmentReport, CalcError> {
    let clos = clo_attainment(conn, course_offering_id, direct_weight, table)?;
    let plos = plo_attainment(conn, course_offering_id, &clos, table)?;
    Ok(AttainmentReport {
        thresholds: table.as_str().to_string(),
        clo_attainment: clos,
        plo_attainment: plos,
    })
}
