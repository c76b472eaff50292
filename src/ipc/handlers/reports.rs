use rusqlite::OptionalExtension;
use serde_json::json;

use crate::attainment::{self, ThresholdTable};
use crate::calc;
use crate::ipc::error::{err, err_calc, ok};
use crate::ipc::handlers::helpers::{db_conn, optional_f64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::ResultStatus;
use crate::stats;

/// Statistics are a projection of a computed snapshot; a draft (or absent)
/// result has nothing trustworthy to describe.
fn handle_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let snapshot = match calc::load_snapshot(conn, &offering_id) {
        Ok(v) => v,
        Err(e) => return err_calc(&req.id, e),
    };
    let Some(snapshot) = snapshot else {
        return err(
            &req.id,
            "result_not_calculated",
            "calculate the course result before requesting statistics",
            None,
        );
    };
    if ResultStatus::parse(&snapshot.status) == Some(ResultStatus::Draft) {
        return err(
            &req.id,
            "result_not_calculated",
            "the course result is a draft; recalculate before requesting statistics",
            None,
        );
    }

    let mut statistics = stats::result_statistics(&snapshot.per_student);
    statistics.question_stats = match stats::question_statistics(conn, &offering_id) {
        Ok(v) => v,
        Err(e) => return err_calc(&req.id, e),
    };

    match serde_json::to_value(&statistics) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_attainment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let offering_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM course_offerings WHERE id = ?",
            [&offering_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if offering_exists.is_none() {
        return err(&req.id, "not_found", "course offering not found", None);
    }

    let table_name = optional_str(req, "thresholds").unwrap_or_else(|| "four_tier".to_string());
    let Some(table) = ThresholdTable::parse(&table_name) else {
        return err(
            &req.id,
            "bad_params",
            "thresholds must be one of: four_tier, three_tier",
            Some(json!({ "thresholds": table_name })),
        );
    };
    let direct_weight = optional_f64(req, "directWeight");
    if let Some(w) = direct_weight {
        if !(0.0..=1.0).contains(&w) {
            return err(
                &req.id,
                "bad_params",
                "directWeight must be within [0,1]",
                Some(json!({ "directWeight": w })),
            );
        }
    }

    match attainment::attainment_report(conn, &offering_id, direct_weight, table) {
        Ok(report) => match serde_json::to_value(&report) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err_calc(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.statistics" => Some(handle_statistics(state, req)),
        "reports.attainment" => Some(handle_attainment(state, req)),
        _ => None,
    }
}
