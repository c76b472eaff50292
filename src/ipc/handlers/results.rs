use chrono::NaiveDate;
use serde_json::json;
use tracing::info;

use crate::calc::{self, CalcContext, CalcMethod, CalcRequest};
use crate::ipc::error::{err, err_calc, err_transition, ok};
use crate::ipc::handlers::helpers::{db_conn, optional_i64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{
    self, NotificationRequest, PublishConfirmation, ResultAction, ResultStatus, TransitionError,
};

fn handle_calculate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let grade_scale_id = match required_str(req, "gradeScaleId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let method_name = match required_str(req, "method") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(method) = CalcMethod::parse(&method_name) else {
        return err(
            &req.id,
            "bad_params",
            "method must be one of: weighted, simple, best_of_n",
            Some(json!({ "method": method_name })),
        );
    };
    let best_of = optional_i64(req, "bestOf");
    let timeout_ms = req
        .params
        .get("timeoutMs")
        .and_then(|v| v.as_u64());

    // Serialize per offering: a second calculation against the same ledger
    // rows must wait or bounce, never interleave.
    let Some(_guard) = state.calc_locks.acquire(&offering_id) else {
        return err(
            &req.id,
            "recalculation_in_progress",
            "another calculation for this offering is in progress; retry after backoff",
            Some(json!({ "offeringId": offering_id })),
        );
    };

    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let ctx = CalcContext {
        conn,
        course_offering_id: &offering_id,
    };
    let calc_req = CalcRequest {
        grade_scale_id,
        method,
        best_of,
        timeout_ms,
    };

    match calc::calculate_course_result(&ctx, &calc_req) {
        Ok(snapshot) => {
            info!(
                offering = %offering_id,
                students = snapshot.per_student.len(),
                method = method.as_str(),
                "course result calculated"
            );
            match serde_json::to_value(&snapshot) {
                Ok(v) => ok(&req.id, v),
                Err(e) => err(&req.id, "internal", e.to_string(), None),
            }
        }
        Err(e) => err_calc(&req.id, e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match calc::load_snapshot(conn, &offering_id) {
        Ok(Some(snapshot)) => match serde_json::to_value(&snapshot) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Ok(None) => err(
            &req.id,
            "not_found",
            "no course result exists for this offering",
            None,
        ),
        Err(e) => err_calc(&req.id, e),
    }
}

fn handle_revert_to_draft(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let current = match calc::current_status(conn, &offering_id) {
        Ok(v) => v,
        Err(e) => return err_calc(&req.id, e),
    };
    let (result_id, status) = match current {
        Some(v) => v,
        None => {
            return err_transition(
                &req.id,
                TransitionError::InvalidTransition {
                    from: ResultStatus::Draft,
                    action: ResultAction::RevertToDraft,
                },
            )
        }
    };
    let next = match lifecycle::transition(status, ResultAction::RevertToDraft) {
        Ok(v) => v,
        Err(e) => return err_transition(&req.id, e),
    };

    if let Err(e) = conn.execute(
        "UPDATE course_results SET status = ? WHERE id = ?",
        (next.as_str(), &result_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "status": next.as_str() }))
}

fn handle_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let current = match calc::current_status(conn, &offering_id) {
        Ok(v) => v,
        Err(e) => return err_calc(&req.id, e),
    };
    let (result_id, status) = match current {
        Some(v) => v,
        None => {
            // Never calculated: publishing a draft, by definition.
            return err_transition(
                &req.id,
                TransitionError::InvalidTransition {
                    from: ResultStatus::Draft,
                    action: ResultAction::Publish,
                },
            );
        }
    };
    let next = match lifecycle::transition(status, ResultAction::Publish) {
        Ok(v) => v,
        Err(e) => return err_transition(&req.id, e),
    };

    let confirmation: PublishConfirmation = match req.params.get("confirmation") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(c) => c,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("invalid confirmation object: {}", e),
                    None,
                )
            }
        },
        None => PublishConfirmation::default(),
    };
    if let Err(e) = lifecycle::check_publish_confirmation(&confirmation) {
        return err_transition(&req.id, e);
    }

    let Some(publish_date) = req.params.get("publishDate").and_then(|v| v.as_str()) else {
        return err_transition(
            &req.id,
            TransitionError::PublishPreconditionNotMet {
                missing: vec!["publishDate"],
            },
        );
    };
    if NaiveDate::parse_from_str(publish_date, "%Y-%m-%d").is_err() {
        return err(
            &req.id,
            "bad_params",
            "publishDate must be an ISO date (YYYY-MM-DD)",
            Some(json!({ "publishDate": publish_date })),
        );
    }

    let student_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM student_results WHERE course_result_id = ?",
        [&result_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = conn.execute(
        "UPDATE course_results SET status = ?, publish_date = ? WHERE id = ?",
        (next.as_str(), publish_date, &result_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // Delivery belongs to the host's notifier; this is only the decision
    // that one is due, and with what payload.
    let notification = NotificationRequest {
        kind: "results_published".to_string(),
        course_offering_id: offering_id.clone(),
        publish_date: publish_date.to_string(),
        student_count: student_count as usize,
    };
    info!(offering = %offering_id, students = student_count, "course result published");

    match serde_json::to_value(&notification) {
        Ok(notification_json) => ok(
            &req.id,
            json!({
                "status": next.as_str(),
                "publishDate": publish_date,
                "notification": notification_json,
            }),
        ),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_finalize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let offering_id = match required_str(req, "offeringId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let current = match calc::current_status(conn, &offering_id) {
        Ok(v) => v,
        Err(e) => return err_calc(&req.id, e),
    };
    let (result_id, status) = match current {
        Some(v) => v,
        None => {
            return err_transition(
                &req.id,
                TransitionError::InvalidTransition {
                    from: ResultStatus::Draft,
                    action: ResultAction::Finalize,
                },
            )
        }
    };
    let next = match lifecycle::transition(status, ResultAction::Finalize) {
        Ok(v) => v,
        Err(e) => return err_transition(&req.id, e),
    };

    if let Err(e) = conn.execute(
        "UPDATE course_results SET status = ? WHERE id = ?",
        (next.as_str(), &result_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    info!(offering = %offering_id, "course result finalized");
    ok(&req.id, json!({ "status": next.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.calculate" => Some(handle_calculate(state, req)),
        "results.get" => Some(handle_get(state, req)),
        "results.revertToDraft" => Some(handle_revert_to_draft(state, req)),
        "results.publish" => Some(handle_publish(state, req)),
        "results.finalize" => Some(handle_finalize(state, req)),
        _ => None,
    }
}
