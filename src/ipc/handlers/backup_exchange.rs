use serde_json::json;
use std::path::PathBuf;
use tracing::info;

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::helpers::required_str;
use crate::ipc::types::{AppState, Request};

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => {
            info!(path = %out_path.to_string_lossy(), "workspace bundle exported");
            ok(
                &req.id,
                json!({
                    "bundleFormat": summary.bundle_format,
                    "entryCount": summary.entry_count,
                    "dbSha256": summary.db_sha256,
                    "outPath": out_path.to_string_lossy(),
                }),
            )
        }
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:#}"), None),
    }
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let in_path = match required_str(req, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    // The live handle must be closed before the database file is swapped.
    state.db = None;

    let import_result = backup::import_workspace_bundle(&in_path, &workspace);
    let reopen = db::open_db(&workspace);
    match (import_result, reopen) {
        (Ok(summary), Ok(conn)) => {
            state.db = Some(conn);
            info!(path = %in_path.to_string_lossy(), "workspace bundle imported");
            ok(
                &req.id,
                json!({ "bundleFormatDetected": summary.bundle_format_detected }),
            )
        }
        (Err(e), Ok(conn)) => {
            // Import failed but the original database is intact; keep serving.
            state.db = Some(conn);
            err(&req.id, "backup_import_failed", format!("{e:#}"), None)
        }
        (_, Err(e)) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_export(state, req)),
        "backup.import" => Some(handle_import(state, req)),
        _ => None,
    }
}
