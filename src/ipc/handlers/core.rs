use crate::config::MigrationConfig;
use crate::db::SqliteStore;
use crate::ipc::error::{err, failure, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    // Close any previous store before opening the next one.
    state.store = None;
    match SqliteStore::open(&path) {
        Ok(store) => {
            let cfg = MigrationConfig::from_env(&path);
            info!(
                workspace = %path.to_string_lossy(),
                dumps = %cfg.dump_dir.to_string_lossy(),
                mappings = %cfg.mapping_dir.to_string_lossy(),
                "workspace selected"
            );
            let result = json!({
                "workspacePath": path.to_string_lossy(),
                "dumpDir": cfg.dump_dir.to_string_lossy(),
                "mappingDir": cfg.mapping_dir.to_string_lossy(),
            });
            state.workspace = Some(path);
            state.store = Some(store);
            state.config = Some(cfg);
            ok(&req.id, result)
        }
        Err(e) => {
            state.workspace = None;
            state.config = None;
            failure(&req.id, "db_open_failed", &e)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
