use crate::db::{SqliteStore, STORE_FILE};
use crate::ipc::error::{err, failure, ok};
use crate::ipc::types::{AppState, Request};
use crate::mapping::FileMappingStore;
use crate::migrate::{Migrator, Step};
use crate::snapshot;
use serde_json::json;
use std::path::PathBuf;

fn param_path(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

fn handle_steps(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(store), Some(cfg)) = (state.store.as_ref(), state.config.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let migrator = Migrator::new(store, &mappings, cfg);
    let completed = match migrator.completed_mappings() {
        Ok(v) => v,
        Err(e) => return failure(&req.id, "mapping_read_failed", &e),
    };

    let steps: Vec<serde_json::Value> = Step::ORDER
        .iter()
        .map(|step| {
            let prereqs = step.prerequisites();
            let ready = prereqs.iter().all(|k| completed.contains(k));
            json!({
                "name": step.name(),
                "tables": step.tables(),
                "prerequisites": prereqs.iter().map(|k| k.name()).collect::<Vec<_>>(),
                "produces": step.produces().map(|k| k.name()),
                "completed": step.produces().map(|k| completed.contains(&k)),
                "ready": ready,
            })
        })
        .collect();
    ok(&req.id, json!({ "steps": steps }))
}

fn handle_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(store), Some(cfg)) = (state.store.as_ref(), state.config.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(raw) = req.params.get("step").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.step", None);
    };
    let step: Step = match raw.parse() {
        Ok(s) => s,
        Err(e) => return failure(&req.id, "bad_params", &e),
    };

    let mut snapshot_info = serde_json::Value::Null;
    if step == Step::Reset {
        if let Some(out) = param_path(req, "snapshotPath") {
            let Some(store_path) = store.path() else {
                return err(&req.id, "snapshot_failed", "store is not file-backed", None);
            };
            match snapshot::export_snapshot(store_path, &cfg.mapping_dir, &out) {
                Ok(s) => {
                    snapshot_info = json!({
                        "path": out.to_string_lossy(),
                        "format": s.format,
                        "entryCount": s.entry_count,
                    })
                }
                Err(e) => {
                    return err(
                        &req.id,
                        "snapshot_failed",
                        format!("{e:#}"),
                        Some(json!({ "step": step.name() })),
                    )
                }
            }
        }
    }

    let mappings = FileMappingStore::new(cfg.mapping_dir.clone());
    let report = Migrator::new(store, &mappings, cfg).run_step(step);
    ok(
        &req.id,
        json!({
            "step": step.name(),
            "success": report.success,
            "count": report.count,
            "logs": report.logs,
            "snapshot": snapshot_info,
        }),
    )
}

fn handle_snapshot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(store), Some(cfg)) = (state.store.as_ref(), state.config.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out) = param_path(req, "outPath") else {
        return err(&req.id, "bad_params", "missing params.outPath", None);
    };
    let Some(store_path) = store.path() else {
        return err(&req.id, "snapshot_failed", "store is not file-backed", None);
    };
    match snapshot::export_snapshot(store_path, &cfg.mapping_dir, &out) {
        Ok(s) => ok(
            &req.id,
            json!({
                "path": out.to_string_lossy(),
                "format": s.format,
                "entryCount": s.entry_count,
                "mappingFiles": s.mapping_files,
            }),
        ),
        Err(e) => failure(&req.id, "snapshot_failed", &e),
    }
}

fn handle_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(workspace), Some(cfg)) = (state.workspace.clone(), state.config.clone()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(input) = param_path(req, "inPath") else {
        return err(&req.id, "bad_params", "missing params.inPath", None);
    };

    // The connection must be closed while the file is swapped.
    state.store = None;
    let store_path = workspace.join(STORE_FILE);
    let restored = snapshot::restore_snapshot(&input, &store_path, &cfg.mapping_dir);
    let reopened = SqliteStore::open(&workspace);
    match (restored, reopened) {
        (Ok(s), Ok(store)) => {
            state.store = Some(store);
            ok(
                &req.id,
                json!({
                    "format": s.format,
                    "mappingFiles": s.mapping_files,
                }),
            )
        }
        (Err(e), Ok(store)) => {
            state.store = Some(store);
            failure(&req.id, "restore_failed", &e)
        }
        (_, Err(e)) => failure(&req.id, "db_open_failed", &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "migration.steps" => Some(handle_steps(state, req)),
        "migration.run" => Some(handle_run(state, req)),
        "migration.snapshot" => Some(handle_snapshot(state, req)),
        "migration.restore" => Some(handle_restore(state, req)),
        _ => None,
    }
}
