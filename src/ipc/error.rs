use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error response carrying the full context chain; causes go into `details`.
pub fn failure(id: &str, code: &str, e: &anyhow::Error) -> serde_json::Value {
    let causes: Vec<String> = e.chain().skip(1).map(|c| c.to_string()).collect();
    let details = (!causes.is_empty()).then(|| json!({ "causes": causes }));
    err(id, code, format!("{e:#}"), details)
}
