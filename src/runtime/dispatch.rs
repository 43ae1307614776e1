//! Request dispatch (§4.6): the runtime process's catch-all HTTP route.
//! Resolves the function by `func_id`, gets or compiles its artifact, binds
//! the declared parameters from query + body, invokes it, and records a
//! fire-and-forget execution metric.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use crate::blob::BlobStore;
use crate::db::{Db, FunctionMetric, LogEntry, LogLevel, LogType, MetricStatus};

use super::cache::CodeCache;
use super::compiler::Compiler;
use super::context::{CommonNamespace, NotificationDispatcher, RuntimeContext};
use super::executor::{FunctionExecutor, InvocationError};

pub struct RuntimeState {
    pub app_id: String,
    pub data_bucket: String,
    pub db: Arc<Db>,
    pub blob: Arc<BlobStore>,
    pub cache: Arc<CodeCache>,
    pub compiler: Arc<dyn Compiler>,
    pub executor: Arc<dyn FunctionExecutor>,
    pub common: Arc<CommonNamespace>,
    pub http_client: reqwest::Client,
    /// Flips true once boot-time preparation (common namespace populated,
    /// dedicated database reachable) has completed; gates
    /// `/__runtime_health__` (§4.2 step 7's health endpoint contract).
    pub ready: AtomicBool,
}

pub fn router(state: Arc<RuntimeState>) -> Router {
    Router::new()
        .route("/__runtime_health__", get(health))
        .route("/", any(dispatch_root))
        .route("/*func_id", any(dispatch))
        .with_state(state)
}

async fn health(State(state): State<Arc<RuntimeState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "not_ready"})))
    }
}

async fn dispatch_root(
    state: State<Arc<RuntimeState>>,
    method: Method,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    dispatch_inner(state, String::new(), method, headers, query, body).await
}

async fn dispatch(
    state: State<Arc<RuntimeState>>,
    Path(func_id): Path<String>,
    method: Method,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if func_id == "favicon.ico" {
        return StatusCode::NO_CONTENT.into_response();
    }
    dispatch_inner(state, func_id, method, headers, query, body).await
}

async fn dispatch_inner(
    State(state): State<Arc<RuntimeState>>,
    func_id: String,
    _method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if func_id.is_empty() {
        return error_envelope(StatusCode::NOT_FOUND, "no function specified");
    }

    let cache_key = format!("{}::{}", state.app_id, func_id);
    let db = state.db.clone();
    let app_id = state.app_id.clone();
    let function_id = func_id.clone();
    let compiler = state.compiler.clone();

    let artifact = state
        .cache
        .get_or_compile(&cache_key, move || {
            let db = db.clone();
            let app_id = app_id.clone();
            let function_id = function_id.clone();
            let compiler = compiler.clone();
            async move {
                let function = db
                    .get_published_endpoint(&app_id, &function_id)
                    .await
                    .map_err(|e| super::compiler::CompileError::Failed(function_id.clone(), e.to_string()))?
                    .ok_or_else(|| {
                        super::compiler::CompileError::Failed(function_id.clone(), "not found".into())
                    })?;
                compiler.compile(&cache_key, &function).await
            }
        })
        .await;

    let artifact = match artifact {
        Ok(a) => a,
        Err(_) => return error_envelope(StatusCode::NOT_FOUND, "function not found or failed to compile"),
    };

    if !artifact.has_handler {
        return error_envelope(StatusCode::INTERNAL_SERVER_ERROR, "function has no handler entry point");
    }

    let body_value = decode_body(&headers, &body);
    let (bound_args, wants_raw_body) = bind_arguments(&artifact.params, &query, &body_value);
    let raw_body = if wants_raw_body { Some(body.clone()) } else { None };

    let notification =
        NotificationDispatcher::new(Default::default(), state.http_client.clone());
    let context = Arc::new(RuntimeContext::new(
        state.app_id.clone(),
        func_id.clone(),
        state.db.clone(),
        state.blob.clone(),
        state.data_bucket.clone(),
        state.common.clone(),
        notification,
    ));

    let start = Instant::now();
    let outcome = state
        .executor
        .invoke(&artifact, context, bound_args, raw_body)
        .await;
    let elapsed = start.elapsed().as_secs_f64();

    record_metric(&state, &func_id, &outcome, elapsed);
    if let Ok(result) = &outcome {
        forward_captured_output(&state, &func_id, result);
    }

    match outcome {
        Ok(result) => (StatusCode::OK, Json(result.body)).into_response(),
        Err(InvocationError::UserException {
            exception_type,
            detail,
            is_client_error,
        }) => {
            let status = if is_client_error {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error_envelope(status, &format!("{exception_type}: {detail}"))
        }
        Err(InvocationError::Timeout(secs)) => {
            error_envelope(StatusCode::GATEWAY_TIMEOUT, &format!("execution timed out after {secs}s"))
        }
    }
}

fn record_metric(
    state: &Arc<RuntimeState>,
    func_id: &str,
    outcome: &Result<super::executor::InvocationOutcome, InvocationError>,
    elapsed_secs: f64,
) {
    let status = if outcome.is_ok() {
        MetricStatus::Success
    } else {
        MetricStatus::Error
    };
    // §7: a user-thrown exception is "recorded as `error` metric with
    // `{type, detail}`".
    let extra = match outcome {
        Err(InvocationError::UserException {
            exception_type,
            detail,
            ..
        }) => json!({ "type": exception_type, "detail": detail }),
        Err(InvocationError::Timeout(secs)) => {
            json!({ "type": "Timeout", "detail": format!("execution timed out after {secs}s") })
        }
        Ok(_) => json!({}),
    };
    let metric = FunctionMetric {
        function_id: func_id.to_string(),
        function_name: func_id.to_string(),
        app_id: state.app_id.clone(),
        status,
        execution_time: elapsed_secs,
        timestamp: chrono::Utc::now().timestamp(),
        extra,
    };
    let db = state.db.clone();
    tokio::spawn(async move {
        if let Err(e) = db.insert_metric(&metric).await {
            warn!(error = %e, "failed to record function metric");
        }
    });
}

/// Forwards captured stdout/stderr to the per-function log sink (§4.6 step
/// 5) as `LogEntry` inserts, which is also what feeds `/logs/websocket_logs`
/// subscribers. Silent on an empty capture — most invocations print nothing.
fn forward_captured_output(
    state: &Arc<RuntimeState>,
    func_id: &str,
    outcome: &super::executor::InvocationOutcome,
) {
    let mut entries = Vec::new();
    if !outcome.stdout.is_empty() {
        entries.push((LogLevel::Info, outcome.stdout.clone()));
    }
    if !outcome.stderr.is_empty() {
        entries.push((LogLevel::Warn, outcome.stderr.clone()));
    }
    if entries.is_empty() {
        return;
    }
    let db = state.db.clone();
    let app_id = state.app_id.clone();
    let func_id = func_id.to_string();
    tokio::spawn(async move {
        for (level, message) in entries {
            let entry = LogEntry {
                level,
                logtype: LogType::Function,
                message,
                app_id: Some(app_id.clone()),
                function_id: Some(func_id.clone()),
                extras: json!({}),
                timestamp: chrono::Utc::now().timestamp(),
            };
            if let Err(e) = db.insert_log(&entry).await {
                warn!(error = %e, "failed to forward captured output to log sink");
            }
        }
    });
}

fn error_envelope(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

enum BodyValue {
    Json(Value),
    Form(HashMap<String, Value>),
    None,
}

fn decode_body(headers: &HeaderMap, body: &Bytes) -> BodyValue {
    if body.is_empty() {
        return BodyValue::None;
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        match serde_json::from_slice(body) {
            Ok(v) => BodyValue::Json(v),
            Err(_) => BodyValue::None,
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let map: HashMap<String, Value> = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        BodyValue::Form(map)
    } else if content_type.starts_with("multipart/form-data") {
        BodyValue::Form(parse_multipart(content_type, body))
    } else {
        BodyValue::None
    }
}

/// Minimal text-field multipart parser: extracts `name="..."` parts as
/// strings. File parts are skipped — binary upload handling is left to the
/// `body` raw-bytes parameter convention instead.
fn parse_multipart(content_type: &str, body: &[u8]) -> HashMap<String, Value> {
    let mut map = HashMap::new();
    let Some(boundary) = content_type
        .split("boundary=")
        .nth(1)
        .map(|b| b.trim_matches('"'))
    else {
        return map;
    };
    if boundary.is_empty() {
        return map;
    }
    let delimiter = format!("--{boundary}");
    let text = String::from_utf8_lossy(body);
    for part in text.split(delimiter.as_str()) {
        let part = part.trim_start_matches("\r\n").trim_end_matches("--").trim_end_matches("\r\n");
        if part.is_empty() {
            continue;
        }
        let Some(header_end) = part.find("\r\n\r\n") else {
            continue;
        };
        let part_headers = &part[..header_end];
        if part_headers.to_ascii_lowercase().contains("filename=") {
            continue;
        }
        let value = part[header_end + 4..].trim_end_matches("\r\n");
        if let Some(name_start) = part_headers.find("name=\"") {
            let rest = &part_headers[name_start + 6..];
            if let Some(name_end) = rest.find('"') {
                map.insert(rest[..name_end].to_string(), Value::String(value.to_string()));
            }
        }
    }
    map
}

/// Binds `query` and the decoded body into the artifact's declared
/// parameter names (§4.6). `context`/`request` are reserved, handled
/// outside this map; `body` requests the raw bytes instead of a named
/// field.
fn bind_arguments(
    params: &[String],
    query: &HashMap<String, String>,
    body: &BodyValue,
) -> (Value, bool) {
    let mut merged = serde_json::Map::new();
    for (k, v) in query {
        merged.insert(k.clone(), Value::String(v.clone()));
    }
    match body {
        BodyValue::Json(Value::Object(map)) => {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
        BodyValue::Form(map) => {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
        _ => {}
    }

    let mut bound = serde_json::Map::new();
    let mut wants_raw_body = false;
    for p in params {
        match p.as_str() {
            "context" | "request" => continue,
            "body" => wants_raw_body = true,
            other => {
                if let Some(v) = merged.remove(other) {
                    bound.insert(other.to_string(), v);
                }
            }
        }
    }
    (Value::Object(bound), wants_raw_body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_declared_params_from_query() {
        let params = vec!["context".to_string(), "name".to_string(), "body".to_string()];
        let mut query = HashMap::new();
        query.insert("name".to_string(), "ferris".to_string());
        let (bound, wants_body) = bind_arguments(&params, &query, &BodyValue::None);
        assert_eq!(bound["name"], Value::String("ferris".to_string()));
        assert!(wants_body);
    }

    #[test]
    fn body_json_fields_fill_declared_params() {
        let params = vec!["a".to_string(), "b".to_string()];
        let query = HashMap::new();
        let body = BodyValue::Json(json!({"a": 1, "b": 2, "c": 3}));
        let (bound, _) = bind_arguments(&params, &query, &body);
        assert_eq!(bound["a"], json!(1));
        assert_eq!(bound["b"], json!(2));
        assert!(bound.get("c").is_none());
    }

    #[test]
    fn multipart_extracts_text_fields() {
        let body = b"--XYZ\r\nContent-Disposition: form-data; name=\"field1\"\r\n\r\nvalue1\r\n--XYZ--\r\n";
        let map = parse_multipart("multipart/form-data; boundary=XYZ", body);
        assert_eq!(map.get("field1"), Some(&Value::String("value1".to_string())));
    }
}
