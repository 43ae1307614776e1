//! `/function/*` (§6): Function CRUD plus the sandboxed `proxy_test` fetch.

use serde::{Deserialize, Serialize};

use crate::db::model::generate_id;
use crate::db::{FunctionStatus, FunctionType, HyacFunction};
use crate::error::{ControllerError, ControllerResult, Envelope};

use axum::extract::State;
use axum::Json;

use super::AppState;

/// Default handler body seeded for a freshly created function absent a
/// template (§8 scenario 1: `GET .../hello` returns `data:[1,2,3]` for the
/// default template).
const DEFAULT_TEMPLATE_CODE: &str = r#"# params: context, request
def handler(context, request):
    return [1, 2, 3]
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFunctionRequest {
    pub app_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub function_type: FunctionTypeWire,
    #[serde(default)]
    pub template_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionTypeWire {
    Endpoint,
    Common,
}

impl From<FunctionTypeWire> for FunctionType {
    fn from(w: FunctionTypeWire) -> Self {
        match w {
            FunctionTypeWire::Endpoint => FunctionType::Endpoint,
            FunctionTypeWire::Common => FunctionType::Common,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFunctionResponse {
    pub function_id: String,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateFunctionRequest>,
) -> ControllerResult<Envelope> {
    let function_type: FunctionType = req.function_type.into();

    // common function names are exposed as namespace members (§4.6) and
    // must be valid identifiers in the handler's language; ASCII-only (§8).
    if function_type == FunctionType::Common && !req.name.is_ascii() {
        return Err(ControllerError::Validation(
            "common function names must be ASCII".into(),
        ));
    }

    state
        .db
        .get_application(&req.app_id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("application {}", req.app_id)))?;

    if state
        .db
        .get_function_by_name(&req.app_id, &req.name)
        .await?
        .is_some()
    {
        return Err(ControllerError::Conflict(format!(
            "function name '{}' already exists in app",
            req.name
        )));
    }

    // FunctionTemplate isn't part of this deployment's data model; a
    // template_id is accepted for API compatibility but always seeds the
    // default handler body.
    let _ = &req.template_id;

    let now = chrono::Utc::now().timestamp();
    let function = HyacFunction {
        function_id: generate_id(),
        function_name: req.name,
        app_id: req.app_id,
        function_type,
        status: FunctionStatus::Published,
        code: DEFAULT_TEMPLATE_CODE.to_string(),
        tags: Vec::new(),
        users: Vec::new(),
        timeout: 30,
        memory_limit: 128,
        created_at: now,
        updated_at: now,
    };

    state.db.insert_function(&function).await?;
    Ok(Envelope::ok(CreateFunctionResponse {
        function_id: function.function_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCodeRequest {
    pub app_id: String,
    pub id: String,
    pub code: String,
}

pub async fn update_code(
    State(state): State<AppState>,
    Json(req): Json<UpdateCodeRequest>,
) -> ControllerResult<Envelope> {
    let existing = state
        .db
        .get_function(&req.id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("function {}", req.id)))?;
    if existing.app_id != req.app_id {
        return Err(ControllerError::NotFound(format!("function {}", req.id)));
    }

    let updated = state
        .db
        .update_function_code(&req.id, &req.code, "management-api")
        .await?;
    Ok(Envelope::ok(serde_json::json!({ "updatedAt": updated.updated_at })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFunctionRequest {
    pub app_id: String,
    pub id: String,
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteFunctionRequest>,
) -> ControllerResult<Envelope> {
    let existing = state
        .db
        .get_function(&req.id)
        .await?
        .ok_or_else(|| ControllerError::NotFound(format!("function {}", req.id)))?;
    if existing.app_id != req.app_id {
        return Err(ControllerError::NotFound(format!("function {}", req.id)));
    }
    state.db.delete_function(&req.id).await?;
    Ok(Envelope::ok_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTestRequest {
    pub target_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub query_params: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Server-side fetch restricted to `*.<base_domain>` hosts (§6). Ownership
/// scoping ("owned by caller") is out of scope without an authentication
/// model; the host allow-list is the enforced boundary.
pub async fn proxy_test(
    State(state): State<AppState>,
    Json(req): Json<ProxyTestRequest>,
) -> ControllerResult<Envelope> {
    let url = url::Url::parse(&req.target_url)
        .map_err(|e| ControllerError::Validation(format!("invalid target_url: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| ControllerError::Validation("target_url has no host".into()))?;
    let suffix = format!(".{}", state.config.api.base_domain);
    if !host.ends_with(&suffix) {
        return Err(ControllerError::Validation(format!(
            "target_url host must be a subdomain of {}",
            state.config.api.base_domain
        )));
    }

    let method = req
        .method
        .parse::<reqwest::Method>()
        .map_err(|_| ControllerError::Validation(format!("invalid method: {}", req.method)))?;

    let mut builder = state.http_client.request(method, url).query(&req.query_params);
    for (k, v) in &req.headers {
        builder = builder.header(k, v);
    }
    if let Some(body) = &req.body {
        builder = builder.json(body);
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| ControllerError::Upstream(e.to_string()))?;
    let status = resp.status().as_u16();
    let text = resp
        .text()
        .await
        .map_err(|e| ControllerError::Upstream(e.to_string()))?;

    Ok(Envelope::ok(serde_json::json!({ "status": status, "body": text })))
}
