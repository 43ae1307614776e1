//! The lazy-start catch-all reverse proxy (§4.3, §6 `ANY /{path:path}`).
//!
//! Intercepts the first request to a subdomain not yet known to the proxy's
//! dynamic routes, blocks until the app is ready, then proxies the original
//! request verbatim. Steady-state traffic never reaches this handler once
//! the dynamic route resolves directly at the proxy layer.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use tracing::{info, warn};

use crate::db::Db;

use super::{ContainerStarter, ProxyError};

pub struct LazyStartProxy {
    db: Arc<Db>,
    starter: Arc<dyn ContainerStarter>,
    client: Client,
    base_domain: String,
}

impl LazyStartProxy {
    pub fn new(
        db: Arc<Db>,
        starter: Arc<dyn ContainerStarter>,
        client: Client,
        base_domain: String,
    ) -> Self {
        Self {
            db,
            starter,
            client,
            base_domain,
        }
    }

    /// `app_id_lc` extracted from `Host: <app_id_lc>.<base_domain>`.
    fn app_id_from_host(&self, host: &str) -> Option<String> {
        let suffix = format!(".{}", self.base_domain);
        host.strip_suffix(&suffix).map(|s| s.to_ascii_lowercase())
    }

    pub async fn handle(
        &self,
        host: &str,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let Some(app_id_lc) = self.app_id_from_host(host) else {
            return (StatusCode::NOT_FOUND, "unknown host").into_response();
        };

        match self.proxy_request(&app_id_lc, method, path_and_query, headers, body).await {
            Ok(resp) => resp,
            Err(ProxyError::AppNotFound(_)) => {
                (StatusCode::NOT_FOUND, "no such application").into_response()
            }
            Err(err) => {
                warn!(app_id_lc, %err, "lazy-start proxy failed");
                (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
            }
        }
    }

    async fn proxy_request(
        &self,
        app_id_lc: &str,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let app = self
            .db
            .get_application_by_lc_id(app_id_lc)
            .await
            .map_err(|e| ProxyError::StartFailed(e.to_string()))?
            .ok_or_else(|| ProxyError::AppNotFound(app_id_lc.to_string()))?;

        info!(app_id = %app.app_id, "cold start: bringing up runtime container for first request");
        let started = self.starter.ensure_started(&app.app_id).await?;

        let upstream_url = format!(
            "http://{}:{}{}",
            started.container_name, started.runtime_port, path_and_query
        );

        let mut req = self.client.request(method, &upstream_url);
        for (name, value) in headers.iter() {
            if name.as_str().eq_ignore_ascii_case("host") {
                continue;
            }
            req = req.header(name, value);
        }
        let upstream = req.body(body).send().await?;

        let status = upstream.status();
        let resp_headers = upstream.headers().clone();
        let bytes = upstream.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in resp_headers.iter() {
            builder = builder.header(name, value);
        }
        Ok(builder.body(axum::body::Body::from(bytes)).unwrap())
    }
}
