//! Subdomain reverse proxy
//!
//! Requests whose Host header falls under the configured parent domain are
//! dispatched by subdomain to an upstream `http://<container-ip>:<port>`.

use std::collections::HashMap;
use std::sync::RwLock;

use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use reqwest::Url;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Host-header-dispatched reverse proxy keyed by subdomain
pub struct HttpProxy {
    host_name: String,
    client: reqwest::Client,
    entries: RwLock<HashMap<String, Url>>,
}

impl HttpProxy {
    pub fn new(host_name: String, client: reqwest::Client) -> Self {
        Self {
            host_name: host_name.to_ascii_lowercase(),
            client,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a request with this Host header belongs to the proxy
    pub fn should_handle(&self, host: &str) -> bool {
        self.subdomain_label(host).is_some()
    }

    /// Left-most label of the host once `.{host_name}` is stripped.
    /// `None` when the host is not under the configured parent domain.
    fn subdomain_label(&self, host: &str) -> Option<String> {
        let host = host.split(':').next()?.to_ascii_lowercase();
        let suffix = format!(".{}", self.host_name);
        let prefix = host.strip_suffix(&suffix)?;
        let label = prefix.split('.').next()?;
        if label.is_empty() {
            return None;
        }
        Some(label.to_string())
    }

    /// Register an upstream for a subdomain; duplicate subdomains conflict
    pub fn add_entry(&self, subdomain: &str, url: Url) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(subdomain) {
            return Err(Error::PortMappingConflict(subdomain.to_string()));
        }

        info!("Routing {}.{} -> {}", subdomain, self.host_name, url);
        entries.insert(subdomain.to_string(), url);
        Ok(())
    }

    /// Drop the upstream for a subdomain, if registered
    pub fn remove_entry(&self, subdomain: &str) {
        if self.entries.write().unwrap().remove(subdomain).is_some() {
            info!("Unrouted {}.{}", subdomain, self.host_name);
        }
    }

    fn upstream_for(&self, subdomain: &str) -> Option<Url> {
        self.entries.read().unwrap().get(subdomain).cloned()
    }

    /// Forward a request to the upstream selected by its Host header
    pub async fn handle(&self, req: Request) -> Response {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();

        let Some(subdomain) = self.subdomain_label(host) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let Some(upstream) = self.upstream_for(&subdomain) else {
            return StatusCode::NOT_FOUND.into_response();
        };

        self.forward(req, upstream).await
    }

    async fn forward(&self, req: Request, upstream: Url) -> Response {
        let (parts, body) = req.into_parts();

        let mut url = upstream;
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
            Ok(method) => method,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let response = builder
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        match response {
            Ok(upstream_response) => {
                let status = StatusCode::from_u16(upstream_response.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);

                let mut builder = Response::builder().status(status);
                for (name, value) in upstream_response.headers().iter() {
                    builder = builder.header(name.as_str(), value.as_bytes());
                }

                builder
                    .body(Body::from_stream(upstream_response.bytes_stream()))
                    .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
            }
            Err(e) => {
                error!("Upstream request failed: {}", e);
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}
