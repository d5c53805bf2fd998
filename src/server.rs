// src/server.rs
//
// Transport adapters. The HTTP listener and the one-shot CGI program both
// reduce a request to (principal, RawInput) and hand it to `Gateway::handle`.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::{Json, Router};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::config::{GatewayConfig, Panel};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::sys::normalize::ResponseEnvelope;
use crate::sys::ownership::Principal;
use crate::sys::validate::RawInput;

/// Panel forms are tiny; anything larger is not a panel request.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const ENVELOPE_FALLBACK: &str = r#"{"status":"error","message":"response serialization failed"}"#;

// ==============================================================================
// 1. Identity
// ==============================================================================

/// Maps the authenticated account the host panel hands us to a principal.
#[derive(Clone, Debug)]
pub struct IdentityPolicy {
    panel: Panel,
    admin_users: Vec<String>,
}

impl IdentityPolicy {
    pub fn new(panel: Panel, admin_users: Vec<String>) -> Self {
        Self { panel, admin_users }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.panel, config.admin_users.clone())
    }

    pub fn principal(&self, remote_user: Option<&str>) -> Result<Principal, GatewayError> {
        // 🛡️ WHM only runs plugins for authenticated administrators.
        if self.panel == Panel::Whm {
            return Ok(Principal::admin());
        }

        let name = remote_user
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::forbidden("no authenticated account on request"))?;

        if self.admin_users.iter().any(|admin| admin == name) {
            Principal::admin_account(name)
        } else {
            Principal::account(name)
        }
    }
}

// ==============================================================================
// 2. HTTP Listener (axum)
// ==============================================================================

struct AppState {
    gateway: Arc<Gateway>,
    identity: IdentityPolicy,
    user_header: String,
    static_dir: PathBuf,
}

pub fn router(gateway: Arc<Gateway>, config: &GatewayConfig) -> Router {
    let state = Arc::new(AppState {
        gateway,
        identity: IdentityPolicy::from_config(config),
        user_header: config.user_header.clone(),
        static_dir: config.static_dir.clone(),
    });

    // One endpoint: every path and method lands in the same handler.
    Router::new()
        .fallback(handle_http)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve_http(gateway: Arc<Gateway>, config: &GatewayConfig) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, panel = ?config.panel, "Varnish gateway listening");

    axum::serve(listener, router(gateway, config))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Varnish gateway stopped");
    Ok(())
}

async fn handle_http(State(state): State<Arc<AppState>>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let query = parse_query(uri.query());
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let input = RawInput::from_parts(&query, content_type, &body);

    if input.action().is_none() {
        return match load_panel(&state.static_dir).await {
            Ok(html) => Html(html).into_response(),
            Err(envelope) => Json(envelope).into_response(),
        };
    }

    let remote_user = headers.get(state.user_header.as_str()).and_then(|v| v.to_str().ok());
    let principal = state.identity.principal(remote_user);
    let envelope = state.gateway.handle(principal, input).await;

    // Always 200: the panels read `status` and drop the body on non-2xx.
    (StatusCode::OK, Json(envelope)).into_response()
}

/// Resolves on SIGINT or SIGTERM so in-flight requests can drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT; draining"),
        () = terminate => info!("Received SIGTERM; draining"),
    }
}

// ==============================================================================
// 3. CGI/1.1 One-Shot
// ==============================================================================

/// The request variables a CGI host sets for us.
#[derive(Debug, Default)]
pub struct CgiRequest {
    pub method: String,
    pub query_string: String,
    pub content_type: Option<String>,
    pub content_length: usize,
    pub remote_user: Option<String>,
}

impl CgiRequest {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            method: lookup("REQUEST_METHOD").unwrap_or_else(|| "GET".to_string()),
            query_string: lookup("QUERY_STRING").unwrap_or_default(),
            content_type: lookup("CONTENT_TYPE").filter(|v| !v.is_empty()),
            // Unparseable lengths read no body; the request still gets an envelope.
            content_length: lookup("CONTENT_LENGTH")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0)
                .min(MAX_BODY_BYTES),
            remote_user: lookup("REMOTE_USER").filter(|v| !v.is_empty()),
        }
    }
}

/// Handles exactly one request from the CGI environment and stdin.
pub async fn serve_cgi(gateway: &Gateway, config: &GatewayConfig) -> io::Result<()> {
    let request = CgiRequest::from_lookup(|key| std::env::var(key).ok());

    let mut body = Vec::with_capacity(request.content_length);
    if request.method.eq_ignore_ascii_case("POST") && request.content_length > 0 {
        tokio::io::stdin().take(request.content_length as u64).read_to_end(&mut body).await?;
    }

    let identity = IdentityPolicy::from_config(config);
    let response = respond_cgi(gateway, &identity, &config.static_dir, &request, &body).await;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&response).await?;
    stdout.flush().await
}

async fn respond_cgi(
    gateway: &Gateway,
    identity: &IdentityPolicy,
    static_dir: &Path,
    request: &CgiRequest,
    body: &[u8],
) -> Vec<u8> {
    let query = parse_query(Some(&request.query_string));
    let input = RawInput::from_parts(&query, request.content_type.as_deref(), body);

    if input.action().is_none() {
        return match load_panel(static_dir).await {
            Ok(html) => cgi_response("text/html; charset=utf-8", html.as_bytes()),
            Err(envelope) => cgi_envelope(&envelope),
        };
    }

    let principal = identity.principal(request.remote_user.as_deref());
    cgi_envelope(&gateway.handle(principal, input).await)
}

fn cgi_envelope(envelope: &ResponseEnvelope) -> Vec<u8> {
    let json = serde_json::to_vec(envelope).unwrap_or_else(|e| {
        error!(error = %e, "Envelope serialization failed");
        ENVELOPE_FALLBACK.as_bytes().to_vec()
    });
    cgi_response("application/json", &json)
}

fn cgi_response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!("Content-Type: {}\r\nCache-Control: no-store\r\n\r\n", content_type).into_bytes();
    out.extend_from_slice(body);
    out
}

// ==============================================================================
// 4. Shared Helpers
// ==============================================================================

/// Decodes a query string. Repeated keys keep the first value.
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    params
}

/// The client only learns that the page is missing; the path stays in the log.
async fn load_panel(static_dir: &Path) -> Result<String, ResponseEnvelope> {
    let path = static_dir.join("index.html");
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "Panel page unavailable");
        ResponseEnvelope::error("Panel UI not found")
    })
}
