//! The loopback access server: bearer-authenticated JSON-over-HTTP action
//! dispatcher (§4.6, §6).
//!
//! One `POST /` route dispatches by an `action` field, authenticated with a
//! random per-session bearer token, with request-size limiting and
//! per-action approval gating in front of every secret-touching action.

use crate::approval::{Action, ApprovalBroker};
use crate::crypto;
use crate::logger::{Logger, LogCategory};
use crate::models::SecretView;
use crate::vault::{VaultError, VaultStore};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tiny_http::{Header, ListenAddr, Method, Request, Response, StatusCode};

/// Request bodies larger than this are rejected with 413 before parsing.
const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("request body too large")]
    TooLarge,
    #[error("malformed json: {0}")]
    MalformedJson(String),
    #[error("internal error")]
    Internal,
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionResponse {
    fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    fn err(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()) }
    }
}

struct Inner {
    vault: VaultStore,
    logger: Logger,
    broker: Arc<dyn ApprovalBroker>,
    auth_token: String,
}

/// The running loopback server. Dropping this does not stop the listener
/// thread; call [`AccessServer::shutdown`] explicitly (the kernel does this
/// as part of its shutdown sequence, §4.7).
pub struct AccessServer {
    inner: Arc<Inner>,
    server: Arc<tiny_http::Server>,
    port: u16,
}

impl AccessServer {
    /// Binds an OS-chosen loopback port and starts serving in a background
    /// thread. Returns the bound port and the freshly generated auth token
    /// for the caller to write into the handshake file.
    pub fn start(
        vault: VaultStore,
        logger: Logger,
        broker: Arc<dyn ApprovalBroker>,
    ) -> std::io::Result<Self> {
        let server = tiny_http::Server::http("127.0.0.1:0")
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let port = match server.server_addr() {
            ListenAddr::IP(addr) => addr.port(),
            #[allow(unreachable_patterns)]
            _ => 0,
        };

        let mut token_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut token_bytes);
        let auth_token = hex::encode(token_bytes);

        let inner = Arc::new(Inner { vault, logger, broker, auth_token: auth_token.clone() });
        let server = Arc::new(server);

        let worker_inner = inner.clone();
        let worker_server = server.clone();
        thread::spawn(move || {
            for request in worker_server.incoming_requests() {
                handle_request(&worker_inner, request);
            }
        });

        Ok(Self { inner, server, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn auth_token(&self) -> &str {
        &self.inner.auth_token
    }

    /// Unblocks the listener's `incoming_requests` loop so its thread exits.
    pub fn shutdown(&self) {
        self.server.unblock();
    }
}

fn handle_request(inner: &Inner, mut request: Request) {
    if *request.method() != Method::Post {
        respond(request, StatusCode(405), ActionResponse::err("method not allowed"));
        return;
    }

    if let Err(e) = check_authorized(inner, &request) {
        respond(request, StatusCode(401), ActionResponse::err(e.to_string()));
        return;
    }

    let body = match read_limited_body(&mut request) {
        Ok(body) => body,
        Err(TransportError::TooLarge) => {
            respond(request, StatusCode(413), ActionResponse::err("request body too large"));
            return;
        }
        Err(e) => {
            respond(request, StatusCode(500), ActionResponse::err(e.to_string()));
            return;
        }
    };

    let parsed: ActionRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            respond(request, StatusCode(500), ActionResponse::err(format!("malformed json: {e}")));
            return;
        }
    };

    let response = dispatch(inner, &parsed.action, &parsed.data);
    respond(request, StatusCode(200), response);
}

fn check_authorized(inner: &Inner, request: &Request) -> Result<(), TransportError> {
    let header_value = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .map(|h| h.value.as_str());

    let token = header_value
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(TransportError::Unauthorized)?;

    if crypto::constant_time_eq(token.as_bytes(), inner.auth_token.as_bytes()) {
        Ok(())
    } else {
        Err(TransportError::Unauthorized)
    }
}

fn read_limited_body(request: &mut Request) -> Result<Vec<u8>, TransportError> {
    let mut limited = request.as_reader().take(MAX_BODY_BYTES + 1);
    let mut buf = Vec::new();
    limited.read_to_end(&mut buf).map_err(|_| TransportError::Internal)?;
    if buf.len() as u64 > MAX_BODY_BYTES {
        return Err(TransportError::TooLarge);
    }
    Ok(buf)
}

fn dispatch(inner: &Inner, action: &str, data: &Value) -> ActionResponse {
    let result = match action {
        "status" => Ok(json!({ "isUnlocked": inner.vault.is_unlocked(), "version": env!("CARGO_PKG_VERSION") })),
        "listProjects" => locked_guard(inner).and_then(|()| list_projects(inner)),
        "listSecretKeys" => locked_guard(inner).and_then(|()| list_secret_keys(inner, data)),
        "getAllSecrets" => locked_guard(inner).and_then(|()| get_all_secrets(inner, data)),
        "getBatchSecrets" => locked_guard(inner).and_then(|()| get_batch_secrets(inner, data)),
        "getSecret" => locked_guard(inner).and_then(|()| get_secret(inner, data)),
        "setSecret" => locked_guard(inner).and_then(|()| set_secret(inner, data)),
        other => Err(format!("unknown action: {other}")),
    };
    match result {
        Ok(value) => ActionResponse::ok(value),
        Err(e) => ActionResponse::err(e),
    }
}

fn locked_guard(inner: &Inner) -> Result<(), String> {
    if inner.vault.is_unlocked() {
        Ok(())
    } else {
        Err("Vault is locked".to_string())
    }
}

fn project_name(data: &Value) -> Result<String, String> {
    data.get("projectName")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "projectName is required".to_string())
}

fn require_approval(inner: &Inner, project: &str, keys: &[String], action: Action) -> Result<(), String> {
    if keys.is_empty() {
        return Ok(());
    }
    let decision = inner.broker.request_approval(project, keys, action);
    if decision.approved {
        Ok(())
    } else {
        Err(format!("Access denied: {}", decision.reason.unwrap_or_default()))
    }
}

fn secrets_to_json(secrets: BTreeMap<String, SecretView>) -> Value {
    serde_json::to_value(secrets).unwrap_or(Value::Null)
}

fn list_projects(inner: &Inner) -> Result<Value, String> {
    let projects = inner.vault.get_projects().map_err(vault_error_message)?;
    serde_json::to_value(projects).map_err(|e| e.to_string())
}

fn list_secret_keys(inner: &Inner, data: &Value) -> Result<Value, String> {
    let project = project_name(data)?;
    let keys = inner.vault.list_secret_keys(&project).map_err(vault_error_message)?;
    require_approval(inner, &project, &keys, Action::Read)?;
    Ok(json!(keys))
}

fn get_all_secrets(inner: &Inner, data: &Value) -> Result<Value, String> {
    let project = project_name(data)?;
    let keys = inner.vault.list_secret_keys(&project).map_err(vault_error_message)?;
    require_approval(inner, &project, &keys, Action::Read)?;
    let secrets = inner.vault.get_secrets(&project).map_err(vault_error_message)?;
    Ok(secrets_to_json(secrets))
}

fn get_batch_secrets(inner: &Inner, data: &Value) -> Result<Value, String> {
    let project = project_name(data)?;
    let requested_keys: Vec<String> = data
        .get("keys")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let existing_keys = inner.vault.list_secret_keys(&project).map_err(vault_error_message)?;
    let present_keys: Vec<String> = requested_keys.iter().filter(|k| existing_keys.contains(*k)).cloned().collect();
    require_approval(inner, &project, &present_keys, Action::Read)?;

    let all_secrets = inner.vault.get_secrets(&project).map_err(vault_error_message)?;
    let result: BTreeMap<String, SecretView> = all_secrets
        .into_iter()
        .filter(|(k, _)| requested_keys.contains(k))
        .collect();
    Ok(secrets_to_json(result))
}

fn get_secret(inner: &Inner, data: &Value) -> Result<Value, String> {
    let project = project_name(data)?;
    let key = data.get("key").and_then(Value::as_str).ok_or("key is required")?.to_string();
    require_approval(inner, &project, &[key.clone()], Action::Read)?;
    let secret = inner.vault.get_secret(&project, &key).map_err(vault_error_message)?;
    serde_json::to_value(secret).map_err(|e| e.to_string())
}

fn set_secret(inner: &Inner, data: &Value) -> Result<Value, String> {
    let project = project_name(data)?;
    let key = data.get("key").and_then(Value::as_str).ok_or("key is required")?.to_string();
    let value = data.get("value").and_then(Value::as_str).ok_or("value is required")?.to_string();
    require_approval(inner, &project, &[key.clone()], Action::Write)?;
    inner.vault.set_secret(&project, &key, &value, None).map_err(vault_error_message)?;
    inner.logger.log(&format!("setSecret {project}:{key}"), LogCategory::Access);
    Ok(json!({}))
}

fn vault_error_message(e: VaultError) -> String {
    e.to_string()
}

fn respond(request: Request, status: StatusCode, body: ActionResponse) {
    let payload = serde_json::to_string(&body).unwrap_or_else(|_| "{\"success\":false}".to_string());
    let response = Response::from_string(payload)
        .with_status_code(status)
        .with_header(content_type_header())
        .with_header(cors_header());
    let _ = request.respond(response);
}

fn content_type_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap()
}

fn cors_header() -> Header {
    Header::from_bytes(&b"Access-Control-Allow-Origin"[..], &b"http://127.0.0.1"[..]).unwrap()
}
