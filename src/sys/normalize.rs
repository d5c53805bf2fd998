// src/sys/normalize.rs

use serde::Serialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::sys::registry::{Action, OutputParser};
use crate::sys::settings::SettingsDocument;
use crate::sys::traits::{CommandResult, DomainListing};

/// The backend's own failure marker. Matching is a plain, case-sensitive
/// substring test; a URL with "error" in its path trips it too.
const FAILURE_MARKER: &str = "error";

// ==============================================================================
// 1. Wire Envelope
// ==============================================================================

/// The only shape that crosses the boundary:
/// `{"status":"ok", ...payload}` or `{"status":"error","message":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResponseEnvelope {
    Ok(Payload),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Status { data: Value },
    Log { message: String, log: String },
    Domains { domains: DomainListing },
    Settings { settings: SettingsDocument },
}

impl ResponseEnvelope {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    #[cfg(test)]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl From<Result<Payload, GatewayError>> for ResponseEnvelope {
    fn from(result: Result<Payload, GatewayError>) -> Self {
        match result {
            Ok(payload) => Self::Ok(payload),
            Err(err) => Self::error(err.client_message()),
        }
    }
}

// ==============================================================================
// 2. Output Parsers
// ==============================================================================

/// Turns one backend run into a payload or a failure, per the template's parser.
pub fn parse_output(
    action: Action,
    parser: OutputParser,
    result: &CommandResult,
) -> Result<Payload, GatewayError> {
    match parser {
        OutputParser::Json => parse_json(result),
        OutputParser::PassthroughLog => parse_log(action, result),
        OutputParser::DomainList => parse_domain_list(result).map(|domains| Payload::Domains { domains }),
    }
}

fn parse_json(result: &CommandResult) -> Result<Payload, GatewayError> {
    match serde_json::from_slice::<Value>(&result.stdout) {
        Ok(data @ Value::Object(_)) => Ok(Payload::Status { data }),
        _ if !result.success => Err(failure_from(result)),
        _ => Err(GatewayError::backend(format!(
            "Failed to parse status output: {}",
            result.combined_log().trim()
        ))),
    }
}

fn parse_log(action: Action, result: &CommandResult) -> Result<Payload, GatewayError> {
    let log = result.combined_log();
    let marked = log.contains(FAILURE_MARKER);

    if result.success && !marked {
        return Ok(Payload::Log { message: success_message(action).to_string(), log });
    }
    if marked {
        return Err(GatewayError::backend(log.trim().to_string()));
    }
    Err(failure_from(result))
}

fn failure_from(result: &CommandResult) -> GatewayError {
    let stderr = result.stderr_text();
    let stdout = result.stdout_text();
    let message = if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else if !stdout.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        match result.exit_code {
            Some(code) => format!("Backend exited with code {}", code),
            None => "Backend was terminated by a signal".to_string(),
        }
    };
    GatewayError::backend(message)
}

pub fn success_message(action: Action) -> &'static str {
    match action {
        Action::Purge => "URL purge requested",
        Action::Flush => "Full cache flush requested",
        Action::Install => "Provisioning completed",
        Action::Service => "Service operation completed",
        Action::UpdateCerts => "Certificate sync completed",
        Action::SettingsUpdate => "Security headers updated and cache reloaded",
        Action::Status | Action::Domains | Action::SettingsGet => "OK",
    }
}

/// Reads `uapi --output json Domains list_domains`. Both the UAPI envelope
/// (`{"result":{"status":1,"data":{..}}}`) and the flattened form
/// (`{"status":1,"data":{..}}`) are accepted.
pub fn parse_domain_list(result: &CommandResult) -> Result<DomainListing, GatewayError> {
    let parsed: Value = serde_json::from_slice(&result.stdout).map_err(|_| {
        GatewayError::backend(format!("Domain lookup failed: {}", failure_from(result).client_message()))
    })?;

    let body = parsed.get("result").filter(|r| r.is_object()).unwrap_or(&parsed);
    if !status_is_success(body.get("status")) {
        let errors = body
            .get("errors")
            .and_then(Value::as_array)
            .map(|errs| errs.iter().filter_map(Value::as_str).collect::<Vec<_>>().join("; "))
            .unwrap_or_default();
        return Err(GatewayError::backend(format!("Domain lookup failed: {}", errors)));
    }

    let data = body
        .get("data")
        .filter(|d| d.is_object())
        .ok_or_else(|| GatewayError::backend("Domain lookup failed: response has no data"))?;

    Ok(DomainListing {
        main_domain: data.get("main_domain").and_then(Value::as_str).unwrap_or_default().to_string(),
        addon_domains: string_list(data.get("addon_domains")),
        parked_domains: string_list(data.get("parked_domains")),
        sub_domains: string_list(data.get("sub_domains")),
    }
    .merged())
}

fn status_is_success(status: Option<&Value>) -> bool {
    match status {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}
