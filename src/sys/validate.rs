// src/sys/validate.rs
//
// 🛡️ Zero-Trust: Everything that reaches a command template passes through here
// first. Validation is all-or-nothing; a request is never partially repaired.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;
use url::Url;

use crate::error::GatewayError;
use crate::sys::registry::Action;
use crate::sys::settings::{SecurityHeaderPolicy, DEFAULT_MAX_AGE};

pub const MAX_URL_BYTES: usize = 2048;
pub const MAX_DOMAIN_BYTES: usize = 253;
pub const MAX_HEADER_VALUE_BYTES: usize = 512;

/// Rejected outright in targets, even where RFC 3986 would allow them.
const SHELL_METACHARACTERS: [&str; 5] = [";", "`", "$(", "|", "&"];

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$")
        .expect("domain regex must compile")
});

static ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_][a-z0-9_-]{0,31}$").expect("account regex must compile")
});

// ==============================================================================
// 1. Raw Request
// ==============================================================================

/// Untrusted input as it arrived: query parameters merged with a JSON (or
/// form-encoded) body.
#[derive(Debug, Clone, Default)]
pub struct RawInput {
    action: Option<String>,
    fields: Map<String, Value>,
    malformed_body: bool,
}

impl RawInput {
    /// `action` prefers the query string; every other field prefers the body
    /// and falls back to the query string.
    pub fn from_parts(query: &HashMap<String, String>, content_type: Option<&str>, body: &[u8]) -> Self {
        let mut fields = Map::new();
        let mut malformed_body = false;

        let is_form = content_type
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        if is_form {
            for (key, value) in url::form_urlencoded::parse(body) {
                fields.insert(key.into_owned(), Value::String(value.into_owned()));
            }
        } else if !body.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(map)) => fields = map,
                _ => malformed_body = true,
            }
        }

        for (key, value) in query {
            fields.entry(key.clone()).or_insert_with(|| Value::String(value.clone()));
        }

        let action = query
            .get("action")
            .cloned()
            .or_else(|| fields.get("action").and_then(Value::as_str).map(str::to_string))
            .filter(|a| !a.is_empty());

        Self { action, fields, malformed_body }
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    /// A non-empty string field; other JSON types are a validation error.
    fn text(&self, name: &'static str) -> Result<Option<&str>, GatewayError> {
        match self.field(name) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim())),
            Some(_) => Err(GatewayError::validation(name, "must be a string")),
        }
    }
}

// ==============================================================================
// 2. Validated Arguments
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    /// `url` is passed on exactly as received (trimmed); `host` is lowercased.
    Url { url: String, host: String },
    /// Legacy per-domain purge.
    Domain(String),
}

impl PurgeTarget {
    pub fn host(&self) -> &str {
        match self {
            PurgeTarget::Url { host, .. } => host,
            PurgeTarget::Domain(domain) => domain,
        }
    }

    pub fn as_arg(&self) -> &str {
        match self {
            PurgeTarget::Url { url, .. } => url,
            PurgeTarget::Domain(domain) => domain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOperation {
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceOperation::Start => "start",
            ServiceOperation::Stop => "stop",
            ServiceOperation::Restart => "restart",
            ServiceOperation::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedArgs {
    None,
    Purge(PurgeTarget),
    Service(ServiceOperation),
    Domains { account: Option<String> },
    Settings(SecurityHeaderPolicy),
}

impl ValidatedArgs {
    /// The value for the template's argument slot, if any.
    pub fn slot_value(&self) -> Option<&str> {
        match self {
            ValidatedArgs::Purge(target) => Some(target.as_arg()),
            ValidatedArgs::Service(op) => Some(op.as_str()),
            ValidatedArgs::Domains { account } => account.as_deref(),
            ValidatedArgs::None | ValidatedArgs::Settings(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// May differ from the requested action (`purge` with `scope=all` is a flush).
    pub action: Action,
    pub args: ValidatedArgs,
}

pub fn validate(action: Action, input: &RawInput) -> Result<ValidatedRequest, GatewayError> {
    if input.malformed_body {
        return Err(GatewayError::validation("body", "request body must be a JSON object"));
    }

    let args = match action {
        Action::Purge => {
            if input.text("scope")? == Some("all") {
                return Ok(ValidatedRequest { action: Action::Flush, args: ValidatedArgs::None });
            }
            let target = match (input.text("url")?, input.text("domain")?) {
                (Some(url), _) => validate_url(url)?,
                (None, Some(domain)) => PurgeTarget::Domain(validate_domain(domain)?),
                (None, None) => return Err(GatewayError::validation("url", "missing URL parameter")),
            };
            ValidatedArgs::Purge(target)
        }
        Action::Service => {
            let op = input
                .text("operation")?
                .ok_or_else(|| GatewayError::validation("operation", "missing service operation"))?;
            ValidatedArgs::Service(validate_operation(op)?)
        }
        Action::Domains => ValidatedArgs::Domains {
            account: input.text("user")?.map(validate_account).transpose()?,
        },
        Action::SettingsUpdate => ValidatedArgs::Settings(validate_policy(input.field("security_headers"))?),
        Action::Status | Action::Flush | Action::Install | Action::UpdateCerts | Action::SettingsGet => {
            ValidatedArgs::None
        }
    };

    Ok(ValidatedRequest { action, args })
}

// ==============================================================================
// 3. Field Validators
// ==============================================================================

pub fn validate_url(raw: &str) -> Result<PurgeTarget, GatewayError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_BYTES {
        return Err(GatewayError::validation("url", format!("exceeds {} bytes", MAX_URL_BYTES)));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(GatewayError::validation("url", "contains control characters"));
    }
    if let Some(meta) = SHELL_METACHARACTERS.iter().find(|m| raw.contains(**m)) {
        return Err(GatewayError::validation("url", format!("contains forbidden sequence '{}'", meta)));
    }
    if !raw.chars().all(is_uri_char) {
        return Err(GatewayError::validation("url", "contains characters outside the URL grammar"));
    }

    let parsed = Url::parse(raw).map_err(|e| GatewayError::validation("url", format!("not a valid absolute URL ({})", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::validation("url", "must use http or https"));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(GatewayError::validation("url", "must not carry credentials"));
    }
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::validation("url", "has no host"))?
        .to_ascii_lowercase();

    Ok(PurgeTarget::Url { url: raw.to_string(), host })
}

/// RFC 3986 unreserved, reserved and `%`.
fn is_uri_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~:/?#[]@!$&'()*+,;=%".contains(c)
}

pub fn validate_domain(raw: &str) -> Result<String, GatewayError> {
    let raw = raw.trim();
    if raw.len() > MAX_DOMAIN_BYTES {
        return Err(GatewayError::validation("domain", format!("exceeds {} bytes", MAX_DOMAIN_BYTES)));
    }
    if !DOMAIN_RE.is_match(raw) {
        return Err(GatewayError::validation("domain", "not a valid hostname"));
    }
    Ok(raw.to_ascii_lowercase())
}

/// Hosting account names double as directory names, so no dots or slashes.
pub fn validate_account(raw: &str) -> Result<String, GatewayError> {
    if !ACCOUNT_RE.is_match(raw) {
        return Err(GatewayError::validation("user", "not a valid account name"));
    }
    Ok(raw.to_string())
}

pub fn validate_operation(raw: &str) -> Result<ServiceOperation, GatewayError> {
    match raw.to_ascii_lowercase().as_str() {
        "start" => Ok(ServiceOperation::Start),
        "stop" => Ok(ServiceOperation::Stop),
        "restart" => Ok(ServiceOperation::Restart),
        "reload" => Ok(ServiceOperation::Reload),
        _ => Err(GatewayError::validation("operation", "must be one of start, stop, restart, reload")),
    }
}

/// Full replacement: absent fields take their defaults, never the stored values.
pub fn validate_policy(value: Option<&Value>) -> Result<SecurityHeaderPolicy, GatewayError> {
    let fields = match value {
        Some(Value::Object(map)) => map,
        None => return Err(GatewayError::validation("security_headers", "missing settings object")),
        Some(_) => return Err(GatewayError::validation("security_headers", "must be an object")),
    };
    let defaults = SecurityHeaderPolicy::default();

    Ok(SecurityHeaderPolicy {
        enabled: coerce_bool("enabled", fields.get("enabled"))?,
        include_subdomains: coerce_bool("include_subdomains", fields.get("include_subdomains"))?,
        preload: coerce_bool("preload", fields.get("preload"))?,
        max_age: normalize_max_age(fields.get("max_age")),
        frame_options: header_value("frame_options", fields.get("frame_options"), defaults.frame_options)?,
        referrer_policy: header_value("referrer_policy", fields.get("referrer_policy"), defaults.referrer_policy)?,
        permissions_policy: header_value(
            "permissions_policy",
            fields.get("permissions_policy"),
            defaults.permissions_policy,
        )?,
    })
}

/// Any truthy/falsy representation becomes a strict bool. Containers are rejected.
pub fn coerce_bool(field: &'static str, value: Option<&Value>) -> Result<bool, GatewayError> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(true)),
        Some(Value::String(s)) => {
            let lowered = s.trim().to_ascii_lowercase();
            Ok(!matches!(lowered.as_str(), "" | "0" | "false" | "no" | "off"))
        }
        Some(_) => Err(GatewayError::validation(field, "must be a boolean")),
    }
}

/// Negative or non-numeric values fall back to the default instead of failing;
/// the WHM form has always behaved this way.
pub fn normalize_max_age(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f.trunc() as u64))
            .unwrap_or(DEFAULT_MAX_AGE),
        Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(DEFAULT_MAX_AGE),
        _ => DEFAULT_MAX_AGE,
    }
}

/// Trimmed and capped; otherwise opaque. CR/LF would let a value spill into
/// the next header line, so control characters are refused.
fn header_value(field: &'static str, value: Option<&Value>, default: String) -> Result<String, GatewayError> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(default),
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(GatewayError::validation(field, "must be a string")),
    };
    if raw.len() > MAX_HEADER_VALUE_BYTES {
        return Err(GatewayError::validation(field, format!("exceeds {} bytes", MAX_HEADER_VALUE_BYTES)));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(GatewayError::validation(field, "contains control characters"));
    }
    Ok(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(body: Value) -> RawInput {
        RawInput::from_parts(&HashMap::new(), Some("application/json"), body.to_string().as_bytes())
    }

    #[test]
    fn accepts_plain_urls() {
        let target = validate_url("https://Alice.com/x?page=2").unwrap();
        assert_eq!(target, PurgeTarget::Url { url: "https://Alice.com/x?page=2".into(), host: "alice.com".into() });
        assert_eq!(validate_url("  http://alice.com  ").unwrap().as_arg(), "http://alice.com");
    }

    #[test]
    fn rejects_shell_metacharacters_everywhere() {
        for bad in [
            "https://alice.com/;rm -rf /",
            "https://alice.com/`id`",
            "https://alice.com/$(id)",
            "https://alice.com/a|b",
            "https://alice.com/?a=1&b=2",
        ] {
            assert!(matches!(validate_url(bad), Err(GatewayError::Validation { field: "url", .. })), "{}", bad);
        }
        for bad in ["alice.com;id", "alice`.com", "$(id).com", "a|b.com", "a&b.com"] {
            assert!(validate_domain(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn rejects_non_http_and_malformed_urls() {
        assert!(validate_url("ftp://alice.com/x").is_err());
        assert!(validate_url("alice.com/x").is_err());
        assert!(validate_url("https://user:pw@alice.com/").is_err());
        assert!(validate_url("https://alice.com/\nInjected: 1").is_err());
        assert!(validate_url("https://alice.com/<script>").is_err());
        let long = format!("https://alice.com/{}", "a".repeat(MAX_URL_BYTES));
        assert!(validate_url(&long).is_err());
    }

    #[test]
    fn domain_grammar() {
        assert_eq!(validate_domain("Shop.Example.COM").unwrap(), "shop.example.com");
        assert!(validate_domain("xn--bcher-kva.example").is_ok());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("-bad.com").is_err());
        assert!(validate_domain("bad-.com").is_err());
        assert!(validate_domain("a..com").is_err());
        assert!(validate_domain("../etc/passwd").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(63))).is_ok());
    }

    #[test]
    fn account_names_cannot_traverse() {
        assert!(validate_account("alice").is_ok());
        assert!(validate_account("..").is_err());
        assert!(validate_account("alice/../bob").is_err());
        assert!(validate_account("").is_err());
    }

    #[test]
    fn purge_reads_body_then_query() {
        let mut query = HashMap::new();
        query.insert("action".to_string(), "purge".to_string());
        query.insert("url".to_string(), "https://query.com/".to_string());

        let from_body = RawInput::from_parts(&query, Some("application/json"), br#"{"url":"https://body.com/"}"#);
        let req = validate(Action::Purge, &from_body).unwrap();
        assert_eq!(req.args, ValidatedArgs::Purge(validate_url("https://body.com/").unwrap()));

        let from_query = RawInput::from_parts(&query, None, b"");
        assert_eq!(from_query.action(), Some("purge"));
        let req = validate(Action::Purge, &from_query).unwrap();
        assert_eq!(req.args.slot_value(), Some("https://query.com/"));
    }

    #[test]
    fn purge_with_domain_or_scope_all() {
        let req = validate(Action::Purge, &input(json!({"domain": "Alice.com"}))).unwrap();
        assert_eq!(req.args, ValidatedArgs::Purge(PurgeTarget::Domain("alice.com".into())));

        let flush = validate(Action::Purge, &input(json!({"scope": "all"}))).unwrap();
        assert_eq!(flush, ValidatedRequest { action: Action::Flush, args: ValidatedArgs::None });

        let missing = validate(Action::Purge, &input(json!({"scope": "url"}))).unwrap_err();
        assert_eq!(missing.client_message(), "Invalid url: missing URL parameter");
    }

    #[test]
    fn malformed_body_is_rejected() {
        let raw = RawInput::from_parts(&HashMap::new(), Some("application/json"), b"[1,2");
        assert!(matches!(validate(Action::Status, &raw), Err(GatewayError::Validation { field: "body", .. })));
        let non_string = validate(Action::Purge, &input(json!({"url": 42}))).unwrap_err();
        assert!(matches!(non_string, GatewayError::Validation { field: "url", .. }));
    }

    #[test]
    fn legacy_form_posts_are_understood() {
        let raw = RawInput::from_parts(
            &HashMap::new(),
            Some("application/x-www-form-urlencoded; charset=UTF-8"),
            b"ajax=1&action=purge&domain=alice.com",
        );
        assert_eq!(raw.action(), Some("purge"));
        assert_eq!(validate(Action::Purge, &raw).unwrap().args.slot_value(), Some("alice.com"));
    }

    #[test]
    fn service_operation_is_from_fixed_set() {
        let req = validate(Action::Service, &input(json!({"operation": "Restart"}))).unwrap();
        assert_eq!(req.args.slot_value(), Some("restart"));
        assert!(validate(Action::Service, &input(json!({"operation": "restart; reboot"}))).is_err());
        assert!(validate(Action::Service, &input(json!({}))).is_err());
    }

    #[test]
    fn max_age_is_lenient() {
        assert_eq!(normalize_max_age(Some(&json!(-5))), DEFAULT_MAX_AGE);
        assert_eq!(normalize_max_age(Some(&json!("abc"))), DEFAULT_MAX_AGE);
        assert_eq!(normalize_max_age(None), DEFAULT_MAX_AGE);
        assert_eq!(normalize_max_age(Some(&json!(600))), 600);
        assert_eq!(normalize_max_age(Some(&json!(" 86400 "))), 86400);
        assert_eq!(normalize_max_age(Some(&json!(12.9))), 12);

        let policy = validate_policy(Some(&json!({"max_age": "abc"}))).unwrap();
        assert_eq!(policy.max_age, DEFAULT_MAX_AGE);
    }

    #[test]
    fn booleans_are_coerced() {
        for truthy in [json!(true), json!(1), json!("1"), json!("on"), json!("yes"), json!("TRUE")] {
            assert!(coerce_bool("enabled", Some(&truthy)).unwrap(), "{}", truthy);
        }
        for falsy in [json!(false), json!(0), json!("0"), json!(""), json!("off"), json!("false"), Value::Null] {
            assert!(!coerce_bool("enabled", Some(&falsy)).unwrap(), "{}", falsy);
        }
        assert!(coerce_bool("enabled", Some(&json!([true]))).is_err());
    }

    #[test]
    fn policy_is_a_full_replacement() {
        let policy = validate_policy(Some(&json!({
            "enabled": "1",
            "frame_options": "  DENY  ",
            "referrer_policy": "",
        })))
        .unwrap();
        assert!(policy.enabled);
        assert!(!policy.preload);
        assert_eq!(policy.frame_options, "DENY");
        assert_eq!(policy.referrer_policy, "");
        assert_eq!(policy.permissions_policy, "geolocation=()");

        assert!(validate_policy(None).is_err());
        assert!(validate_policy(Some(&json!({"frame_options": "DENY\r\nSet-Cookie: x"}))).is_err());
        let long = "a".repeat(MAX_HEADER_VALUE_BYTES + 1);
        assert!(validate_policy(Some(&json!({"permissions_policy": long}))).is_err());
    }
}
