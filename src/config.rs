// src/config.rs

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}='{value}' is invalid: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

/// Which host panel this instance fronts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Panel {
    /// Tenant-facing; callers act on their own domains.
    Cpanel,
    /// Administrator-facing; every caller has full scope.
    Whm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    // 🛡️ SLA Boundary: Identity & Listener
    pub panel: Panel,
    pub bind: SocketAddr,
    pub user_header: String,
    pub admin_users: Vec<String>,

    // 📂 Platform Paths
    pub ctl_candidates: Vec<PathBuf>,
    pub uapi_path: PathBuf,
    pub userdata_dir: PathBuf,
    pub settings_path: PathBuf,
    pub static_dir: PathBuf,

    // 🛡️ Fixed elevation prefix. Never built from request data.
    pub elevation: Vec<String>,

    pub short_timeout: Duration,
    pub long_timeout: Duration,
    pub log_format: LogFormat,
}

const DEFAULT_CTL_CANDIDATES: &str = "/usr/local/varnish-whm-manager/bin/varnishctl.sh:\
/opt/varnish-whm-manager/bin/varnishctl.sh:/usr/local/bin/varnishctl";

impl GatewayConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or empty keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| -> String {
            lookup(key).filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
        };

        let panel = match get("VARNISH_GATEWAY_PANEL", "cpanel").to_ascii_lowercase().as_str() {
            "cpanel" => Panel::Cpanel,
            "whm" => Panel::Whm,
            other => return Err(invalid("VARNISH_GATEWAY_PANEL", other, "expected 'cpanel' or 'whm'")),
        };

        let bind_raw = get("VARNISH_GATEWAY_BIND", "127.0.0.1:8089");
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| invalid("VARNISH_GATEWAY_BIND", &bind_raw, &e.to_string()))?;

        let ctl_candidates: Vec<PathBuf> = get("VARNISH_GATEWAY_CTL_CANDIDATES", DEFAULT_CTL_CANDIDATES)
            .split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if let Some(relative) = ctl_candidates.iter().find(|p| !p.is_absolute()) {
            return Err(invalid(
                "VARNISH_GATEWAY_CTL_CANDIDATES",
                &relative.display().to_string(),
                "candidate paths must be absolute",
            ));
        }

        let elevation: Vec<String> = get("VARNISH_GATEWAY_ELEVATION", "sudo -n")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        // "none" disables the wrapper for hosts where the gateway itself is privileged.
        let elevation = if elevation == ["none"] { Vec::new() } else { elevation };

        let admin_users = get("VARNISH_GATEWAY_ADMIN_USERS", "root")
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();

        let log_format = match get("VARNISH_GATEWAY_LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(invalid("VARNISH_GATEWAY_LOG_FORMAT", other, "expected 'text' or 'json'")),
        };

        Ok(Self {
            panel,
            bind,
            user_header: get("VARNISH_GATEWAY_USER_HEADER", "x-remote-user").to_ascii_lowercase(),
            admin_users,
            ctl_candidates,
            uapi_path: PathBuf::from(get("VARNISH_GATEWAY_UAPI", "/usr/local/cpanel/bin/uapi")),
            userdata_dir: PathBuf::from(get("VARNISH_GATEWAY_USERDATA_DIR", "/var/cpanel/userdata")),
            settings_path: PathBuf::from(get(
                "VARNISH_GATEWAY_SETTINGS",
                "/usr/local/varnish-whm-manager/etc/settings.json",
            )),
            static_dir: PathBuf::from(get(
                "VARNISH_GATEWAY_STATIC_DIR",
                "/usr/local/varnish-whm-manager/share/panel",
            )),
            elevation,
            short_timeout: seconds("VARNISH_GATEWAY_TIMEOUT_SECS", &get("VARNISH_GATEWAY_TIMEOUT_SECS", "10"))?,
            long_timeout: seconds(
                "VARNISH_GATEWAY_LONG_TIMEOUT_SECS",
                &get("VARNISH_GATEWAY_LONG_TIMEOUT_SECS", "900"),
            )?,
            log_format,
        })
    }
}

fn seconds(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    // 🛡️ Strictly numeric and non-zero: a zero timeout would fail every request.
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(invalid(key, raw, "must be greater than zero")),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(invalid(key, raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        GatewayConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_a_stock_install() {
        let config = load(&[]).unwrap();
        assert_eq!(config.panel, Panel::Cpanel);
        assert_eq!(config.bind, "127.0.0.1:8089".parse::<SocketAddr>().unwrap());
        assert_eq!(config.ctl_candidates.len(), 3);
        assert_eq!(config.ctl_candidates[0], PathBuf::from("/usr/local/varnish-whm-manager/bin/varnishctl.sh"));
        assert_eq!(config.elevation, vec!["sudo", "-n"]);
        assert_eq!(config.admin_users, vec!["root"]);
        assert_eq!(config.short_timeout, Duration::from_secs(10));
        assert_eq!(config.long_timeout, Duration::from_secs(900));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("VARNISH_GATEWAY_PANEL", "WHM"),
            ("VARNISH_GATEWAY_ELEVATION", "none"),
            ("VARNISH_GATEWAY_ADMIN_USERS", "root, reseller1"),
            ("VARNISH_GATEWAY_USER_HEADER", "X-Cpanel-User"),
            ("VARNISH_GATEWAY_CTL_CANDIDATES", "/a/ctl.sh::/b/ctl.sh"),
            ("VARNISH_GATEWAY_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.panel, Panel::Whm);
        assert!(config.elevation.is_empty());
        assert_eq!(config.admin_users, vec!["root", "reseller1"]);
        assert_eq!(config.user_header, "x-cpanel-user");
        assert_eq!(config.ctl_candidates, vec![PathBuf::from("/a/ctl.sh"), PathBuf::from("/b/ctl.sh")]);
        assert_eq!(config.short_timeout, Duration::from_secs(5));
    }

    #[test]
    fn malformed_values_fail_startup() {
        assert!(load(&[("VARNISH_GATEWAY_PANEL", "plesk")]).is_err());
        assert!(load(&[("VARNISH_GATEWAY_BIND", "localhost")]).is_err());
        assert!(load(&[("VARNISH_GATEWAY_TIMEOUT_SECS", "ten")]).is_err());
        assert!(load(&[("VARNISH_GATEWAY_LONG_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("VARNISH_GATEWAY_CTL_CANDIDATES", "bin/varnishctl")]).is_err());
        assert!(load(&[("VARNISH_GATEWAY_LOG_FORMAT", "xml")]).is_err());
    }
}
