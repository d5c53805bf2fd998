// src/sys/registry.rs
//
// 🛡️ Zero-Trust: The table below is the complete set of things this gateway can
// make the host do. No user input is part of a template; a validated argument is
// appended later as one discrete argv element.

use nix::unistd::{access, AccessFlags};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::sys::traits::Invocation;

// ==============================================================================
// 1. Public Action Names
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Status,
    Purge,
    Flush,
    Domains,
    Install,
    Service,
    UpdateCerts,
    SettingsGet,
    SettingsUpdate,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Status,
        Action::Purge,
        Action::Flush,
        Action::Domains,
        Action::Install,
        Action::Service,
        Action::UpdateCerts,
        Action::SettingsGet,
        Action::SettingsUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Status => "status",
            Action::Purge => "purge",
            Action::Flush => "flush",
            Action::Domains => "domains",
            Action::Install => "install",
            Action::Service => "service",
            Action::UpdateCerts => "update_certs",
            Action::SettingsGet => "settings_get",
            Action::SettingsUpdate => "settings_update",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            // The legacy inline cPanel page posted `get_status`.
            "get_status" => Ok(Action::Status),
            other => Action::ALL
                .into_iter()
                .find(|action| action.as_str() == other)
                .ok_or_else(|| GatewayError::UnknownAction(other.to_string())),
        }
    }
}

// ==============================================================================
// 2. Template Shape
// ==============================================================================

/// Which executable a template runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The privileged cache control script, found among the configured candidates.
    Varnishctl,
    /// The platform's own API binary. Runs unelevated.
    Uapi,
    /// Served in-process (Settings Store); no subprocess.
    Local,
}

/// The one argument position a template exposes to validated input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    None,
    /// Validated URL or bare domain.
    Target,
    /// One of the fixed service operations.
    Operation,
    /// Optional `--user=<account>` selector.
    Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputParser {
    Json,
    PassthroughLog,
    DomainList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Short,
    Long,
}

#[derive(Debug)]
pub struct CommandTemplate {
    pub action: Action,
    pub backend: Backend,
    pub prefix: &'static [&'static str],
    pub slot: ArgSlot,
    pub suffix: &'static [&'static str],
    pub parser: OutputParser,
    pub elevated: bool,
    pub timeout: TimeoutClass,
    pub admin_only: bool,
}

const fn template(
    action: Action,
    backend: Backend,
    prefix: &'static [&'static str],
    slot: ArgSlot,
    parser: OutputParser,
    timeout: TimeoutClass,
    admin_only: bool,
) -> CommandTemplate {
    CommandTemplate {
        action,
        backend,
        prefix,
        slot,
        suffix: &[],
        parser,
        elevated: matches!(backend, Backend::Varnishctl),
        timeout,
        admin_only,
    }
}

static TEMPLATES: [CommandTemplate; 9] = [
    template(Action::Status, Backend::Varnishctl, &["status", "--format=json"], ArgSlot::None, OutputParser::Json, TimeoutClass::Short, false),
    template(Action::Purge, Backend::Varnishctl, &["purge"], ArgSlot::Target, OutputParser::PassthroughLog, TimeoutClass::Short, false),
    // A full flush bans every tenant's objects, so only administrators may run it.
    template(Action::Flush, Backend::Varnishctl, &["flush"], ArgSlot::None, OutputParser::PassthroughLog, TimeoutClass::Short, true),
    CommandTemplate {
        action: Action::Domains,
        backend: Backend::Uapi,
        prefix: &["--output", "json"],
        slot: ArgSlot::Account,
        suffix: &["Domains", "list_domains"],
        parser: OutputParser::DomainList,
        elevated: false,
        timeout: TimeoutClass::Short,
        admin_only: false,
    },
    template(Action::Install, Backend::Varnishctl, &["install"], ArgSlot::None, OutputParser::PassthroughLog, TimeoutClass::Long, true),
    template(Action::Service, Backend::Varnishctl, &["service"], ArgSlot::Operation, OutputParser::PassthroughLog, TimeoutClass::Long, true),
    template(Action::UpdateCerts, Backend::Varnishctl, &["update-certs"], ArgSlot::None, OutputParser::PassthroughLog, TimeoutClass::Long, true),
    template(Action::SettingsGet, Backend::Local, &[], ArgSlot::None, OutputParser::Json, TimeoutClass::Short, true),
    // settings_update persists locally, then asks the backend to regenerate and reload.
    template(Action::SettingsUpdate, Backend::Varnishctl, &["reload"], ArgSlot::None, OutputParser::PassthroughLog, TimeoutClass::Long, true),
];

// ==============================================================================
// 3. Resolution
// ==============================================================================

/// A template bound to a concrete executable and timeout.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub template: &'static CommandTemplate,
    pub program: Option<PathBuf>,
    pub timeout: Duration,
}

impl ResolvedCommand {
    /// Builds the argument vector. `slot_value` is already validated; it is
    /// appended as a single element and never parsed by a shell.
    pub fn invocation(&self, slot_value: Option<&str>) -> Result<Invocation, GatewayError> {
        let program = self.program.clone().ok_or_else(|| {
            GatewayError::backend(format!("{} does not run a subprocess", self.template.action))
        })?;

        let mut args: Vec<String> = self.template.prefix.iter().map(|s| s.to_string()).collect();
        match (self.template.slot, slot_value) {
            (ArgSlot::None, _) | (ArgSlot::Account, None) => {}
            (ArgSlot::Account, Some(account)) => args.push(format!("--user={}", account)),
            (ArgSlot::Target | ArgSlot::Operation, Some(value)) => args.push(value.to_string()),
            (ArgSlot::Target | ArgSlot::Operation, None) => {
                return Err(GatewayError::backend(format!(
                    "{} requires an argument",
                    self.template.action
                )));
            }
        }
        args.extend(self.template.suffix.iter().map(|s| s.to_string()));

        Ok(Invocation {
            action: self.template.action,
            program,
            args,
            elevated: self.template.elevated,
            timeout: self.timeout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    ctl_candidates: Vec<PathBuf>,
    uapi_path: PathBuf,
    short_timeout: Duration,
    long_timeout: Duration,
}

impl CommandRegistry {
    pub fn new(
        ctl_candidates: Vec<PathBuf>,
        uapi_path: PathBuf,
        short_timeout: Duration,
        long_timeout: Duration,
    ) -> Self {
        Self { ctl_candidates, uapi_path, short_timeout, long_timeout }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.ctl_candidates.clone(),
            config.uapi_path.clone(),
            config.short_timeout,
            config.long_timeout,
        )
    }

    pub fn template(action: Action) -> &'static CommandTemplate {
        // Every Action has exactly one entry; the table is indexed by declaration order.
        &TEMPLATES[action as usize]
    }

    pub fn resolve(&self, action: Action) -> Result<ResolvedCommand, GatewayError> {
        let template = Self::template(action);
        let timeout = match template.timeout {
            TimeoutClass::Short => self.short_timeout,
            TimeoutClass::Long => self.long_timeout,
        };

        let program = match template.backend {
            Backend::Local => None,
            Backend::Varnishctl => Some(
                first_executable(&self.ctl_candidates).ok_or_else(|| {
                    GatewayError::BackendUnavailable { capability: "varnishctl.sh".to_string() }
                })?,
            ),
            Backend::Uapi => {
                if !is_executable(&self.uapi_path) {
                    return Err(GatewayError::BackendUnavailable { capability: "uapi".to_string() });
                }
                Some(self.uapi_path.clone())
            }
        };

        Ok(ResolvedCommand { template, program, timeout })
    }
}

/// First candidate that is a regular file executable by this process.
pub fn first_executable(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|path| is_executable(path)).cloned()
}

pub fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}
