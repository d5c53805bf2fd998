use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::GatewayError;
use crate::sys::registry::Action;

// ==============================================================================
// 1. Privileged Execution (argv only)
// ==============================================================================

/// 🛡️ Zero-Trust: Discrete fields prevent shell injection via OS execve.
/// `program` and `args` reach `execve` as-is; nothing is ever joined into a
/// shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub action: Action,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Run through the configured elevation wrapper.
    pub elevated: bool,
    pub timeout: Duration,
}

/// Outcome of one subprocess run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub success: bool,
}

impl CommandResult {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout followed by stderr, the way the backend's `2>&1` log used to read.
    pub fn combined_log(&self) -> String {
        let stdout = self.stdout_text();
        let stderr = self.stderr_text();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout,
            (true, false) => stderr,
            (false, false) if stdout.ends_with('\n') => format!("{}{}", stdout, stderr),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation under its timeout. Never retries.
    async fn run(&self, invocation: Invocation) -> Result<CommandResult, GatewayError>;
}

// ==============================================================================
// 2. Domain Ownership Source (Platform-Agnostic)
// ==============================================================================

/// Domains attached to one hosting account, grouped the way the platform reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainListing {
    pub main_domain: String,
    pub addon_domains: Vec<String>,
    pub parked_domains: Vec<String>,
    pub sub_domains: Vec<String>,
}

impl DomainListing {
    /// Drops repeated names across categories, keeping the first occurrence in
    /// main → addon → parked → sub order. Identity is the exact string.
    pub fn merged(self) -> Self {
        let mut seen: HashSet<String> = HashSet::new();
        if !self.main_domain.is_empty() {
            seen.insert(self.main_domain.clone());
        }
        let mut keep_first = |domains: Vec<String>| -> Vec<String> {
            domains
                .into_iter()
                .filter(|d| !d.is_empty() && seen.insert(d.clone()))
                .collect()
        };
        let addon_domains = keep_first(self.addon_domains);
        let parked_domains = keep_first(self.parked_domains);
        let sub_domains = keep_first(self.sub_domains);

        Self { main_domain: self.main_domain, addon_domains, parked_domains, sub_domains }
    }

    /// All names in listing order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.main_domain.as_str())
            .filter(|d| !d.is_empty())
            .chain(self.addon_domains.iter().map(String::as_str))
            .chain(self.parked_domains.iter().map(String::as_str))
            .chain(self.sub_domains.iter().map(String::as_str))
    }

    pub fn domain_set(&self) -> DomainSet {
        DomainSet::from_iter(self.iter())
    }
}

/// Membership view over a listing. Lives for one request only.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    lowered: HashSet<String>,
}

impl DomainSet {
    pub fn contains(&self, host: &str) -> bool {
        self.lowered.contains(&host.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.lowered.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for DomainSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self { lowered: iter.into_iter().map(|d| d.to_ascii_lowercase()).collect() }
    }
}

#[async_trait]
pub trait DomainSource: Send + Sync {
    /// Lists the domains of `account`. Any failure must be an `Err`, never an
    /// empty listing standing in for "unknown".
    async fn list_domains(&self, account: &str) -> Result<DomainListing, GatewayError>;
}

// ==============================================================================
// 3. Live Configuration Apply
// ==============================================================================

#[async_trait]
pub trait ConfigApplier: Send + Sync {
    /// Regenerates and reloads the cache configuration from the persisted settings.
    async fn apply(&self) -> Result<(), GatewayError>;
}
