// src/sys/ownership.rs
//
// 🛡️ Fail-closed: this guard is the only thing stopping one tenant from banning
// another tenant's objects. Any lookup failure is Forbidden, never an allow.

use async_trait::async_trait;
use nix::unistd::{geteuid, User};
use regex::Regex;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::sys::normalize::parse_domain_list;
use crate::sys::registry::{Action, CommandRegistry};
use crate::sys::traits::{CommandRunner, DomainListing, DomainSet, DomainSource};
use crate::sys::validate::{validate_account, PurgeTarget};

static USERDATA_SKIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(main|cache|ssl|apache|nginx|subdomain|addons)(?:$|\.)").expect("userdata skip regex must compile")
});

static USERDATA_DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("userdata domain regex must compile"));

static MAIN_DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"main_domain:\s*(\S+)").expect("main_domain regex must compile"));

/// Suffixes the platform writes next to per-domain userdata files.
const USERDATA_ARTIFACT_SUFFIXES: [&str; 4] = [".cache", ".json", ".yaml", ".lock"];

// ==============================================================================
// 1. Principal
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Own domains only.
    OwnDomains,
    /// Administrative; skips membership checks but not validation.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scope: Scope,
}

impl Principal {
    pub fn account(name: &str) -> Result<Self, GatewayError> {
        let name = validate_account(name).map_err(|_| GatewayError::forbidden(format!("invalid identity '{}'", name)))?;
        Ok(Self { name, scope: Scope::OwnDomains })
    }

    pub fn admin_account(name: &str) -> Result<Self, GatewayError> {
        Ok(Self { scope: Scope::All, ..Self::account(name)? })
    }

    /// The WHM panel's caller.
    pub fn admin() -> Self {
        Self { name: "admin".to_string(), scope: Scope::All }
    }

    pub fn is_admin(&self) -> bool {
        self.scope == Scope::All
    }
}

// ==============================================================================
// 2. Guard
// ==============================================================================

pub struct OwnershipGuard {
    source: Arc<dyn DomainSource>,
}

impl OwnershipGuard {
    pub fn new(source: Arc<dyn DomainSource>) -> Self {
        Self { source }
    }

    /// Fresh listing for `account`; nothing is cached between requests.
    pub async fn listing(&self, account: &str) -> Result<DomainListing, GatewayError> {
        self.source.list_domains(account).await
    }

    pub async fn domain_set(&self, principal: &Principal) -> Result<DomainSet, GatewayError> {
        let listing = self.source.list_domains(&principal.name).await.map_err(|e| {
            GatewayError::forbidden(format!("domain lookup for {} failed: {}", principal.name, e))
        })?;
        let owned = listing.domain_set();
        if owned.is_empty() {
            return Err(GatewayError::forbidden(format!("{} has no domains on record", principal.name)));
        }
        Ok(owned)
    }

    pub async fn authorize(&self, principal: &Principal, target: &PurgeTarget) -> Result<(), GatewayError> {
        if principal.is_admin() {
            return Ok(());
        }

        let owned = self.domain_set(principal).await?;
        if owned.contains(target.host()) {
            debug!(principal = %principal.name, host = target.host(), "Ownership confirmed");
            return Ok(());
        }

        Err(GatewayError::forbidden(format!(
            "{} does not own {}",
            principal.name,
            target.host()
        )))
    }

    /// Which account's listing a `domains` request may see.
    pub fn listing_account<'a>(&self, principal: &'a Principal, requested: Option<&'a str>) -> Result<&'a str, GatewayError> {
        match requested {
            None => Ok(&principal.name),
            Some(account) if account == principal.name || principal.is_admin() => Ok(account),
            Some(account) => Err(GatewayError::forbidden(format!(
                "{} asked for the domains of {}",
                principal.name, account
            ))),
        }
    }
}

// ==============================================================================
// 3. Platform API Source (uapi)
// ==============================================================================

pub struct UapiDomainSource {
    registry: Arc<CommandRegistry>,
    runner: Arc<dyn CommandRunner>,
    // Account uapi acts as without --user; None when it cannot be determined.
    current_user: Option<String>,
}

impl UapiDomainSource {
    pub fn new(registry: Arc<CommandRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        let current_user = match User::from_uid(geteuid()) {
            Ok(Some(user)) => Some(user.name),
            _ => None,
        };
        Self::with_current_user(registry, runner, current_user)
    }

    pub fn with_current_user(
        registry: Arc<CommandRegistry>,
        runner: Arc<dyn CommandRunner>,
        current_user: Option<String>,
    ) -> Self {
        Self { registry, runner, current_user }
    }

    async fn query(&self, account: Option<&str>) -> Result<DomainListing, GatewayError> {
        let resolved = self.registry.resolve(Action::Domains)?;
        let result = self.runner.run(resolved.invocation(account)?).await?;
        parse_domain_list(&result)
    }
}

#[async_trait]
impl DomainSource for UapiDomainSource {
    async fn list_domains(&self, account: &str) -> Result<DomainListing, GatewayError> {
        // A bare call lists the domains of whoever runs uapi, so it is only
        // meaningful when that is the requested account.
        if self.current_user.as_deref() == Some(account) {
            match self.query(None).await {
                Ok(listing) => return Ok(listing),
                Err(e) => debug!(account, error = %e, "uapi without --user failed; retrying with --user"),
            }
        }
        self.query(Some(account)).await
    }
}

// ==============================================================================
// 4. Filesystem Source (/var/cpanel/userdata/<account>)
// ==============================================================================

pub struct UserdataDomainSource {
    root: PathBuf,
}

impl UserdataDomainSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl DomainSource for UserdataDomainSource {
    async fn list_domains(&self, account: &str) -> Result<DomainListing, GatewayError> {
        let account = validate_account(account)?;
        let base = self.root.join(&account);

        let mut entries = tokio::fs::read_dir(&base).await.map_err(|e| {
            GatewayError::backend(format!("Domain lookup failed: cannot read {}: {}", base.display(), e))
        })?;

        let mut all: Vec<String> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GatewayError::backend(format!("Domain lookup failed: {}", e)))?
        {
            let Ok(name) = entry.file_name().into_string() else { continue };
            if name.starts_with('.')
                || USERDATA_SKIP_RE.is_match(&name)
                || USERDATA_ARTIFACT_SUFFIXES.iter().any(|s| name.ends_with(s))
            {
                continue;
            }
            if USERDATA_DOMAIN_RE.is_match(&name) {
                all.push(name);
            }
        }
        all.sort();

        let main_from_file = match tokio::fs::read_to_string(base.join("main")).await {
            Ok(contents) => MAIN_DOMAIN_RE.captures(&contents).map(|c| c[1].to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!(account = %account, error = %e, "Unreadable userdata main file");
                None
            }
        };

        let main_domain = main_from_file.or_else(|| all.first().cloned()).unwrap_or_default();
        if main_domain.is_empty() {
            return Err(GatewayError::backend(format!("Domain lookup failed: no domains for {}", account)));
        }

        let addon_domains = all.into_iter().filter(|d| *d != main_domain).collect();
        Ok(DomainListing { main_domain, addon_domains, parked_domains: vec![], sub_domains: vec![] })
    }
}

// ==============================================================================
// 5. Ordered Fallback
// ==============================================================================

/// Tries each source in order; first success wins. All failing is an error.
pub struct FallbackDomainSource {
    sources: Vec<Arc<dyn DomainSource>>,
}

impl FallbackDomainSource {
    pub fn new(sources: Vec<Arc<dyn DomainSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl DomainSource for FallbackDomainSource {
    async fn list_domains(&self, account: &str) -> Result<DomainListing, GatewayError> {
        let mut last_err = GatewayError::backend("Domain lookup failed: no domain source configured");
        for source in &self.sources {
            match source.list_domains(account).await {
                Ok(listing) => return Ok(listing),
                Err(e) => {
                    warn!(account, error = %e, "Domain source failed; trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
