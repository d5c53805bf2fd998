// src/gateway.rs
//
// Transport-agnostic request handling. Both the HTTP listener and the CGI
// adapter hand a principal and the raw request here and get one envelope back.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::sys::executor::PrivilegedExecutor;
use crate::sys::normalize::{parse_output, Payload, ResponseEnvelope};
use crate::sys::ownership::{FallbackDomainSource, OwnershipGuard, Principal, UapiDomainSource, UserdataDomainSource};
use crate::sys::registry::{Action, CommandRegistry};
use crate::sys::settings::{BackendReloader, SettingsDocument, SettingsStore};
use crate::sys::traits::{CommandRunner, DomainSource};
use crate::sys::validate::{validate, RawInput, ValidatedArgs, ValidatedRequest};

pub struct Gateway {
    registry: Arc<CommandRegistry>,
    runner: Arc<dyn CommandRunner>,
    guard: OwnershipGuard,
    settings: SettingsStore,
}

impl Gateway {
    pub fn new(
        registry: Arc<CommandRegistry>,
        runner: Arc<dyn CommandRunner>,
        guard: OwnershipGuard,
        settings: SettingsStore,
    ) -> Self {
        Self { registry, runner, guard, settings }
    }

    /// Production wiring: real executor, uapi with userdata fallback, and a
    /// settings store that reloads through the backend.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let registry = Arc::new(CommandRegistry::from_config(config));
        let runner: Arc<dyn CommandRunner> = Arc::new(PrivilegedExecutor::from_config(config));

        let sources: Vec<Arc<dyn DomainSource>> = vec![
            Arc::new(UapiDomainSource::new(registry.clone(), runner.clone())),
            Arc::new(UserdataDomainSource::new(config.userdata_dir.clone())),
        ];
        let guard = OwnershipGuard::new(Arc::new(FallbackDomainSource::new(sources)));

        let reloader = Arc::new(BackendReloader::new(registry.clone(), runner.clone()));
        let settings = SettingsStore::new(config.settings_path.clone(), reloader);

        Self::new(registry, runner, guard, settings)
    }

    /// Never fails: every outcome becomes an envelope, and every error is
    /// logged with its full diagnostic before the client-safe message is sent.
    pub async fn handle(&self, principal: Result<Principal, GatewayError>, input: RawInput) -> ResponseEnvelope {
        let started = Instant::now();
        let requested = input.action().unwrap_or("").to_string();

        let principal = match principal {
            Ok(p) => p,
            Err(e) => {
                warn!(action = %requested, error = %e, "Rejected unauthenticated request");
                return Err::<Payload, _>(e).into();
            }
        };

        let outcome = self.dispatch(&principal, &input).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            Ok(_) => info!(action = %requested, principal = %principal.name, duration_ms, "Request completed"),
            Err(e) => warn!(
                action = %requested,
                principal = %principal.name,
                duration_ms,
                retryable = e.is_retryable(),
                error = %e,
                "Request failed"
            ),
        }

        outcome.into()
    }

    async fn dispatch(&self, principal: &Principal, input: &RawInput) -> Result<Payload, GatewayError> {
        let action: Action = input
            .action()
            .ok_or_else(|| GatewayError::validation("action", "missing action parameter"))?
            .parse()?;

        let ValidatedRequest { action, args } = validate(action, input)?;

        if CommandRegistry::template(action).admin_only && !principal.is_admin() {
            return Err(GatewayError::forbidden(format!("{} is administrative; {} is not", action, principal.name)));
        }

        match (action, args) {
            (Action::Purge, ValidatedArgs::Purge(target)) => {
                self.guard.authorize(principal, &target).await?;
                self.run(action, Some(target.as_arg())).await
            }
            (Action::Domains, ValidatedArgs::Domains { account }) => {
                let account = self.guard.listing_account(principal, account.as_deref())?;
                let domains = self.guard.listing(account).await?.merged();
                Ok(Payload::Domains { domains })
            }
            (Action::SettingsGet, _) => {
                let security_headers = self.settings.get().await?;
                Ok(Payload::Settings { settings: SettingsDocument { security_headers } })
            }
            (Action::SettingsUpdate, ValidatedArgs::Settings(policy)) => {
                let security_headers = self.settings.update(policy).await?;
                Ok(Payload::Settings { settings: SettingsDocument { security_headers } })
            }
            (action, args) => self.run(action, args.slot_value()).await,
        }
    }

    /// Resolve → execute → parse for one registry entry.
    async fn run(&self, action: Action, slot_value: Option<&str>) -> Result<Payload, GatewayError> {
        let resolved = self.registry.resolve(action)?;
        let invocation = resolved.invocation(slot_value)?;
        let result = self.runner.run(invocation).await?;
        parse_output(action, resolved.template.parser, &result)
    }
}
