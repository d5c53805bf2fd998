// 🛡️ Zero-Trust Architecture: every privileged capability sits behind a trait in `traits`.

pub mod traits;     // Capability seams (exec, domain lookup, config apply)
pub mod registry;   // Action → command template table
pub mod validate;   // Untrusted input normalization
pub mod executor;   // argv-only subprocess runner with timeouts
pub mod ownership;  // Tenant ↔ domain authorization
pub mod normalize;  // Backend output → response envelope
pub mod settings;   // Security header policy store

#[cfg(test)]
pub mod testing {
    //! Fakes shared by the unit tests.

    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::error::GatewayError;
    use crate::sys::traits::{CommandResult, CommandRunner, ConfigApplier, DomainListing, DomainSource, Invocation};

    /// Writes an executable `/bin/sh` script and returns its path.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Records every invocation and replays queued results (default: empty success).
    #[derive(Default)]
    pub struct ScriptedRunner {
        calls: Mutex<Vec<Invocation>>,
        queued: Mutex<VecDeque<Result<CommandResult, GatewayError>>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_ok(&self, stdout: &str) {
            self.push(0, stdout, "");
        }

        pub fn push_failure(&self, code: i32, stdout: &str, stderr: &str) {
            self.push(code, stdout, stderr);
        }

        pub fn push_err(&self, err: GatewayError) {
            self.queued.lock().unwrap().push_back(Err(err));
        }

        fn push(&self, code: i32, stdout: &str, stderr: &str) {
            self.queued.lock().unwrap().push_back(Ok(CommandResult {
                exit_code: Some(code),
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                duration: Duration::from_millis(1),
                success: code == 0,
            }));
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: Invocation) -> Result<CommandResult, GatewayError> {
            self.calls.lock().unwrap().push(invocation);
            self.queued.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(CommandResult {
                    exit_code: Some(0),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    duration: Duration::from_millis(1),
                    success: true,
                })
            })
        }
    }

    /// Fixed account → domains map. Unknown accounts are a lookup failure.
    pub struct StaticDomains {
        accounts: HashMap<String, DomainListing>,
        fail: bool,
    }

    impl StaticDomains {
        pub fn with(account: &str, domains: &[&str]) -> Arc<Self> {
            let mut listing = DomainListing::default();
            if let Some((main, rest)) = domains.split_first() {
                listing.main_domain = main.to_string();
                listing.addon_domains = rest.iter().map(|d| d.to_string()).collect();
            }
            let mut accounts = HashMap::new();
            accounts.insert(account.to_string(), listing);
            Arc::new(Self { accounts, fail: false })
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self { accounts: HashMap::new(), fail: true })
        }
    }

    #[async_trait]
    impl DomainSource for StaticDomains {
        async fn list_domains(&self, account: &str) -> Result<DomainListing, GatewayError> {
            if self.fail {
                return Err(GatewayError::backend("Domain lookup failed: platform unreachable"));
            }
            self.accounts
                .get(account)
                .cloned()
                .ok_or_else(|| GatewayError::backend(format!("Domain lookup failed: unknown account {}", account)))
        }
    }

    /// Counts apply calls and the peak number running at once.
    pub struct StaticApplier {
        failure: Option<String>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StaticApplier {
        fn build(failure: Option<String>) -> Arc<Self> {
            Arc::new(Self {
                failure,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        pub fn ok() -> Arc<Self> {
            Self::build(None)
        }

        pub fn failing(message: &str) -> Arc<Self> {
            Self::build(Some(message.to_string()))
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfigApplier for StaticApplier {
        async fn apply(&self) -> Result<(), GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match &self.failure {
                Some(message) => Err(GatewayError::backend(message.clone())),
                None => Ok(()),
            }
        }
    }
}
