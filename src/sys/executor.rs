// src/sys/executor.rs

use async_trait::async_trait;
use nix::unistd::geteuid;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::sys::traits::{CommandResult, CommandRunner, Invocation};

/// Runs registry invocations, elevated ones through a single fixed wrapper
/// (`sudo -n` by default). How the wrapper grants privilege is host
/// configuration; this type only ever calls through it.
pub struct PrivilegedExecutor {
    elevation: Vec<String>,
}

impl PrivilegedExecutor {
    pub fn new(elevation: Vec<String>) -> Self {
        Self { elevation }
    }

    /// Drops the wrapper when the process already runs as root (WHM CGI).
    pub fn from_config(config: &GatewayConfig) -> Self {
        if geteuid().is_root() {
            info!("Running as root; elevation wrapper disabled");
            Self::new(Vec::new())
        } else {
            Self::new(config.elevation.clone())
        }
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut command = match (invocation.elevated, self.elevation.split_first()) {
            (true, Some((wrapper, wrapper_args))) => {
                let mut c = Command::new(wrapper);
                c.args(wrapper_args).arg(&invocation.program);
                c
            }
            _ => Command::new(&invocation.program),
        };

        command
            .args(&invocation.args)
            .env("LC_ALL", "C") // keep backend messages unlocalized for marker matching
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandRunner for PrivilegedExecutor {
    async fn run(&self, invocation: Invocation) -> Result<CommandResult, GatewayError> {
        let command = self.build_command(&invocation);

        // The supervisor owns the child. If the caller goes away the run still
        // finishes (or hits its timeout); only the result is discarded.
        let supervisor = tokio::spawn(supervise(command, invocation));
        supervisor
            .await
            .map_err(|e| GatewayError::backend(format!("Executor task failed: {}", e)))?
    }
}

async fn supervise(mut command: Command, invocation: Invocation) -> Result<CommandResult, GatewayError> {
    let action = invocation.action.as_str();
    let started = Instant::now();

    let child = command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => GatewayError::BackendUnavailable {
            capability: format!("{} ({})", invocation.program.display(), e),
        },
        _ => GatewayError::backend(format!("Failed to spawn process: {}", e)),
    })?;

    // On timeout the wait future (and with it the child) is dropped; kill_on_drop reaps it.
    let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(GatewayError::backend(format!("Failed to collect process output: {}", e))),
        Err(_) => {
            warn!(action, timeout_secs = invocation.timeout.as_secs(), "Backend command timed out; killed");
            return Err(GatewayError::Timeout { action: action.to_string(), after: invocation.timeout });
        }
    };

    let result = CommandResult {
        exit_code: output.status.code(),
        success: output.status.success(),
        stdout: output.stdout,
        stderr: output.stderr,
        duration: started.elapsed(),
    };

    info!(
        action,
        exit_code = ?result.exit_code,
        duration_ms = duration_ms(result.duration),
        "Backend command finished"
    );
    debug!(action, stdout = %result.stdout_text(), stderr = %result.stderr_text(), "Backend raw output");

    Ok(result)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::registry::Action;
    use crate::sys::testing::write_script;
    use std::path::PathBuf;

    fn invocation(program: PathBuf, args: &[&str], elevated: bool, timeout: Duration) -> Invocation {
        Invocation {
            action: Action::Purge,
            program,
            args: args.iter().map(|s| s.to_string()).collect(),
            elevated,
            timeout,
        }
    }

    #[tokio::test]
    async fn arguments_arrive_verbatim_without_a_shell() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ctl.sh", r#"for a in "$@"; do printf '%s\n' "$a"; done"#);
        let executor = PrivilegedExecutor::new(Vec::new());

        let tricky = "https://alice.com/x $(touch pwned) `id`";
        let result = executor
            .run(invocation(script, &["purge", tricky], true, Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stdout_text(), format!("purge\n{}\n", tricky));
        assert!(!dir.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn elevated_runs_go_through_the_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = write_script(dir.path(), "fake-sudo", r#"echo "wrapped:$*""#);
        let ctl = write_script(dir.path(), "ctl.sh", "echo direct");
        let executor = PrivilegedExecutor::new(vec![wrapper.display().to_string(), "-n".to_string()]);

        let elevated = executor
            .run(invocation(ctl.clone(), &["flush"], true, Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(elevated.stdout_text(), format!("wrapped:-n {} flush\n", ctl.display()));

        let plain = executor.run(invocation(ctl, &[], false, Duration::from_secs(5))).await.unwrap();
        assert_eq!(plain.stdout_text(), "direct\n");
    }

    #[tokio::test]
    async fn captures_exit_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ctl.sh", "echo out; echo oops >&2; exit 3");
        let result = PrivilegedExecutor::new(Vec::new())
            .run(invocation(script, &[], false, Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout_text(), "out\n");
        assert_eq!(result.stderr_text(), "oops\n");
    }

    #[tokio::test]
    async fn hung_backend_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ctl.sh", "exec sleep 30");
        let started = Instant::now();
        let err = PrivilegedExecutor::new(Vec::new())
            .run(invocation(script, &[], false, Duration::from_millis(200)))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_program_is_backend_unavailable() {
        let err = PrivilegedExecutor::new(Vec::new())
            .run(invocation(PathBuf::from("/nonexistent/varnishctl.sh"), &[], false, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
    }
}
