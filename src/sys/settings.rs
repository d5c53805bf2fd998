// src/sys/settings.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::GatewayError;
use crate::sys::normalize::parse_output;
use crate::sys::registry::{Action, CommandRegistry};
use crate::sys::traits::{CommandRunner, ConfigApplier};

pub const SETTINGS_VERSION: u32 = 1;
pub const DEFAULT_MAX_AGE: u64 = 31_536_000;

// ==============================================================================
// 1. Policy Record
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeaderPolicy {
    pub enabled: bool,
    pub include_subdomains: bool,
    pub preload: bool,
    pub max_age: u64,
    pub frame_options: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
}

impl Default for SecurityHeaderPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            include_subdomains: false,
            preload: false,
            max_age: DEFAULT_MAX_AGE,
            frame_options: "SAMEORIGIN".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            permissions_policy: "geolocation=()".to_string(),
        }
    }
}

/// On-disk shape. The control script reads `security_headers` from this file
/// when it regenerates the VCL.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsRecord {
    version: u32,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    security_headers: SecurityHeaderPolicy,
}

/// `settings` payload as the panels consume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsDocument {
    pub security_headers: SecurityHeaderPolicy,
}

// ==============================================================================
// 2. Store (serialized read-modify-persist-reload)
// ==============================================================================

pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    applier: Arc<dyn ConfigApplier>,
    // One region covers persist + reload + rollback, so two updates never interleave.
    lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: PathBuf, applier: Arc<dyn ConfigApplier>) -> Self {
        Self { inner: Arc::new(StoreInner { path, applier, lock: Mutex::new(()) }) }
    }

    /// Current policy; persists and returns the defaults on first read.
    pub async fn get(&self) -> Result<SecurityHeaderPolicy, GatewayError> {
        let inner = self.inner.clone();
        join(tokio::spawn(async move { inner.get().await })).await
    }

    /// Replaces the whole record, then reloads the cache layer. A failed reload
    /// restores the previous record byte for byte.
    ///
    /// The work runs on its own task: if the caller goes away mid-reload, the
    /// reload and any rollback still finish and only the result is dropped.
    pub async fn update(&self, policy: SecurityHeaderPolicy) -> Result<SecurityHeaderPolicy, GatewayError> {
        let inner = self.inner.clone();
        join(tokio::spawn(async move { inner.update(policy).await })).await
    }
}

async fn join<T>(
    task: tokio::task::JoinHandle<Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    task.await
        .map_err(|e| GatewayError::storage(format!("settings task failed: {}", e)))?
}

impl StoreInner {
    async fn get(&self) -> Result<SecurityHeaderPolicy, GatewayError> {
        let _guard = self.lock.lock().await;
        match read_raw(&self.path).await? {
            Some(bytes) => Ok(decode(&self.path, &bytes)?.security_headers),
            None => {
                let policy = SecurityHeaderPolicy::default();
                write_atomic(&self.path, encode(&policy)?).await?;
                info!(path = %self.path.display(), "Initialized security header settings with defaults");
                Ok(policy)
            }
        }
    }

    async fn update(&self, policy: SecurityHeaderPolicy) -> Result<SecurityHeaderPolicy, GatewayError> {
        let _guard = self.lock.lock().await;
        let previous = read_raw(&self.path).await?;

        write_atomic(&self.path, encode(&policy)?).await?;

        if let Err(apply_err) = self.applier.apply().await {
            warn!(error = %apply_err, "Reload after settings update failed; rolling back");
            let restored = match previous {
                Some(bytes) => write_atomic(&self.path, bytes).await,
                None => remove_if_present(&self.path).await,
            };
            if let Err(restore_err) = restored {
                error!(error = %restore_err, path = %self.path.display(), "Settings rollback failed");
                return Err(GatewayError::ReloadFailed {
                    message: format!("{}; rollback also failed: {}", apply_err, restore_err),
                });
            }
            return Err(GatewayError::ReloadFailed { message: apply_err.client_message() });
        }

        info!("Security header policy updated and cache configuration reloaded");
        Ok(policy)
    }
}

fn encode(policy: &SecurityHeaderPolicy) -> Result<Vec<u8>, GatewayError> {
    let record = SettingsRecord {
        version: SETTINGS_VERSION,
        updated_at: Some(Utc::now()),
        security_headers: policy.clone(),
    };
    let mut bytes = serde_json::to_vec_pretty(&record)
        .map_err(|e| GatewayError::storage(format!("Failed to encode settings: {}", e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<SettingsRecord, GatewayError> {
    let record: SettingsRecord = serde_json::from_slice(bytes).map_err(|e| {
        GatewayError::storage(format!("Corrupt settings file {}: {}", path.display(), e))
    })?;
    if record.version > SETTINGS_VERSION {
        return Err(GatewayError::storage(format!(
            "Settings file {} has unsupported version {}",
            path.display(),
            record.version
        )));
    }
    Ok(record)
}

async fn read_raw(path: &Path) -> Result<Option<Vec<u8>>, GatewayError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GatewayError::storage(format!("Failed to read {}: {}", path.display(), e))),
    }
}

async fn remove_if_present(path: &Path) -> Result<(), GatewayError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GatewayError::storage(format!("Failed to remove {}: {}", path.display(), e))),
    }
}

/// Temp file in the same directory, fsync, then rename over the target.
async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), GatewayError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), String> {
        let dir = path.parent().ok_or("settings path has no parent directory")?;
        std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| format!("Failed to create temp file: {}", e))?;
        tmp.write_all(&bytes).map_err(|e| format!("Failed to write temp file: {}", e))?;
        tmp.as_file().sync_all().map_err(|e| format!("Failed to sync temp file: {}", e))?;
        // The control script runs as root but the panel user may read it too.
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))
            .map_err(|e| format!("Failed to set permissions: {}", e))?;
        tmp.persist(&path).map_err(|e| format!("Failed to perform atomic rename: {}", e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| GatewayError::storage(format!("settings writer task failed: {}", e)))?
    .map_err(GatewayError::storage)
}

// ==============================================================================
// 3. Backend Reload
// ==============================================================================

/// Applies persisted settings by running the `reload` sub-command through the
/// same privileged entry point as every other action.
pub struct BackendReloader {
    registry: Arc<CommandRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl BackendReloader {
    pub fn new(registry: Arc<CommandRegistry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { registry, runner }
    }
}

#[async_trait]
impl ConfigApplier for BackendReloader {
    async fn apply(&self) -> Result<(), GatewayError> {
        let resolved = self.registry.resolve(Action::SettingsUpdate)?;
        let invocation = resolved.invocation(None)?;
        let result = self.runner.run(invocation).await?;
        parse_output(Action::SettingsUpdate, resolved.template.parser, &result).map(|_| ())
    }
}
