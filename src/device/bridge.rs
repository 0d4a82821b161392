use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::commands::{classify, run_with_retry, CommandResult, CommandRunner, RetryPolicy, TimeoutStrategy};
use crate::device::DeviceId;
use crate::error::ErrorCode;

/// Typed access to the `adb` binary.
///
/// Every call goes through the injected [`CommandRunner`] so nothing here
/// touches processes directly.
#[derive(Clone)]
pub struct Bridge {
    runner: Arc<dyn CommandRunner>,
    adb: PathBuf,
    strategy: TimeoutStrategy,
    retry: RetryPolicy,
}

/// Properties reported by `status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub android_release: Option<String>,
    pub sdk_level: Option<String>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("adb", &self.adb)
            .field("strategy", &self.strategy)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        adb: impl Into<PathBuf>,
        strategy: TimeoutStrategy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runner,
            adb: adb.into(),
            strategy,
            retry,
        }
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    pub fn strategy(&self) -> &TimeoutStrategy {
        &self.strategy
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `adb <args>` with an explicit timeout and retry policy
    pub async fn exec(
        &self,
        args: &[&str],
        strategy: &TimeoutStrategy,
        policy: &RetryPolicy,
    ) -> CommandResult {
        run_with_retry(self.runner.as_ref(), &self.adb, args, strategy, policy).await
    }

    /// `adb devices -l`
    pub async fn list_devices(&self, policy: &RetryPolicy) -> CommandResult {
        self.exec(&["devices", "-l"], &self.strategy, policy).await
    }

    /// Bounce the adb server: `kill-server` followed by `start-server`.
    pub async fn restart_server(&self) -> Result<(), ErrorCode> {
        warn!(adb = %self.adb.display(), "restarting adb server");
        let killed = self.exec(&["kill-server"], &self.strategy, &RetryPolicy::once()).await;
        if !killed.success() {
            // Nothing to kill is fine; start-server decides the outcome.
            debug!(exit_code = killed.exit_code, "adb kill-server reported failure");
        }

        let started = self.exec(&["start-server"], &self.strategy, &self.retry).await;
        match classify(&started) {
            None => {
                info!("adb server restarted");
                Ok(())
            }
            Some(code) => {
                warn!(?code, stderr = %started.stderr.trim(), "adb start-server failed");
                Err(code)
            }
        }
    }

    /// `adb -s <id> get-state`
    pub async fn get_state(&self, id: &DeviceId, strategy: &TimeoutStrategy) -> CommandResult {
        self.exec(&["-s", id.as_str(), "get-state"], strategy, &self.retry)
            .await
    }

    /// Trivial round trip through the device shell
    pub async fn ping(&self, id: &DeviceId, strategy: &TimeoutStrategy) -> CommandResult {
        self.exec(&["-s", id.as_str(), "shell", "echo", "ok"], strategy, &self.retry)
            .await
    }

    /// `adb -s <id> shell getprop <property>`, carriage returns stripped
    pub async fn get_prop(&self, id: &DeviceId, property: &str) -> Result<String, ErrorCode> {
        let result = self
            .exec(
                &["-s", id.as_str(), "shell", "getprop", property],
                &self.strategy,
                &self.retry,
            )
            .await;
        match classify(&result) {
            None => Ok(result.stdout_trimmed()),
            Some(code) => Err(code),
        }
    }

    /// First line of `adb version`
    pub async fn version(&self) -> Result<String, ErrorCode> {
        let result = self.exec(&["version"], &self.strategy, &RetryPolicy::once()).await;
        match classify(&result) {
            None => Ok(result
                .stdout_trimmed()
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()),
            Some(code) => Err(code),
        }
    }

    /// Collect model and OS properties; a property that cannot be read stays `None`.
    pub async fn device_info(&self, id: &DeviceId) -> DeviceInfo {
        let prop = |name: &'static str| async move {
            match self.get_prop(id, name).await {
                Ok(value) if !value.is_empty() => Some(value),
                Ok(_) => None,
                Err(code) => {
                    debug!(device = %id, property = name, ?code, "getprop failed");
                    None
                }
            }
        };

        DeviceInfo {
            id: id.to_string(),
            model: prop("ro.product.model").await,
            manufacturer: prop("ro.product.manufacturer").await,
            android_release: prop("ro.build.version.release").await,
            sdk_level: prop("ro.build.version.sdk").await,
        }
    }
}
