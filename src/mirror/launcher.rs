use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, warn};

use crate::commands::executor::exit_code_of;
use crate::commands::{classify, Shutdown, TimeoutStrategy};
use crate::device::{Bridge, DeviceHandler, DeviceId};
use crate::error::{ErrorCode, EXIT_USER_INTERRUPT};
use crate::mirror::MirrorOptions;

/// How a mirroring session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MirrorExit {
    /// Raw exit status of scrcpy (128 + signal when it was killed by one)
    pub exit_code: i32,
    /// A shutdown signal arrived while the session was running
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Clean,
    Interrupted,
    Abnormal(i32),
}

impl MirrorExit {
    pub fn outcome(&self) -> MirrorOutcome {
        const SIGINT_EXIT: i32 = 128 + 2;
        if self.interrupted || self.exit_code == EXIT_USER_INTERRUPT || self.exit_code == SIGINT_EXIT {
            MirrorOutcome::Interrupted
        } else if self.exit_code == 0 {
            MirrorOutcome::Clean
        } else {
            MirrorOutcome::Abnormal(self.exit_code)
        }
    }
}

/// Confirm the device is in `device` state and answers a shell round trip.
pub async fn verify_reachable(
    bridge: &Bridge,
    id: &DeviceId,
    timeout_secs: u64,
) -> Result<(), ErrorCode> {
    let strategy = TimeoutStrategy::new(timeout_secs, bridge.strategy().kill_grace_secs);

    let state = bridge.get_state(id, &strategy).await;
    if let Some(code) = classify(&state) {
        if code == ErrorCode::UserCancelled {
            return Err(code);
        }
        warn!(device = %id, ?code, stderr = %state.stderr.trim(), "device state query failed");
        return Err(ErrorCode::DeviceDisconnected);
    }
    let reported = state.stdout_trimmed();
    if reported != "device" {
        warn!(device = %id, state = %reported, "device is not ready");
        return Err(ErrorCode::DeviceDisconnected);
    }

    let echo = bridge.ping(id, &strategy).await;
    if classify(&echo) == Some(ErrorCode::UserCancelled) {
        return Err(ErrorCode::UserCancelled);
    }
    if classify(&echo).is_some() || echo.stdout_trimmed() != "ok" {
        warn!(device = %id, exit_code = echo.exit_code, "device did not answer shell round trip");
        return Err(ErrorCode::DeviceDisconnected);
    }

    debug!(device = %id, "device reachable");
    Ok(())
}

/// Run scrcpy against `id` in the foreground and wait for it to exit.
///
/// Only a failure to start the process is an error; every exit status,
/// including interrupts, is returned to the caller. When `shutdown` fires,
/// scrcpy gets SIGTERM and five seconds to exit before it is killed.
pub async fn launch_mirror(
    scrcpy: &Path,
    id: &DeviceId,
    options: &MirrorOptions,
    shutdown: &Shutdown,
) -> Result<MirrorExit, ErrorCode> {
    options.validate()?;
    let args = options.to_args(id);
    info!(device = %id, scrcpy = %scrcpy.display(), ?args, "starting screen mirroring");

    let mut child = Command::new(scrcpy)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            warn!(scrcpy = %scrcpy.display(), "failed to start scrcpy: {e}");
            match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::MissingDependency,
                std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
                _ => ErrorCode::MirrorFailed,
            }
        })?;

    let child_id = child.id();
    let mut interrupted = false;
    let status = tokio::select! {
        status = child.wait() => status,
        signal = shutdown.requested() => {
            interrupted = true;
            info!(device = %id, signal, "shutdown requested, stopping scrcpy");
            forward_sigterm(child_id);
            match tokio_timeout(Duration::from_secs(5), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("scrcpy did not exit after SIGTERM, killing it");
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    }
    .map_err(|e| {
        warn!("failed to wait for scrcpy: {e}");
        ErrorCode::MirrorFailed
    })?;

    let exit = MirrorExit {
        exit_code: exit_code_of(status),
        interrupted,
    };
    info!(device = %id, exit_code = exit.exit_code, interrupted, "screen mirroring ended");
    Ok(exit)
}

#[cfg(unix)]
fn forward_sigterm(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to scrcpy failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn forward_sigterm(_pid: Option<u32>) {}

/// Watch handler that mirrors every newly attached device
pub struct AutoMirrorHandler {
    bridge: Bridge,
    scrcpy: PathBuf,
    options: MirrorOptions,
    verify_timeout_secs: u64,
    confirm: bool,
    shutdown: Shutdown,
}

impl AutoMirrorHandler {
    pub fn new(bridge: Bridge, scrcpy: impl Into<PathBuf>, options: MirrorOptions) -> Self {
        let verify_timeout_secs = bridge.strategy().timeout_secs;
        Self {
            bridge,
            scrcpy: scrcpy.into(),
            options,
            verify_timeout_secs,
            confirm: false,
            shutdown: Shutdown::never(),
        }
    }

    /// Stop the running session when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Ask on the terminal before each session
    pub fn with_confirmation(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    async fn ask(&self, id: &DeviceId) -> anyhow::Result<bool> {
        let label = match self.bridge.get_prop(id, "ro.product.model").await {
            Ok(model) if !model.is_empty() => format!("{model} ({id})"),
            _ => id.to_string(),
        };
        tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::with_theme(&dialoguer::theme::ColorfulTheme::default())
                .with_prompt(format!("Android device connected: {label}. Start mirroring?"))
                .default(true)
                .interact()
        })
        .await
        .context("confirmation prompt panicked")?
        .context("reading confirmation")
    }
}

#[async_trait]
impl DeviceHandler for AutoMirrorHandler {
    async fn device_added(&self, id: &DeviceId) -> anyhow::Result<()> {
        if self.confirm && !self.ask(id).await? {
            info!(device = %id, "mirroring declined");
            return Ok(());
        }

        verify_reachable(&self.bridge, id, self.verify_timeout_secs)
            .await
            .with_context(|| format!("device {id} is not reachable"))?;

        let exit = launch_mirror(&self.scrcpy, id, &self.options, &self.shutdown)
            .await
            .with_context(|| format!("could not start mirroring {id}"))?;
        match exit.outcome() {
            MirrorOutcome::Clean | MirrorOutcome::Interrupted => Ok(()),
            MirrorOutcome::Abnormal(code) => {
                anyhow::bail!("scrcpy exited with status {code} for {id}")
            }
        }
    }
}

/// Watch handler that only records arrivals
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl DeviceHandler for LogHandler {
    async fn device_added(&self, id: &DeviceId) -> anyhow::Result<()> {
        info!(device = %id, "new device available; run `droid-mirror start --serial {id}` to mirror it");
        Ok(())
    }
}
