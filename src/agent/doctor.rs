use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::config::Config;
use crate::agent::tools::{find_tool, ADB, SCRCPY};
use crate::commands::{classify, CommandRunner, RetryPolicy};
use crate::device::{parse_device_list, Bridge, DeviceEntry};
use crate::error::{Diagnostics, ErrorCode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: &'static str,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

impl ToolStatus {
    pub fn is_installed(&self) -> bool {
        self.path.is_some()
    }
}

/// Environment check results for `doctor`
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub adb: ToolStatus,
    pub scrcpy: ToolStatus,
    pub server_responsive: bool,
    pub devices: Vec<DeviceEntry>,
    pub fix_attempted: bool,
}

impl DoctorReport {
    /// Most severe problem found, if any
    pub fn problem(&self) -> Option<ErrorCode> {
        if !self.adb.is_installed() || !self.scrcpy.is_installed() {
            Some(ErrorCode::MissingDependency)
        } else if !self.server_responsive {
            Some(ErrorCode::CommandError)
        } else {
            None
        }
    }

    fn needs_fix(&self) -> bool {
        !self.server_responsive || self.devices.iter().any(|d| !d.state.is_ready())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for tool in [&self.adb, &self.scrcpy] {
            match (&tool.path, &tool.version) {
                (Some(path), Some(version)) => {
                    let _ = writeln!(out, "[ok]      {:<7} {} ({})", tool.name, version, path.display());
                }
                (Some(path), None) => {
                    let _ = writeln!(out, "[warn]    {:<7} version unknown ({})", tool.name, path.display());
                }
                (None, _) => {
                    let _ = writeln!(out, "[missing] {:<7} install with: brew install {}", tool.name, brew_formula(tool.name));
                }
            }
        }

        if self.adb.is_installed() {
            if self.server_responsive {
                let _ = writeln!(out, "[ok]      adb server responding");
            } else {
                let _ = writeln!(out, "[fail]    adb server not responding");
            }
        }

        let ready = self.devices.iter().filter(|d| d.state.is_ready()).count();
        let _ = writeln!(out, "[info]    {ready} ready device(s), {} total", self.devices.len());
        for device in self.devices.iter().filter(|d| !d.state.is_ready()) {
            let _ = writeln!(out, "[warn]    {} is {}", device.id, device.state);
        }
        if self.fix_attempted {
            let _ = writeln!(out, "[info]    adb server was restarted");
        }
        out
    }
}

fn brew_formula(tool: &str) -> &'static str {
    if tool == ADB {
        "android-platform-tools"
    } else {
        "scrcpy"
    }
}

/// Inspect both binaries and the adb server; with `fix`, restart the server
/// when it is unresponsive or holds offline/unauthorized devices.
pub async fn run_doctor(config: &Config, runner: Arc<dyn CommandRunner>, fix: bool) -> DoctorReport {
    let strategy = config.timeout_strategy();
    let adb_path = find_tool(ADB, config.adb_path.as_deref());
    let scrcpy_path = find_tool(SCRCPY, config.scrcpy_path.as_deref());

    let scrcpy_version = match &scrcpy_path {
        Some(path) => {
            let result = runner.run(path, &["--version"], &strategy).await;
            classify(&result)
                .is_none()
                .then(|| result.stdout_trimmed().lines().next().unwrap_or_default().to_string())
        }
        None => None,
    };

    let mut report = DoctorReport {
        adb: ToolStatus {
            name: ADB,
            path: adb_path.clone(),
            version: None,
        },
        scrcpy: ToolStatus {
            name: SCRCPY,
            path: scrcpy_path,
            version: scrcpy_version,
        },
        server_responsive: false,
        devices: Vec::new(),
        fix_attempted: false,
    };

    let Some(adb) = adb_path else {
        warn!("adb not found");
        return report;
    };

    let bridge = Bridge::new(runner, adb, strategy, config.retry.clone());
    report.adb.version = bridge.version().await.ok();
    check_bridge(&bridge, &mut report).await;

    if fix && report.needs_fix() {
        info!("attempting fix: restarting adb server");
        report.fix_attempted = true;
        if let Err(code) = bridge.restart_server().await {
            warn!(?code, "adb server restart failed");
        }
        check_bridge(&bridge, &mut report).await;
    }

    report
}

async fn check_bridge(bridge: &Bridge, report: &mut DoctorReport) {
    let result = bridge.list_devices(&RetryPolicy::once()).await;
    report.server_responsive = classify(&result).is_none();
    report.devices = if report.server_responsive {
        parse_device_list(&result.stdout, &Diagnostics::new())
    } else {
        Vec::new()
    };
}
