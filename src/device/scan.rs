//! Parsing of `adb devices` output and the scan step of a watch cycle.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::Serialize;
use tracing::{debug, warn};

use crate::commands::{classify, RetryPolicy};
use crate::device::{Bridge, DeviceId, DeviceSnapshot};
use crate::error::{Diagnostics, ErrorCode};

/// Connection state column of `adb devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Device,
    Unauthorized,
    Offline,
    Other(String),
}

impl DeviceState {
    fn parse(raw: &str) -> Self {
        match raw {
            "device" => DeviceState::Device,
            "unauthorized" => DeviceState::Unauthorized,
            "offline" => DeviceState::Offline,
            other => DeviceState::Other(other.to_string()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DeviceState::Device)
    }
}

impl Display for DeviceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Device => f.pad("device"),
            DeviceState::Unauthorized => f.pad("unauthorized"),
            DeviceState::Offline => f.pad("offline"),
            DeviceState::Other(raw) => f.pad(raw),
        }
    }
}

/// One parsed line of the device table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub state: DeviceState,
    /// `key:value` fields printed by `adb devices -l` (model, product, transport_id, ...)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl DeviceEntry {
    pub fn model(&self) -> Option<String> {
        self.details.get("model").map(|m| m.replace('_', " "))
    }
}

/// Parse the device table.
///
/// The header and daemon chatter are skipped, lines without a state column
/// are ignored, and lines whose serial fails validation are dropped with a
/// warning recorded in `diagnostics`.
pub fn parse_device_list(output: &str, diagnostics: &Diagnostics) -> Vec<DeviceEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let line = line.trim_end_matches('\r').trim_end();
        if line.trim().is_empty() || line.starts_with("List of devices") || line.starts_with("* ") {
            continue;
        }

        // adb separates the serial from the state with a tab; fall back to
        // any whitespace for hand-written or reformatted input.
        let (raw_id, rest) = match line.split_once('\t') {
            Some(split) => split,
            None => match line.trim_start().split_once(char::is_whitespace) {
                Some(split) => split,
                None => continue,
            },
        };

        let mut fields = rest.split_whitespace();
        let Some(state) = fields.next() else {
            continue;
        };

        let raw_id = raw_id.trim();
        let id = match DeviceId::parse(raw_id) {
            Ok(id) => id,
            Err(_) => {
                diagnostics.warn(&format!("dropping device line with invalid serial {raw_id:?}"));
                continue;
            }
        };

        let details = fields
            .filter_map(|field| field.split_once(':'))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        entries.push(DeviceEntry {
            id,
            state: DeviceState::parse(state),
            details,
        });
    }

    entries
}

/// Snapshot of the entries in `device` state
pub fn ready_snapshot(entries: &[DeviceEntry]) -> DeviceSnapshot {
    entries
        .iter()
        .filter(|entry| entry.state.is_ready())
        .map(|entry| entry.id.clone())
        .collect()
}

/// List every device line, with one retry and a single adb server restart
/// as the recovery step when listing keeps failing.
pub async fn list_devices(
    bridge: &Bridge,
    diagnostics: &Diagnostics,
) -> Result<Vec<DeviceEntry>, ErrorCode> {
    let bounded = RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: bridge.retry_policy().initial_delay_ms,
    };

    let mut result = bridge.list_devices(&bounded).await;
    if let Some(code) = classify(&result) {
        if code == ErrorCode::UserCancelled {
            debug!("device listing interrupted by shutdown");
            return Err(code);
        }
        diagnostics.warn(&format!(
            "listing devices failed ({code}), restarting adb server and retrying once"
        ));
        if let Err(restart) = bridge.restart_server().await {
            warn!(?restart, "adb server restart did not succeed");
        }
        result = bridge.list_devices(&RetryPolicy::once()).await;
    }

    if let Some(code) = classify(&result) {
        diagnostics.error(
            code,
            &format!("unable to list devices: {}", result.stderr.trim()),
        );
        return Err(code);
    }

    let entries = parse_device_list(&result.stdout, diagnostics);
    debug!(count = entries.len(), "parsed device list");
    Ok(entries)
}

/// Current set of ready devices, sorted and deduplicated
pub async fn scan(bridge: &Bridge, diagnostics: &Diagnostics) -> Result<DeviceSnapshot, ErrorCode> {
    let entries = list_devices(bridge, diagnostics).await?;
    for entry in entries.iter().filter(|e| !e.state.is_ready()) {
        debug!(device = %entry.id, state = %entry.state, "device not ready, excluded from snapshot");
    }
    Ok(ready_snapshot(&entries))
}
