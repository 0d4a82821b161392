use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::device::DeviceId;
use crate::error::ErrorCode;

/// Flags passed to scrcpy for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorOptions {
    /// Turn the device display off while mirroring
    pub turn_screen_off: bool,
    /// Keep the device awake while plugged in
    pub stay_awake: bool,
    /// Inject letters as text events instead of key events
    pub prefer_text: bool,
    /// Longest side of the mirrored video in pixels
    pub max_size: Option<u32>,
    /// Video bit rate, e.g. `8M` or `2500K`
    pub video_bit_rate: Option<String>,
    pub window_title: Option<String>,
    /// Appended verbatim after the generated flags
    pub extra_args: Vec<String>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            turn_screen_off: true,
            stay_awake: true,
            prefer_text: true,
            max_size: None,
            video_bit_rate: None,
            window_title: None,
            extra_args: Vec::new(),
        }
    }
}

const SHELL_METACHARS: &[char] = &[';', '|', '&', '`', '$', '>', '<', '\n'];

impl MirrorOptions {
    /// Reject values scrcpy would choke on before anything is spawned
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.max_size == Some(0) {
            return Err(ErrorCode::InvalidInput);
        }
        if let Some(rate) = &self.video_bit_rate {
            if !bit_rate_pattern().is_match(rate) {
                return Err(ErrorCode::InvalidInput);
            }
        }
        for arg in &self.extra_args {
            // The serial is always chosen by us.
            if arg == "-s" || arg.starts_with("--serial") {
                return Err(ErrorCode::InvalidInput);
            }
            if arg.chars().any(|c| SHELL_METACHARS.contains(&c)) {
                return Err(ErrorCode::InvalidInput);
            }
        }
        Ok(())
    }

    /// Full scrcpy argument list targeting `id`
    pub fn to_args(&self, id: &DeviceId) -> Vec<String> {
        let mut args = vec!["--serial".to_string(), id.to_string()];
        if self.turn_screen_off {
            args.push("--turn-screen-off".into());
        }
        if self.stay_awake {
            args.push("--stay-awake".into());
        }
        if self.prefer_text {
            args.push("--prefer-text".into());
        }
        if let Some(size) = self.max_size {
            args.push(format!("--max-size={size}"));
        }
        if let Some(rate) = &self.video_bit_rate {
            args.push(format!("--video-bit-rate={rate}"));
        }
        if let Some(title) = &self.window_title {
            args.push(format!("--window-title={title}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

fn bit_rate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[1-9][0-9]*[KM]?$").unwrap())
}
