use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};
use tracing::{debug, info, warn};

use droid_mirror::agent::config::Config;
use droid_mirror::agent::{daemon, doctor, tools};
use droid_mirror::commands::{listen_for_signals, CommandExecutor, CommandRunner, Shutdown};
use droid_mirror::device::{list_devices, Bridge, DeviceEntry, DeviceId, TickOutcome};
use droid_mirror::error::{Diagnostics, ErrorCode, EXIT_USER_INTERRUPT};
use droid_mirror::mirror::{launch_mirror, verify_reachable, MirrorOptions, MirrorOutcome};
use droid_mirror::utils;

#[derive(Parser)]
#[command(name = "droid-mirror", version, about = "Mirror Android devices with scrcpy")]
struct AppCli {
    /// Config file path (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a device's screen
    Start {
        /// Device serial; prompts when several devices are attached
        #[arg(short, long)]
        serial: Option<String>,
        /// Keep the device display on
        #[arg(long)]
        no_screen_off: bool,
        /// Let the device sleep as usual
        #[arg(long)]
        no_stay_awake: bool,
        /// Limit the longest side of the video, in pixels
        #[arg(long)]
        max_size: Option<u32>,
        /// Video bit rate, e.g. 8M
        #[arg(long)]
        bit_rate: Option<String>,
    },
    /// List attached devices and their states
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show adb version and details of ready devices
    Status,
    /// Check adb, scrcpy and the adb server
    Doctor {
        /// Restart the adb server when something looks wrong
        #[arg(long)]
        fix: bool,
    },
    /// Detect newly attached devices and mirror them
    Watch {
        /// Run a single poll tick and exit
        #[arg(long)]
        once: bool,
    },
}

struct MirrorOverrides {
    no_screen_off: bool,
    no_stay_awake: bool,
    max_size: Option<u32>,
    bit_rate: Option<String>,
}

impl MirrorOverrides {
    fn apply(self, mut options: MirrorOptions) -> MirrorOptions {
        if self.no_screen_off {
            options.turn_screen_off = false;
        }
        if self.no_stay_awake {
            options.stay_awake = false;
        }
        if self.max_size.is_some() {
            options.max_size = self.max_size;
        }
        if self.bit_rate.is_some() {
            options.video_bit_rate = self.bit_rate;
        }
        options
    }
}

/// Time allowed for in-flight work to wind down after a shutdown signal
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let args = AppCli::parse();
    utils::logging::init(&args.log_level);
    let shutdown = listen_for_signals();

    let outcome = async {
        match dispatch(args, &shutdown).await {
            Ok(status) => status,
            Err(e) if shutdown.is_requested() => {
                debug!("stopped by signal: {e:#}");
                1
            }
            Err(e) => report(&e),
        }
    };
    // Blocking prompts cannot be cancelled; do not let them hold the process.
    let deadline = async {
        let signal = shutdown.requested().await;
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        signal
    };

    let status = tokio::select! {
        status = outcome => status,
        signal = deadline => {
            warn!(signal, "shutdown took too long, exiting");
            std::process::exit(128 + signal);
        }
    };
    let status = shutdown.signal().map_or(status, |signal| 128 + signal);
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}

async fn dispatch(args: AppCli, shutdown: &Shutdown) -> Result<i32> {
    let config = Config::load(args.config.as_deref()).context(ErrorCode::InvalidInput)?;
    debug!(?config, "configuration loaded");
    let runner: Arc<dyn CommandRunner> = Arc::new(CommandExecutor::with_shutdown(shutdown.clone()));
    let interactive = std::io::stdin().is_terminal();

    match args.command {
        Commands::Start {
            serial,
            no_screen_off,
            no_stay_awake,
            max_size,
            bit_rate,
        } => {
            let overrides = MirrorOverrides {
                no_screen_off,
                no_stay_awake,
                max_size,
                bit_rate,
            };
            start(&config, runner, serial, overrides, interactive, shutdown).await
        }
        Commands::List { json } => list(&config, runner, json).await,
        Commands::Status => status(&config, runner).await,
        Commands::Doctor { fix } => {
            let report = doctor::run_doctor(&config, runner, fix).await;
            print!("{}", report.render());
            match report.problem() {
                None => Ok(0),
                Some(code) => {
                    for hint in code.suggestions() {
                        println!("  hint: {hint}");
                    }
                    Ok(code.exit_code())
                }
            }
        }
        Commands::Watch { once } => {
            let watcher = daemon::build_watcher(&config, runner, interactive, shutdown)
                .context("checking for adb and scrcpy")?;
            let diagnostics = Diagnostics::new();
            if once {
                match daemon::run_once(&watcher, &diagnostics).await? {
                    TickOutcome::Skipped => println!("another watch tick is running; skipped"),
                    TickOutcome::Completed { diff, current, .. } => {
                        for id in &diff.added {
                            println!("+ {id}");
                        }
                        for id in &diff.removed {
                            println!("- {id}");
                        }
                        debug!(devices = current.len(), "snapshot persisted");
                    }
                }
            } else {
                daemon::run(&config, &watcher, &diagnostics, shutdown).await;
            }
            Ok(0)
        }
    }
}

async fn start(
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    serial: Option<String>,
    overrides: MirrorOverrides,
    interactive: bool,
    shutdown: &Shutdown,
) -> Result<i32> {
    let toolchain = tools::require_toolchain(config).context("checking for adb and scrcpy")?;
    let options = overrides.apply(config.mirror.clone());
    options.validate().context("invalid mirroring options")?;

    let bridge = Bridge::new(runner, &toolchain.adb, config.timeout_strategy(), config.retry.clone());
    let diagnostics = Diagnostics::new();

    let id = match serial {
        Some(raw) => DeviceId::parse(&raw).with_context(|| format!("invalid serial {raw:?}"))?,
        None => select_device(&bridge, &diagnostics, interactive).await?,
    };

    verify_reachable(&bridge, &id, config.command_timeout_secs)
        .await
        .with_context(|| format!("device {id} is not reachable"))?;

    println!("Mirroring {id}; close the window or press Ctrl+C to stop");
    let exit = launch_mirror(&toolchain.scrcpy, &id, &options, shutdown)
        .await
        .context("starting scrcpy")?;

    match exit.outcome() {
        MirrorOutcome::Clean => {
            println!("Mirroring of {id} ended");
            Ok(0)
        }
        MirrorOutcome::Interrupted => {
            println!("Mirroring of {id} interrupted");
            Ok(EXIT_USER_INTERRUPT)
        }
        MirrorOutcome::Abnormal(code) => Err(anyhow::Error::new(ErrorCode::MirrorFailed)
            .context(format!("scrcpy exited with status {code}"))),
    }
}

/// Pick the only ready device, or ask which one to use.
async fn select_device(bridge: &Bridge, diagnostics: &Diagnostics, interactive: bool) -> Result<DeviceId> {
    let mut offered_retry = false;

    loop {
        let entries = list_devices(bridge, diagnostics).await.context("listing devices")?;
        for entry in entries.iter().filter(|e| !e.state.is_ready()) {
            warn!(device = %entry.id, state = %entry.state, "device attached but not ready");
        }
        let mut ready: Vec<DeviceEntry> = entries.into_iter().filter(|e| e.state.is_ready()).collect();

        match ready.len() {
            0 => {
                if interactive && !offered_retry {
                    offered_retry = true;
                    if prompt_retry().await? {
                        continue;
                    }
                    return Err(ErrorCode::UserCancelled.into());
                }
                return Err(ErrorCode::NoDevices.into());
            }
            1 => return Ok(ready.remove(0).id),
            count if !interactive => {
                return Err(anyhow::Error::new(ErrorCode::InvalidInput)
                    .context(format!("{count} devices connected; choose one with --serial")));
            }
            _ => return prompt_device(ready).await,
        }
    }
}

async fn prompt_retry() -> Result<bool> {
    tokio::task::spawn_blocking(|| {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("No Android devices found. Connect one and retry?")
            .default(true)
            .interact()
    })
    .await
    .context("prompt task failed")?
    .context("reading answer")
}

async fn prompt_device(ready: Vec<DeviceEntry>) -> Result<DeviceId> {
    let labels: Vec<String> = ready
        .iter()
        .map(|entry| match entry.model() {
            Some(model) => format!("{model} ({})", entry.id),
            None => entry.id.to_string(),
        })
        .collect();

    let selection = tokio::task::spawn_blocking(move || {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select a device to mirror")
            .items(&labels)
            .default(0)
            .interact_opt()
    })
    .await
    .context("prompt task failed")?
    .context("reading selection")?;

    match selection {
        Some(index) => Ok(ready[index].id.clone()),
        None => Err(ErrorCode::UserCancelled.into()),
    }
}

async fn list(config: &Config, runner: Arc<dyn CommandRunner>, json: bool) -> Result<i32> {
    let adb = tools::find_adb(config).context("looking for adb")?;
    let bridge = Bridge::new(runner, adb, config.timeout_strategy(), config.retry.clone());
    let diagnostics = Diagnostics::new();
    let entries = list_devices(&bridge, &diagnostics).await.context("listing devices")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }

    if entries.is_empty() {
        println!("No devices attached");
        return Ok(0);
    }
    println!("{:<24} {:<14} MODEL", "SERIAL", "STATE");
    for entry in &entries {
        println!(
            "{:<24} {:<14} {}",
            entry.id,
            entry.state,
            entry.model().unwrap_or_default()
        );
    }
    Ok(0)
}

async fn status(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<i32> {
    let adb = tools::find_adb(config).context("looking for adb")?;
    let bridge = Bridge::new(runner, adb, config.timeout_strategy(), config.retry.clone());
    let diagnostics = Diagnostics::new();

    match bridge.version().await {
        Ok(version) => println!("{version}"),
        Err(code) => warn!(?code, "could not read adb version"),
    }

    let entries = list_devices(&bridge, &diagnostics).await.context("listing devices")?;
    if entries.is_empty() {
        return Err(ErrorCode::NoDevices.into());
    }

    for entry in &entries {
        if !entry.state.is_ready() {
            println!("{}: {}", entry.id, entry.state);
            continue;
        }
        let info = bridge.device_info(&entry.id).await;
        println!("{}:", entry.id);
        println!("  model:        {}", info.model.as_deref().unwrap_or("unknown"));
        println!("  manufacturer: {}", info.manufacturer.as_deref().unwrap_or("unknown"));
        println!(
            "  android:      {} (sdk {})",
            info.android_release.as_deref().unwrap_or("unknown"),
            info.sdk_level.as_deref().unwrap_or("?")
        );
    }
    info!(warnings = diagnostics.warnings(), "status complete");
    Ok(0)
}

/// Print the failure with its hints and return the exit status for it.
fn report(err: &anyhow::Error) -> i32 {
    let code = err.downcast_ref::<ErrorCode>().copied().unwrap_or(ErrorCode::Unknown);
    debug!(?code, "command failed: {err:?}");
    eprintln!("error: {err:#}");
    for hint in code.suggestions() {
        eprintln!("  hint: {hint}");
    }
    code.exit_code()
}
