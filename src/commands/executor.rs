use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout as tokio_timeout, Duration};
use tracing::{debug, info, warn};

use crate::commands::shutdown::Shutdown;
use crate::commands::timeout::{RetryPolicy, TimeoutStrategy, TimeoutTracker};
use crate::error::ErrorCode;

/// Exit code reported for a child killed at its deadline
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code reported when the program could not be started at all
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Outcome of one command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Stopped because the process is shutting down
    pub interrupted: bool,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.interrupted
    }

    /// Stdout with carriage returns stripped and surrounding whitespace trimmed
    pub fn stdout_trimmed(&self) -> String {
        self.stdout.replace('\r', "").trim().to_string()
    }

    fn spawn_failure(program: &Path, err: &std::io::Error, duration: Duration) -> Self {
        Self {
            exit_code: EXIT_SPAWN_FAILED,
            stdout: String::new(),
            stderr: format!("failed to start {}: {err}", program.display()),
            timed_out: false,
            interrupted: false,
            duration,
        }
    }

    fn not_started(program: &Path, signal: i32) -> Self {
        Self {
            exit_code: 128 + signal,
            stdout: String::new(),
            stderr: format!("not starting {}: shutting down", program.display()),
            timed_out: false,
            interrupted: true,
            duration: Duration::ZERO,
        }
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Shutdown(i32),
}

/// Something that can run an external program to completion.
///
/// [`CommandExecutor`] is the process-backed implementation; tests substitute
/// scripted runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[&str], strategy: &TimeoutStrategy)
        -> CommandResult;
}

/// Runs child processes with a deadline and process-group termination.
///
/// The process group is also torn down when `shutdown` fires, so a signal to
/// this process never leaves a child behind.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    shutdown: Shutdown,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown(shutdown: Shutdown) -> Self {
        Self { shutdown }
    }

    async fn execute(
        &self,
        program: &Path,
        args: &[&str],
        strategy: &TimeoutStrategy,
    ) -> CommandResult {
        let tracker = TimeoutTracker::new(strategy.clone());
        if let Some(signal) = self.shutdown.signal() {
            debug!(program = %program.display(), "shutdown requested, not spawning");
            return CommandResult::not_started(program, signal);
        }
        debug!(program = %program.display(), ?args, "running command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program.display(), "failed to spawn: {e}");
                return CommandResult::spawn_failure(program, &e, tracker.elapsed());
            }
        };

        let child_id = child.id();
        debug!("Spawned process with PID: {:?}", child_id);

        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_to_string(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_to_string(err)));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = sleep(tracker.remaining()) => Waited::Deadline,
            signal = self.shutdown.requested() => Waited::Shutdown(signal),
        };

        let (exit_code, timed_out, interrupted) = match waited {
            Waited::Exited(Ok(status)) => (exit_code_of(status), false, false),
            Waited::Exited(Err(e)) => {
                warn!(program = %program.display(), "failed to wait for child: {e}");
                (-1, false, false)
            }
            Waited::Deadline => {
                warn!(
                    program = %program.display(),
                    timeout_secs = strategy.timeout_secs,
                    "command reached its deadline, terminating process group"
                );
                self.terminate(&mut child, child_id, strategy).await;
                (EXIT_TIMED_OUT, true, false)
            }
            Waited::Shutdown(signal) => {
                warn!(program = %program.display(), signal, "shutting down, terminating process group");
                let graceful = TimeoutStrategy {
                    allow_graceful_termination: true,
                    ..strategy.clone()
                };
                self.terminate(&mut child, child_id, &graceful).await;
                (128 + signal, false, true)
            }
        };

        let stdout = collect_output(stdout_task).await;
        let stderr = collect_output(stderr_task).await;

        debug!(
            program = %program.display(),
            exit_code,
            timed_out,
            interrupted,
            elapsed_ms = tracker.elapsed().as_millis() as u64,
            "command finished"
        );

        CommandResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
            interrupted,
            duration: tracker.elapsed(),
        }
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL whatever is left.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>, strategy: &TimeoutStrategy) {
        if strategy.allow_graceful_termination {
            if let Err(e) = send_sigterm(child, pid) {
                debug!("SIGTERM failed: {e:#}");
            }
            if tokio_timeout(strategy.kill_grace(), child.wait()).await.is_ok() {
                info!("process terminated gracefully");
            }
        }

        // Sent even after a graceful exit so no grandchild keeps the pipes open.
        if let Err(e) = send_sigkill(child, pid).await {
            debug!("SIGKILL failed: {e:#}");
        }
        let _ = tokio_timeout(Duration::from_secs(2), child.wait()).await;
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn run(
        &self,
        program: &Path,
        args: &[&str],
        strategy: &TimeoutStrategy,
    ) -> CommandResult {
        self.execute(program, args, strategy).await
    }
}

/// Repeat `program` until it succeeds or `policy.max_attempts` runs are used up.
///
/// The delay before each retry doubles. Only transient failures (timeout or
/// a generic non-zero exit) are repeated; the last result is returned as is.
pub async fn run_with_retry<R>(
    runner: &R,
    program: &Path,
    args: &[&str],
    strategy: &TimeoutStrategy,
    policy: &RetryPolicy,
) -> CommandResult
where
    R: CommandRunner + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
            sleep(delay).await;
        }

        let result = runner.run(program, args, strategy).await;
        let code = match classify(&result) {
            None => {
                if attempt > 1 {
                    info!(program = %program.display(), attempt, "command succeeded after retry");
                }
                return result;
            }
            Some(code) => code,
        };

        if !code.is_transient() {
            debug!(program = %program.display(), ?code, "not retrying non-transient failure");
            return result;
        }
        if attempt >= max_attempts {
            warn!(
                program = %program.display(),
                attempts = attempt,
                ?code,
                "command failed after all attempts"
            );
            return result;
        }

        warn!(
            program = %program.display(),
            attempt,
            max_attempts,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            "command failed, retrying"
        );
        attempt += 1;
    }
}

/// Map a result to its failure category; `None` means success.
pub fn classify(result: &CommandResult) -> Option<ErrorCode> {
    if result.interrupted {
        return Some(ErrorCode::UserCancelled);
    }
    if result.timed_out {
        return Some(ErrorCode::Timeout);
    }
    if result.exit_code == 0 {
        return None;
    }
    if no_device_pattern().is_match(&result.stdout) || no_device_pattern().is_match(&result.stderr)
    {
        return Some(ErrorCode::NoDevices);
    }
    Some(ErrorCode::CommandError)
}

fn no_device_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)device (?:'[^']*' )?not found|no devices").expect("valid regex")
    })
}

/// Exit code of a finished child; signal deaths map to 128 + signal number
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn read_to_string<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("output stream closed with error: {e}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect_output(task: Option<JoinHandle<String>>) -> String {
    let Some(handle) = task else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio_timeout(Duration::from_secs(2), handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("output reader failed: {e}");
            String::new()
        }
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// Send SIGTERM to the child's process group
#[cfg(unix)]
fn send_sigterm(child: &mut Child, pid: Option<u32>) -> Result<()> {
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to process group {}", pid);
        killpg(Pid::from_raw(pid as i32), Signal::SIGTERM).context("failed to send SIGTERM")?;
    } else {
        child.start_kill().context("failed to send SIGTERM")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child, _pid: Option<u32>) -> Result<()> {
    child.start_kill().context("failed to terminate process")?;
    Ok(())
}

/// Send SIGKILL to the child's process group
#[cfg(unix)]
async fn send_sigkill(child: &mut Child, pid: Option<u32>) -> Result<()> {
    if let Some(pid) = pid {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGKILL to process group {}", pid);
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e).context("failed to send SIGKILL"),
        }
    } else {
        child.kill().await.context("failed to kill process")?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn send_sigkill(child: &mut Child, _pid: Option<u32>) -> Result<()> {
    child.kill().await.context("failed to kill process")?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::commands::shutdown::{channel, SIGTERM};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    /// Zombies still answer `kill(pid, 0)`, so they count as gone.
    fn process_alive(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), None).is_err() {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => !Path::new("/proc/self").exists(),
        }
    }

    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl CommandRunner for Flaky {
        async fn run(&self, _: &Path, _: &[&str], _: &TimeoutStrategy) -> CommandResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.succeed_on {
                result(0, "", false)
            } else {
                result(1, "error: closed", false)
            }
        }
    }

    fn result(exit_code: i32, stderr: &str, timed_out: bool) -> CommandResult {
        CommandResult {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            timed_out,
            interrupted: false,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&result(0, "", false)), None);
        assert_eq!(classify(&result(124, "", true)), Some(ErrorCode::Timeout));
        assert_eq!(
            classify(&result(1, "error: no devices/emulators found", false)),
            Some(ErrorCode::NoDevices)
        );
        assert_eq!(
            classify(&result(1, "error: device 'R58M' not found", false)),
            Some(ErrorCode::NoDevices)
        );
        assert_eq!(
            classify(&result(1, "adb: device not found", false)),
            Some(ErrorCode::NoDevices)
        );
        assert_eq!(
            classify(&result(1, "error: closed", false)),
            Some(ErrorCode::CommandError)
        );

        let mut interrupted = result(143, "", false);
        interrupted.interrupted = true;
        assert_eq!(classify(&interrupted), Some(ErrorCode::UserCancelled));
        assert!(!ErrorCode::UserCancelled.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let runner = Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 0,
        };
        let policy = RetryPolicy::new(4, Duration::from_millis(500));
        let started = tokio::time::Instant::now();

        let result = run_with_retry(&runner, Path::new("adb"), &[], &TimeoutStrategy::default(), &policy).await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(500 + 1000 + 2000));
        assert_eq!(started.elapsed(), policy.total_backoff());
        assert_eq!(classify(&result), Some(ErrorCode::CommandError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_success() {
        let runner = Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        };
        let started = tokio::time::Instant::now();

        let result = run_with_retry(
            &runner,
            Path::new("adb"),
            &[],
            &TimeoutStrategy::default(),
            &RetryPolicy::new(3, Duration::from_millis(500)),
        )
        .await;

        assert!(result.success());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let pid_arg = pid_file.display().to_string();
        let (trigger, shutdown) = channel();
        let executor = CommandExecutor::with_shutdown(shutdown);
        let strategy = TimeoutStrategy::quick_strategy(30);

        let args = ["-c", "sleep 30 & echo $! > \"$0\"; wait", &pid_arg];
        let run = executor.run(
            Path::new("sh"),
            &args,
            &strategy,
        );
        let fire = async {
            for _ in 0..100 {
                let written = std::fs::read_to_string(&pid_file).unwrap_or_default();
                if written.ends_with('\n') {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
            trigger.fire(SIGTERM);
        };
        let started = Instant::now();
        let (result, ()) = tokio::join!(run, fire);

        assert!(result.interrupted);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, 128 + SIGTERM);
        assert_eq!(classify(&result), Some(ErrorCode::UserCancelled));
        assert!(started.elapsed() < Duration::from_secs(10));

        let grandchild: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..40 {
            alive = process_alive(grandchild);
            if !alive {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "sleep {grandchild} survived shutdown");
    }

    #[tokio::test]
    async fn test_nothing_spawns_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let marker_arg = marker.display().to_string();
        let (trigger, shutdown) = channel();
        trigger.fire(SIGTERM);

        let result = CommandExecutor::with_shutdown(shutdown)
            .run(Path::new("touch"), &[&marker_arg], &TimeoutStrategy::quick_strategy(5))
            .await;

        assert!(result.interrupted);
        assert_eq!(result.exit_code, 128 + SIGTERM);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let executor = CommandExecutor::new();
        let strategy = TimeoutStrategy::quick_strategy(10);
        let result = executor
            .run(Path::new("echo"), &["hello"], &strategy)
            .await;

        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn test_captures_stderr_separately() {
        let executor = CommandExecutor::new();
        let strategy = TimeoutStrategy::quick_strategy(10);
        let result = executor
            .run(Path::new("sh"), &["-c", "echo out; echo err >&2; exit 3"], &strategy)
            .await;

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(classify(&result), Some(ErrorCode::CommandError));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let executor = CommandExecutor::new();
        let strategy = TimeoutStrategy::new(1, 1);
        let started = Instant::now();
        let result = executor
            .run(Path::new("sh"), &["-c", "sleep 30"], &strategy)
            .await;

        assert!(result.timed_out);
        assert_eq!(result.exit_code, EXIT_TIMED_OUT);
        assert_eq!(classify(&result), Some(ErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_that_ignores_sigterm() {
        let executor = CommandExecutor::new();
        let strategy = TimeoutStrategy::new(1, 1);
        let started = Instant::now();
        let result = executor
            .run(
                Path::new("sh"),
                &["-c", "trap '' TERM; sleep 30 & wait"],
                &strategy,
            )
            .await;

        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_reported_not_raised() {
        let executor = CommandExecutor::new();
        let strategy = TimeoutStrategy::quick_strategy(5);
        let result = executor
            .run(Path::new("/nonexistent/droid-mirror-test-binary"), &[], &strategy)
            .await;

        assert_eq!(result.exit_code, EXIT_SPAWN_FAILED);
        assert!(!result.timed_out);
        assert!(result.stderr.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_failed_command() {
        let executor = CommandExecutor::new();
        let strategy = TimeoutStrategy::quick_strategy(10);
        let result = executor.run(Path::new("false"), &[], &strategy).await;

        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
    }
}
