#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use droid_mirror::commands::{CommandResult, CommandRunner, RetryPolicy, TimeoutStrategy};
use droid_mirror::device::{Bridge, DeviceId, DeviceSnapshot};

pub fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        timed_out: false,
        interrupted: false,
        duration: Duration::ZERO,
    }
}

pub fn fail(exit_code: i32, stderr: &str) -> CommandResult {
    CommandResult {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        timed_out: false,
        interrupted: false,
        duration: Duration::ZERO,
    }
}

/// Answers adb invocations from a per-command queue. The last queued answer
/// repeats; unknown commands fail with exit code 1.
#[derive(Default)]
pub struct ScriptedRunner {
    answers: Mutex<HashMap<String, VecDeque<CommandResult>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, command: &str, answers: Vec<CommandResult>) {
        self.answers
            .lock()
            .unwrap()
            .insert(command.to_string(), answers.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == command).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _program: &Path, args: &[&str], _strategy: &TimeoutStrategy) -> CommandResult {
        let key = args.join(" ");
        self.calls.lock().unwrap().push(key.clone());

        let mut answers = self.answers.lock().unwrap();
        match answers.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => fail(1, &format!("unscripted command: {key}")),
        }
    }
}

pub fn bridge(runner: Arc<ScriptedRunner>) -> Bridge {
    Bridge::new(
        runner,
        "/usr/local/bin/adb",
        TimeoutStrategy::quick_strategy(5),
        RetryPolicy::new(3, Duration::ZERO),
    )
}

pub fn snapshot(ids: &[&str]) -> DeviceSnapshot {
    ids.iter().map(|id| DeviceId::parse(id).unwrap()).collect()
}

pub fn strs(ids: &[DeviceId]) -> Vec<&str> {
    ids.iter().map(DeviceId::as_str).collect()
}
