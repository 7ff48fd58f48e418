//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::filter::{FilterController, FilterState};
use crate::core::runner::{CommandOutput, CommandRunner, display_command};
use crate::core::scheduler::{Delay, DelayUnit, JobHandle, JobQueue, RollbackCommand};
use crate::core::store::{FsRuleStore, Promotion, RuleStore, RulesetLocation};
use crate::core::verify::VerifyResult;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PFGUARD_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PFGUARD_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Scripted [`CommandRunner`] for tests.
///
/// Replays queued outputs in order and records every invocation as a
/// rendered command line. When the queue is empty every call succeeds with
/// no output.
#[derive(Default)]
pub struct FakeRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<String>>,
    stdin: Mutex<Vec<Option<String>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the output returned by the next unanswered call.
    pub fn push(&self, output: CommandOutput) {
        self.responses.lock().unwrap().push_back(output);
    }

    /// Queues a successful call printing `stdout`.
    pub fn push_ok(&self, stdout: &str) {
        self.push(ok_output(stdout));
    }

    /// Queues a failed call printing `stderr`.
    pub fn push_err(&self, code: i32, stderr: &str) {
        self.push(CommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Stdin passed to each call, in call order
    pub fn stdin(&self) -> Vec<Option<String>> {
        self.stdin.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(display_command(program, args));
        self.stdin.lock().unwrap().push(stdin.map(String::from));
        let response = self.responses.lock().unwrap().pop_front();
        Ok(response.unwrap_or_else(|| ok_output("")))
    }
}

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Writes `content` to `dir/name`, creating parent directories.
pub fn write_rules(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// Ordered record of side effects shared between fakes
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::default()
}

fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

/// Knobs and observable state of a [`FakeFilter`]
#[derive(Debug, Default)]
pub struct FilterHost {
    pub enabled: bool,
    pub loaded: Option<PathBuf>,
    pub fail_load: bool,
    pub fail_status: bool,
}

/// In-memory [`FilterController`]
///
/// A ruleset is rejected when its file contains `syntax error`.
pub struct FakeFilter {
    pub host: Mutex<FilterHost>,
    journal: Journal,
}

impl FakeFilter {
    pub fn new(journal: &Journal) -> Self {
        Self {
            host: Mutex::new(FilterHost::default()),
            journal: Arc::clone(journal),
        }
    }

    pub fn running(journal: &Journal, rules: &Path) -> Self {
        let filter = Self::new(journal);
        {
            let mut host = filter.host.lock().unwrap();
            host.enabled = true;
            host.loaded = Some(rules.to_path_buf());
        }
        filter
    }

    pub fn loaded(&self) -> Option<PathBuf> {
        self.host.lock().unwrap().loaded.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.host.lock().unwrap().enabled
    }

    fn load(&self, rules: &Path, enable: bool) -> Result<String> {
        let verb = if enable { "enable" } else { "reload" };
        record(&self.journal, format!("{verb} {}", rules.display()));
        let mut host = self.host.lock().unwrap();
        if host.fail_load {
            return Err(Error::Execution {
                command: format!("pfctl -f {}", rules.display()),
                stderr: "pfctl: DIOCADDRULE: Device busy".into(),
                exit_code: Some(1),
            });
        }
        if enable {
            host.enabled = true;
        }
        host.loaded = Some(rules.to_path_buf());
        Ok("OK".into())
    }
}

impl FilterController for FakeFilter {
    async fn validate(&self, rules: &Path) -> Result<VerifyResult> {
        record(&self.journal, format!("validate {}", rules.display()));
        let content = std::fs::read_to_string(rules)?;
        if content.contains("syntax error") {
            let msg = format!("{}:1: syntax error", rules.display());
            return Err(Error::Validation {
                errors: vec![msg.clone()],
                stderr: msg,
            });
        }
        let mut result = VerifyResult::success();
        result.warnings = content
            .lines()
            .filter_map(|line| line.strip_prefix("# warning: "))
            .map(String::from)
            .collect();
        Ok(result)
    }

    async fn enable(&self, rules: &Path) -> Result<String> {
        self.validate(rules).await?;
        self.load(rules, true)
    }

    async fn reload(&self, rules: &Path) -> Result<String> {
        self.validate(rules).await?;
        self.load(rules, false)
    }

    async fn disable(&self) -> Result<String> {
        record(&self.journal, "disable".into());
        self.host.lock().unwrap().enabled = false;
        Ok("OK".into())
    }

    async fn status(&self) -> Result<FilterState> {
        let host = self.host.lock().unwrap();
        if host.fail_status {
            return Err(Error::Execution {
                command: "pfctl -s info".into(),
                stderr: "pfctl: /dev/pf: Permission denied".into(),
                exit_code: Some(1),
            });
        }
        Ok(if host.enabled {
            FilterState::Enabled
        } else {
            FilterState::Disabled
        })
    }

    fn load_command(&self, rules: &Path) -> RollbackCommand {
        RollbackCommand::new(
            "pfctl",
            vec!["-f".to_string(), rules.to_string_lossy().into_owned()],
        )
    }
}

#[derive(Debug, Clone)]
pub struct FakeJob {
    pub id: String,
    pub tag: String,
    pub delay: Delay,
    pub command: RollbackCommand,
}

/// In-memory [`JobQueue`]
#[derive(Default)]
pub struct FakeQueue {
    pub jobs: Mutex<Vec<FakeJob>>,
    pub fail_schedule: Mutex<bool>,
    next_id: Mutex<u32>,
    journal: Journal,
}

impl FakeQueue {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: Arc::clone(journal),
            ..Self::default()
        }
    }

    /// Adds a job behind the scheduler adapter's back.
    pub fn inject(&self, tag: &str, command: RollbackCommand) {
        let id = self.next_id();
        self.jobs.lock().unwrap().push(FakeJob {
            id,
            tag: tag.to_string(),
            delay: Delay::new(1, DelayUnit::Minutes).unwrap(),
            command,
        });
    }

    fn next_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        next.to_string()
    }
}

impl JobQueue for FakeQueue {
    async fn schedule(&self, delay: &Delay, command: &RollbackCommand, tag: &str) -> Result<()> {
        record(&self.journal, format!("schedule {tag} +{delay}"));
        if *self.fail_schedule.lock().unwrap() {
            return Err(Error::Execution {
                command: format!("at now + {delay}"),
                stderr: "Can't open /var/run/atd.pid to signal atd. No atd running?".into(),
                exit_code: Some(1),
            });
        }
        let id = self.next_id();
        self.jobs.lock().unwrap().push(FakeJob {
            id,
            tag: tag.to_string(),
            delay: *delay,
            command: command.clone(),
        });
        Ok(())
    }

    async fn cancel_all(&self, tag: &str) -> Result<usize> {
        record(&self.journal, format!("cancel {tag}"));
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|job| job.tag != tag);
        Ok(before - jobs.len())
    }

    async fn list(&self, tag: &str) -> Result<Vec<JobHandle>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.tag == tag)
            .map(|job| JobHandle {
                id: job.id.clone(),
                scheduled: format!("now + {}", job.delay),
            })
            .collect())
    }
}

/// [`RuleStore`] that journals promotions before delegating to the filesystem
pub struct JournaledStore {
    inner: FsRuleStore,
    journal: Journal,
}

impl JournaledStore {
    pub fn new(journal: &Journal) -> Self {
        Self {
            inner: FsRuleStore::new(),
            journal: Arc::clone(journal),
        }
    }
}

impl RuleStore for JournaledStore {
    fn backup(&self, good: &RulesetLocation) -> Result<Option<PathBuf>> {
        self.inner.backup(good)
    }

    fn promote(
        &self,
        candidate: &RulesetLocation,
        destination: &RulesetLocation,
    ) -> Result<Promotion> {
        record(&self.journal, format!("promote {candidate} -> {destination}"));
        self.inner.promote(candidate, destination)
    }

    fn rewrite_references(
        &self,
        destination: &RulesetLocation,
        candidate_path: &str,
        destination_path: &str,
    ) -> Result<usize> {
        self.inner
            .rewrite_references(destination, candidate_path, destination_path)
    }
}
