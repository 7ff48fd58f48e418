//! Rollback job scheduling
//!
//! The waiting happens outside this process: a [`JobQueue`] hands the
//! rollback command to the host's deferred-job facility (`at`), and a
//! [`TaggedScheduler`] narrows that queue down to the single reserved tag the
//! safe-apply cycle owns.

use crate::core::error::{Error, Result};
use crate::core::runner::{CommandRunner, display_command};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Marker line written into every job script, followed by the tag
pub const TAG_MARKER: &str = "# pfguard-tag: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum DelayUnit {
    #[strum(
        to_string = "minutes",
        serialize = "m",
        serialize = "min",
        serialize = "mins",
        serialize = "minute"
    )]
    Minutes,
    #[strum(
        to_string = "hours",
        serialize = "h",
        serialize = "hr",
        serialize = "hrs",
        serialize = "hour"
    )]
    Hours,
    #[strum(to_string = "days", serialize = "d", serialize = "day")]
    Days,
    #[strum(to_string = "weeks", serialize = "w", serialize = "week")]
    Weeks,
}

/// How long the rollback job waits before firing
///
/// Parsed from strings such as `10 min`, `2h` or `1 day`; a bare number is
/// minutes. `at` cannot schedule below minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay {
    amount: u32,
    unit: DelayUnit,
}

impl Delay {
    /// # Errors
    ///
    /// Returns [`Error::InvalidDelay`] when `amount` is zero.
    pub fn new(amount: u32, unit: DelayUnit) -> Result<Self> {
        if amount == 0 {
            return Err(Error::InvalidDelay(format!("0 {unit}")));
        }
        Ok(Self { amount, unit })
    }

    pub fn amount(&self) -> u32 {
        self.amount
    }

    pub fn unit(&self) -> DelayUnit {
        self.unit
    }

    /// `at` time specification arguments: `now + <n> <unit>`
    pub fn at_timespec(&self) -> [String; 4] {
        [
            "now".to_string(),
            "+".to_string(),
            self.amount.to_string(),
            self.unit.to_string(),
        ]
    }
}

impl FromStr for Delay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidDelay(s.to_string());

        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed).trim_start();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(digits_end);

        let amount: u32 = digits.parse().map_err(|_| invalid())?;
        let unit = unit.trim();
        let unit = if unit.is_empty() {
            DelayUnit::Minutes
        } else {
            // "minutes"/"hours"/... parse as written; plural aliases of the short forms don't
            DelayUnit::from_str(unit)
                .or_else(|_| DelayUnit::from_str(unit.trim_end_matches('s')))
                .map_err(|_| invalid())?
        };

        Self::new(amount, unit).map_err(|_| invalid())
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

/// A program invocation run by the rollback job when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RollbackCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Single-quoted `sh` command line, safe for any argument content.
    pub fn to_shell_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| format!("'{}'", word.replace('\'', r"'\''")))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for RollbackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A job sitting in the deferred-job queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    /// Queue listing line for the job, as the scheduler printed it
    pub scheduled: String,
}

/// External deferred-job facility
pub trait JobQueue: Send + Sync {
    fn schedule(
        &self,
        delay: &Delay,
        command: &RollbackCommand,
        tag: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Removes every job carrying `tag`, returning how many were removed.
    fn cancel_all(&self, tag: &str) -> impl Future<Output = Result<usize>> + Send;

    fn list(&self, tag: &str) -> impl Future<Output = Result<Vec<JobHandle>>> + Send;
}

/// The rollback safeguard as seen by the coordinator: one reserved tag
pub trait RollbackScheduler: Send + Sync {
    /// Parses a delay string. Called before the filter is touched.
    fn parse_delay(&self, delay: &str) -> Result<Delay> {
        delay.parse()
    }

    /// Replaces any job under the tag with one running `command` after `delay`.
    fn arm(
        &self,
        delay: &Delay,
        command: &RollbackCommand,
    ) -> impl Future<Output = Result<JobHandle>> + Send;

    /// Removes all jobs under the tag. Zero removed is not an error.
    fn cancel(&self) -> impl Future<Output = Result<usize>> + Send;

    /// Jobs currently under the tag; more than one is reported as found.
    fn pending_count(&self) -> impl Future<Output = Result<usize>> + Send;
}

/// [`RollbackScheduler`] over any [`JobQueue`], scoped to one tag
pub struct TaggedScheduler<Q> {
    queue: Q,
    tag: String,
}

impl<Q: JobQueue> TaggedScheduler<Q> {
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if `tag` is not a safe job tag.
    pub fn new(queue: Q, tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        crate::validators::validate_tag(&tag).map_err(Error::Precondition)?;
        Ok(Self { queue, tag })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Jobs currently under the tag
    pub async fn jobs(&self) -> Result<Vec<JobHandle>> {
        self.queue.list(&self.tag).await
    }
}

impl<Q: JobQueue> RollbackScheduler for TaggedScheduler<Q> {
    async fn arm(&self, delay: &Delay, command: &RollbackCommand) -> Result<JobHandle> {
        let cleared = self.queue.cancel_all(&self.tag).await?;
        if cleared > 0 {
            info!("Cleared {cleared} previous rollback job(s) under tag '{}'", self.tag);
        }

        self.queue.schedule(delay, command, &self.tag).await?;

        let mut jobs = self.queue.list(&self.tag).await?;
        match jobs.len() {
            1 => {
                let job = jobs.remove(0);
                info!(
                    "Rollback armed: job {} runs `{command}` in {delay}",
                    job.id
                );
                Ok(job)
            }
            0 => Err(Error::Precondition(format!(
                "rollback job under tag '{}' is missing right after scheduling",
                self.tag
            ))),
            n => Err(Error::Precondition(format!(
                "more than one rollback job under tag '{}' after arming ({n} found)",
                self.tag
            ))),
        }
    }

    async fn cancel(&self) -> Result<usize> {
        let removed = self.queue.cancel_all(&self.tag).await?;
        if removed > 0 {
            info!("Cancelled {removed} rollback job(s) under tag '{}'", self.tag);
        } else {
            debug!("No rollback job under tag '{}' to cancel", self.tag);
        }
        Ok(removed)
    }

    async fn pending_count(&self) -> Result<usize> {
        let count = self.queue.list(&self.tag).await?.len();
        if count > 1 {
            warn!("{count} rollback jobs found under tag '{}'", self.tag);
        }
        Ok(count)
    }
}

/// [`JobQueue`] backed by `at`, `atq` and `atrm`
///
/// Jobs are recognised by the [`TAG_MARKER`] line in their script, read back
/// with `at -c <job>`.
pub struct AtQueue<R> {
    runner: R,
    at: String,
    atq: String,
    atrm: String,
}

impl<R: CommandRunner> AtQueue<R> {
    pub fn new(
        runner: R,
        at: impl Into<String>,
        atq: impl Into<String>,
        atrm: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            at: at.into(),
            atq: atq.into(),
            atrm: atrm.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let command = display_command(program, args);
        let output = self
            .runner
            .run(program, args, stdin)
            .await?
            .into_result(&command)?;
        Ok(output.stdout)
    }

    async fn carries_tag(&self, id: &str, tag: &str) -> bool {
        let marker = format!("{TAG_MARKER}{tag}");
        match self.run(&self.at, &["-c", id], None).await {
            Ok(body) => body.lines().any(|line| line.trim_end() == marker),
            Err(e) => {
                // The job may have fired between atq and at -c
                debug!("Could not read job {id}: {e}");
                false
            }
        }
    }
}

impl<R: CommandRunner> JobQueue for AtQueue<R> {
    async fn schedule(&self, delay: &Delay, command: &RollbackCommand, tag: &str) -> Result<()> {
        let script = format!("{TAG_MARKER}{tag}\n{}\n", command.to_shell_line());
        let timespec = delay.at_timespec();
        let args: Vec<&str> = timespec.iter().map(String::as_str).collect();

        let command_line = display_command(&self.at, &args);
        let output = self
            .runner
            .run(&self.at, &args, Some(&script))
            .await?
            .into_result(&command_line)?;

        // at reports the job on stderr ("job 12 at ...")
        match parse_job_id(&output.stderr).or_else(|| parse_job_id(&output.stdout)) {
            Some(id) => debug!("Scheduled at job {id} with tag '{tag}'"),
            None => debug!("Scheduled at job with tag '{tag}'"),
        }
        Ok(())
    }

    async fn cancel_all(&self, tag: &str) -> Result<usize> {
        let jobs = self.list(tag).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = jobs.iter().map(|job| job.id.as_str()).collect();
        self.run(&self.atrm, &ids, None).await?;
        Ok(jobs.len())
    }

    async fn list(&self, tag: &str) -> Result<Vec<JobHandle>> {
        let listing = self.run(&self.atq, &[], None).await?;

        let mut tagged = Vec::new();
        for job in parse_atq(&listing) {
            if self.carries_tag(&job.id, tag).await {
                tagged.push(job);
            }
        }
        Ok(tagged)
    }
}

/// Extracts the id from `job <id> at <time>`.
fn parse_job_id(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "job" {
                return words.next().map(String::from);
            }
        }
        None
    })
}

fn is_bsd_job_id(word: &str) -> bool {
    word.split_once('.').is_some_and(|(secs, queue)| {
        !secs.is_empty()
            && secs.chars().all(|c| c.is_ascii_digit())
            && queue.len() == 1
            && queue.chars().all(|c| c.is_ascii_alphabetic())
    })
}

fn is_number(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_ascii_digit())
}

/// Parses `atq` output from Linux (`<id>\t<date> <queue> <user>`),
/// OpenBSD (`<rank> <date> <owner> <secs>.<queue> <queue>`) and FreeBSD
/// (`<date> <owner> <queue> <id>`).
fn parse_atq(listing: &str) -> Vec<JobHandle> {
    listing
        .lines()
        .filter_map(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            let first = *words.first()?;
            if matches!(first, "Rank" | "Date") {
                return None;
            }

            let id = if is_number(first) {
                first
            } else if let Some(bsd) = words.iter().copied().find(|w| is_bsd_job_id(w)) {
                bsd
            } else {
                words.last().copied().filter(|w| is_number(w))?
            };

            Some(JobHandle {
                id: id.to_string(),
                scheduled: line.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{FakeRunner, ok_output};

    fn queue() -> AtQueue<FakeRunner> {
        AtQueue::new(FakeRunner::new(), "at", "atq", "atrm")
    }

    fn pfctl_reload() -> RollbackCommand {
        RollbackCommand::new("/sbin/pfctl", vec!["-f".into(), "/etc/pf.conf".into()])
    }

    #[test]
    fn test_parse_delay_forms() {
        let cases = [
            ("10 min", 10, DelayUnit::Minutes),
            ("10min", 10, DelayUnit::Minutes),
            ("5", 5, DelayUnit::Minutes),
            ("2h", 2, DelayUnit::Hours),
            ("2 Hours", 2, DelayUnit::Hours),
            ("1 day", 1, DelayUnit::Days),
            ("3 mins", 3, DelayUnit::Minutes),
            ("2 hrs", 2, DelayUnit::Hours),
            ("+15 minutes", 15, DelayUnit::Minutes),
            ("1w", 1, DelayUnit::Weeks),
        ];
        for (input, amount, unit) in cases {
            let delay: Delay = input.parse().unwrap_or_else(|e| panic!("{input}: {e}"));
            assert_eq!(delay.amount(), amount, "{input}");
            assert_eq!(delay.unit(), unit, "{input}");
        }
    }

    #[test]
    fn test_parse_delay_rejects_garbage() {
        for input in ["", "soon", "0 min", "ten minutes", "10 fortnights", "-5 min", "5 5"] {
            assert!(
                matches!(input.parse::<Delay>(), Err(Error::InvalidDelay(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_delay_rendering() {
        let delay: Delay = "10 min".parse().unwrap();
        assert_eq!(delay.to_string(), "10 minutes");
        assert_eq!(delay.at_timespec(), ["now", "+", "10", "minutes"]);
    }

    #[test]
    fn test_shell_line_quotes_arguments() {
        let cmd = RollbackCommand::new(
            "/sbin/pfctl",
            vec!["-f".into(), "/etc/it's pf.conf".into()],
        );
        assert_eq!(cmd.to_shell_line(), r"'/sbin/pfctl' '-f' '/etc/it'\''s pf.conf'");
        assert_eq!(cmd.to_string(), "/sbin/pfctl -f /etc/it's pf.conf");
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            parse_job_id(
                "warning: commands will be executed using /bin/sh\n\
                 job 12 at Mon Oct 19 10:00:00 2026\n"
            ),
            Some("12".to_string())
        );
        assert_eq!(
            parse_job_id("job 1603100400.a at Mon Oct 19 10:00:00 2026"),
            Some("1603100400.a".to_string())
        );
        assert_eq!(parse_job_id("nothing here"), None);
    }

    #[test]
    fn test_parse_atq_linux() {
        let jobs = parse_atq(
            "12\tMon Oct 19 10:00:00 2026 a root\n13\tMon Oct 19 11:00:00 2026 a root\n",
        );
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["12", "13"]);
    }

    #[test]
    fn test_parse_atq_openbsd() {
        let listing = "Rank     Execution Date     Owner     Job         Queue\n\
                       1st      Oct 19, 2026 10:00   root      1792404000.a  a\n";
        let jobs = parse_atq(listing);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "1792404000.a");
    }

    #[test]
    fn test_parse_atq_freebsd() {
        let listing = "Date\t\t\t\tOwner\t\tQueue\tJob#\n\
                       Mon Oct 19 10:00:00 CEST 2026\troot\t\tc\t5\n";
        let jobs = parse_atq(listing);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "5");
    }

    #[test]
    fn test_parse_atq_empty() {
        assert!(parse_atq("").is_empty());
    }

    #[tokio::test]
    async fn test_schedule_writes_tagged_script() {
        let q = queue();
        q.runner.push(crate::core::runner::CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: "job 7 at Mon Oct 19 10:10:00 2026\n".into(),
        });

        q.schedule(&"10 min".parse().unwrap(), &pfctl_reload(), "pf")
            .await
            .unwrap();

        assert_eq!(q.runner.calls(), vec!["at now + 10 minutes"]);
        let script = q.runner.stdin()[0].clone().unwrap();
        assert_eq!(script, "# pfguard-tag: pf\n'/sbin/pfctl' '-f' '/etc/pf.conf'\n");
    }

    #[tokio::test]
    async fn test_list_filters_by_tag() {
        let q = queue();
        q.runner
            .push_ok("3\tMon Oct 19 10:00:00 2026 a root\n4\tMon Oct 19 10:05:00 2026 a root\n");
        q.runner.push_ok("#!/bin/sh\n# pfguard-tag: pf\n'/sbin/pfctl' '-f' '/etc/pf.conf'\n");
        q.runner.push_ok("#!/bin/sh\n# pfguard-tag: other\nbackup.sh\n");

        let jobs = q.list("pf").await.unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "3");
        assert_eq!(q.runner.calls(), vec!["atq", "at -c 3", "at -c 4"]);
    }

    #[tokio::test]
    async fn test_list_does_not_match_tag_prefix() {
        let q = queue();
        q.runner.push_ok("3\tMon Oct 19 10:00:00 2026 a root\n");
        q.runner.push_ok("# pfguard-tag: pf-staging\n");

        assert!(q.list("pf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_vanished_jobs() {
        let q = queue();
        q.runner.push_ok("3\tMon Oct 19 10:00:00 2026 a root\n");
        q.runner.push_err(1, "Cannot find jobid 3");

        assert!(q.list("pf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_removes_tagged_jobs() {
        let q = queue();
        q.runner.push_ok("3\tMon Oct 19 10:00:00 2026 a root\n");
        q.runner.push_ok("# pfguard-tag: pf\n");
        q.runner.push(ok_output(""));

        assert_eq!(q.cancel_all("pf").await.unwrap(), 1);
        assert_eq!(q.runner.calls(), vec!["atq", "at -c 3", "atrm 3"]);
    }

    #[tokio::test]
    async fn test_cancel_all_without_jobs_is_noop() {
        let q = queue();
        q.runner.push_ok("");

        assert_eq!(q.cancel_all("pf").await.unwrap(), 0);
        assert_eq!(q.runner.calls(), vec!["atq"]);
    }

    #[tokio::test]
    async fn test_atq_failure_is_surfaced() {
        let q = queue();
        q.runner.push_err(1, "atq: cannot open lockfile");

        assert!(matches!(q.list("pf").await, Err(Error::Execution { .. })));
    }

    #[test]
    fn test_tagged_scheduler_rejects_unsafe_tag() {
        assert!(TaggedScheduler::new(queue(), "pf; rm -rf /").is_err());
        assert!(TaggedScheduler::new(queue(), "pf").is_ok());
    }

    #[tokio::test]
    async fn test_arm_clears_then_schedules() {
        let scheduler = TaggedScheduler::new(queue(), "pf").unwrap();
        let runner = &scheduler.queue().runner;
        // cancel_all: one stale job
        runner.push_ok("3\tMon Oct 19 10:00:00 2026 a root\n");
        runner.push_ok("# pfguard-tag: pf\n");
        runner.push_ok("");
        // schedule
        runner.push_ok("");
        // verify
        runner.push_ok("4\tMon Oct 19 10:10:00 2026 a root\n");
        runner.push_ok("# pfguard-tag: pf\n");

        let job = scheduler
            .arm(&"10 min".parse().unwrap(), &pfctl_reload())
            .await
            .unwrap();

        assert_eq!(job.id, "4");
        assert_eq!(
            runner.calls(),
            vec![
                "atq",
                "at -c 3",
                "atrm 3",
                "at now + 10 minutes",
                "atq",
                "at -c 4"
            ]
        );
    }

    #[tokio::test]
    async fn test_arm_reports_duplicates() {
        let scheduler = TaggedScheduler::new(queue(), "pf").unwrap();
        let runner = &scheduler.queue().runner;
        runner.push_ok(""); // cancel_all: nothing
        runner.push_ok(""); // schedule
        runner.push_ok("4\tx\n5\ty\n");
        runner.push_ok("# pfguard-tag: pf\n");
        runner.push_ok("# pfguard-tag: pf\n");

        let err = scheduler
            .arm(&"10 min".parse().unwrap(), &pfctl_reload())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Precondition(ref msg) if msg.contains("more than one")));
    }

    #[tokio::test]
    async fn test_pending_count_reports_all() {
        let scheduler = TaggedScheduler::new(queue(), "pf").unwrap();
        let runner = &scheduler.queue().runner;
        runner.push_ok("4\tx\n5\ty\n");
        runner.push_ok("# pfguard-tag: pf\n");
        runner.push_ok("# pfguard-tag: pf\n");

        assert_eq!(scheduler.pending_count().await.unwrap(), 2);
    }
}
