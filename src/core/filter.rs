//! Live packet filter control through `pfctl`
//!
//! No state is cached here: every call is a fresh privileged invocation, and
//! rules are always dry-run before they are loaded.

use crate::core::error::{Error, Result};
use crate::core::runner::{CommandRunner, display_command};
use crate::core::scheduler::RollbackCommand;
use crate::core::verify::{VerifyResult, verify_ruleset};
use std::future::Future;
use std::path::Path;
use tracing::{info, warn};

/// Marker pfctl prints in `-s info` while the filter is running
const ENABLED_MARKER: &str = "Status: Enabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FilterState {
    Disabled,
    Enabled,
}

impl FilterState {
    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// The primitive operations against the live packet filter
pub trait FilterController: Send + Sync {
    /// Dry-run syntax check; fails with [`Error::Validation`] when rejected.
    fn validate(&self, rules: &Path) -> impl Future<Output = Result<VerifyResult>> + Send;

    /// Validates, then enables the filter with `rules` loaded.
    fn enable(&self, rules: &Path) -> impl Future<Output = Result<String>> + Send;

    /// Validates, then loads `rules` without toggling the enabled state.
    fn reload(&self, rules: &Path) -> impl Future<Output = Result<String>> + Send;

    fn disable(&self) -> impl Future<Output = Result<String>> + Send;

    /// Queries the live status. A failed query is an error, never `Disabled`.
    fn status(&self) -> impl Future<Output = Result<FilterState>> + Send;

    /// The command the rollback job runs to load `rules`.
    fn load_command(&self, rules: &Path) -> RollbackCommand;
}

/// [`FilterController`] driving the `pfctl` binary
pub struct Pfctl<R> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> Pfctl<R> {
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Runs pfctl and returns stdout, or `OK` when it printed nothing.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let command = display_command(&self.program, args);
        let output = self
            .runner
            .run(&self.program, args, None)
            .await?
            .into_result(&command)?;

        if output.stdout.trim().is_empty() {
            Ok("OK".to_string())
        } else {
            Ok(output.stdout)
        }
    }

    async fn checked_load(&self, rules: &Path, enable: bool) -> Result<String> {
        self.validate(rules).await?;

        let path = rules.to_string_lossy();
        let mut args = Vec::with_capacity(3);
        if enable {
            args.push("-e");
        }
        args.extend(["-f", &*path]);
        let result = self.run(&args).await;
        match &result {
            Ok(_) => info!("Loaded {} (enable: {enable})", rules.display()),
            Err(e) => warn!("Loading {} failed: {e}", rules.display()),
        }
        result
    }
}

impl<R: CommandRunner> FilterController for Pfctl<R> {
    async fn validate(&self, rules: &Path) -> Result<VerifyResult> {
        let result = verify_ruleset(&self.runner, &self.program, rules).await?;
        if result.success {
            Ok(result)
        } else {
            Err(Error::Validation {
                errors: result.errors,
                stderr: result.stderr,
            })
        }
    }

    async fn enable(&self, rules: &Path) -> Result<String> {
        self.checked_load(rules, true).await
    }

    async fn reload(&self, rules: &Path) -> Result<String> {
        self.checked_load(rules, false).await
    }

    async fn disable(&self) -> Result<String> {
        let result = self.run(&["-d"]).await;
        if result.is_ok() {
            info!("Packet filter disabled");
        }
        result
    }

    async fn status(&self) -> Result<FilterState> {
        let info = self.run(&["-s", "info"]).await?;
        if info.contains(ENABLED_MARKER) {
            Ok(FilterState::Enabled)
        } else {
            Ok(FilterState::Disabled)
        }
    }

    fn load_command(&self, rules: &Path) -> RollbackCommand {
        RollbackCommand::new(
            self.program.clone(),
            vec!["-f".to_string(), rules.to_string_lossy().into_owned()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::FakeRunner;

    fn pfctl() -> Pfctl<FakeRunner> {
        Pfctl::new(FakeRunner::new(), "/sbin/pfctl")
    }

    #[tokio::test]
    async fn test_enable_validates_first() {
        let pf = pfctl();
        pf.runner.push_ok("");
        pf.runner.push_ok("");

        let out = pf.enable(Path::new("/etc/pf.conf")).await.unwrap();

        assert_eq!(out, "OK");
        assert_eq!(
            pf.runner.calls(),
            vec![
                "/sbin/pfctl -n -f /etc/pf.conf",
                "/sbin/pfctl -e -f /etc/pf.conf"
            ]
        );
    }

    #[tokio::test]
    async fn test_reload_does_not_toggle() {
        let pf = pfctl();

        pf.reload(Path::new("/etc/pf.conf.new")).await.unwrap();

        assert_eq!(
            pf.runner.calls(),
            vec![
                "/sbin/pfctl -n -f /etc/pf.conf.new",
                "/sbin/pfctl -f /etc/pf.conf.new"
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_rules_are_never_loaded() {
        let pf = pfctl();
        pf.runner
            .push_err(1, "/etc/pf.conf.new:2: syntax error\n");

        let err = pf.reload(Path::new("/etc/pf.conf.new")).await.unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(pf.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_enable_conflict_is_execution_error() {
        let pf = pfctl();
        pf.runner.push_ok("");
        pf.runner.push_err(1, "pfctl: pf already enabled\n");

        let err = pf.enable(Path::new("/etc/pf.conf")).await.unwrap_err();

        match err {
            Error::Execution { stderr, .. } => assert_eq!(stderr, "pfctl: pf already enabled"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_disable() {
        let pf = pfctl();
        pf.runner.push_ok("");

        assert_eq!(pf.disable().await.unwrap(), "OK");
        assert_eq!(pf.runner.calls(), vec!["/sbin/pfctl -d"]);
    }

    #[tokio::test]
    async fn test_disable_failure_is_surfaced() {
        let pf = pfctl();
        pf.runner.push_err(1, "pfctl: pf not enabled");

        assert!(matches!(
            pf.disable().await,
            Err(Error::Execution { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_enabled() {
        let pf = pfctl();
        pf.runner
            .push_ok("Status: Enabled for 0 days 01:02:03           Debug: err\n");

        assert_eq!(pf.status().await.unwrap(), FilterState::Enabled);
    }

    #[tokio::test]
    async fn test_status_disabled() {
        let pf = pfctl();
        pf.runner.push_ok("Status: Disabled for 0 days 00:00:10\n");

        assert_eq!(pf.status().await.unwrap(), FilterState::Disabled);
    }

    #[tokio::test]
    async fn test_status_failure_is_not_disabled() {
        let pf = pfctl();
        pf.runner.push_err(1, "pfctl: /dev/pf: Permission denied");

        assert!(pf.status().await.is_err());
    }

    #[test]
    fn test_load_command() {
        let pf = pfctl();
        let cmd = pf.load_command(Path::new("/etc/pf.conf"));
        assert_eq!(cmd.to_shell_line(), "'/sbin/pfctl' '-f' '/etc/pf.conf'");
    }
}
