/// Verification module for pf rulesets
///
/// Dry-runs a ruleset through `pfctl -n -f` before anything is loaded,
/// so a broken file never reaches the live filter.
use crate::core::error::Result;
use crate::core::runner::{CommandRunner, display_command};
use std::path::Path;
use tracing::{info, warn};

/// Result of a ruleset verification operation
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Raw diagnostic output, kept verbatim for remote troubleshooting
    pub stderr: String,
}

impl VerifyResult {
    /// Creates a successful verification result
    pub fn success() -> Self {
        Self {
            success: true,
            warnings: Vec::new(),
            errors: Vec::new(),
            stderr: String::new(),
        }
    }

    /// Creates a failed verification result with errors
    pub fn failure(errors: Vec<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            warnings: Vec::new(),
            errors,
            stderr: stderr.into(),
        }
    }
}

/// Verifies a ruleset without loading it using `pfctl -n -f`
///
/// # Errors
///
/// Returns `Err` only if pfctl cannot be executed. A syntactically broken
/// ruleset is an `Ok` result with `success == false`.
pub async fn verify_ruleset<R: CommandRunner>(
    runner: &R,
    pfctl: &str,
    rules: &Path,
) -> Result<VerifyResult> {
    let path = rules.to_string_lossy();
    let args = ["-n", "-f", &*path];
    info!("Verifying ruleset via {}", display_command(pfctl, &args));

    let output = runner.run(pfctl, &args, None).await?;

    if output.success() {
        info!("Ruleset verification passed");
        let mut result = VerifyResult::success();
        // pfctl reports non-fatal remarks (e.g. unresolved hostnames) on stderr
        result.warnings = parse_pfctl_errors(&output.stderr);
        Ok(result)
    } else {
        warn!("Ruleset verification failed: {}", output.stderr.trim_end());
        let mut errors = parse_pfctl_errors(&output.stderr);
        if errors.is_empty() {
            errors.push(format!(
                "pfctl rejected {} without diagnostics",
                rules.display()
            ));
        }
        Ok(VerifyResult::failure(errors, output.stderr.trim_end()))
    }
}

/// Parses pfctl error output into user-facing messages
///
/// Keeps the `file:line:` location, drops the `pfctl: ` prefix and the
/// trailing "rules not loaded" summary that carries no extra information.
fn parse_pfctl_errors(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("pfctl: ").to_string())
        .filter(|line| {
            let lower = line.to_lowercase();
            !(lower.starts_with("syntax error in config file") && lower.contains("not loaded"))
        })
        .collect()
}
