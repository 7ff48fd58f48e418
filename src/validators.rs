//! Input validation for values that end up in privileged commands
//!
//! Tags, ruleset paths and program names are all embedded in the rollback
//! job script that `at` runs as root later, so they are checked here before
//! anything is scheduled.

use std::path::Path;

/// Longest accepted rollback tag
pub const MAX_TAG_LEN: usize = 32;

/// Validates a rollback job tag.
///
/// SECURITY: ASCII only, so the tag is safe inside a shell comment line and
/// cannot smuggle a newline into the job script.
///
/// # Examples
///
/// ```
/// use pfguard::validators::validate_tag;
///
/// assert!(validate_tag("pf").is_ok());
/// assert!(validate_tag("pf\nrm -rf /").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if the tag is empty, longer than [`MAX_TAG_LEN`], or holds
/// anything besides ASCII letters, digits, `-` and `_`.
pub fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("Rollback tag cannot be empty".to_string());
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(format!("Rollback tag too long (max {MAX_TAG_LEN} characters)"));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(format!("Rollback tag '{tag}' contains invalid characters"));
    }
    Ok(())
}

/// Validates a ruleset location from configuration or the command line.
///
/// # Errors
///
/// Returns `Err` if the path is relative, or contains NUL or a line break.
pub fn validate_rules_path(path: &Path) -> Result<(), String> {
    let text = path.to_string_lossy();
    if text.is_empty() {
        return Err("Ruleset path cannot be empty".to_string());
    }
    if text.contains(['\0', '\n', '\r']) {
        return Err(format!(
            "Ruleset path {} contains control characters",
            text.escape_debug()
        ));
    }
    if !path.is_absolute() {
        return Err(format!("Ruleset path {text} must be absolute"));
    }
    Ok(())
}

/// Validates a configured helper program (`pfctl`, `at`, ...).
///
/// Bare names are looked up on `PATH`; anything with a `/` must be absolute.
///
/// # Errors
///
/// Returns `Err` for empty names, whitespace or control characters, and
/// relative paths.
pub fn validate_program(program: &str) -> Result<(), String> {
    if program.is_empty() {
        return Err("Program name cannot be empty".to_string());
    }
    if program.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!(
            "Program {} contains whitespace or control characters",
            program.escape_debug()
        ));
    }
    if program.contains('/') && !program.starts_with('/') {
        return Err(format!("Program path {program} must be absolute"));
    }
    Ok(())
}
