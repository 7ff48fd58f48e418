use std::path::PathBuf;
use thiserror::Error;

/// Core error types for pfguard
#[derive(Debug, Error)]
pub enum Error {
    /// Candidate ruleset rejected by the dry-run syntax check. Nothing was loaded.
    #[error("Ruleset validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String>, stderr: String },

    /// An external command ran and reported failure
    #[error("`{command}` failed ({}): {stderr}", exit_label(.exit_code))]
    Execution {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// A ruleset location does not resolve to a file
    #[error("Ruleset not found: {} is not a file", .0.display())]
    NotFound(PathBuf),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Copying a ruleset artifact failed; the destination was left untouched
    #[error("Copy of {} failed: {source}", .path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State found on the host contradicts what the protocol requires
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Rollback delay could not be understood by the scheduler
    #[error("Invalid delay '{0}': expected e.g. '10 min', '2h', '1 day'")]
    InvalidDelay(String),

    /// External program could not be started at all
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Settings file is unusable
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

#[allow(clippy::ref_option)]
fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit {code}"),
        None => "killed by signal".to_string(),
    }
}

/// Error categories reported to callers of apply/confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    #[strum(serialize = "validation error")]
    Validation,
    #[strum(serialize = "execution error")]
    Execution,
    #[strum(serialize = "not found")]
    NotFound,
    #[strum(serialize = "I/O error")]
    Io,
    #[strum(serialize = "precondition violation")]
    Precondition,
}

impl Error {
    /// Maps every variant onto one of the reported categories.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::InvalidDelay(_) => ErrorKind::Validation,
            Self::Execution { .. } | Self::Spawn { .. } | Self::Elevation(_) => {
                ErrorKind::Execution
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) | Self::Copy { .. } | Self::Serialization(_) => ErrorKind::Io,
            Self::Precondition(_) | Self::Config(_) | Self::Internal(_) => ErrorKind::Precondition,
        }
    }

    /// Captured diagnostic output of the failing command, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Validation { stderr, .. } | Self::Execution { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Known pfctl / at diagnostics and their translations
pub struct PfctlErrorPattern;

impl PfctlErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to control pf")
                .with_suggestion("Run as root, or configure doas/sudo for pfctl, at, atq and atrm")
                .with_suggestion("Force a method with PFGUARD_ELEVATION_METHOD=doas|sudo")
                .with_help("https://man.openbsd.org/pfctl");
        }

        if lower.contains("pf already enabled") {
            return ErrorTranslation::new("pf is already enabled")
                .with_suggestion("Use `pfguard reload` to load rules without toggling pf")
                .with_suggestion("`pfguard apply` picks enable or reload automatically");
        }

        if lower.contains("pf not enabled") {
            return ErrorTranslation::new("pf is already disabled")
                .with_suggestion("Check the current state with `pfguard status`");
        }

        if lower.contains("syntax error") || lower.contains("rules not loaded") {
            return ErrorTranslation::new("Invalid pf ruleset syntax")
                .with_suggestion("Run `pfctl -nf <file>` to see the offending line numbers")
                .with_suggestion("Check macros and tables are defined before use")
                .with_suggestion("Check include paths point at files that exist")
                .with_help("https://man.openbsd.org/pf.conf");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("A required program or ruleset file was not found")
                .with_suggestion("Verify pfctl_path, at_path, atq_path and atrm_path in the config")
                .with_suggestion("Verify the ruleset path exists (directories need a pf.conf)");
        }

        if lower.contains("atd") || lower.starts_with("at: ") {
            return ErrorTranslation::new("The at scheduler is unavailable")
                .with_suggestion("Make sure the at daemon / cron is running")
                .with_suggestion("Check /var/at/at.allow and /var/at/at.deny for your user")
                .with_help("https://man.openbsd.org/at");
        }

        if lower.contains("garbled time") || lower.contains("bad time") {
            return ErrorTranslation::new("The scheduler rejected the rollback delay")
                .with_suggestion("Use a delay such as '10 min', '2h' or '1 day'");
        }

        if lower.contains("resource busy") || lower.contains("device busy") {
            return ErrorTranslation::new("The pf device is busy")
                .with_suggestion("Another process may be modifying pf; wait and retry");
        }

        if lower.contains("more than one rollback job") {
            return ErrorTranslation::new("Several rollback jobs share the reserved tag")
                .with_suggestion("Inspect them with `atq` and `at -c <job>`")
                .with_suggestion("Remove stray jobs with `atrm`, then re-apply");
        }

        ErrorTranslation::new(format!("pf error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify pf is working: pfctl -s info")
            .with_help("https://man.openbsd.org/pfctl")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
