//! Privilege elevation for pf and scheduler operations
//!
//! pfguard may run as an unprivileged operator and only elevates the programs
//! it drives: `pfctl` for the packet filter and `at`/`atq`/`atrm` for the
//! rollback job.
//!
//! # Elevation Strategy
//!
//! - **Root**: programs run directly
//! - **Preferred**: `doas` when available (OpenBSD base system)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `PFGUARD_ELEVATION_METHOD`: Force a specific elevation method (`doas` or `sudo`).
//!   Useful for scripts with NOPASSWD/nopass rules.
//!   Example: `PFGUARD_ELEVATION_METHOD=sudo pfguard confirm`
//!
//! - `PFGUARD_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - The elevation binary is checked for availability before use
//! - Audit logging tracks all privileged operations (via caller)

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Neither doas nor sudo found in PATH
    #[error("No elevation method available - install doas or sudo, or run as root")]
    NoMethodAvailable,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `PFGUARD_ELEVATION_METHOD`
    #[error("Invalid PFGUARD_ELEVATION_METHOD '{0}'. Valid options: doas, sudo")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(method: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    cmd
}

/// Creates a command for `program` that runs with root privileges.
///
/// Arguments are passed directly without shell interpretation. Callers must
/// validate anything user-supplied before it reaches here.
///
/// # Testing
///
/// Set `PFGUARD_NO_ELEVATION=1` to run `program` directly.
pub fn create_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    if std::env::var("PFGUARD_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    if let Ok(method) = std::env::var("PFGUARD_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "doas" | "sudo" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    if binary_exists("doas") {
        return Ok(wrapped("doas", program, args));
    }
    if binary_exists("sudo") {
        return Ok(wrapped("sudo", program, args));
    }
    Err(ElevationError::NoMethodAvailable)
}
