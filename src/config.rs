use crate::core::error::{Error, Result};
use crate::core::scheduler::Delay;
use crate::utils::get_config_dir;
use crate::validators::{validate_program, validate_rules_path, validate_tag};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an alternative settings file
pub const CONFIG_ENV: &str = "PFGUARD_CONFIG";

const CONFIG_FILE: &str = "config.json";

/// Host settings for pfguard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_pfctl")]
    pub pfctl_path: String,
    #[serde(default = "default_at")]
    pub at_path: String,
    #[serde(default = "default_atq")]
    pub atq_path: String,
    #[serde(default = "default_atrm")]
    pub atrm_path: String,
    /// Rules the rollback job reloads and `confirm` promotes into
    #[serde(default = "default_known_good")]
    pub known_good: PathBuf,
    /// Candidate used when `apply`/`confirm` get no path
    #[serde(default = "default_candidate")]
    pub candidate: PathBuf,
    #[serde(default = "default_delay")]
    pub default_delay: String,
    /// Tag identifying this host's rollback job in the `at` queue
    #[serde(default = "default_tag")]
    pub rollback_tag: String,
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pfctl_path: default_pfctl(),
            at_path: default_at(),
            atq_path: default_atq(),
            atrm_path: default_atrm(),
            known_good: default_known_good(),
            candidate: default_candidate(),
            default_delay: default_delay(),
            rollback_tag: default_tag(),
            audit_log: true,
        }
    }
}

fn default_pfctl() -> String {
    option_env!("PFGUARD_SYSTEM_PFCTL_PATH")
        .unwrap_or("/sbin/pfctl")
        .to_string()
}

fn default_at() -> String {
    "at".to_string()
}

fn default_atq() -> String {
    "atq".to_string()
}

fn default_atrm() -> String {
    "atrm".to_string()
}

fn default_known_good() -> PathBuf {
    PathBuf::from("/etc/pf.conf")
}

fn default_candidate() -> PathBuf {
    PathBuf::from("/etc/pf.conf.new")
}

fn default_delay() -> String {
    "10 min".to_string()
}

fn default_tag() -> String {
    "pf".to_string()
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Rejects settings that would put unsafe text into a scheduled job.
    pub fn validate(&self) -> Result<()> {
        for program in [
            &self.pfctl_path,
            &self.at_path,
            &self.atq_path,
            &self.atrm_path,
        ] {
            validate_program(program).map_err(Error::Config)?;
        }
        validate_rules_path(&self.known_good).map_err(Error::Config)?;
        validate_rules_path(&self.candidate).map_err(Error::Config)?;
        validate_tag(&self.rollback_tag).map_err(Error::Config)?;
        self.default_delay
            .parse::<Delay>()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }
}

/// Settings file location: `explicit`, else `$PFGUARD_CONFIG`, else the XDG
/// config directory.
pub fn settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    get_config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Loads settings from `path`, or defaults when the file does not exist.
///
/// A file that exists but cannot be parsed is an error: silently falling
/// back to defaults could point the rollback at the wrong rules.
pub async fn load_settings(path: &Path) -> Result<Settings> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        Err(e) => return Err(e.into()),
    };

    let settings: Settings = serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    settings.validate()?;
    Ok(settings)
}

/// Saves settings using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_settings(settings: &Settings, path: &Path) -> Result<()> {
    settings.validate()?;
    let json = serde_json::to_string_pretty(settings)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");

    // Create file with restrictive permissions from the start so it is never
    // briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })?;
    Ok(())
}
