//! Directory helpers following the XDG Base Directory specification
//!
//! - Config: `~/.config/pfguard/` - settings
//! - State: `~/.local/state/pfguard/` - audit log
//!
//! Running as root (the usual case for a firewall tool) these resolve under
//! root's home.

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "pfguard", "pfguard")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Creates the config and state directories with mode 0700.
pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.recursive(true);

        for dir in [get_config_dir(), get_state_dir()].into_iter().flatten() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        for dir in [get_config_dir(), get_state_dir()].into_iter().flatten() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}
