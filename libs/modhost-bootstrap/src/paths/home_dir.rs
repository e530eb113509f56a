//! Resolution of the server home directory.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("HOME environment variable is not set")]
    HomeMissing,
    #[error("APPDATA environment variable is not set")]
    AppDataMissing,
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn user_home() -> Result<String, HomeDirError> {
    #[cfg(target_os = "windows")]
    {
        env::var("USERPROFILE")
            .or_else(|_| env::var("HOME"))
            .map_err(|_| HomeDirError::HomeMissing)
    }
    #[cfg(not(target_os = "windows"))]
    {
        env::var("HOME").map_err(|_| HomeDirError::HomeMissing)
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return Ok(PathBuf::from(user_home()?));
    }
    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        return Ok(Path::new(&user_home()?).join(rest));
    }
    Ok(PathBuf::from(raw))
}

/// Resolve the server home directory.
///
/// When `config_home` is given, `~` is expanded and the result must be an
/// absolute path. When absent, the platform default is used:
/// `%APPDATA%/<default_subdir>` on Windows, `$HOME/<default_subdir>`
/// elsewhere. With `create`, the directory is created if missing.
pub fn resolve_home_dir(
    config_home: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match config_home {
        Some(raw) => {
            let expanded = expand_tilde(&raw)?;
            if !expanded.is_absolute() {
                return Err(HomeDirError::AbsoluteRequired(
                    expanded.to_string_lossy().into(),
                ));
            }
            expanded
        }
        None => {
            #[cfg(target_os = "windows")]
            {
                let appdata = env::var("APPDATA").map_err(|_| HomeDirError::AppDataMissing)?;
                Path::new(&appdata).join(default_subdir)
            }
            #[cfg(not(target_os = "windows"))]
            {
                Path::new(&user_home()?).join(default_subdir)
            }
        }
    };

    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}
