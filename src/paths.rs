//! XDG-compliant path resolution for sria.
//!
//! Provides [`SriaPaths`], the global directories the CLI keeps its
//! configuration and durable store in, following the XDG Base Directory
//! Specification.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(sria::paths::no_home),
        help("Set the HOME environment variable or pass --data-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(sria::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Global XDG-compliant directories for sria.
#[derive(Debug, Clone)]
pub struct SriaPaths {
    /// `$XDG_CONFIG_HOME/sria/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/sria/`
    pub data_dir: PathBuf,
}

impl SriaPaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join("sria");

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join("sria");

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Every directory under a single root. Used for `--data-dir` and tests.
    pub fn from_root(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    /// Create all base directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [&self.config_dir, &self.data_dir] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Path to the config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Path to the durable agent store.
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("sria.redb")
    }
}
