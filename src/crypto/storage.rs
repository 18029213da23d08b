use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ISSUER_KEY_FILE: &str = "issuer.pem";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key file not found: {0}")]
    NotFound(PathBuf),

    #[error("Could not determine {0} directory")]
    NoProjectDirs(&'static str),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "keyserver", "keyserver")
}

/// Get the default issuer key path for the current platform
pub fn default_issuer_key_path() -> Result<PathBuf> {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(ISSUER_KEY_FILE))
        .ok_or(StorageError::NoProjectDirs("data"))
}

/// Create the parent directory of `path` if it is missing
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Write key material, readable by the owner only on unix
pub fn save_key_secure(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_directory_exists(path)?;
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    std::fs::write(path, contents).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    Ok(())
}

pub fn load_key_secure(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StorageError::NotFound(path.to_path_buf()))
        }
        Err(source) => Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
