//! Transient credential file for password-authenticated profiles
//!
//! The tunnel executable reads a two-line username/password file. It lives
//! next to the profile config and is removed as soon as the tunnel has
//! consumed it.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{TunsvcError, TunsvcResult};

/// A staged credential file on disk
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
}

/// Derive the credential file path from the profile config path.
pub fn credential_path(config_path: &Path, extension: &str) -> PathBuf {
    config_path.with_extension(extension)
}

/// Write `username` and `password` to an owner-only file derived from `config_path`.
pub async fn stage(
    config_path: &Path,
    extension: &str,
    username: &str,
    password: &str,
) -> TunsvcResult<CredentialFile> {
    let path = credential_path(config_path, extension);
    if path == config_path {
        return Err(TunsvcError::InvalidParameter(format!(
            "Credential file would overwrite profile {}",
            config_path.display()
        )));
    }

    write_owner_only(&path, format!("{}\n{}\n", username, password).as_bytes())
        .await
        .map_err(|source| TunsvcError::StageCredentials { path: path.clone(), source })?;

    debug!("Staged credentials at {:?}", path);
    Ok(CredentialFile { path })
}

async fn write_owner_only(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;

    // A leftover file keeps its old mode, so tighten it before writing.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }

    file.write_all(content).await?;
    file.flush().await?;
    Ok(())
}

impl CredentialFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. A file that is already gone is not an error.
    pub async fn remove(&self) -> TunsvcResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Removed credentials at {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the file, logging instead of failing.
    pub async fn discard(&self) {
        if let Err(e) = self.remove().await {
            warn!("Failed to remove credential file {:?}: {}", self.path, e);
        }
    }
}
