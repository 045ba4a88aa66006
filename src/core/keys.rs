//! SH-007: Ephemeral SSH key material.
//!
//! An ed25519 pair is generated into a private temp directory that lives as
//! long as the `EphemeralKey`. Dropping it removes the private key from disk.

use super::error::StackError;
use crate::transport::{self, CommandSpec};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct EphemeralKey {
    _dir: TempDir,
    private_key: PathBuf,
    public_key: String,
}

impl EphemeralKey {
    /// Run `ssh-keygen -t ed25519` with no passphrase.
    pub fn generate(comment: &str) -> Result<Self, StackError> {
        let dir = tempfile::Builder::new()
            .prefix("stackhand-key-")
            .tempdir()
            .map_err(|e| StackError::io(std::env::temp_dir(), e))?;
        let private_key = dir.path().join("id_ed25519");

        let spec = CommandSpec::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg(private_key.display().to_string());
        let out = transport::run(&spec)
            .map_err(|e| StackError::Precondition(format!("cannot run ssh-keygen: {}", e)))?;
        if !out.success() {
            return Err(StackError::Precondition(format!(
                "ssh-keygen failed: {}",
                out.error_summary()
            )));
        }

        let pub_path = private_key.with_extension("pub");
        let public_key = std::fs::read_to_string(&pub_path)
            .map_err(|e| StackError::io(&pub_path, e))?
            .trim()
            .to_string();

        Ok(Self {
            _dir: dir,
            private_key,
            public_key,
        })
    }

    pub fn private_key_path(&self) -> &Path {
        &self.private_key
    }

    /// OpenSSH public key line.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}
