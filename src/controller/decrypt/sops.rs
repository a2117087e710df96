//! # SOPS Decryption
//!
//! Decrypts SOPS-encrypted documents using the sops binary against an
//! ephemeral keyring: PGP keys from the bundle are imported into a transient
//! GNUPGHOME, age identities are collected into a transient key file. The
//! keyring is private to one generator build and removed when the decryptor
//! is dropped, regardless of success or failure.

use super::{detect_encrypted_format, AGE_KEY_SUFFIX, Decryptor, DocumentFormat, KeyBundle, PGP_KEY_SUFFIX};
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, warn};

pub struct SopsDecryptor {
    /// Transient keyring directory; removing the TempDir is the single
    /// cleanup point for all key material on disk.
    keyring: TempDir,
    gnupg_home: Option<PathBuf>,
    age_key_file: Option<PathBuf>,
}

impl SopsDecryptor {
    /// Build the ephemeral keyring from the key bundle. Key files with
    /// unknown suffixes are ignored.
    pub fn new(keys: KeyBundle) -> Result<Self> {
        let keyring = TempDir::with_prefix("component-controller-keyring-")
            .context("failed to create transient keyring directory")?;

        let mut pgp_keys: Vec<&[u8]> = Vec::new();
        let mut age_keys: Vec<&[u8]> = Vec::new();
        for (name, value) in keys.iter() {
            if name.ends_with(PGP_KEY_SUFFIX) {
                pgp_keys.push(value);
            } else if name.ends_with(AGE_KEY_SUFFIX) {
                age_keys.push(value);
            } else {
                debug!("ignoring key file {} with unsupported suffix", name);
            }
        }

        let gnupg_home = if pgp_keys.is_empty() {
            None
        } else {
            Some(import_pgp_keys(keyring.path(), &pgp_keys)?)
        };

        let age_key_file = if age_keys.is_empty() {
            None
        } else {
            let path = keyring.path().join("age-keys.txt");
            let mut contents = Vec::new();
            for key in age_keys {
                contents.extend_from_slice(key);
                contents.push(b'\n');
            }
            std::fs::write(&path, &contents).context("failed to write age key file")?;
            Some(path)
        };

        Ok(SopsDecryptor {
            keyring,
            gnupg_home,
            age_key_file,
        })
    }

    fn decrypt_with_format(
        &self,
        data: &[u8],
        input_format: DocumentFormat,
        output_format: DocumentFormat,
    ) -> Result<Vec<u8>> {
        let sops = which::which("sops").context("sops binary not found on PATH")?;

        // sops wants a file whose extension matches the input type
        let staging = TempDir::with_prefix_in("decrypt-", self.keyring.path())
            .context("failed to create decryption staging directory")?;
        let input_path = staging.path().join(format!("data.{}", input_format.extension()));
        std::fs::write(&input_path, data).context("failed to stage encrypted document")?;

        let mut cmd = Command::new(&sops);
        cmd.arg("--decrypt")
            .arg("--input-type")
            .arg(input_format.as_str())
            .arg("--output-type")
            .arg(output_format.as_str())
            .arg(&input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(gnupg_home) = &self.gnupg_home {
            cmd.env("GNUPGHOME", gnupg_home);
        }
        if let Some(age_key_file) = &self.age_key_file {
            cmd.env("SOPS_AGE_KEY_FILE", age_key_file);
        }

        let output = cmd.output().context("failed to execute sops")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "failed to emit encrypted {} document as decrypted {}: {}",
                input_format.as_str(),
                output_format.as_str(),
                stderr.trim()
            );
        }
        Ok(output.stdout)
    }
}

impl Decryptor for SopsDecryptor {
    fn decrypt(&self, data: &[u8], path_hint: &Path) -> Result<Vec<u8>> {
        let Some(input_format) = detect_encrypted_format(data) else {
            // no supported format marker: pass through unchanged
            return Ok(data.to_vec());
        };
        let output_format = DocumentFormat::for_path(path_hint);
        debug!(
            "decrypting {} ({} -> {})",
            path_hint.display(),
            input_format.as_str(),
            output_format.as_str()
        );
        self.decrypt_with_format(data, input_format, output_format)
            .with_context(|| format!("failed to decrypt {}", path_hint.display()))
    }
}

/// Import PGP keys into a transient GNUPGHOME below the keyring directory,
/// one `gpg --import` invocation per key.
fn import_pgp_keys(keyring: &Path, keys: &[&[u8]]) -> Result<PathBuf> {
    let gpg = which::which("gpg").context("gpg binary not found on PATH")?;
    let gnupg_home = keyring.join("gnupg");
    std::fs::create_dir(&gnupg_home).context("failed to create GNUPGHOME")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // gpg refuses group/world accessible home directories
        std::fs::set_permissions(&gnupg_home, std::fs::Permissions::from_mode(0o700))
            .context("failed to restrict GNUPGHOME permissions")?;
    }

    for key in keys {
        let mut child = Command::new(&gpg)
            .env("GNUPGHOME", &gnupg_home)
            .arg("--batch")
            .arg("--quiet")
            .arg("--import")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn gpg import")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(key).context("failed to write PGP key to gpg stdin")?;
        }
        let output = child.wait_with_output().context("failed to wait for gpg import")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("gpg import failed: {}", stderr.trim());
            bail!("failed to import PGP key: {}", stderr.trim());
        }
    }

    Ok(gnupg_home)
}
