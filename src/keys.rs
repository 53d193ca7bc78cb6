// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH keypair lifecycle for the edge host
//!
//! Keys are Ed25519 in OpenSSH format. A broken pair is replaced by staging
//! both new files next to the originals and renaming them into place. The
//! private key rename is the commit point: before it the old private key is
//! untouched, so an interrupted repair is simply repeated on the next run.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};

/// How [`ensure_keypair`] arrived at the current pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyOrigin {
    /// Valid pair was already on disk
    Existing,
    /// No private key existed; a new pair was generated
    Generated,
    /// Private key was unreadable; both files were replaced
    Repaired,
    /// Private key was fine but the public key was missing or stale
    PublicKeyRederived,
}

/// A validated SSH credential
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    /// Private key path; the public key is the same path plus `.pub`
    pub keypair_path: PathBuf,
    /// `SHA256:...` fingerprint of the public key
    pub public_key_fingerprint: String,
    /// OpenSSH public key line
    pub public_key: String,
    /// When the pair was last parsed successfully
    pub last_validated_at: DateTime<Utc>,
    /// What had to be done to get here
    pub origin: KeyOrigin,
}

/// Public key path for a private key path
pub fn public_key_path(private: &Path) -> PathBuf {
    let mut name: OsString = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Make sure a valid keypair exists at `path`, generating or repairing it as
/// needed.
pub fn ensure_keypair<P: AsRef<Path>>(path: P) -> Result<Credential> {
    let path = path.as_ref();
    ensure_parent(path)?;
    remove_stale_staging(path);

    let origin = match read_private(path)? {
        PrivateState::Missing => {
            info!(path = %path.display(), "Generating new SSH keypair");
            stage_keypair(path)?.commit()?;
            KeyOrigin::Generated
        }
        PrivateState::Invalid(reason) => {
            warn!(path = %path.display(), reason = %reason, "SSH private key is unusable, replacing keypair");
            stage_keypair(path)?.commit()?;
            KeyOrigin::Repaired
        }
        PrivateState::Valid(private) => {
            if private.is_encrypted() {
                return Err(ProvisionError::Key {
                    path: path.display().to_string(),
                    message: "passphrase-protected keys cannot be used unattended".to_string(),
                });
            }
            if public_matches(path, private.public_key()) {
                KeyOrigin::Existing
            } else {
                warn!(path = %path.display(), "Public key missing or stale, re-deriving from private key");
                write_public(path, private.public_key())?;
                KeyOrigin::PublicKeyRederived
            }
        }
    };

    let public = read_public(path)?;
    let credential = Credential {
        keypair_path: path.to_path_buf(),
        public_key_fingerprint: public.fingerprint(HashAlg::Sha256).to_string(),
        public_key: encode_public(path, &public)?,
        last_validated_at: Utc::now(),
        origin,
    };

    info!(
        path = %path.display(),
        fingerprint = %credential.public_key_fingerprint,
        origin = ?origin,
        "SSH keypair ready"
    );
    Ok(credential)
}

/// Fingerprint of the keypair at `path` without modifying anything
///
/// Derived from the private key, so a `.pub` file that does not belong to a
/// usable private key is never reported.
pub fn fingerprint<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    match read_private(path)? {
        PrivateState::Valid(private) => {
            Ok(private.public_key().fingerprint(HashAlg::Sha256).to_string())
        }
        PrivateState::Missing => Err(ProvisionError::Key {
            path: path.display().to_string(),
            message: "no keypair found".to_string(),
        }),
        PrivateState::Invalid(reason) => Err(ProvisionError::Key {
            path: path.display().to_string(),
            message: reason,
        }),
    }
}

/// Whether the private key at `path` parses (read-only)
pub fn is_valid(path: &Path) -> bool {
    matches!(read_private(path), Ok(PrivateState::Valid(key)) if !key.is_encrypted())
}

/// A freshly generated pair written to temp files beside its destination
pub struct StagedKeypair {
    private: NamedTempFile,
    public: NamedTempFile,
    private_target: PathBuf,
    public_target: PathBuf,
}

impl StagedKeypair {
    /// Rename both files into place, private key first
    ///
    /// A crash between the renames leaves a valid private key next to a stale
    /// `.pub`, which [`ensure_keypair`] re-derives.
    pub fn commit(self) -> Result<()> {
        self.private
            .persist(&self.private_target)
            .map_err(|e| e.error)?;
        self.public
            .persist(&self.public_target)
            .map_err(|e| e.error)?;
        sync_dir(&self.private_target);
        debug!(path = %self.private_target.display(), "Committed staged keypair");
        Ok(())
    }
}

/// Generate a new pair and write it to temp files next to `path`
pub fn stage_keypair(path: &Path) -> Result<StagedKeypair> {
    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| key_error(path, e))?;
    let private_text = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| key_error(path, e))?;
    let public_text = encode_public(path, private.public_key())?;

    let dir = parent_dir(path);
    let prefix = staging_prefix(path);

    let mut private_file = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;
    set_mode(private_file.as_file(), 0o600)?;
    private_file.write_all(private_text.as_bytes())?;
    private_file.as_file().sync_all()?;

    let mut public_file = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;
    set_mode(public_file.as_file(), 0o644)?;
    public_file.write_all(public_text.as_bytes())?;
    public_file.write_all(b"\n")?;
    public_file.as_file().sync_all()?;

    Ok(StagedKeypair {
        private: private_file,
        public: public_file,
        private_target: path.to_path_buf(),
        public_target: public_key_path(path),
    })
}

enum PrivateState {
    Missing,
    Invalid(String),
    Valid(PrivateKey),
}

fn read_private(path: &Path) -> Result<PrivateState> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PrivateState::Missing),
        Err(e) => return Err(e.into()),
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(PrivateState::Invalid("private key file is empty".to_string()));
    }

    match PrivateKey::from_openssh(&bytes) {
        Ok(key) => Ok(PrivateState::Valid(key)),
        Err(e) => Ok(PrivateState::Invalid(e.to_string())),
    }
}

fn read_public(path: &Path) -> Result<PublicKey> {
    let public_path = public_key_path(path);
    let text = std::fs::read_to_string(&public_path)?;
    PublicKey::from_openssh(text.trim()).map_err(|e| key_error(&public_path, e))
}

fn public_matches(path: &Path, expected: &PublicKey) -> bool {
    read_public(path)
        .map(|public| public.key_data() == expected.key_data())
        .unwrap_or(false)
}

fn write_public(path: &Path, public: &PublicKey) -> Result<()> {
    let text = encode_public(path, public)?;
    let mut file = tempfile::Builder::new()
        .prefix(&staging_prefix(path))
        .tempfile_in(parent_dir(path))?;
    set_mode(file.as_file(), 0o644)?;
    file.write_all(text.as_bytes())?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(public_key_path(path)).map_err(|e| e.error)?;
    Ok(())
}

fn encode_public(path: &Path, public: &PublicKey) -> Result<String> {
    public.to_openssh().map_err(|e| key_error(path, e))
}

fn key_error(path: &Path, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::Key {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn staging_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "key".to_string());
    format!(".{}.provision-", name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    let dir = parent_dir(path);
    if dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove temp files left behind by an interrupted repair
fn remove_stale_staging(path: &Path) {
    let prefix = staging_prefix(path);
    let Ok(entries) = std::fs::read_dir(parent_dir(path)) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            debug!(file = %entry.path().display(), "Removing leftover staged key file");
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> Result<()> {
    Ok(())
}

fn sync_dir(path: &Path) {
    if let Ok(dir) = std::fs::File::open(parent_dir(path)) {
        let _ = dir.sync_all();
    }
}
