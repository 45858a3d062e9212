use anyhow::{Context, Result};
use fs_err as fs;
use std::{
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::acme_client::Credentials;

pub const CERT_FILE: &str = "fullchain.pem";
pub const KEY_FILE: &str = "privkey.pem";

/// On-disk layout of accounts and certificate lineages.
///
/// ```text
/// <workdir>/accounts/<acme server host>/credentials.json
/// <workdir>/archive/<name>/<timestamp>/{fullchain,privkey}.pem
/// <workdir>/live/<name>/{fullchain,privkey}.pem -> newest archive entry
/// ```
#[derive(Debug, Clone)]
pub struct WorkDir {
    workdir: PathBuf,
}

impl WorkDir {
    pub fn new(workdir: impl AsRef<Path>) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.workdir.join("accounts")
    }

    /// Account credentials are kept per ACME server.
    pub fn account_credentials_path(&self, acme_url: &str) -> PathBuf {
        self.accounts_dir()
            .join(server_dir_name(acme_url))
            .join("credentials.json")
    }

    pub fn archive_dir(&self, name: &str) -> PathBuf {
        self.workdir.join("archive").join(name)
    }

    pub fn live_root(&self) -> PathBuf {
        self.workdir.join("live")
    }

    pub fn live_dir(&self, name: &str) -> PathBuf {
        self.live_root().join(name)
    }

    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.live_dir(name).join(CERT_FILE)
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.live_dir(name).join(KEY_FILE)
    }

    /// Create the top level directories, failing early with a hint when the
    /// workdir is not writable.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            self.accounts_dir(),
            self.workdir.join("archive"),
            self.live_root(),
        ] {
            create_dir(&dir).map_err(|err| {
                if is_permission_denied(&err) {
                    err.context(format!(
                        "no write access to {}; run `make sudo-run` or pick another --workdir",
                        self.workdir.display()
                    ))
                } else {
                    err
                }
            })?;
        }
        // live/ is read by web servers, the others hold secrets
        set_mode(&self.accounts_dir(), 0o700)?;
        set_mode(&self.workdir.join("archive"), 0o700)?;
        Ok(())
    }

    /// Names of all lineages that have a live certificate.
    pub fn list_lineages(&self) -> Result<Vec<String>> {
        let live_root = self.live_root();
        let entries = match fs::read_dir(&live_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        let mut names = vec![];
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(CERT_FILE).exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Account URI stored for `acme_url`, `None` if no account was created yet.
    pub fn acme_account_uri(&self, acme_url: &str) -> Result<Option<String>> {
        let path = self.account_credentials_path(acme_url);
        let encoded_credentials = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let credentials: Credentials = serde_json::from_str(&encoded_credentials)
            .with_context(|| format!("invalid account credentials in {}", path.display()))?;
        Ok(Some(credentials.account_id))
    }

    /// Archive a certificate and key and point the live links at them.
    ///
    /// Returns the archive directory the files were written to.
    pub fn store_cert(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<PathBuf> {
        use path_absolutize::Absolutize;

        // Put the new cert in {archive}/{name}/{timestamp}/fullchain.pem
        let timestamp = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Iso8601::DEFAULT)
            .context("failed to format timestamp")?;
        let cert_dir = self.archive_dir(name).join(timestamp);
        create_dir(&cert_dir)?;
        let cert_dir = cert_dir.absolutize()?.to_path_buf();
        let cert_path = cert_dir.join(CERT_FILE);
        let key_path = cert_dir.join(KEY_FILE);
        fs::write(&cert_path, cert_pem)?;
        write_private(&key_path, key_pem)?;
        debug!("stored new cert in {}", cert_dir.display());

        ln_force(&cert_path, self.cert_path(name))?;
        ln_force(&key_path, self.key_path(name))?;
        Ok(cert_dir)
    }
}

/// Directory name for a lineage, derived from its first domain.
pub fn lineage_name(domain: &str) -> String {
    match domain.strip_prefix("*.") {
        Some(base) => format!("_wildcard.{base}"),
        None => domain.to_string(),
    }
}

/// `https://acme-v02.api.letsencrypt.org/directory` -> `acme-v02.api.letsencrypt.org`
fn server_dir_name(acme_url: &str) -> String {
    let without_scheme = acme_url
        .split_once("://")
        .map_or(acme_url, |(_, rest)| rest);
    let host = without_scheme.split('/').next().unwrap_or_default();
    host.replace(':', "_")
}

/// Write a file readable by the owner only.
pub(crate) fn write_private(path: impl AsRef<Path>, contents: &str) -> Result<()> {
    use fs_err::os::unix::fs::OpenOptionsExt;

    let path = path.as_ref();
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    set_mode(path, 0o600)?;
    Ok(())
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).context("failed to create directory")
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|e| e.kind() == ErrorKind::PermissionDenied)
    })
}

fn ln_force(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let dst = dst.as_ref();
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst)?;
    } else if let Some(dst_parent) = dst.parent() {
        fs::create_dir_all(dst_parent)?;
    }
    fs::os::unix::fs::symlink(src.as_ref(), dst)?;
    Ok(())
}
