//! known_hosts verification with trust-on-first-use.
//!
//! Unknown hosts are appended on first contact; a host already present with
//! a different key is rejected as a possible man-in-the-middle. Appends are
//! serialized by a mutex, and the file and its parent directory are created
//! with restrictive permissions when missing.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use russh::keys::PublicKey;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

pub struct KnownHosts {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl KnownHosts {
    /// Open (creating if necessary) the known-hosts file at `path`.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                create_dir_restricted(dir)?;
            }
        }
        if !path.exists() {
            create_file_restricted(&path)?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Verify `key` for `host:port`, appending it on first contact.
    pub async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        let pattern = normalize(host, port);
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::config_with_source(
                format!("reading known_hosts {}", self.path.display()),
                e,
            )
        })?;

        let mut known = false;
        let mut mismatch = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
                // Hashed entries are not produced here and are skipped.
                continue;
            }
            let mut fields = line.splitn(2, char::is_whitespace);
            let (Some(patterns), Some(key_part)) = (fields.next(), fields.next()) else {
                continue;
            };
            if !patterns
                .split(',')
                .any(|p| p.eq_ignore_ascii_case(&pattern))
            {
                continue;
            }
            match PublicKey::from_str(key_part.trim()) {
                Ok(entry) if entry.key_data() == key.key_data() => {
                    known = true;
                    break;
                }
                Ok(_) => mismatch = true,
                Err(_) => continue,
            }
        }

        if known {
            return Ok(());
        }
        if mismatch {
            return Err(Error::auth(format!(
                "host key mismatch for {} (possible man-in-the-middle)",
                pattern
            )));
        }

        self.append(&pattern, key).await
    }

    async fn append(&self, pattern: &str, key: &PublicKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let encoded = key
            .to_openssh()
            .map_err(|e| Error::config_with_source("encoding host key", e))?;
        let line = format!("{} {}\n", pattern, encoded);

        let mut contents = tokio::fs::read_to_string(&self.path).await.unwrap_or_default();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&line);
        tokio::fs::write(&self.path, contents).await.map_err(|e| {
            Error::config_with_source(
                format!("writing known_hosts {}", self.path.display()),
                e,
            )
        })?;

        tracing::info!("added host key for {} to {}", pattern, self.path.display());
        Ok(())
    }
}

/// known_hosts host pattern: plain host for port 22, `[host]:port` otherwise.
fn normalize(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn create_dir_restricted(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| {
                Error::config_with_source(
                    format!("creating known_hosts directory {}", dir.display()),
                    e,
                )
            })
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::config_with_source(
                format!("creating known_hosts directory {}", dir.display()),
                e,
            )
        })
    }
}

fn create_file_restricted(path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            Error::config_with_source(format!("creating known_hosts {}", path.display()), e)
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file
            .metadata()
            .map_err(|e| Error::config_with_source("known_hosts metadata", e))?
            .permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)
            .map_err(|e| Error::config_with_source("setting known_hosts permissions", e))?;
    }
    #[cfg(not(unix))]
    let _ = file;

    Ok(())
}
