//! Per-machine credential material on the host.
//!
//! Keytabs are provisioned by an external process into
//! `<root>/<machine>.<domain>/krb5.keytab`.  The daemon only mounts that
//! directory into the machine and deletes the keytab when the machine goes.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};

const KEYTAB_FILE: &str = "krb5.keytab";

#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
    domain: String,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>, domain: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Fully-qualified host name for a machine: `<name>.<domain>`.
    pub fn hostname(&self, name: &str) -> String {
        format!("{}.{}", name, self.domain)
    }

    /// Host directory mounted into the machine at `/opt/keytabs`.
    pub fn directory(&self, name: &str) -> PathBuf {
        self.root.join(self.hostname(name))
    }

    pub fn keytab_path(&self, name: &str) -> PathBuf {
        self.directory(name).join(KEYTAB_FILE)
    }

    /// Delete any keytab staged for `name`.  Returns whether a file was removed.
    pub async fn remove(&self, name: &str) -> io::Result<bool> {
        let path = self.keytab_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed credential material {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No credential material at {}", path.display());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
