//! Rebuildable trust store for outbound TLS connections.
//!
//! The pool is always rebuilt wholesale from the add directories minus the
//! remove directory, keyed by file name, so disabling a system certificate
//! only requires dropping a same-named file into the remove directory.
//! Readers take an `Arc` snapshot; a rebuild swaps the pool atomically and
//! never exposes a partially built one.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use log::{debug, warn};
use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Certificate directory layout: certificates from every `add_dirs` entry
/// are trusted unless a file of the same name exists in `remove_dir`.
#[derive(Debug, Clone)]
pub struct TrustStorePaths {
    pub add_dirs: Vec<PathBuf>,
    pub remove_dir: PathBuf,
}

impl TrustStorePaths {
    /// System root store, conscrypt module store, and the user-added store,
    /// minus the user-disabled store.
    pub fn platform_default() -> Self {
        Self {
            add_dirs: vec![
                PathBuf::from("/system/etc/security/cacerts"),
                PathBuf::from("/apex/com.android.conscrypt/cacerts"),
                PathBuf::from("/data/misc/user/0/cacerts-added"),
            ],
            remove_dir: PathBuf::from("/data/misc/user/0/cacerts-removed"),
        }
    }
}

/// Process-scoped certificate pool with atomic rebuild.
pub struct TrustStore {
    paths: TrustStorePaths,
    roots: RwLock<Arc<RootCertStore>>,
}

impl TrustStore {
    /// Create an empty store; call [`rebuild`](Self::rebuild) to populate.
    pub fn new(paths: TrustStorePaths) -> Self {
        Self {
            paths,
            roots: RwLock::new(Arc::new(RootCertStore::empty())),
        }
    }

    /// Current pool snapshot. Requests in flight keep whichever pool they
    /// read even if a rebuild lands afterwards.
    pub fn roots(&self) -> Arc<RootCertStore> {
        self.roots.read().unwrap().clone()
    }

    /// TLS client configuration over the current pool; the per-request hook
    /// for outbound connections.
    pub fn client_config(&self) -> rustls::ClientConfig {
        rustls::ClientConfig::builder()
            .with_root_certificates(self.roots())
            .with_no_client_auth()
    }

    /// Rescan the certificate directories and replace the pool in one swap.
    /// Returns the number of certificates in the new pool.
    pub fn rebuild(&self) -> usize {
        let removed = file_names(&self.paths.remove_dir);
        let mut pool = RootCertStore::empty();
        let mut seen: HashSet<OsString> = HashSet::new();

        for dir in &self.paths.add_dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("skipping certificate dir {}: {err}", dir.display());
                    continue;
                }
            };

            for entry in entries.flatten() {
                let name = entry.file_name();
                if removed.contains(&name) {
                    debug!("certificate {:?} is user-disabled", name);
                    continue;
                }
                if !seen.insert(name.clone()) {
                    continue;
                }

                for der in read_certificates(&entry.path()) {
                    if let Err(err) = pool.add(der) {
                        debug!("rejected certificate from {:?}: {err}", name);
                    }
                }
            }
        }

        let count = pool.len();
        *self.roots.write().unwrap() = Arc::new(pool);
        count
    }
}

fn file_names(dir: &Path) -> HashSet<OsString> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.flatten().map(|entry| entry.file_name()).collect(),
        Err(err) => {
            debug!("no removed-certificate dir {}: {err}", dir.display());
            HashSet::new()
        }
    }
}

/// Parse a certificate file that may be DER or PEM with any number of
/// concatenated certificate blocks. Malformed blocks are skipped; they must
/// not take down the rest of the file.
fn read_certificates(path: &Path) -> Vec<CertificateDer<'static>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("unreadable certificate file {}: {err}", path.display());
            return Vec::new();
        }
    };

    let Ok(text) = std::str::from_utf8(&bytes) else {
        return vec![CertificateDer::from(bytes)];
    };
    if !text.contains(PEM_BEGIN) {
        return vec![CertificateDer::from(bytes)];
    }

    let mut certs = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(PEM_BEGIN) {
        let body_start = start + PEM_BEGIN.len();
        let Some(end) = rest[body_start..].find(PEM_END) else {
            warn!("unterminated PEM block in {}", path.display());
            break;
        };

        let body: String = rest[body_start..body_start + end]
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect();
        match B64.decode(body) {
            Ok(der) => certs.push(CertificateDer::from(der)),
            Err(err) => warn!("skipping malformed PEM block in {}: {err}", path.display()),
        }

        rest = &rest[body_start + end + PEM_END.len()..];
    }

    certs
}
