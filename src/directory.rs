//! Certificate directory.
//!
//! Process-wide cache mapping a node's key id to its certificate. Entries
//! are shared (`Arc`), so callers may hold a certificate past a cache
//! overwrite; entries live for the lifetime of the owning overlay, no
//! eviction. An optional host-installed hook can answer lookups from a
//! local store (disk, OS keychain) before the overlay falls back to the
//! network.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::crypto::Certificate;
use crate::infohash::InfoHash;

/// Host hook answering certificate lookups from a local store.
pub type LocalCertificateStore = Arc<dyn Fn(&InfoHash) -> Vec<Arc<Certificate>> + Send + Sync>;

#[derive(Default)]
struct DirectoryState {
    /// Own identity, short-circuiting lookups for our id.
    own: Option<(InfoHash, Arc<Certificate>)>,
    cache: HashMap<InfoHash, Arc<Certificate>>,
    local_store: Option<LocalCertificateStore>,
}

/// Cheap-clone handle over the shared certificate cache.
#[derive(Clone, Default)]
pub struct CertificateDirectory {
    inner: Arc<RwLock<DirectoryState>>,
}

impl CertificateDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the local identity, served for lookups of its own id.
    pub(crate) fn set_own(&self, id: InfoHash, certificate: Arc<Certificate>) {
        self.write().own = Some((id, certificate));
    }

    /// Install the local-store hook consulted on cache misses.
    pub fn set_local_store(&self, hook: LocalCertificateStore) {
        self.write().local_store = Some(hook);
    }

    /// Known certificate for `node`: the own certificate for our id,
    /// otherwise a cache hit, otherwise `None`.
    pub fn get(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        let state = self.read();
        if let Some((own_id, cert)) = &state.own {
            if own_id == node {
                return Some(cert.clone());
            }
        }
        state.cache.get(node).cloned()
    }

    /// Consult the local-store hook and cache its first answer.
    pub(crate) fn query_local_store(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        let hook = self.read().local_store.clone()?;
        let cert = hook(node).into_iter().next()?;
        debug!(%node, "certificate resolved from local store");
        self.write().cache.insert(*node, cert.clone());
        Some(cert)
    }

    /// Parse and cache a certificate claimed to belong to `node`.
    ///
    /// The blob is rejected unless it parses and its public key hashes to
    /// `node`; an existing entry is overwritten.
    pub fn register(&self, node: &InfoHash, blob: &[u8]) -> Option<Arc<Certificate>> {
        let cert = match Certificate::from_bytes(blob) {
            Ok(cert) => cert,
            Err(error) => {
                debug!(%node, %error, "ignoring unparseable certificate");
                return None;
            }
        };
        if cert.id() != *node {
            warn!(%node, cert = %cert.id(), "certificate does not match node id");
            return None;
        }
        debug!(%node, "registering certificate");
        let cert = Arc::new(cert);
        self.write().cache.insert(*node, cert.clone());
        Some(cert)
    }

    /// Cache a certificate unconditionally, keyed by its own id.
    pub fn insert(&self, certificate: Arc<Certificate>) {
        self.write().cache.insert(certificate.id(), certificate);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DirectoryState> {
        self.inner.read().expect("directory lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DirectoryState> {
        self.inner.write().expect("directory lock poisoned")
    }
}
