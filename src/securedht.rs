//! # Secure DHT facade
//!
//! [`SecureDht`] wraps a plain DHT backend with the overlay's three
//! guarantees:
//!
//! - **Authenticity**: values may be signed; storing nodes refuse
//!   modifications that are not signed by the stored owner or that roll the
//!   sequence number back
//! - **Confidentiality**: values may be encrypted toward a recipient key;
//!   only the recipient recovers the plaintext
//! - **Identity discovery**: each participant's certificate is published
//!   into the DHT under its public-key hash, so peers resolve
//!   `id -> certificate` asynchronously and then verify or encrypt
//!
//! ## Two ids
//!
//! The overlay id ([`SecureDht::id`]) is the public-key hash from the
//! certificate; it is what values are addressed to and what the directory
//! caches under. The routing id ([`SecureDht::node_id`]) is
//! `InfoHash::get("node:" + hex(overlay id))`, fixed into the backend at
//! construction; it only decides where this node sits in the keyspace.
//!
//! ## Receive pipeline
//!
//! Every value delivered through [`SecureDht::get`] or [`SecureDht::listen`]
//! passes a filter that decrypts values addressed to us, verifies
//! signatures, and silently drops anything that fails. Verification
//! failures never reach the caller, and empty batches are suppressed.
//!
//! All callbacks run on the DHT driver task; user calls are expected from
//! that task or to be serialized externally.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::backend::{DhtBackend, ListenToken, ValueBatch, ValuesCallback};
use crate::crypto::{Certificate, CryptoError, Identity, PrivateKey, PublicKey};
use crate::directory::{CertificateDirectory, LocalCertificateStore};
use crate::infohash::InfoHash;
use crate::value::{
    CERTIFICATE_TYPE, EditPolicy, Filter, StorePolicy, Value, ValueFlags, ValueType,
};

/// Value id under which a node announces its own certificate.
const CERTIFICATE_VALUE_ID: u64 = 1;

// ============================================================================
// Policy wrappers
// ============================================================================

/// Prepend signature verification to a store policy.
///
/// Signed, unencrypted values must verify against their embedded owner key
/// before the inner policy is consulted. Encrypted values are opaque here:
/// their inner signatures can only be checked by the recipient after
/// decryption.
pub fn secure_store_policy(inner: StorePolicy) -> StorePolicy {
    Arc::new(move |hash, value, from, addr| {
        if value.is_signed() && !value.is_encrypted() && !value.check_signature() {
            warn!(%hash, id = value.id, "store refused: signature verification failed");
            return false;
        }
        inner(hash, value, from, addr)
    })
}

/// Prepend ownership and monotonicity checks to an edit policy.
///
/// When the stored value is signed (and not opaque), a replacement must
/// keep the owner, verify its own signature, and carry a strictly greater
/// `seq`. The exception is a byte-identical re-announcement at the same
/// `seq`, which is allowed, possibly from another node.
pub fn secure_edit_policy(inner: EditPolicy) -> EditPolicy {
    Arc::new(move |hash, old, new, from, addr| {
        if !old.is_signed() || old.is_encrypted() {
            return inner(hash, old, new, from, addr);
        }
        if old.owner != new.owner {
            warn!(%hash, id = old.id, "edit refused: owner changed");
            return false;
        }
        if !new.check_signature() {
            warn!(%hash, id = old.id, "edit refused: signature verification failed");
            return false;
        }
        if new.seq == old.seq {
            if new.to_sign() != old.to_sign() {
                warn!(%hash, id = old.id, "edit refused: sequence number must increase");
                return false;
            }
        } else if new.seq < old.seq {
            warn!(%hash, id = old.id, old_seq = old.seq, new_seq = new.seq, "edit refused: rollback");
            return false;
        }
        inner(hash, old, new, from, addr)
    })
}

/// Augment a value type so its policies enforce the signature rules.
pub fn secure_type(value_type: ValueType) -> ValueType {
    ValueType {
        store_policy: secure_store_policy(value_type.store_policy.clone()),
        edit_policy: secure_edit_policy(value_type.edit_policy.clone()),
        ..value_type
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`SecureDht`].
pub struct SecureDhtBuilder<B: DhtBackend> {
    backend: B,
    identity: Option<Identity>,
    local_store: Option<LocalCertificateStore>,
    announce: bool,
}

impl<B: DhtBackend> SecureDhtBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            identity: None,
            local_store: None,
            announce: true,
        }
    }

    /// Operate with this identity. Without one the overlay is anonymous:
    /// it can read plain and signed values but cannot sign, decrypt or be
    /// addressed.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Install a hook answering certificate lookups from a local store.
    pub fn local_certificate_store(mut self, hook: LocalCertificateStore) -> Self {
        self.local_store = Some(hook);
        self
    }

    /// Whether to publish the own certificate on startup (default: yes).
    pub fn announce_certificate(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    /// Validate the identity, fix the routing id, register the default
    /// value types and kick off the certificate announcement.
    pub async fn build(self) -> Result<Arc<SecureDht<B>>> {
        let (private_key, certificate) = match &self.identity {
            Some(identity) => {
                if identity.private_key.public_key().id() != identity.certificate.id() {
                    bail!(CryptoError::IdentityMismatch);
                }
                (
                    Some(identity.private_key.clone()),
                    Some(identity.certificate.clone()),
                )
            }
            None => (None, None),
        };

        let node_id = match &certificate {
            Some(cert) => InfoHash::get_str(&format!("node:{}", cert.id())),
            None => InfoHash::random(),
        };
        self.backend.set_local_id(node_id);

        let directory = CertificateDirectory::new();
        if let Some(cert) = &certificate {
            directory.set_own(cert.id(), cert.clone());
        }
        if let Some(hook) = self.local_store {
            directory.set_local_store(hook);
        }

        let public_key = private_key.as_ref().map(|k| k.public_key());
        let dht = Arc::new(SecureDht {
            backend: Arc::new(self.backend),
            private_key,
            public_key,
            certificate,
            directory,
        });

        // The certificate type must stay insecure: certificate values are
        // the means of obtaining signature keys in the first place.
        dht.register_type(ValueType::user_data()).await;
        dht.register_insecure_type(ValueType::certificate()).await;

        if self.announce {
            if let Some(cert) = &dht.certificate {
                let backend = dht.backend.clone();
                let cert_id = cert.id();
                let mut value = Value::new(CERTIFICATE_TYPE, cert.to_der());
                value.id = CERTIFICATE_VALUE_ID;
                tokio::spawn(async move {
                    if backend.put(cert_id, value).await {
                        debug!(id = %cert_id, "own certificate announced");
                    } else {
                        warn!(id = %cert_id, "could not announce own certificate");
                    }
                });
            }
        }

        Ok(dht)
    }
}

// ============================================================================
// SecureDht
// ============================================================================

/// Secure overlay over a [`DhtBackend`].
pub struct SecureDht<B: DhtBackend> {
    backend: Arc<B>,
    private_key: Option<Arc<PrivateKey>>,
    public_key: Option<PublicKey>,
    certificate: Option<Arc<Certificate>>,
    directory: CertificateDirectory,
}

impl<B: DhtBackend> std::fmt::Debug for SecureDht<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureDht")
            .field("public_key", &self.public_key)
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

impl<B: DhtBackend> SecureDht<B> {
    pub fn builder(backend: B) -> SecureDhtBuilder<B> {
        SecureDhtBuilder::new(backend)
    }

    /// Shorthand for `builder(backend).identity(..).build()`.
    pub async fn new(backend: B, identity: Option<Identity>) -> Result<Arc<Self>> {
        let mut builder = Self::builder(backend);
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        builder.build().await
    }

    /// Overlay id: the public-key hash, or the zero hash when anonymous.
    pub fn id(&self) -> InfoHash {
        self.certificate
            .as_ref()
            .map(|cert| cert.id())
            .unwrap_or_else(InfoHash::zero)
    }

    /// Routing id of the underlying DHT node.
    pub fn node_id(&self) -> InfoHash {
        self.backend.local_id()
    }

    pub fn certificate(&self) -> Option<&Arc<Certificate>> {
        self.certificate.as_ref()
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ------------------------------------------------------------------
    // Type registration
    // ------------------------------------------------------------------

    /// Register a value type with signature enforcement (see
    /// [`secure_type`]).
    pub async fn register_type(&self, value_type: ValueType) {
        self.backend.register_type(secure_type(value_type)).await;
    }

    /// Register a value type without signature enforcement.
    pub async fn register_insecure_type(&self, value_type: ValueType) {
        self.backend.register_type(value_type).await;
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Query values under `hash`, decrypting and verifying before delivery.
    pub async fn get(
        &self,
        hash: InfoHash,
        on_values: impl FnMut(ValueBatch) -> bool + Send + 'static,
        filter: Option<Filter>,
    ) -> bool {
        let wrapped = self.wrap_values_callback(Box::new(on_values), filter);
        self.backend.get(hash, wrapped, None).await
    }

    /// Subscribe to values under `hash` with the same pipeline as
    /// [`SecureDht::get`].
    pub async fn listen(
        &self,
        hash: InfoHash,
        on_values: impl FnMut(ValueBatch) -> bool + Send + 'static,
        filter: Option<Filter>,
    ) -> ListenToken {
        let wrapped = self.wrap_values_callback(Box::new(on_values), filter);
        self.backend.listen(hash, wrapped, None).await
    }

    pub async fn cancel_listen(&self, hash: InfoHash, token: ListenToken) -> bool {
        self.backend.cancel_listen(hash, token).await
    }

    /// Receive pipeline: decrypt values addressed to us, verify signatures,
    /// drop failures silently, apply the user filter, and suppress empty
    /// batches. The user callback's continue/stop result is propagated.
    fn wrap_values_callback(
        &self,
        mut on_values: ValuesCallback,
        filter: Option<Filter>,
    ) -> ValuesCallback {
        let key = self.private_key.clone();
        let own_id = self.id();
        Box::new(move |values: ValueBatch| {
            let mut delivered: ValueBatch = Vec::new();
            for value in values {
                if value.is_encrypted() {
                    let Some(key) = &key else { continue };
                    match decrypt_value(key, &value) {
                        Ok(inner) => {
                            if inner.recipient != own_id {
                                // Addressed to someone else; not ours to report.
                                continue;
                            }
                            if !inner.check_signature() {
                                warn!(id = value.id, "dropping decrypted value: bad signature");
                                continue;
                            }
                            if filter.as_ref().is_none_or(|f| f(&inner)) {
                                delivered.push(Arc::new(inner));
                            }
                        }
                        Err(error) => {
                            warn!(id = value.id, %error, "could not decrypt value");
                        }
                    }
                } else if value.is_signed() {
                    if !value.check_signature() {
                        warn!(id = value.id, "dropping signed value: bad signature");
                        continue;
                    }
                    if filter.as_ref().is_none_or(|f| f(&value)) {
                        delivered.push(value);
                    }
                } else if filter.as_ref().is_none_or(|f| f(&value)) {
                    delivered.push(value);
                }
            }
            if delivered.is_empty() {
                return true;
            }
            on_values(delivered)
        })
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Plain passthrough to the underlying DHT.
    pub async fn put(&self, hash: InfoHash, value: Value) -> bool {
        self.backend.put(hash, value).await
    }

    /// Sign and announce a value, negotiating a sequence number past any
    /// prior announcement of `(hash, value.id)`, ours or already online.
    ///
    /// The pre-announcement query completes before the value is signed and
    /// stored.
    pub async fn put_signed(&self, hash: InfoHash, mut value: Value) -> Result<bool> {
        if value.id == Value::INVALID_ID {
            value.id = Value::random_id();
        }

        if let Some(prior) = self.backend.get_put(hash, value.id).await {
            if value.seq <= prior.seq {
                debug!(%hash, id = value.id, "found previous announcement, bumping seq");
                value.seq = prior.seq + 1;
            }
        }

        // Highest own seq seen online, offset by one so zero means "none".
        let seen = Arc::new(AtomicU32::new(0));
        let own_key_id = self.public_key.as_ref().map(|k| k.id());
        let watcher = {
            let seen = seen.clone();
            move |values: ValueBatch| {
                for v in values {
                    if !v.is_signed() {
                        warn!(id = v.id, "unsigned value already stored at this location");
                    } else if v.owner.as_ref().map(|o| o.id()) != own_key_id {
                        warn!(id = v.id, "value owned by another key at this location");
                    } else {
                        seen.fetch_max(u32::from(v.seq) + 1, Ordering::SeqCst);
                    }
                }
                true
            }
        };
        self.get(hash, watcher, Some(Value::id_filter(value.id))).await;

        match seen.load(Ordering::SeqCst) {
            0 => {}
            top => {
                let top = (top - 1) as u16;
                if value.seq <= top {
                    debug!(%hash, id = value.id, seq = top + 1, "bumping seq past online value");
                    value.seq = top + 1;
                }
            }
        }

        self.sign(&mut value)?;
        Ok(self.backend.put(hash, value).await)
    }

    /// Resolve the recipient's certificate, encrypt toward it and announce.
    ///
    /// Resolves to `false` when the certificate cannot be found or
    /// encryption fails.
    pub async fn put_encrypted(&self, hash: InfoHash, to: InfoHash, value: Value) -> bool {
        let Some(cert) = self.find_certificate(to).await else {
            warn!(%to, "cannot encrypt: certificate not found");
            return false;
        };
        debug!(recipient = %cert.id(), "encrypting value for recipient");
        match self.encrypt(value, cert.public_key()) {
            Ok(sealed) => self.backend.put(hash, sealed).await,
            Err(error) => {
                warn!(%error, "error encrypting value");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Value transformation
    // ------------------------------------------------------------------

    /// Sign `value` with the own key, setting owner and flags.
    pub fn sign(&self, value: &mut Value) -> Result<()> {
        let key = self.private_key.as_ref().ok_or(CryptoError::MissingKey)?;
        let public_key = self.public_key.as_ref().ok_or(CryptoError::MissingKey)?;
        if value.is_encrypted() {
            bail!(CryptoError::AlreadyEncrypted);
        }
        value.owner = Some(public_key.clone());
        value.flags = ValueFlags::SIGNED | (value.flags & ValueFlags::RECIPIENT);
        value.signature = key.sign(&value.to_sign())?;
        Ok(())
    }

    /// Sign `value`, then seal it toward `to`: the result is an opaque
    /// value with the same id whose contents are the encrypted signed form.
    pub fn encrypt(&self, mut value: Value, to: &PublicKey) -> Result<Value> {
        if value.is_encrypted() {
            bail!(CryptoError::AlreadyEncrypted);
        }
        value.set_recipient(to.id());
        self.sign(&mut value)?;

        let mut sealed = Value::with_id(value.id);
        sealed.recipient = to.id();
        sealed.set_cypher(to.encrypt(&value.to_encrypt())?);
        Ok(sealed)
    }

    /// Recover the signed value inside an encrypted one. The caller is
    /// responsible for verifying the inner signature.
    pub fn decrypt(&self, value: &Value) -> Result<Value> {
        let key = self.private_key.as_ref().ok_or(CryptoError::MissingKey)?;
        decrypt_value(key, value)
    }

    // ------------------------------------------------------------------
    // Certificates
    // ------------------------------------------------------------------

    /// Known certificate for `node`: own identity, then cache.
    pub fn get_certificate(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        self.directory.get(node)
    }

    /// Validate and cache a certificate blob claimed to belong to `node`.
    pub fn register_certificate(&self, node: &InfoHash, blob: &[u8]) -> Option<Arc<Certificate>> {
        self.directory.register(node, blob)
    }

    /// Cache a certificate unconditionally under its own id.
    pub fn insert_certificate(&self, certificate: Arc<Certificate>) {
        self.directory.insert(certificate);
    }

    /// Install a hook answering certificate lookups from a local store.
    pub fn set_local_certificate_store(&self, hook: LocalCertificateStore) {
        self.directory.set_local_store(hook);
    }

    /// Resolve a certificate: cache, local-store hook, then a DHT query
    /// filtered to certificate values. At most one candidate wins, even if
    /// several replies carry valid certificates; exhaustion yields `None`.
    pub async fn find_certificate(&self, node: InfoHash) -> Option<Arc<Certificate>> {
        if let Some(cert) = self.directory.get(&node) {
            debug!(%node, "using cached certificate");
            return Some(cert);
        }
        if let Some(cert) = self.directory.query_local_store(&node) {
            return Some(cert);
        }

        let found: Arc<Mutex<Option<Arc<Certificate>>>> = Arc::default();
        let on_values: ValuesCallback = {
            let found = found.clone();
            let directory = self.directory.clone();
            Box::new(move |values: ValueBatch| {
                let mut slot = found.lock().expect("found flag poisoned");
                if slot.is_some() {
                    return false;
                }
                for value in values {
                    if let Some(cert) = directory.register(&node, &value.data) {
                        debug!(%node, "certificate resolved from the network");
                        *slot = Some(cert);
                        return false;
                    }
                }
                true
            })
        };
        self.backend
            .get(node, on_values, Some(Value::type_filter(CERTIFICATE_TYPE)))
            .await;

        let resolved = found.lock().expect("found flag poisoned").take();
        if resolved.is_none() {
            debug!(%node, "certificate not found");
        }
        resolved
    }
}

fn decrypt_value(key: &PrivateKey, value: &Value) -> Result<Value> {
    if !value.is_encrypted() {
        bail!(CryptoError::NotEncrypted);
    }
    let plain = key.decrypt(&value.cypher).map_err(CryptoError::from)?;
    let inner = Value::unpack_body(&plain, value.id)?;
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::crypto::fixtures::{ALICE, BOB, CAROL};
    use crate::store::{MemoryDht, MemoryNetwork};
    use crate::value::USER_DATA_TYPE;

    const ADDR: SocketAddr = SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        0,
    );

    async fn overlay(net: &MemoryNetwork, identity: &Identity) -> Arc<SecureDht<MemoryDht>> {
        SecureDht::new(net.node(), Some(identity.clone()))
            .await
            .expect("overlay construction failed")
    }

    fn plain(id: u64, data: &[u8]) -> Value {
        let mut v = Value::new(USER_DATA_TYPE, data.to_vec());
        v.id = id;
        v
    }

    #[tokio::test]
    async fn construction_rejects_mismatched_identity() {
        let net = MemoryNetwork::new();
        let broken = Identity {
            private_key: ALICE.private_key.clone(),
            certificate: BOB.certificate.clone(),
        };
        let err = SecureDht::new(net.node(), Some(broken))
            .await
            .expect_err("mismatched identity accepted");
        assert_eq!(
            err.downcast_ref::<CryptoError>(),
            Some(&CryptoError::IdentityMismatch)
        );
    }

    #[tokio::test]
    async fn overlay_and_routing_ids_differ() {
        let net = MemoryNetwork::new();
        let dht = overlay(&net, &ALICE).await;

        assert_eq!(dht.id(), ALICE.id());
        assert_eq!(
            dht.node_id(),
            InfoHash::get_str(&format!("node:{}", ALICE.id()))
        );
        assert_ne!(dht.id(), dht.node_id());
    }

    #[tokio::test]
    async fn anonymous_overlay_has_zero_id() {
        let net = MemoryNetwork::new();
        let dht = SecureDht::new(net.node(), None)
            .await
            .expect("anonymous construction failed");
        assert!(dht.id().is_zero());
        assert!(dht.certificate().is_none());

        let mut v = plain(1, b"x");
        assert!(dht.sign(&mut v).is_err());
        assert!(dht.put_signed(InfoHash::random(), plain(1, b"x")).await.is_err());
    }

    #[tokio::test]
    async fn sign_sets_owner_flags_and_signature() {
        let net = MemoryNetwork::new();
        let dht = overlay(&net, &ALICE).await;

        let mut v = plain(5, b"payload");
        dht.sign(&mut v).expect("signing failed");

        assert!(v.is_signed());
        assert!(!v.is_encrypted());
        assert_eq!(v.owner.as_ref().map(|o| o.id()), Some(ALICE.id()));
        assert!(v.check_signature());

        // Directed flag survives signing.
        let mut directed = plain(6, b"payload");
        directed.set_recipient(BOB.id());
        dht.sign(&mut directed).expect("signing failed");
        assert!(directed.has_recipient());
        assert!(directed.check_signature());
    }

    #[tokio::test]
    async fn sign_and_encrypt_refuse_opaque_values() {
        let net = MemoryNetwork::new();
        let dht = overlay(&net, &ALICE).await;

        let mut sealed = dht
            .encrypt(plain(1, b"payload"), BOB.certificate.public_key())
            .expect("encryption failed");
        assert!(dht.sign(&mut sealed).is_err());
        assert!(
            dht.encrypt(sealed, BOB.certificate.public_key()).is_err(),
            "double encryption accepted"
        );
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let net = MemoryNetwork::new();
        let alice = overlay(&net, &ALICE).await;
        let bob = overlay(&net, &BOB).await;

        let sealed = alice
            .encrypt(plain(77, b"for bob"), BOB.certificate.public_key())
            .expect("encryption failed");
        assert!(sealed.is_encrypted());
        assert_eq!(sealed.id, 77);
        assert_eq!(sealed.recipient, BOB.id());
        assert!(sealed.data.is_empty());

        let inner = bob.decrypt(&sealed).expect("decryption failed");
        assert_eq!(inner.data, b"for bob");
        assert_eq!(inner.id, 77);
        assert_eq!(inner.recipient, BOB.id());
        assert!(inner.check_signature());
        assert_eq!(inner.owner.as_ref().map(|o| o.id()), Some(ALICE.id()));

        // A third party cannot recover the plaintext.
        let carol = overlay(&net, &CAROL).await;
        assert!(carol.decrypt(&sealed).is_err());
    }

    #[tokio::test]
    async fn decrypt_refuses_plain_values() {
        let net = MemoryNetwork::new();
        let dht = overlay(&net, &ALICE).await;
        assert!(dht.decrypt(&plain(1, b"not sealed")).is_err());
    }

    fn signed_by(identity: &Identity, id: u64, data: &[u8], seq: u16) -> Arc<Value> {
        let mut v = Value::new(USER_DATA_TYPE, data.to_vec());
        v.id = id;
        v.seq = seq;
        v.flags = ValueFlags::SIGNED;
        v.owner = Some(identity.private_key.public_key());
        v.signature = identity
            .private_key
            .sign(&v.to_sign())
            .expect("signing failed");
        Arc::new(v)
    }

    #[test]
    fn secure_store_policy_checks_signatures() {
        let vt = secure_type(ValueType::user_data());
        let hash = InfoHash::random();
        let from = InfoHash::random();

        let good = signed_by(&ALICE, 1, b"data", 1);
        assert!((vt.store_policy)(&hash, &good, &from, ADDR));

        let mut tampered = (*good).clone();
        tampered.data = b"datb".to_vec();
        assert!(!(vt.store_policy)(&hash, &Arc::new(tampered), &from, ADDR));

        // Plain values pass through to the inner policy.
        let unsigned = Arc::new(plain(2, b"plain"));
        assert!((vt.store_policy)(&hash, &unsigned, &from, ADDR));

        // Opaque values are not checkable at the store.
        let mut opaque = Value::with_id(3);
        opaque.set_cypher(vec![0xFF; 32]);
        assert!((vt.store_policy)(&hash, &Arc::new(opaque), &from, ADDR));
    }

    #[test]
    fn secure_edit_policy_enforces_monotonicity() {
        let vt = secure_type(ValueType::user_data());
        let hash = InfoHash::random();
        let from = InfoHash::random();
        let edit = |old: &Arc<Value>, new: &Arc<Value>| (vt.edit_policy)(&hash, old, new, &from, ADDR);

        let v1 = signed_by(&ALICE, 42, b"first", 1);

        // Same seq, different data: refused.
        assert!(!edit(&v1, &signed_by(&ALICE, 42, b"changed", 1)));
        // Same seq, identical bytes: re-announcement allowed.
        assert!(edit(&v1, &v1.clone()));
        // Greater seq with a valid signature: accepted.
        assert!(edit(&v1, &signed_by(&ALICE, 42, b"second", 2)));
        // Rollback: refused.
        let v3 = signed_by(&ALICE, 42, b"third", 3);
        assert!(!edit(&v3, &signed_by(&ALICE, 42, b"older", 2)));
        // Another owner: refused.
        assert!(!edit(&v1, &signed_by(&BOB, 42, b"takeover", 2)));

        // Forged owner: claims Alice's key but signed by Bob.
        let mut forged = Value::new(USER_DATA_TYPE, b"forged".to_vec());
        forged.id = 42;
        forged.seq = 2;
        forged.flags = ValueFlags::SIGNED;
        forged.owner = Some(ALICE.private_key.public_key());
        forged.signature = BOB
            .private_key
            .sign(&forged.to_sign())
            .expect("signing failed");
        assert!(!edit(&v1, &Arc::new(forged)));

        // Unsigned old value imposes no authorship.
        let unsigned = Arc::new(plain(42, b"plain"));
        assert!(edit(&unsigned, &signed_by(&ALICE, 42, b"now signed", 1)));
    }

    #[tokio::test]
    async fn receive_pipeline_drops_tampered_values() {
        let net = MemoryNetwork::new();
        let alice = overlay(&net, &ALICE).await;
        let bob = overlay(&net, &BOB).await;
        let hash = InfoHash::random();

        // Store a tampered signed value under a tag with no signature
        // enforcement, so it reaches the reader's filter.
        alice
            .register_insecure_type(ValueType::new(99, "loose", std::time::Duration::from_secs(60)))
            .await;
        let mut forged = (*signed_by(&ALICE, 1, b"original", 1)).clone();
        forged.value_type = 99;
        forged.data = b"tampered".to_vec();
        assert!(alice.backend().put(hash, forged).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bob.get(
            hash,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            },
            None,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "tampered value delivered");
    }

    #[tokio::test]
    async fn receive_pipeline_ignores_foreign_encrypted_values() {
        let net = MemoryNetwork::new();
        let alice = overlay(&net, &ALICE).await;
        let bob = overlay(&net, &BOB).await;
        let carol = overlay(&net, &CAROL).await;
        let hash = InfoHash::random();

        // Alice resolves Bob through his spawned startup announcement.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(alice.put_encrypted(hash, BOB.id(), plain(0, b"secret")).await);

        let for_carol = Arc::new(AtomicUsize::new(0));
        let counter = for_carol.clone();
        carol
            .get(
                hash,
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                },
                None,
            )
            .await;
        assert_eq!(for_carol.load(Ordering::SeqCst), 0, "foreign value delivered");

        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = seen.clone();
        bob.get(
            hash,
            move |batch: ValueBatch| {
                sink.lock()
                    .expect("lock poisoned")
                    .extend(batch.iter().map(|v| (**v).clone()));
                true
            },
            None,
        )
        .await;
        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, b"secret");
    }

    #[tokio::test]
    async fn put_signed_bumps_seq_past_prior_announcement() {
        let net = MemoryNetwork::new();
        let alice = overlay(&net, &ALICE).await;
        let hash = InfoHash::random();

        let mut v = plain(10, b"rev one");
        v.seq = 0;
        assert!(alice.put_signed(hash, v).await.expect("put_signed failed"));
        let first = alice
            .backend()
            .get_put(hash, 10)
            .await
            .expect("announcement missing");
        assert_eq!(first.seq, 0);

        // Re-announcing with a stale seq bumps past both the local record
        // and the online copy.
        let mut v = plain(10, b"rev two");
        v.seq = 0;
        assert!(alice.put_signed(hash, v).await.expect("put_signed failed"));
        let second = alice
            .backend()
            .get_put(hash, 10)
            .await
            .expect("announcement missing");
        assert!(second.seq > first.seq);
        assert_eq!(second.data, b"rev two");
    }

    #[tokio::test]
    async fn put_signed_assigns_random_id() {
        let net = MemoryNetwork::new();
        let alice = overlay(&net, &ALICE).await;
        let hash = InfoHash::random();

        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        assert!(
            alice
                .put_signed(hash, Value::new(USER_DATA_TYPE, b"auto id".to_vec()))
                .await
                .expect("put_signed failed")
        );
        let sink = seen.clone();
        alice
            .get(
                hash,
                move |batch: ValueBatch| {
                    sink.lock()
                        .expect("lock poisoned")
                        .extend(batch.iter().map(|v| (**v).clone()));
                    true
                },
                None,
            )
            .await;
        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_ne!(seen[0].id, Value::INVALID_ID);
        assert!(seen[0].check_signature());
    }

    // A backend that answers every `get` with scripted batches, recording
    // how many were actually delivered before the callback stopped it.
    struct ScriptedBackend {
        batches: Mutex<Vec<ValueBatch>>,
        delivered: AtomicUsize,
        id: Mutex<InfoHash>,
    }

    impl ScriptedBackend {
        fn new(batches: Vec<ValueBatch>) -> Self {
            Self {
                batches: Mutex::new(batches),
                delivered: AtomicUsize::new(0),
                id: Mutex::new(InfoHash::random()),
            }
        }
    }

    #[async_trait::async_trait]
    impl DhtBackend for ScriptedBackend {
        fn local_id(&self) -> InfoHash {
            *self.id.lock().expect("lock poisoned")
        }

        fn set_local_id(&self, id: InfoHash) {
            *self.id.lock().expect("lock poisoned") = id;
        }

        async fn register_type(&self, _value_type: ValueType) {}

        async fn get(
            &self,
            _hash: InfoHash,
            mut on_values: ValuesCallback,
            _filter: Option<Filter>,
        ) -> bool {
            let batches = std::mem::take(&mut *self.batches.lock().expect("lock poisoned"));
            for batch in batches {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                if !on_values(batch) {
                    break;
                }
            }
            true
        }

        async fn put(&self, _hash: InfoHash, _value: Value) -> bool {
            true
        }

        async fn listen(
            &self,
            _hash: InfoHash,
            _on_values: ValuesCallback,
            _filter: Option<Filter>,
        ) -> ListenToken {
            0
        }

        async fn cancel_listen(&self, _hash: InfoHash, _token: ListenToken) -> bool {
            false
        }

        async fn get_put(&self, _hash: InfoHash, _value_id: u64) -> Option<Value> {
            None
        }
    }

    #[tokio::test]
    async fn find_certificate_resolves_at_most_once() {
        // Several replies carry the same valid certificate; the first one
        // wins and the query is stopped.
        let cert_value = {
            let mut v = Value::new(CERTIFICATE_TYPE, BOB.certificate.to_der());
            v.id = CERTIFICATE_VALUE_ID;
            Arc::new(v)
        };
        let batches = vec![
            vec![cert_value.clone()],
            vec![cert_value.clone()],
            vec![cert_value.clone()],
        ];
        let backend = ScriptedBackend::new(batches);
        let dht = SecureDht::new(backend, Some(ALICE.clone()))
            .await
            .expect("overlay construction failed");

        let cert = dht
            .find_certificate(BOB.id())
            .await
            .expect("certificate not resolved");
        assert_eq!(cert.id(), BOB.id());
        assert_eq!(
            dht.backend().delivered.load(Ordering::SeqCst),
            1,
            "query not stopped after first resolution"
        );

        // Second resolution is a cache hit.
        assert!(dht.find_certificate(BOB.id()).await.is_some());
    }

    #[tokio::test]
    async fn find_certificate_skips_invalid_candidates() {
        // First reply carries a mismatched certificate, second the real one.
        let wrong = {
            let mut v = Value::new(CERTIFICATE_TYPE, CAROL.certificate.to_der());
            v.id = 7;
            Arc::new(v)
        };
        let right = {
            let mut v = Value::new(CERTIFICATE_TYPE, BOB.certificate.to_der());
            v.id = CERTIFICATE_VALUE_ID;
            Arc::new(v)
        };
        let backend = ScriptedBackend::new(vec![vec![wrong], vec![right]]);
        let dht = SecureDht::new(backend, Some(ALICE.clone()))
            .await
            .expect("overlay construction failed");

        let cert = dht
            .find_certificate(BOB.id())
            .await
            .expect("certificate not resolved");
        assert_eq!(cert.id(), BOB.id());
        assert_eq!(dht.backend().delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn find_certificate_returns_none_when_exhausted() {
        let backend = ScriptedBackend::new(Vec::new());
        let dht = SecureDht::new(backend, Some(ALICE.clone()))
            .await
            .expect("overlay construction failed");
        assert!(dht.find_certificate(BOB.id()).await.is_none());
    }
}
