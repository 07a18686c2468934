//! # Cryptographic identities
//!
//! This module provides the cryptographic building blocks of the overlay:
//!
//! - **Keys**: RSA key pairs ([`PrivateKey`], [`PublicKey`]) with stable
//!   160-bit ids derived from the canonical SPKI encoding
//! - **Certificates**: X.509 certificates with an issuer chain, generated
//!   with `rcgen` and parsed with `x509-parser`
//! - **Signatures**: RSA PKCS#1 v1.5 over SHA-512
//! - **Encryption**: block-wise RSA-OAEP(SHA-512) for directed values,
//!   AES-GCM helpers for symmetric payloads
//!
//! ## Identity model
//!
//! An [`Identity`] is a private key together with an X.509 certificate whose
//! enclosed public key hashes to the same [`InfoHash`]. The certificate is
//! what gets published into the DHT, so any peer can resolve `id -> key` and
//! then verify or encrypt toward that peer.
//!
//! ## Wire choices
//!
//! Peers of one network must agree on these (they are part of the wire
//! format, not local policy):
//!
//! - signature digest: SHA-512, RSA PKCS#1 v1.5
//! - asymmetric block padding: OAEP with SHA-512
//! - key id digest: SHA-1 of the SubjectPublicKeyInfo DER
//!
//! The crypto crates used here self-initialize; no process-wide library
//! setup or teardown is required.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use aes_gcm::aead::generic_array::typenum::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use anyhow::{Context, Result, anyhow, bail};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::sha2::{Digest, Sha512};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use x509_parser::prelude::*;

use crate::infohash::InfoHash;

/// Default modulus size for generated identities.
pub const DEFAULT_KEY_LENGTH: usize = 4096;

/// Smallest modulus accepted for generated identities.
pub const MIN_KEY_LENGTH: usize = 2048;

/// Certificate validity window for generated identities.
const CERT_VALIDITY_DAYS: i64 = 10 * 365;

/// OID of the `UID` DN attribute carrying the hex public-key id.
const UID_OID: [u64; 7] = [0, 9, 2342, 19200300, 100, 1, 1];
const UID_OID_STR: &str = "0.9.2342.19200300.100.1.1";

/// SHA-512 output length fixes the OAEP overhead per RSA block.
const OAEP_OVERHEAD: usize = 2 * 64 + 2;

const AES_NONCE_LEN: usize = 12;
const AES_TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

// ============================================================================
// Error Types
// ============================================================================

/// Error type for key and encryption misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Certificate and private key belong to different key pairs.
    IdentityMismatch,
    /// Requested or imported key is below the accepted modulus size.
    KeyTooShort { bits: usize },
    /// AES key is not 128, 192 or 256 bits.
    BadAesKeyLength { len: usize },
    /// Value is already encrypted.
    AlreadyEncrypted,
    /// Value is not encrypted.
    NotEncrypted,
    /// No private key available for the requested operation.
    MissingKey,
    /// RSA signing failed.
    Signing,
    /// Asymmetric or symmetric encryption failed.
    Encryption,
    /// Ciphertext could not be recovered.
    Decrypt(DecryptError),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::IdentityMismatch => {
                write!(f, "certificate does not match the private key")
            }
            CryptoError::KeyTooShort { bits } => {
                write!(f, "key length {bits} is below the {MIN_KEY_LENGTH}-bit minimum")
            }
            CryptoError::BadAesKeyLength { len } => {
                write!(f, "AES key must be 16, 24 or 32 bytes, got {len}")
            }
            CryptoError::AlreadyEncrypted => write!(f, "value is already encrypted"),
            CryptoError::NotEncrypted => write!(f, "value is not encrypted"),
            CryptoError::MissingKey => write!(f, "no private key available"),
            CryptoError::Signing => write!(f, "signing failed"),
            CryptoError::Encryption => write!(f, "encryption failed"),
            CryptoError::Decrypt(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<DecryptError> for CryptoError {
    fn from(e: DecryptError) -> Self {
        CryptoError::Decrypt(e)
    }
}

/// Error type for ciphertext recovery failures (wrong key, tampered data,
/// bad padding). Always recoverable: the offending value is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    /// Input is not a whole number of cipher blocks, or too short.
    Truncated,
    /// An RSA block failed to decrypt (wrong key or corrupted padding).
    Block,
    /// AES-GCM authentication tag mismatch.
    Tag,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecryptError::Truncated => write!(f, "ciphertext is truncated"),
            DecryptError::Block => write!(f, "cipher block could not be decrypted"),
            DecryptError::Tag => write!(f, "authentication tag mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

// ============================================================================
// Public Key
// ============================================================================

/// RSA public key with a stable 160-bit id.
///
/// The id is the SHA-1 digest of the canonical SubjectPublicKeyInfo DER, the
/// same encoding a certificate carries, so `certificate.id() == key.id()`.
#[derive(Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PublicKey {
    fn from_rsa(key: RsaPublicKey) -> Result<Self> {
        let der = key
            .to_public_key_der()
            .context("could not encode public key")?
            .to_vec();
        Ok(Self { key, der })
    }

    /// Reconstruct a key from its SubjectPublicKeyInfo DER encoding.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let key =
            RsaPublicKey::from_public_key_der(der).context("could not parse public key DER")?;
        Self::from_rsa(key)
    }

    /// Canonical SubjectPublicKeyInfo DER encoding.
    pub fn to_der(&self) -> Vec<u8> {
        self.der.clone()
    }

    /// Stable 160-bit id of this key.
    pub fn id(&self) -> InfoHash {
        InfoHash::get(&self.der)
    }

    /// Verify an RSA PKCS#1 v1.5 / SHA-512 signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        if signature.is_empty() {
            return false;
        }
        let digest = Sha512::digest(data);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha512>(), &digest, signature)
            .is_ok()
    }

    /// Block-wise RSA-OAEP encryption.
    ///
    /// The input is split into chunks of the largest size one OAEP block can
    /// carry; each chunk produces one modulus-size output block and the
    /// result is their concatenation. A zero-length plaintext still produces
    /// one padded block, so the ciphertext of valid input is never empty and
    /// every encryption round-trips through [`PrivateKey::decrypt`].
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.key.size();
        let Some(chunk) = block.checked_sub(OAEP_OVERHEAD).filter(|c| *c > 0) else {
            return Err(CryptoError::KeyTooShort { bits: block * 8 });
        };
        let mut out = Vec::with_capacity(data.len().div_ceil(chunk).max(1) * block);
        let mut remaining = data;
        loop {
            let (piece, rest) = remaining.split_at(remaining.len().min(chunk));
            let sealed = self
                .key
                .encrypt(&mut OsRng, Oaep::new::<Sha512>(), piece)
                .map_err(|_| CryptoError::Encryption)?;
            out.extend_from_slice(&sealed);
            remaining = rest;
            if remaining.is_empty() {
                break;
            }
        }
        Ok(out)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.id().to_hex()[..10])
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.der)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let der = Vec::<u8>::deserialize(deserializer)?;
        PublicKey::from_der(&der).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Private Key
// ============================================================================

/// RSA private key and its derivable public key.
#[derive(Clone)]
pub struct PrivateKey {
    key: RsaPrivateKey,
}

impl PrivateKey {
    /// Generate a new RSA key pair.
    ///
    /// `key_length` is the modulus size in bits, at least [`MIN_KEY_LENGTH`].
    pub fn generate(key_length: usize) -> Result<Self> {
        if key_length < MIN_KEY_LENGTH {
            bail!(CryptoError::KeyTooShort { bits: key_length });
        }
        let key =
            RsaPrivateKey::new(&mut OsRng, key_length).context("RSA key generation failed")?;
        Ok(Self { key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_rsa(RsaPublicKey::from(&self.key))
            .expect("an RSA public key always has a canonical encoding")
    }

    /// Sign `data` with RSA PKCS#1 v1.5 over SHA-512.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha512::digest(data);
        self.key
            .sign(Pkcs1v15Sign::new::<Sha512>(), &digest)
            .map_err(|_| CryptoError::Signing)
    }

    /// Reverse of [`PublicKey::encrypt`]: decrypt each modulus-size block
    /// and concatenate the recovered chunks. Valid ciphertext is at least
    /// one block long (even for an empty plaintext), so an empty input is
    /// truncated, not an empty message.
    pub fn decrypt(&self, cypher: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let block = self.key.size();
        if cypher.is_empty() || cypher.len() % block != 0 {
            return Err(DecryptError::Truncated);
        }
        let mut out = Vec::with_capacity(cypher.len());
        for piece in cypher.chunks(block) {
            let plain = self
                .key
                .decrypt(Oaep::new::<Sha512>(), piece)
                .map_err(|_| DecryptError::Block)?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }

    /// PKCS#8 DER encoding, PBES2-encrypted when a password is given.
    pub fn to_der(&self, password: Option<&str>) -> Result<Vec<u8>> {
        let doc = match password {
            None => self
                .key
                .to_pkcs8_der()
                .context("could not serialize private key")?,
            Some(password) => self
                .key
                .to_pkcs8_encrypted_der(&mut OsRng, password.as_bytes())
                .context("could not serialize encrypted private key")?,
        };
        Ok(doc.as_bytes().to_vec())
    }

    /// Reconstruct a key from [`PrivateKey::to_der`] output.
    pub fn from_der(der: &[u8], password: Option<&str>) -> Result<Self> {
        let key = match password {
            None => {
                RsaPrivateKey::from_pkcs8_der(der).context("could not parse private key DER")?
            }
            Some(password) => RsaPrivateKey::from_pkcs8_encrypted_der(der, password.as_bytes())
                .context("could not decrypt private key DER")?,
        };
        Ok(Self { key })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("id", &self.public_key().id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Certificate
// ============================================================================

/// Tag of a certificate alternative name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NameType {
    Rfc822,
    Dns,
    Uri,
    Ip,
}

/// X.509 certificate with an optional shared issuer chain.
///
/// The chain runs from subject up to a self-signed CA; roots terminate it
/// (cycles are not valid in X.509). Parsed fields are extracted once at
/// construction so the certificate can be shared cheaply.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: PublicKey,
    subject_cn: String,
    subject_uid: String,
    issuer_cn: String,
    issuer_uid: String,
    alt_names: Vec<(NameType, String)>,
    ca: bool,
    /// Issuer certificate, shared along the chain.
    pub issuer: Option<Arc<Certificate>>,
}

impl Certificate {
    /// Parse a single DER certificate (no chain).
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| anyhow!("could not parse certificate: {e}"))?;

        let public_key = PublicKey::from_der(cert.public_key().raw)
            .context("certificate carries an unsupported public key")?;

        let mut alt_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::RFC822Name(s) => alt_names.push((NameType::Rfc822, s.to_string())),
                    GeneralName::DNSName(s) => alt_names.push((NameType::Dns, s.to_string())),
                    GeneralName::URI(s) => alt_names.push((NameType::Uri, s.to_string())),
                    GeneralName::IPAddress(bytes) => {
                        alt_names.push((NameType::Ip, format_ip(bytes)))
                    }
                    _ => {}
                }
            }
        }

        let ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        Ok(Self {
            public_key,
            subject_cn: name_cn(cert.subject()),
            subject_uid: name_attr(cert.subject(), UID_OID_STR),
            issuer_cn: name_cn(cert.issuer()),
            issuer_uid: name_attr(cert.issuer(), UID_OID_STR),
            alt_names,
            ca,
            issuer: None,
            der: der.to_vec(),
        })
    }

    /// Parse a certificate from DER, or a PEM chain ordered from subject to
    /// issuer. The returned certificate is the subject; its `issuer` chain
    /// links the remaining entries.
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        if !looks_like_pem(blob) {
            return Self::from_der(blob);
        }
        let pems = ::pem::parse_many(blob).context("could not parse PEM input")?;
        let mut issuer: Option<Arc<Certificate>> = None;
        for entry in pems.iter().rev() {
            let mut cert = Self::from_der(entry.contents())?;
            cert.issuer = issuer.take();
            issuer = Some(Arc::new(cert));
        }
        let subject = issuer.ok_or_else(|| anyhow!("PEM input contains no certificate"))?;
        Ok(Arc::try_unwrap(subject).unwrap_or_else(|arc| (*arc).clone()))
    }

    /// DER of this certificate alone (the on-DHT payload form; issuers are
    /// resolved separately).
    pub fn to_der(&self) -> Vec<u8> {
        self.der.clone()
    }

    /// PEM encoding; with `chain`, the issuer chain is appended from subject
    /// to CA.
    pub fn to_pem(&self, chain: bool) -> String {
        let mut out = ::pem::encode(&::pem::Pem::new("CERTIFICATE", self.der.clone()));
        if chain {
            let mut next = self.issuer.clone();
            while let Some(cert) = next {
                out.push_str(&::pem::encode(&::pem::Pem::new("CERTIFICATE", cert.der.clone())));
                next = cert.issuer.clone();
            }
        }
        out
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Same as `public_key().id()`.
    pub fn id(&self) -> InfoHash {
        self.public_key.id()
    }

    pub fn common_name(&self) -> &str {
        &self.subject_cn
    }

    /// Subject UID: the hex public-key id for certificates generated by
    /// [`generate_identity`].
    pub fn uid(&self) -> &str {
        &self.subject_uid
    }

    pub fn issuer_common_name(&self) -> &str {
        &self.issuer_cn
    }

    pub fn issuer_uid(&self) -> &str {
        &self.issuer_uid
    }

    pub fn alternative_names(&self) -> &[(NameType, String)] {
        &self.alt_names
    }

    /// Whether the certificate is marked as a certificate authority.
    pub fn is_ca(&self) -> bool {
        self.ca
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cn", &self.subject_cn)
            .field("id", &self.id())
            .field("ca", &self.ca)
            .finish_non_exhaustive()
    }
}

fn looks_like_pem(blob: &[u8]) -> bool {
    blob.iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| blob[start..].starts_with(b"-----BEGIN"))
}

fn name_cn(name: &X509Name) -> String {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn name_attr(name: &X509Name, oid: &str) -> String {
    for attr in name.iter_attributes() {
        if attr.attr_type().to_id_string() == oid {
            if let Ok(s) = attr.as_str() {
                return s.to_string();
            }
        }
    }
    String::new()
}

fn format_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => {
            let arr: [u8; 4] = bytes.try_into().expect("length checked");
            IpAddr::V4(Ipv4Addr::from(arr)).to_string()
        }
        16 => {
            let arr: [u8; 16] = bytes.try_into().expect("length checked");
            IpAddr::V6(Ipv6Addr::from(arr)).to_string()
        }
        _ => hex::encode(bytes),
    }
}

// ============================================================================
// Identity
// ============================================================================

/// A private key and the certificate carrying its public half.
#[derive(Clone, Debug)]
pub struct Identity {
    pub private_key: Arc<PrivateKey>,
    pub certificate: Arc<Certificate>,
}

impl Identity {
    /// Pair a key and certificate, rejecting mismatched material.
    pub fn new(private_key: PrivateKey, certificate: Certificate) -> Result<Self, CryptoError> {
        if private_key.public_key().id() != certificate.id() {
            return Err(CryptoError::IdentityMismatch);
        }
        Ok(Self {
            private_key: Arc::new(private_key),
            certificate: Arc::new(certificate),
        })
    }

    /// The identity's 160-bit id (the public-key hash).
    pub fn id(&self) -> InfoHash {
        self.certificate.id()
    }
}

/// Generate a new RSA key pair and X.509 certificate.
///
/// With a CA identity the certificate is signed by it and chained to it;
/// otherwise it is self-signed and marked CA:TRUE. The subject CN is `name`,
/// the subject UID is the hex public-key id, the serial number is random and
/// the validity window is ten years.
pub fn generate_identity(
    name: &str,
    ca: Option<&Identity>,
    key_length: usize,
) -> Result<Identity> {
    let private_key = PrivateKey::generate(key_length)?;
    let certificate = issue_certificate(name, &private_key, ca)?;
    Identity::new(private_key, certificate).map_err(Into::into)
}

fn rcgen_key_pair(key: &PrivateKey) -> Result<rcgen::KeyPair> {
    let pkcs8 = key
        .key
        .to_pkcs8_der()
        .context("could not encode signing key")?;
    let der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
        .context("could not load RSA key for certificate signing")
}

fn issue_certificate(name: &str, key: &PrivateKey, ca: Option<&Identity>) -> Result<Certificate> {
    let key_pair = rcgen_key_pair(key)?;

    let mut params = rcgen::CertificateParams::new(Vec::new())
        .context("could not create certificate parameters")?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(name.to_string()),
    );
    params.distinguished_name.push(
        rcgen::DnType::CustomDnType(UID_OID.to_vec()),
        rcgen::DnValue::Utf8String(key.public_key().id().to_hex()),
    );
    params.serial_number = Some(rcgen::SerialNumber::from(OsRng.next_u64()));
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now - ::time::Duration::hours(1);
    params.not_after = now + ::time::Duration::days(CERT_VALIDITY_DAYS);

    let der = match ca {
        None => {
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params
                .self_signed(&key_pair)
                .context("could not self-sign certificate")?
                .der()
                .to_vec()
        }
        Some(ca) => {
            params.is_ca = rcgen::IsCa::ExplicitNoCa;
            let ca_key_pair = rcgen_key_pair(&ca.private_key)?;
            let ca_der = CertificateDer::from(ca.certificate.to_der());
            let issuer_params = rcgen::CertificateParams::from_ca_cert_der(&ca_der)
                .context("could not read CA certificate")?;
            let issuer = issuer_params
                .self_signed(&ca_key_pair)
                .context("could not load CA signer")?;
            params
                .signed_by(&key_pair, &issuer, &ca_key_pair)
                .context("could not sign certificate with CA")?
                .der()
                .to_vec()
        }
    };

    let mut certificate = Certificate::from_der(&der)?;
    if let Some(ca) = ca {
        certificate.issuer = Some(ca.certificate.clone());
    }
    Ok(certificate)
}

// ============================================================================
// AES-GCM helpers
// ============================================================================

/// AES-GCM encryption for 128/192/256-bit keys.
///
/// Output layout: `nonce(12) || ciphertext || tag(16)` with a random nonce.
pub fn aes_encrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; AES_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let bad_key = |_| CryptoError::BadAesKeyLength { len: key.len() };
    let sealed = match key.len() {
        16 => Aes128Gcm::new_from_slice(key).map_err(bad_key)?.encrypt(nonce, data),
        24 => Aes192Gcm::new_from_slice(key).map_err(bad_key)?.encrypt(nonce, data),
        32 => Aes256Gcm::new_from_slice(key).map_err(bad_key)?.encrypt(nonce, data),
        len => return Err(CryptoError::BadAesKeyLength { len }),
    }
    .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(AES_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse of [`aes_encrypt`]. Fails with [`DecryptError::Tag`] on any
/// tampering of nonce, ciphertext or tag.
pub fn aes_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AES_NONCE_LEN + AES_TAG_LEN {
        return Err(DecryptError::Truncated.into());
    }
    let (nonce_bytes, sealed) = data.split_at(AES_NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let bad_key = |_| CryptoError::BadAesKeyLength { len: key.len() };
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key).map_err(bad_key)?.decrypt(nonce, sealed),
        24 => Aes192Gcm::new_from_slice(key).map_err(bad_key)?.decrypt(nonce, sealed),
        32 => Aes256Gcm::new_from_slice(key).map_err(bad_key)?.decrypt(nonce, sealed),
        len => return Err(CryptoError::BadAesKeyLength { len }),
    }
    .map_err(|_| DecryptError::Tag.into())
}

// ============================================================================
// Shared test fixtures
// ============================================================================
