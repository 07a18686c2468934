//! # Value model
//!
//! A value is data stored at an [`InfoHash`] in the DHT, together with the
//! metadata the overlay authenticates:
//!
//! - `id`: 64-bit discriminator between values stored at one location
//! - `flags`: whether the value is signed, encrypted, and/or directed
//! - `owner`: public key of the original writer (signed values)
//! - `recipient`: key id of the addressee (directed values)
//! - `seq`: revision counter preventing rollback of signed values
//!
//! ## Canonical regions
//!
//! Two byte regions are carved out of the value for cryptography, using a
//! stable length-tagged little-endian layout so independent implementations
//! interoperate:
//!
//! - [`Value::to_sign`] covers everything authenticated: type, id, flags,
//!   owner key, seq, recipient, data. `seq` is inside the signed region, so
//!   a replayed signature cannot claim a new revision.
//! - [`Value::to_encrypt`] is `to_sign` plus the signature, so decrypting a
//!   directed value reconstructs the complete signed value.
//!
//! The outer wire form ([`Value::pack`]) is the signed region plus the
//! signature for plain values, or `type | id | flags | recipient | cypher`
//! for encrypted ones.
//!
//! ## Value types
//!
//! A [`ValueType`] associates a 16-bit tag with an expiration and a pair of
//! store/edit policies that the storing node runs against incoming values.
//! The default policies accept any store and accept any edit (an
//! unauthenticated replacement imposes no authorship); authenticated types
//! constrain replacement through the secure policy wrapper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::infohash::{HASH_LEN, InfoHash};

/// Tag of the generic user-data value type.
pub const USER_DATA_TYPE: u16 = 0;

/// Reserved well-known tag for on-DHT certificates.
///
/// The overlay registers this type as insecure: certificate values are the
/// means of obtaining signature keys, so they cannot themselves be subject
/// to signature enforcement.
pub const CERTIFICATE_TYPE: u16 = 8;

bitflags! {
    /// How a value is signed and encrypted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValueFlags: u8 {
        const SIGNED = 0b001;
        const ENCRYPTED = 0b010;
        const RECIPIENT = 0b100;
    }
}

impl Serialize for ValueFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for ValueFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ValueFlags::from_bits_truncate(u8::deserialize(deserializer)?))
    }
}

// ============================================================================
// Wire Errors
// ============================================================================

/// Error type for canonical-encoding parse failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the announced field.
    Truncated,
    /// A length prefix exceeds the remaining input.
    Length,
    /// The embedded owner key could not be parsed.
    BadPublicKey,
    /// Bytes left over after the value ended.
    Trailing,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "value encoding is truncated"),
            WireError::Length => write!(f, "length prefix exceeds input"),
            WireError::BadPublicKey => write!(f, "embedded owner key is invalid"),
            WireError::Trailing => write!(f, "trailing bytes after value"),
        }
    }
}

impl std::error::Error for WireError {}

/// Bounds-checked reader over a canonical encoding.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("length checked")))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("length checked")))
    }

    fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().expect("length checked")) as usize;
        if self.buf.len() < len {
            return Err(WireError::Length);
        }
        self.take(len)
    }

    fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() { Ok(()) } else { Err(WireError::Trailing) }
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

// ============================================================================
// Value
// ============================================================================

/// A value stored at an [`InfoHash`], with signing and encryption metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Value {
    /// Discriminator between values stored at the same location.
    /// [`Value::INVALID_ID`] means "assign a random id on announce".
    pub id: u64,
    /// Registered value-type tag.
    pub value_type: u16,
    pub flags: ValueFlags,
    /// Public key of the original writer; present iff signed.
    pub owner: Option<PublicKey>,
    /// Key id of the addressee; the zero hash when absent.
    pub recipient: InfoHash,
    /// Plaintext payload (empty for encrypted values).
    pub data: Vec<u8>,
    /// Revision counter per `(info-hash, value-id, owner)`.
    pub seq: u16,
    pub signature: Vec<u8>,
    /// Ciphertext (encrypted values only).
    pub cypher: Vec<u8>,
}

impl Value {
    pub const INVALID_ID: u64 = 0;

    pub fn new(value_type: u16, data: Vec<u8>) -> Self {
        Self {
            value_type,
            data,
            ..Self::default()
        }
    }

    pub fn with_id(id: u64) -> Self {
        Self { id, ..Self::default() }
    }

    /// A random non-zero value id.
    pub fn random_id() -> u64 {
        loop {
            let id = OsRng.next_u64();
            if id != Self::INVALID_ID {
                return id;
            }
        }
    }

    #[inline]
    pub fn is_signed(&self) -> bool {
        self.flags.contains(ValueFlags::SIGNED)
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(ValueFlags::ENCRYPTED)
    }

    #[inline]
    pub fn has_recipient(&self) -> bool {
        self.flags.contains(ValueFlags::RECIPIENT)
    }

    /// Address the value to a recipient key id.
    pub fn set_recipient(&mut self, recipient: InfoHash) {
        self.recipient = recipient;
        self.flags |= ValueFlags::RECIPIENT;
    }

    /// Replace the contents with ciphertext, marking the value opaque.
    pub fn set_cypher(&mut self, cypher: Vec<u8>) {
        self.cypher = cypher;
        self.flags = ValueFlags::SIGNED | ValueFlags::ENCRYPTED | ValueFlags::RECIPIENT;
    }

    /// Verify the signature against the embedded owner key.
    pub fn check_signature(&self) -> bool {
        match &self.owner {
            Some(owner) => owner.verify(&self.to_sign(), &self.signature),
            None => false,
        }
    }

    /// Bytes covered by the signature.
    pub fn to_sign(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.data.len());
        out.extend_from_slice(&self.value_type.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(self.flags.bits());
        if self.is_signed() {
            let owner = self
                .owner
                .as_ref()
                .map(PublicKey::to_der)
                .unwrap_or_default();
            put_bytes(&mut out, &owner);
            out.extend_from_slice(&self.seq.to_le_bytes());
        }
        if self.has_recipient() {
            out.extend_from_slice(self.recipient.as_bytes());
        }
        put_bytes(&mut out, &self.data);
        out
    }

    /// Bytes handed to the recipient's key: the signed region plus the
    /// signature, so the decrypted output is a complete signed value.
    pub fn to_encrypt(&self) -> Vec<u8> {
        let mut out = self.to_sign();
        put_bytes(&mut out, &self.signature);
        out
    }

    /// Outer wire encoding.
    pub fn pack(&self) -> Vec<u8> {
        if self.is_encrypted() {
            let mut out = Vec::with_capacity(2 + 8 + 1 + HASH_LEN + 4 + self.cypher.len());
            out.extend_from_slice(&self.value_type.to_le_bytes());
            out.extend_from_slice(&self.id.to_le_bytes());
            out.push(self.flags.bits());
            out.extend_from_slice(self.recipient.as_bytes());
            put_bytes(&mut out, &self.cypher);
            return out;
        }
        let mut out = self.to_sign();
        if self.is_signed() {
            put_bytes(&mut out, &self.signature);
        }
        out
    }

    /// Parse an outer wire encoding.
    pub fn unpack(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);
        let value_type = r.u16()?;
        let id = r.u64()?;
        let flags = ValueFlags::from_bits_truncate(r.u8()?);

        let mut value = Value {
            id,
            value_type,
            flags,
            ..Self::default()
        };

        if flags.contains(ValueFlags::ENCRYPTED) {
            let recipient: [u8; HASH_LEN] =
                r.take(HASH_LEN)?.try_into().expect("length checked");
            value.recipient = InfoHash::from_bytes(recipient);
            value.cypher = r.bytes()?.to_vec();
            r.finish()?;
            return Ok(value);
        }

        if flags.contains(ValueFlags::SIGNED) {
            let owner = r.bytes()?;
            value.owner = Some(PublicKey::from_der(owner).map_err(|_| WireError::BadPublicKey)?);
            value.seq = r.u16()?;
        }
        if flags.contains(ValueFlags::RECIPIENT) {
            let recipient: [u8; HASH_LEN] =
                r.take(HASH_LEN)?.try_into().expect("length checked");
            value.recipient = InfoHash::from_bytes(recipient);
        }
        value.data = r.bytes()?.to_vec();
        if flags.contains(ValueFlags::SIGNED) {
            value.signature = r.bytes()?.to_vec();
        }
        r.finish()?;
        Ok(value)
    }

    /// Reconstruct a signed value from decrypted bytes, binding it to the
    /// id of the enclosing encrypted value. The caller is responsible for
    /// verifying the inner signature afterwards.
    pub fn unpack_body(bytes: &[u8], id: u64) -> Result<Self, WireError> {
        let mut value = Self::unpack(bytes)?;
        value.id = id;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// A filter accepting everything.
    pub fn all_filter() -> Filter {
        Arc::new(|_| true)
    }

    /// Accept values of one registered type.
    pub fn type_filter(value_type: u16) -> Filter {
        Arc::new(move |v: &Value| v.value_type == value_type)
    }

    /// Accept values with one id.
    pub fn id_filter(id: u64) -> Filter {
        Arc::new(move |v: &Value| v.id == id)
    }

    /// Accept values directed at one recipient.
    pub fn recipient_filter(recipient: InfoHash) -> Filter {
        Arc::new(move |v: &Value| v.recipient == recipient)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id {
            return false;
        }
        if self.is_encrypted() {
            return self.cypher == other.cypher;
        }
        self.owner == other.owner
            && self.value_type == other.value_type
            && self.data == other.data
            && self.signature == other.signature
    }
}

impl Eq for Value {}

/// Shared predicate over values, applied after decryption/verification.
pub type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Conjunction of two filters.
pub fn chain_filters(first: Filter, second: Filter) -> Filter {
    Arc::new(move |v: &Value| first(v) && second(v))
}

// ============================================================================
// Value Types and Policies
// ============================================================================

/// Store admission check run by the storing node:
/// `(info_hash, value, from_node, from_addr) -> accept`.
pub type StorePolicy = Arc<dyn Fn(&InfoHash, &Arc<Value>, &InfoHash, SocketAddr) -> bool + Send + Sync>;

/// Replacement check run by the storing node:
/// `(info_hash, old, new, from_node, from_addr) -> accept`.
pub type EditPolicy =
    Arc<dyn Fn(&InfoHash, &Arc<Value>, &Arc<Value>, &InfoHash, SocketAddr) -> bool + Send + Sync>;

/// A registered value type: a 16-bit tag with storage policies.
#[derive(Clone)]
pub struct ValueType {
    pub id: u16,
    pub name: String,
    pub expiration: Duration,
    pub store_policy: StorePolicy,
    pub edit_policy: EditPolicy,
}

impl ValueType {
    /// A type with the default policies (accept stores, accept edits).
    pub fn new(id: u16, name: &str, expiration: Duration) -> Self {
        Self::with_policies(
            id,
            name,
            expiration,
            Self::default_store_policy(),
            Self::default_edit_policy(),
        )
    }

    pub fn with_policies(
        id: u16,
        name: &str,
        expiration: Duration,
        store_policy: StorePolicy,
        edit_policy: EditPolicy,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            expiration,
            store_policy,
            edit_policy,
        }
    }

    /// Accept every store.
    pub fn default_store_policy() -> StorePolicy {
        Arc::new(|_, _, _, _| true)
    }

    /// Accept every edit. Authenticated types constrain replacement through
    /// the secure policy wrapper, which runs before delegating here.
    pub fn default_edit_policy() -> EditPolicy {
        Arc::new(|_, _, _, _, _| true)
    }

    /// The generic user-data type.
    pub fn user_data() -> Self {
        Self::new(USER_DATA_TYPE, "User Data", Duration::from_secs(60 * 60))
    }

    /// The reserved certificate type.
    pub fn certificate() -> Self {
        Self::new(CERTIFICATE_TYPE, "Certificate", Duration::from_secs(60 * 60))
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ValueType {}

impl std::fmt::Debug for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}
