//! # Sealdht - Secure Overlay for Kademlia-style DHTs
//!
//! Sealdht augments a plain DHT value store with three guarantees:
//!
//! - **Authenticity**: values may be signed by their writer; storing nodes
//!   reject modifications not signed by the stored owner and enforce
//!   strictly monotonic sequence numbers against rollback
//! - **Confidentiality**: values may be end-to-end encrypted toward a named
//!   recipient, so only the recipient's private key recovers the plaintext
//! - **Identity discovery**: each participant's X.509 certificate is itself
//!   published into the DHT under its public-key hash, so peers resolve
//!   `id -> certificate` asynchronously and then verify or encrypt
//!
//! ## Architecture
//!
//! The overlay does not implement routing: it consumes any Kademlia-style
//! DHT through the small [`DhtBackend`] trait and layers signing,
//! encryption, policy enforcement and certificate resolution on top. An
//! in-process [`MemoryNetwork`] backend ships for tests and loopback use.
//!
//! ## Concurrency Model
//!
//! The overlay is cooperative: all value and completion callbacks are
//! dispatched sequentially on the DHT driver task, and user calls are
//! expected from that task or serialized externally. Shared state between
//! an operation and its callbacks lives in small reference-counted cells,
//! never in globals.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `infohash` | 160-bit identifiers: digest derivation, bit ops, ordering |
//! | `crypto` | RSA keys, X.509 certificate chains, sign/verify, block encryption, AES-GCM |
//! | `value` | Value model, canonical wire regions, filters, type policies |
//! | `backend` | `DhtBackend`: the interface consumed from the underlying DHT |
//! | `store` | In-process reference backend with policy enforcement |
//! | `directory` | Certificate cache with validation and local-store hook |
//! | `securedht` | The facade: get/listen/put, putSigned, putEncrypted, findCertificate |

mod backend;
mod crypto;
mod directory;
mod infohash;
mod securedht;
mod store;
mod value;

pub use backend::{DhtBackend, ListenToken, ValueBatch, ValuesCallback};
pub use crypto::{
    Certificate, CryptoError, DEFAULT_KEY_LENGTH, DecryptError, Identity, MIN_KEY_LENGTH,
    NameType, PrivateKey, PublicKey, aes_decrypt, aes_encrypt, generate_identity,
};
pub use directory::{CertificateDirectory, LocalCertificateStore};
pub use infohash::{HASH_BITS, HASH_LEN, InfoHash};
pub use securedht::{
    SecureDht, SecureDhtBuilder, secure_edit_policy, secure_store_policy, secure_type,
};
pub use store::{MemoryDht, MemoryNetwork};
pub use value::{
    CERTIFICATE_TYPE, EditPolicy, Filter, StorePolicy, USER_DATA_TYPE, Value, ValueFlags,
    ValueType, WireError, chain_filters,
};
