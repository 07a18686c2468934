//! Interface the overlay consumes from the underlying DHT.
//!
//! The overlay does not care how routing, iterative lookup or transport are
//! implemented; it talks to the DHT through [`DhtBackend`] only. Keeping the
//! trait this small lets the secure layer wrap any Kademlia implementation,
//! and lets tests substitute an in-process table.
//!
//! ## Callback contract
//!
//! Value batches arrive through an `on_values` callback in DHT-received
//! order; returning `false` stops the iterative query or listen. The
//! original `done(ok)` callback of each operation is the async return
//! value. All callbacks for one operation are dispatched sequentially on
//! the DHT driver task, so callback state needs no internal locking beyond
//! what sharing with the caller requires.

use std::sync::Arc;

use async_trait::async_trait;

use crate::infohash::InfoHash;
use crate::value::{Filter, Value, ValueType};

/// One batch of values delivered by the DHT.
pub type ValueBatch = Vec<Arc<Value>>;

/// Per-operation value sink; return `false` to stop the query.
pub type ValuesCallback = Box<dyn FnMut(ValueBatch) -> bool + Send>;

/// Handle for cancelling a [`DhtBackend::listen`].
pub type ListenToken = u64;

/// The small surface of a Kademlia-style DHT the secure overlay builds on.
#[async_trait]
pub trait DhtBackend: Send + Sync + 'static {
    /// The node id this backend routes under.
    fn local_id(&self) -> InfoHash;

    /// Fix the node id. Called once by the overlay during construction,
    /// before the backend bootstraps into the network.
    fn set_local_id(&self, id: InfoHash);

    /// Register a value type, replacing any previous type with the same tag.
    /// Values with unregistered tags fall back to the user-data policies.
    async fn register_type(&self, value_type: ValueType);

    /// Query values stored under `hash`. Resolves to the query outcome once
    /// the lookup terminates; `on_values` may be invoked any number of times
    /// before that.
    async fn get(&self, hash: InfoHash, on_values: ValuesCallback, filter: Option<Filter>)
    -> bool;

    /// Announce a value under `hash`. Resolves to `false` when the store was
    /// refused (e.g. by a store or edit policy).
    async fn put(&self, hash: InfoHash, value: Value) -> bool;

    /// Subscribe to values stored under `hash`. Current values are delivered
    /// immediately, later stores as they arrive, until the callback returns
    /// `false` or the listen is cancelled.
    async fn listen(
        &self,
        hash: InfoHash,
        on_values: ValuesCallback,
        filter: Option<Filter>,
    ) -> ListenToken;

    /// Cancel a listen. Returns `false` for unknown tokens.
    async fn cancel_listen(&self, hash: InfoHash, token: ListenToken) -> bool;

    /// The last value this node announced under `(hash, value_id)`, if any.
    async fn get_put(&self, hash: InfoHash, value_id: u64) -> Option<Value>;
}
