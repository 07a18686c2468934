//! In-process reference backend.
//!
//! [`MemoryNetwork`] is a single value table shared by any number of
//! [`MemoryDht`] backends, simulating a DHT network inside one process:
//! every node sees every store, and the table runs the registered store and
//! edit policies against each incoming value exactly like a storing node
//! would. It backs the integration tests and doubles as a loopback backend
//! for applications that want overlay semantics without a network.
//!
//! Policy refusal surfaces as `put -> false`. Stored values expire per
//! their registered type and are pruned on access. Listener callbacks are
//! invoked with the table lock released, so a callback may re-enter the
//! backend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::{DhtBackend, ListenToken, ValueBatch, ValuesCallback};
use crate::infohash::InfoHash;
use crate::value::{Filter, USER_DATA_TYPE, Value, ValueType};

/// Address reported to policies for in-process stores.
const LOCAL_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    0,
);

struct StoredEntry {
    value: Arc<Value>,
    expires_at: Instant,
}

struct Listener {
    filter: Option<Filter>,
    callback: ValuesCallback,
}

#[derive(Default)]
struct TableState {
    types: HashMap<u16, ValueType>,
    storage: HashMap<InfoHash, HashMap<u64, StoredEntry>>,
    listeners: HashMap<InfoHash, Vec<(ListenToken, Listener)>>,
    next_token: ListenToken,
}

impl TableState {
    /// Registered type for a tag, falling back to the plain user-data
    /// policies for unregistered tags.
    fn type_for(&self, tag: u16) -> ValueType {
        self.types
            .get(&tag)
            .or_else(|| self.types.get(&USER_DATA_TYPE))
            .cloned()
            .unwrap_or_else(ValueType::user_data)
    }

    fn prune_expired(&mut self, hash: &InfoHash) {
        if let Some(values) = self.storage.get_mut(hash) {
            let now = Instant::now();
            values.retain(|_, entry| entry.expires_at > now);
        }
    }
}

/// A shared in-process value table.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<TableState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new backend attached to this table, with a random node id until
    /// the overlay fixes it.
    pub fn node(&self) -> MemoryDht {
        MemoryDht {
            state: self.state.clone(),
            id: Mutex::new(InfoHash::random()),
            announced: Mutex::new(HashMap::new()),
        }
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryDht {
    state: Arc<Mutex<TableState>>,
    id: Mutex<InfoHash>,
    /// Last value this node announced per `(hash, value id)`.
    announced: Mutex<HashMap<(InfoHash, u64), Value>>,
}

impl MemoryDht {
    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().expect("table lock poisoned")
    }
}

#[async_trait]
impl DhtBackend for MemoryDht {
    fn local_id(&self) -> InfoHash {
        *self.id.lock().expect("id lock poisoned")
    }

    fn set_local_id(&self, id: InfoHash) {
        *self.id.lock().expect("id lock poisoned") = id;
    }

    async fn register_type(&self, value_type: ValueType) {
        debug!(tag = value_type.id, name = %value_type.name, "registering value type");
        self.lock().types.insert(value_type.id, value_type);
    }

    async fn get(
        &self,
        hash: InfoHash,
        mut on_values: ValuesCallback,
        filter: Option<Filter>,
    ) -> bool {
        let mut batch: ValueBatch = {
            let mut state = self.lock();
            state.prune_expired(&hash);
            state
                .storage
                .get(&hash)
                .map(|values| values.values().map(|e| e.value.clone()).collect())
                .unwrap_or_default()
        };
        batch.sort_by_key(|v| v.id);
        if let Some(filter) = &filter {
            batch.retain(|v| filter(v));
        }
        if !batch.is_empty() {
            on_values(batch);
        }
        true
    }

    async fn put(&self, hash: InfoHash, value: Value) -> bool {
        let value = Arc::new(value);
        let from = self.local_id();

        let mut to_notify: Vec<(ListenToken, Listener)> = Vec::new();
        let accepted = {
            let mut state = self.lock();
            state.prune_expired(&hash);
            let value_type = state.type_for(value.value_type);
            let values = state.storage.entry(hash).or_default();
            let accepted = match values.get(&value.id) {
                Some(existing) => {
                    (value_type.edit_policy)(&hash, &existing.value, &value, &from, LOCAL_ADDR)
                }
                None => (value_type.store_policy)(&hash, &value, &from, LOCAL_ADDR),
            };
            if accepted {
                values.insert(
                    value.id,
                    StoredEntry {
                        value: value.clone(),
                        expires_at: Instant::now() + value_type.expiration,
                    },
                );
                if let Some(listeners) = state.listeners.get_mut(&hash) {
                    let mut keep = Vec::new();
                    for (token, listener) in listeners.drain(..) {
                        let matches = listener.filter.as_ref().is_none_or(|f| f(&value));
                        if matches {
                            to_notify.push((token, listener));
                        } else {
                            keep.push((token, listener));
                        }
                    }
                    *listeners = keep;
                }
            }
            accepted
        };

        if !accepted {
            info!(%hash, id = value.id, tag = value.value_type, "store refused by policy");
            return false;
        }

        // Callbacks run without the table lock so they may re-enter.
        let mut still_listening = Vec::new();
        for (token, mut listener) in to_notify {
            if (listener.callback)(vec![value.clone()]) {
                still_listening.push((token, listener));
            }
        }
        if !still_listening.is_empty() {
            self.lock()
                .listeners
                .entry(hash)
                .or_default()
                .extend(still_listening);
        }

        self.announced
            .lock()
            .expect("announce lock poisoned")
            .insert((hash, value.id), (*value).clone());
        true
    }

    async fn listen(
        &self,
        hash: InfoHash,
        mut on_values: ValuesCallback,
        filter: Option<Filter>,
    ) -> ListenToken {
        let (token, mut current) = {
            let mut state = self.lock();
            state.prune_expired(&hash);
            state.next_token += 1;
            let token = state.next_token;
            let current: ValueBatch = state
                .storage
                .get(&hash)
                .map(|values| values.values().map(|e| e.value.clone()).collect())
                .unwrap_or_default();
            (token, current)
        };
        current.sort_by_key(|v| v.id);
        if let Some(filter) = &filter {
            current.retain(|v| filter(v));
        }

        let keep = current.is_empty() || on_values(current);
        if keep {
            self.lock().listeners.entry(hash).or_default().push((
                token,
                Listener {
                    filter,
                    callback: on_values,
                },
            ));
        }
        token
    }

    async fn cancel_listen(&self, hash: InfoHash, token: ListenToken) -> bool {
        let mut state = self.lock();
        let Some(listeners) = state.listeners.get_mut(&hash) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() != before
    }

    async fn get_put(&self, hash: InfoHash, value_id: u64) -> Option<Value> {
        self.announced
            .lock()
            .expect("announce lock poisoned")
            .get(&(hash, value_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn value(id: u64, data: &[u8]) -> Value {
        let mut v = Value::new(USER_DATA_TYPE, data.to_vec());
        v.id = id;
        v
    }

    /// Collect delivered batches into a shared vector.
    fn collector() -> (Arc<Mutex<Vec<Value>>>, ValuesCallback) {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = seen.clone();
        let cb: ValuesCallback = Box::new(move |batch| {
            sink.lock()
                .expect("lock poisoned")
                .extend(batch.iter().map(|v| (**v).clone()));
            true
        });
        (seen, cb)
    }

    #[tokio::test]
    async fn put_then_get() {
        let net = MemoryNetwork::new();
        let a = net.node();
        let b = net.node();
        let hash = InfoHash::random();

        assert!(a.put(hash, value(1, b"hello")).await);

        let (seen, cb) = collector();
        assert!(b.get(hash, cb, None).await);
        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, b"hello");
    }

    #[tokio::test]
    async fn get_applies_filter_and_suppresses_empty_batches() {
        let net = MemoryNetwork::new();
        let node = net.node();
        let hash = InfoHash::random();
        node.put(hash, value(1, b"one")).await;
        node.put(hash, value(2, b"two")).await;

        let (seen, cb) = collector();
        node.get(hash, cb, Some(Value::id_filter(2))).await;
        assert_eq!(seen.lock().expect("lock poisoned").len(), 1);

        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        let cb: ValuesCallback = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        node.get(hash, cb, Some(Value::id_filter(99))).await;
        assert_eq!(called.load(Ordering::SeqCst), 0, "empty batch delivered");
    }

    #[tokio::test]
    async fn default_policies_allow_overwrite() {
        let net = MemoryNetwork::new();
        let node = net.node();
        let hash = InfoHash::random();

        assert!(node.put(hash, value(1, b"first")).await);
        assert!(node.put(hash, value(1, b"second")).await);

        let (seen, cb) = collector();
        node.get(hash, cb, None).await;
        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, b"second");
    }

    #[tokio::test]
    async fn rejecting_policy_refuses_store() {
        let net = MemoryNetwork::new();
        let node = net.node();
        let vt = ValueType::with_policies(
            7,
            "locked",
            Duration::from_secs(60),
            Arc::new(|_, _, _, _| false),
            ValueType::default_edit_policy(),
        );
        node.register_type(vt).await;

        let mut v = Value::new(7, b"nope".to_vec());
        v.id = 1;
        assert!(!node.put(InfoHash::random(), v).await);
    }

    #[tokio::test]
    async fn listeners_replay_and_follow() {
        let net = MemoryNetwork::new();
        let a = net.node();
        let b = net.node();
        let hash = InfoHash::random();
        a.put(hash, value(1, b"old")).await;

        let (seen, cb) = collector();
        let token = b.listen(hash, cb, None).await;
        assert_eq!(seen.lock().expect("lock poisoned").len(), 1, "no replay");

        a.put(hash, value(2, b"new")).await;
        assert_eq!(seen.lock().expect("lock poisoned").len(), 2, "no live update");

        assert!(b.cancel_listen(hash, token).await);
        a.put(hash, value(3, b"after cancel")).await;
        assert_eq!(seen.lock().expect("lock poisoned").len(), 2);
        assert!(!b.cancel_listen(hash, token).await);
    }

    #[tokio::test]
    async fn listener_stops_by_returning_false() {
        let net = MemoryNetwork::new();
        let node = net.node();
        let hash = InfoHash::random();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cb: ValuesCallback = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });
        node.listen(hash, cb, None).await;

        node.put(hash, value(1, b"one")).await;
        node.put(hash, value(2, b"two")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "listener kept after false");
    }

    #[tokio::test]
    async fn values_expire() {
        let net = MemoryNetwork::new();
        let node = net.node();
        node.register_type(ValueType::new(9, "ephemeral", Duration::from_millis(20)))
            .await;
        let hash = InfoHash::random();

        let mut v = Value::new(9, b"short-lived".to_vec());
        v.id = 1;
        node.put(hash, v).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let (seen, cb) = collector();
        node.get(hash, cb, None).await;
        assert!(seen.lock().expect("lock poisoned").is_empty(), "value survived expiry");
    }

    #[tokio::test]
    async fn get_put_returns_own_announcements_only() {
        let net = MemoryNetwork::new();
        let a = net.node();
        let b = net.node();
        let hash = InfoHash::random();

        a.put(hash, value(4, b"mine")).await;
        assert_eq!(
            a.get_put(hash, 4).await.expect("announcement missing").data,
            b"mine"
        );
        assert!(b.get_put(hash, 4).await.is_none());
        assert!(a.get_put(hash, 5).await.is_none());
    }
}
