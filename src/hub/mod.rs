//! Single-process WebSocket fan-out.
//!
//! One coordinator task owns the client set. It is the only writer of that
//! set; fan-out takes the read side of the lock. Producers hand frames over
//! a bounded channel with `try_send` and are never blocked. Every client has
//! a bounded outbound queue, and a client whose queue is full is evicted on
//! the spot: its queue is closed and it is dropped from the set.
//!
//! The same hub type serves admin consoles (keyed by admin id) and user
//! clients (keyed by user id).

pub mod socket;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

/// An already-serialized frame body, shared between all recipients.
pub type Frame = Arc<str>;

/// Capacity of the hub-level dispatch channel.
pub const DISPATCH_CAPACITY: usize = 256;

pub trait HubKey: Eq + Clone + Debug + Send + Sync + 'static {}

impl<T: Eq + Clone + Debug + Send + Sync + 'static> HubKey for T {}

/// Handle returned to a newly registered client.
pub struct Subscription<K> {
    pub id: u64,
    pub key: K,
    pub rx: mpsc::Receiver<Frame>,
}

struct Client<K> {
    key: K,
    tx: mpsc::Sender<Frame>,
}

struct Registration<K> {
    id: u64,
    key: K,
    tx: mpsc::Sender<Frame>,
    ack: oneshot::Sender<()>,
}

enum Dispatch<K> {
    All(Frame),
    To(K, Frame),
}

type ClientSet<K> = Arc<RwLock<HashMap<u64, Client<K>>>>;

struct Inner<K> {
    name: &'static str,
    register_tx: mpsc::Sender<Registration<K>>,
    unregister_tx: mpsc::Sender<u64>,
    dispatch_tx: mpsc::Sender<Dispatch<K>>,
    clients: ClientSet<K>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

pub struct Hub<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Hub<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: HubKey> Hub<K> {
    /// Create a hub and spawn its coordinator. Must be called inside a Tokio runtime.
    pub fn new(name: &'static str, queue_capacity: usize) -> Self {
        // register/unregister are hand-offs; capacity 1 is the smallest tokio allows
        let (register_tx, register_rx) = mpsc::channel(1);
        let (unregister_tx, unregister_rx) = mpsc::channel(1);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CAPACITY);
        let clients: ClientSet<K> = Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(coordinate(
            name,
            Arc::clone(&clients),
            register_rx,
            unregister_rx,
            dispatch_rx,
        ));

        Self {
            inner: Arc::new(Inner {
                name,
                register_tx,
                unregister_tx,
                dispatch_tx,
                clients,
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Add a client. Resolves once the coordinator has inserted it, so any
    /// frame published afterwards reaches it.
    pub async fn register(&self, key: K) -> Option<Subscription<K>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let (ack, acked) = oneshot::channel();

        self.inner
            .register_tx
            .send(Registration { id, key: key.clone(), tx, ack })
            .await
            .ok()?;
        acked.await.ok()?;

        Some(Subscription { id, key, rx })
    }

    /// Remove a client. Unknown or already-evicted ids are ignored.
    pub async fn unregister(&self, id: u64) {
        let _ = self.inner.unregister_tx.send(id).await;
    }

    /// Queue a frame for every connected client.
    pub fn publish(&self, frame: Frame) -> bool {
        self.dispatch(Dispatch::All(frame))
    }

    /// Queue a frame for every client registered under `key`.
    pub fn send_to(&self, key: K, frame: Frame) -> bool {
        self.dispatch(Dispatch::To(key, frame))
    }

    fn dispatch(&self, dispatch: Dispatch<K>) -> bool {
        match self.inner.dispatch_tx.try_send(dispatch) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(hub = self.inner.name, "Dispatch backlog full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn is_connected(&self, key: &K) -> bool {
        self.inner.clients.read().values().any(|c| &c.key == key)
    }
}

async fn coordinate<K: HubKey>(
    name: &'static str,
    clients: ClientSet<K>,
    mut register_rx: mpsc::Receiver<Registration<K>>,
    mut unregister_rx: mpsc::Receiver<u64>,
    mut dispatch_rx: mpsc::Receiver<Dispatch<K>>,
) {
    loop {
        tokio::select! {
            biased;

            Some(reg) = register_rx.recv() => {
                tracing::debug!(hub = name, client = reg.id, key = ?reg.key, "Client registered");
                clients.write().insert(reg.id, Client { key: reg.key, tx: reg.tx });
                let _ = reg.ack.send(());
            }
            Some(id) = unregister_rx.recv() => {
                if clients.write().remove(&id).is_some() {
                    tracing::debug!(hub = name, client = id, "Client unregistered");
                }
            }
            Some(dispatch) = dispatch_rx.recv() => fan_out(name, &clients, dispatch),
            else => break,
        }
    }

    tracing::debug!(hub = name, "Hub coordinator stopped");
}

fn fan_out<K: HubKey>(name: &'static str, clients: &ClientSet<K>, dispatch: Dispatch<K>) {
    let (target, frame) = match dispatch {
        Dispatch::All(frame) => (None, frame),
        Dispatch::To(key, frame) => (Some(key), frame),
    };

    let mut evicted = Vec::new();
    {
        let set = clients.read();
        for (id, client) in set.iter() {
            if target.as_ref().is_some_and(|key| key != &client.key) {
                continue;
            }
            if client.tx.try_send(Arc::clone(&frame)).is_err() {
                evicted.push(*id);
            }
        }
    }

    if !evicted.is_empty() {
        let mut set = clients.write();
        for id in evicted {
            // dropping the sender closes the client's queue
            if let Some(client) = set.remove(&id) {
                tracing::warn!(hub = name, client = id, key = ?client.key, "Outbound queue full, client evicted");
            }
        }
    }
}
