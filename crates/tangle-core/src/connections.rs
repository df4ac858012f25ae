//! Connection store
//!
//! Owns every live [`Connection`], hands out process-local ids, and
//! broadcasts lifecycle events so the topology layer (and embedders) can
//! react to links coming and going. Outbound dials go through the
//! [`Transport`] collaborator, throttled by a semaphore so a flapping
//! target list cannot exhaust the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info};

use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionId};
use crate::cvid::Cvid;
use crate::error::{NetError, NetResult};
use crate::transport::{Link, LinkOptions, Transport};

/// Lifecycle events emitted by the store
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed on a link
    Established {
        id: ConnectionId,
        local_cvid: Cvid,
        remote_cvid: Cvid,
    },
    /// Handshake failed; the link stays open but carries no session
    HandshakeFailed { id: ConnectionId },
    /// A link was lost or removed
    Lost { id: ConnectionId, remote_cvid: Cvid },
}

/// Registry of live connections
pub struct ConnectionStore {
    transport: Arc<dyn Transport>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    events: broadcast::Sender<ConnectionEvent>,
    dial_permits: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl ConnectionStore {
    pub fn new(transport: Arc<dyn Transport>, config: &NetConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            transport,
            connections: RwLock::new(HashMap::new()),
            events,
            dial_permits: Arc::new(Semaphore::new(config.outgoing_concurrency)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Dial a new outbound connection.
    ///
    /// Returns the connection handle and the link's receive half; the caller
    /// drives the read loop.
    pub async fn connect(
        &self,
        address: &str,
        port: u16,
        options: &LinkOptions,
    ) -> NetResult<(Arc<Connection>, mpsc::UnboundedReceiver<Bytes>)> {
        let _permit = self
            .dial_permits
            .acquire()
            .await
            .map_err(|_| NetError::IllegalState("dial semaphore closed".into()))?;

        debug!(address, port, "Dialing");
        let link = tokio::time::timeout(
            options.connect_timeout,
            self.transport.connect(address, port, options),
        )
        .await
        .map_err(|_| NetError::Timeout)??;

        Ok(self.adopt(link))
    }

    /// Take ownership of an already-established link (e.g. an accepted
    /// inbound connection).
    pub fn adopt(&self, link: Link) -> (Arc<Connection>, mpsc::UnboundedReceiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, link.peer, link.tx);
        self.connections.write().insert(id, connection.clone());
        info!(id, peer = %connection.peer(), "Connection adopted");
        (connection, link.rx)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// First connection whose peer holds the given session id
    pub fn get_by_cvid(&self, cvid: Cvid) -> Option<Arc<Connection>> {
        if cvid == 0 {
            return None;
        }
        self.connections
            .read()
            .values()
            .find(|conn| conn.remote_cvid() == cvid)
            .cloned()
    }

    /// Announce a completed handshake
    pub fn mark_established(&self, connection: &Connection) {
        let _ = self.events.send(ConnectionEvent::Established {
            id: connection.id(),
            local_cvid: connection.local_cvid(),
            remote_cvid: connection.remote_cvid(),
        });
    }

    /// Announce a failed handshake
    pub fn mark_handshake_failed(&self, connection: &Connection) {
        let _ = self
            .events
            .send(ConnectionEvent::HandshakeFailed {
                id: connection.id(),
            });
    }

    /// Drop a connection, shutting it down and announcing the loss
    pub fn remove(&self, id: ConnectionId) {
        let removed = self.connections.write().remove(&id);
        if let Some(connection) = removed {
            connection.shutdown();
            info!(id, peer = %connection.peer(), "Connection removed");
            let _ = self.events.send(ConnectionEvent::Lost {
                id,
                remote_cvid: connection.remote_cvid(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Shut down every connection
    pub fn clear(&self) {
        let drained: Vec<ConnectionId> = self.connections.read().keys().copied().collect();
        for id in drained {
            self.remove(id);
        }
    }
}
