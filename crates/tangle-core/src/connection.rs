//! A single established link to a peer
//!
//! [`Connection`] wraps the send half of a transport link with the state a
//! live peer needs: negotiated session ids, the pending-request table that
//! pairs replies with their requests, and the per-stream sinks that receive
//! entanglement events.
//!
//! Request/reply pairing is explicit: [`Connection::read`] registers interest
//! in a correlation id *before* the request is sent, so a fast reply can
//! never slip past the reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::cvid::{Cvid, InstanceType};
use crate::envelope::{Envelope, Frame, MessageId};
use crate::error::{NetError, NetResult};
use crate::stream::StreamSink;

/// Process-local connection handle, unrelated to any wire identifier
pub type ConnectionId = u64;

/// State for one established link
pub struct Connection {
    id: ConnectionId,
    peer: String,
    local_cvid: AtomicI32,
    remote_cvid: AtomicI32,
    remote_uuid: Mutex<Option<String>>,
    remote_instance: Mutex<Option<InstanceType>>,
    link_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Envelope>>>,
    sinks: Mutex<HashMap<i32, Arc<dyn StreamSink>>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: String, link_tx: mpsc::UnboundedSender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            local_cvid: AtomicI32::new(0),
            remote_cvid: AtomicI32::new(0),
            remote_uuid: Mutex::new(None),
            remote_instance: Mutex::new(None),
            link_tx: Mutex::new(Some(link_tx)),
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Our session id on this link (0 before the handshake completes)
    pub fn local_cvid(&self) -> Cvid {
        self.local_cvid.load(Ordering::Acquire)
    }

    pub fn set_local_cvid(&self, cvid: Cvid) {
        self.local_cvid.store(cvid, Ordering::Release);
    }

    /// The peer's session id (0 before the handshake completes)
    pub fn remote_cvid(&self) -> Cvid {
        self.remote_cvid.load(Ordering::Acquire)
    }

    pub fn set_remote_cvid(&self, cvid: Cvid) {
        self.remote_cvid.store(cvid, Ordering::Release);
    }

    /// The peer's long-term identity, once learned
    pub fn remote_uuid(&self) -> Option<String> {
        self.remote_uuid.lock().clone()
    }

    pub fn set_remote_uuid(&self, uuid: String) {
        *self.remote_uuid.lock() = Some(uuid);
    }

    pub fn remote_instance(&self) -> Option<InstanceType> {
        *self.remote_instance.lock()
    }

    pub fn set_remote_instance(&self, instance: InstanceType) {
        *self.remote_instance.lock() = Some(instance);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serialize and transmit an envelope
    pub fn send(&self, envelope: &Envelope) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::ConnectionClosed);
        }
        trace!(to = envelope.to, id = envelope.id, "Sending envelope");
        let bytes = Frame::V1(envelope.clone()).encode()?;
        match self.link_tx.lock().as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| NetError::ConnectionClosed),
            None => Err(NetError::ConnectionClosed),
        }
    }

    /// Register interest in the reply carrying the given correlation id.
    ///
    /// Call this before sending the request; the returned future then cannot
    /// miss a reply that arrives immediately.
    pub fn read(self: &Arc<Self>, id: MessageId) -> ReplyFuture {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        ReplyFuture {
            connection: self.clone(),
            id,
            rx: Some(rx),
        }
    }

    /// Offer an inbound envelope to the pending-request table.
    ///
    /// Returns `None` when a waiter consumed it, otherwise hands the
    /// envelope back for regular dispatch.
    pub fn complete_reply(&self, envelope: Envelope) -> Option<Envelope> {
        let waiter = self.pending.lock().remove(&envelope.id);
        match waiter {
            Some(tx) => match tx.send(envelope) {
                Ok(()) => None,
                // Waiter gave up between deregistration and delivery
                Err(envelope) => Some(envelope),
            },
            None => Some(envelope),
        }
    }

    /// Attach a sink for one stream id
    pub fn register_sink(&self, stream_id: i32, sink: Arc<dyn StreamSink>) {
        self.sinks.lock().insert(stream_id, sink);
    }

    pub fn remove_sink(&self, stream_id: i32) {
        self.sinks.lock().remove(&stream_id);
    }

    /// The sink attached to a stream id, if any
    pub fn sink(&self, stream_id: i32) -> Option<Arc<dyn StreamSink>> {
        self.sinks.lock().get(&stream_id).cloned()
    }

    /// Mark the connection closed and fail all outstanding requests
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(id = self.id, peer = %self.peer, "Connection shut down");
        // Dropping the send half lets the peer's read loop observe the loss
        self.link_tx.lock().take();
        // Dropping the senders wakes every waiter with ConnectionClosed
        self.pending.lock().clear();
        self.sinks.lock().clear();
    }

    fn forget(&self, id: MessageId) {
        self.pending.lock().remove(&id);
    }
}

/// Pending reply registered with [`Connection::read`].
///
/// Dropping the future (timeout, cancellation) deregisters the pending
/// entry, so abandoned requests never leak table slots.
pub struct ReplyFuture {
    connection: Arc<Connection>,
    id: MessageId,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl ReplyFuture {
    /// Wait for the reply, up to `timeout`
    pub async fn wait(mut self, timeout: Duration) -> NetResult<Envelope> {
        // Taking the receiver keeps Drop from double-removing the entry
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(NetError::IllegalState("reply already consumed".into())),
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(NetError::ConnectionClosed),
            Err(_) => Err(NetError::Timeout),
        }
    }
}

impl Drop for ReplyFuture {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.connection.forget(self.id);
        }
    }
}
