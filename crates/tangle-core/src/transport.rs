//! Transport abstraction
//!
//! The mesh core is transport-agnostic: it sends and receives length-delimited
//! byte frames over a [`Link`] and leaves sockets, TLS, and listeners to a
//! [`Transport`] collaborator. [`MemoryTransport`] is an in-process
//! implementation used by embedding tests and local meshes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{NetError, NetResult};

/// Options a dialer passes down to the transport
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Whether the transport should negotiate TLS
    pub tls: bool,
    /// How long the dial may take
    pub connect_timeout: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            tls: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One established byte-frame channel to a peer.
///
/// Frames written to `tx` arrive at the peer's `rx` in order. The link is
/// lost when `rx` yields `None`.
pub struct Link {
    pub tx: mpsc::UnboundedSender<Bytes>,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
    /// Human-readable peer address, for logging
    pub peer: String,
}

/// Dials outbound links
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, address: &str, port: u16, options: &LinkOptions) -> NetResult<Link>;
}

type Endpoint = (String, u16);

/// In-process transport: dials connect to listeners registered in the same
/// hub, with a pair of crossed unbounded channels standing in for a socket.
#[derive(Default)]
pub struct MemoryTransport {
    listeners: Mutex<HashMap<Endpoint, mpsc::UnboundedSender<Link>>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener; incoming links arrive on the returned receiver.
    /// Listening again on the same endpoint replaces the previous listener.
    pub fn listen(&self, address: &str, port: u16) -> mpsc::UnboundedReceiver<Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .insert((address.to_owned(), port), tx);
        rx
    }

    /// Drop the listener on an endpoint; established links are unaffected
    pub fn unlisten(&self, address: &str, port: u16) {
        self.listeners.lock().remove(&(address.to_owned(), port));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str, port: u16, _options: &LinkOptions) -> NetResult<Link> {
        let listener = self
            .listeners
            .lock()
            .get(&(address.to_owned(), port))
            .cloned();

        let Some(listener) = listener else {
            debug!(address, port, "No listener registered");
            return Err(NetError::Transport(format!(
                "connection refused: {address}:{port}"
            )));
        };

        let (dialer_tx, acceptor_rx) = mpsc::unbounded_channel();
        let (acceptor_tx, dialer_rx) = mpsc::unbounded_channel();

        listener
            .send(Link {
                tx: acceptor_tx,
                rx: acceptor_rx,
                peer: "dialer".into(),
            })
            .map_err(|_| NetError::Transport(format!("listener gone: {address}:{port}")))?;

        Ok(Link {
            tx: dialer_tx,
            rx: dialer_rx,
            peer: format!("{address}:{port}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_without_listener() {
        let transport = MemoryTransport::new();
        let result = transport
            .connect("10.0.0.1", 8768, &LinkOptions::default())
            .await;
        assert!(matches!(result, Err(NetError::Transport(_))));
    }

    #[tokio::test]
    async fn test_frames_cross_the_link_in_order() {
        let transport = MemoryTransport::new();
        let mut incoming = transport.listen("server", 8768);

        let mut dialer = transport
            .connect("server", 8768, &LinkOptions::default())
            .await
            .unwrap();
        let mut accepted = incoming.recv().await.unwrap();

        dialer.tx.send(Bytes::from_static(b"one")).unwrap();
        dialer.tx.send(Bytes::from_static(b"two")).unwrap();
        assert_eq!(accepted.rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(accepted.rx.recv().await.unwrap(), Bytes::from_static(b"two"));

        accepted.tx.send(Bytes::from_static(b"ack")).unwrap();
        assert_eq!(dialer.rx.recv().await.unwrap(), Bytes::from_static(b"ack"));
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_the_link() {
        let transport = MemoryTransport::new();
        let mut incoming = transport.listen("server", 8768);

        let dialer = transport
            .connect("server", 8768, &LinkOptions::default())
            .await
            .unwrap();
        let mut accepted = incoming.recv().await.unwrap();

        drop(dialer);
        assert!(accepted.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unlisten_refuses_new_dials() {
        let transport = MemoryTransport::new();
        let _incoming = transport.listen("server", 8768);
        transport.unlisten("server", 8768);
        assert!(transport
            .connect("server", 8768, &LinkOptions::default())
            .await
            .is_err());
    }
}
