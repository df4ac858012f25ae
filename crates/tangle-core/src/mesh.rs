//! Mesh instance
//!
//! [`Mesh`] wires the layers together for one process: it owns the
//! connection store, the topology store, and the local state tree, runs the
//! per-link read loop (handshake, reply pairing, stream demux, relaying),
//! and exposes the high-level operations embedders call: connect, serve,
//! route, entangle.
//!
//! ```text
//!                         ┌────────────────────┐
//!                         │        Mesh        │
//!                         └─────────┬──────────┘
//!               ┌───────────────────┼───────────────────┐
//!       ┌───────┴───────┐   ┌───────┴───────┐   ┌───────┴───────┐
//!       │ ConnectionStore│  │  NetworkStore │   │  state tree   │
//!       │  (live links)  │  │ (graph+routes)│   │ (entangleable)│
//!       └───────┬───────┘   └───────────────┘   └───────────────┘
//!               │
//!         Transport (dials, listeners)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionId};
use crate::connections::ConnectionStore;
use crate::context::RequestContext;
use crate::cvid::{self, Cvid, InstanceFlavor, InstanceType};
use crate::entangle::{EntangleConfig, Entangled};
use crate::envelope::{Direction, Envelope, Frame, Payload};
use crate::error::{NetError, NetResult};
use crate::handshake::{HandshakeRequester, HandshakeResponder};
use crate::network::NetworkStore;
use crate::reconnect::{ConnectionLoop, LoopConfig};
use crate::st::{EphemeralDocument, StatePath};
use crate::stream;
use crate::transport::{Link, LinkOptions, Transport};

/// One mesh participant
pub struct Mesh {
    config: NetConfig,
    instance: InstanceType,
    flavor: InstanceFlavor,
    uuid: String,
    connections: Arc<ConnectionStore>,
    network: Arc<NetworkStore>,
    root: Arc<EphemeralDocument>,
    entanglements: Mutex<HashMap<ConnectionId, Vec<Arc<Entangled>>>>,
}

impl Mesh {
    /// Assemble a mesh instance. Servers mint their own session id up
    /// front; everyone else receives one from their first handshake.
    pub fn new(
        config: NetConfig,
        instance: InstanceType,
        flavor: InstanceFlavor,
        transport: Arc<dyn Transport>,
    ) -> NetResult<Arc<Self>> {
        if instance == InstanceType::Unrecognized {
            return Err(NetError::InvalidInstance(
                "unrecognized instance type".into(),
            ));
        }
        if flavor == InstanceFlavor::Unrecognized {
            return Err(NetError::InvalidInstance(
                "unrecognized instance flavor".into(),
            ));
        }

        let connections = ConnectionStore::new(transport, &config);
        let network = NetworkStore::new(connections.clone(), instance, config.clone());
        if instance == InstanceType::Server {
            network.set_cvid(cvid::mint(instance, flavor)?);
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        info!(?instance, %uuid, "Mesh instance assembled");
        Ok(Arc::new(Self {
            config,
            instance,
            flavor,
            uuid,
            connections,
            network,
            root: EphemeralDocument::root(),
            entanglements: Mutex::new(HashMap::new()),
        }))
    }

    pub fn instance(&self) -> InstanceType {
        self.instance
    }

    /// This instance's long-term identity
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// This instance's current session id (0 before any handshake)
    pub fn local_cvid(&self) -> Cvid {
        self.network.local_cvid()
    }

    pub fn connections(&self) -> &Arc<ConnectionStore> {
        &self.connections
    }

    pub fn network(&self) -> &Arc<NetworkStore> {
        &self.network
    }

    /// The local state tree
    pub fn root(&self) -> &Arc<EphemeralDocument> {
        &self.root
    }

    fn link_options(&self) -> LinkOptions {
        LinkOptions {
            tls: self.config.tls,
            connect_timeout: self.config.connect_timeout,
        }
    }

    /// Dial a peer and run the handshake as the connecting side
    pub async fn connect(self: &Arc<Self>, address: &str, port: u16) -> NetResult<Arc<Connection>> {
        let (connection, rx) = self
            .connections
            .connect(address, port, &self.link_options())
            .await?;
        tokio::spawn(run_link(self.clone(), connection.clone(), rx, Role::Requester));
        Ok(connection)
    }

    /// Take over an accepted inbound link and answer its handshake
    pub fn accept(self: &Arc<Self>, link: Link) -> Arc<Connection> {
        let (connection, rx) = self.connections.adopt(link);
        tokio::spawn(run_link(self.clone(), connection.clone(), rx, Role::Responder));
        connection
    }

    /// Accept every link arriving on `incoming`
    pub fn serve(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Link>) -> JoinHandle<()> {
        let mesh = self.clone();
        tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                mesh.accept(link);
            }
        })
    }

    /// Keep dialing the given targets until one connects
    pub fn connect_loop(self: &Arc<Self>, config: LoopConfig) -> NetResult<ConnectionLoop> {
        ConnectionLoop::spawn(self.clone(), config)
    }

    /// Entangle the local node at `path` with its counterpart on a directly
    /// connected peer. Negotiates a stream id, then starts replication in
    /// the agreed direction.
    pub async fn entangle(
        self: &Arc<Self>,
        target: Cvid,
        path: &StatePath,
        direction: Direction,
        whitelist: Vec<StatePath>,
    ) -> NetResult<Arc<Entangled>> {
        let connection = self
            .connections
            .get_by_cvid(target)
            .ok_or(NetError::ConnectionNotFound(target))?;

        let node = self
            .root
            .node_at(path)
            .ok_or_else(|| NetError::NotFound(path.to_string()))?;

        let stream_id = stream::stream_id();
        let entangled = Entangled::new(
            node,
            connection.clone(),
            EntangleConfig {
                direction,
                initiator: true,
                stream_id,
                update_period: Duration::from_secs(1),
                whitelist: whitelist.clone(),
            },
        )?;

        let request = Envelope::new(
            target,
            self.local_cvid(),
            Payload::EntangleRequest {
                stream_id,
                path: path.to_string(),
                update_period_ms: 1000,
                direction,
                whitelist: whitelist.iter().map(ToString::to_string).collect(),
            },
        );
        let pending = connection.read(request.id);
        if let Err(error) = connection.send(&request) {
            entangled.stop();
            return Err(error);
        }

        match pending.wait(self.config.message_timeout).await {
            Ok(reply) => match reply.payload {
                Payload::Outcome { success: true, .. } => {
                    entangled.open()?;
                    self.entanglements
                        .lock()
                        .entry(connection.id())
                        .or_default()
                        .push(entangled.clone());
                    Ok(entangled)
                }
                Payload::Outcome { success: false, message } => {
                    entangled.stop();
                    Err(NetError::Rejected(message))
                }
                _ => {
                    entangled.stop();
                    Err(NetError::Rejected("unexpected reply payload".into()))
                }
            },
            Err(error) => {
                entangled.stop();
                Err(error)
            }
        }
    }

    fn handle_entangle_request(self: &Arc<Self>, connection: Arc<Connection>, request: Envelope) {
        let local_cvid = self.local_cvid();
        let mut ctx = RequestContext::new(connection.clone(), request);

        let Payload::EntangleRequest {
            stream_id,
            ref path,
            update_period_ms,
            direction,
            ref whitelist,
        } = ctx.request().payload
        else {
            return;
        };
        let path = StatePath::parse(path);
        let whitelist: Vec<StatePath> = whitelist.iter().map(|w| StatePath::parse(w)).collect();

        let outcome = self.root.node_at(&path).map_or_else(
            || Err(NetError::NotFound(path.to_string())),
            |node| {
                Entangled::new(
                    node,
                    connection.clone(),
                    EntangleConfig {
                        direction,
                        initiator: false,
                        stream_id,
                        update_period: Duration::from_millis(update_period_ms),
                        whitelist,
                    },
                )
            },
        );

        let staged = match outcome {
            Ok(entangled) => {
                self.entanglements
                    .lock()
                    .entry(connection.id())
                    .or_default()
                    .push(entangled.clone());
                // The source half (and its snapshot) starts only after the
                // acceptance has left, so the peer sees Outcome first.
                let result = ctx.reply(Payload::Outcome {
                    success: true,
                    message: String::new(),
                });
                result.and_then(|()| {
                    ctx.defer(Box::new(move || {
                        if let Err(error) = entangled.open() {
                            warn!(%error, "Entanglement source failed to start");
                        }
                    }))
                })
            }
            Err(error) => {
                debug!(%error, %path, "Refusing entanglement");
                ctx.reply(Payload::Outcome {
                    success: false,
                    message: error.to_string(),
                })
            }
        };

        if let Err(error) = staged.and_then(|()| ctx.finish(local_cvid)) {
            debug!(%error, "Entanglement reply failed");
        }
    }

    fn on_link_lost(&self, connection: &Connection) {
        if let Some(entangled) = self.entanglements.lock().remove(&connection.id()) {
            for entanglement in entangled {
                entanglement.stop();
            }
        }
        self.network.on_link_lost(connection);
        self.connections.remove(connection.id());
    }

    /// Tear down every connection and entanglement
    pub fn shutdown(&self) {
        let drained: Vec<Vec<Arc<Entangled>>> =
            self.entanglements.lock().drain().map(|(_, e)| e).collect();
        for entanglement in drained.into_iter().flatten() {
            entanglement.stop();
        }
        self.connections.clear();
        info!("Mesh shut down");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Requester,
    Responder,
}

/// Per-link task: handshake first, then dispatch until the link dies
async fn run_link(
    mesh: Arc<Mesh>,
    connection: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    role: Role,
) {
    let established = match handshake_phase(&mesh, &connection, &mut rx, role).await {
        Some(established) => established,
        // Link died mid-handshake
        None => {
            mesh.on_link_lost(&connection);
            return;
        }
    };

    if established {
        if role == Role::Requester && mesh.instance != InstanceType::Server {
            mesh.network.set_cvid(connection.local_cvid());
        }
        mesh.connections.mark_established(&connection);
        mesh.network.on_link_established(&connection);
    } else {
        // The link stays open; it just carries no session
        mesh.connections.mark_handshake_failed(&connection);
    }

    while let Some(bytes) = rx.recv().await {
        let envelope = match Frame::decode(&bytes) {
            Ok(frame) => frame.into_inner(),
            Err(error) => {
                debug!(%error, peer = %connection.peer(), "Undecodable frame");
                continue;
            }
        };

        // Not for us: relay on the sender's behalf
        let local = mesh.local_cvid();
        if envelope.to != 0 && local != 0 && envelope.to != local {
            if let Err(error) = mesh.network.route(&envelope) {
                debug!(%error, to = envelope.to, "Relay failed");
            }
            continue;
        }

        // Replies claim their waiter before anything else sees them
        let Some(envelope) = connection.complete_reply(envelope) else {
            continue;
        };

        match envelope.payload {
            Payload::StreamEvent { stream_id, ref update } => match connection.sink(stream_id) {
                Some(sink) => sink.on_next(update.clone()),
                None => debug!(stream_id, "Event for unknown stream"),
            },
            Payload::EntangleRequest { .. } => {
                mesh.handle_entangle_request(connection.clone(), envelope);
            }
            ref payload => {
                debug!(?payload, "Unhandled payload");
            }
        }
    }

    mesh.on_link_lost(&connection);
}

/// Run one side of the handshake. `None` means the link closed before the
/// exchange finished.
async fn handshake_phase(
    mesh: &Arc<Mesh>,
    connection: &Arc<Connection>,
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
    role: Role,
) -> Option<bool> {
    let first = async {
        let bytes = rx.recv().await?;
        Frame::decode(&bytes).ok().map(Frame::into_inner)
    };

    match role {
        Role::Requester => {
            let mut requester =
                HandshakeRequester::new(mesh.instance, mesh.flavor, mesh.uuid.clone());
            if requester.send_request(connection).is_err() {
                return Some(false);
            }
            let Some(response) = first.await else {
                return None;
            };
            Some(requester.handle_response(connection, &response).is_ok())
        }
        Role::Responder => {
            let Some(request) = first.await else {
                return None;
            };
            let responder = HandshakeResponder::new(mesh.uuid.clone());
            Some(
                responder
                    .handle_request(&mesh.network, connection, &request)
                    .is_ok(),
            )
        }
    }
}
