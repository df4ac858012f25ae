//! Network topology and message routing
//!
//! Tracks the mesh as an undirected multigraph: nodes are session ids
//! (CVIDs), edges are live connections, and parallel edges between the same
//! pair of nodes are allowed. The graph only reflects links this process has
//! observed; it is not a global view of the mesh.
//!
//! ```text
//!                     ┌──────────┐
//!              ┌──────┤  server  ├──────┐
//!              │      └────┬─────┘      │
//!              │           │            │
//!         ┌────┴────┐ ┌────┴────┐ ┌─────┴────┐
//!         │  agent  │ │  client │ │  agent   │
//!         └─────────┘ └─────────┘ └──────────┘
//! ```
//!
//! Routing prefers a direct edge to the destination; anything else goes
//! through the preferred server, which relays on our behalf.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionId};
use crate::connections::ConnectionStore;
use crate::cvid::{self, Cvid, InstanceType};
use crate::envelope::Envelope;
use crate::error::{NetError, NetResult};

/// Topology events emitted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// This instance's own session id changed
    CvidChanged(Cvid),
    /// A server became directly reachable
    ServerEstablished(Cvid),
    /// The last link to a directly-connected server was lost
    ServerLost(Cvid),
}

/// Undirected multigraph of observed mesh links
struct Topology {
    local: Cvid,
    /// Cached relay choice; 0 when unset
    preferred: Cvid,
    nodes: HashSet<Cvid>,
    edges: HashMap<(Cvid, Cvid), Vec<ConnectionId>>,
}

impl Topology {
    fn new() -> Self {
        Self {
            local: 0,
            preferred: 0,
            nodes: HashSet::new(),
            edges: HashMap::new(),
        }
    }

    fn key(a: Cvid, b: Cvid) -> (Cvid, Cvid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn add_edge(&mut self, a: Cvid, b: Cvid, link: ConnectionId) {
        if a == b || a == 0 || b == 0 {
            return;
        }
        self.nodes.insert(a);
        self.nodes.insert(b);
        let links = self.edges.entry(Self::key(a, b)).or_default();
        if !links.contains(&link) {
            links.push(link);
        }
    }

    /// Returns whether the link was actually present
    fn remove_link(&mut self, a: Cvid, b: Cvid, link: ConnectionId) -> bool {
        let key = Self::key(a, b);
        let Some(links) = self.edges.get_mut(&key) else {
            return false;
        };
        let before = links.len();
        links.retain(|l| *l != link);
        let removed = links.len() < before;
        if links.is_empty() {
            self.edges.remove(&key);
        }
        removed
    }

    fn degree(&self, node: Cvid) -> usize {
        self.edges
            .iter()
            .filter(|((a, b), _)| *a == node || *b == node)
            .map(|(_, links)| links.len())
            .sum()
    }

    /// Drop a node that no longer has any edges (never the local node)
    fn prune(&mut self, node: Cvid) {
        if node != self.local && self.degree(node) == 0 {
            self.nodes.remove(&node);
            if self.preferred == node {
                self.preferred = 0;
            }
        }
    }

    fn adjacent(&self, a: Cvid, b: Cvid) -> bool {
        self.edges.contains_key(&Self::key(a, b))
    }

    /// The preferred server, choosing (and caching) one if necessary
    fn preferred_server(&mut self) -> Option<Cvid> {
        if self.preferred != 0 && self.nodes.contains(&self.preferred) {
            return Some(self.preferred);
        }
        let found = self
            .nodes
            .iter()
            .copied()
            .find(|node| *node != self.local && cvid::extract_instance(*node) == InstanceType::Server)?;
        self.preferred = found;
        Some(found)
    }
}

/// Topology store and router
pub struct NetworkStore {
    connections: Arc<ConnectionStore>,
    graph: Mutex<Topology>,
    events: broadcast::Sender<NetworkEvent>,
    config: NetConfig,
    instance: InstanceType,
}

impl NetworkStore {
    pub fn new(
        connections: Arc<ConnectionStore>,
        instance: InstanceType,
        config: NetConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            connections,
            graph: Mutex::new(Topology::new()),
            events,
            config,
            instance,
        })
    }

    /// Subscribe to topology events
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// This instance's current session id (0 when none)
    pub fn local_cvid(&self) -> Cvid {
        self.graph.lock().local
    }

    /// Adopt a new session id for this instance.
    ///
    /// Happens on every handshake a non-server completes; the previous id
    /// (and its node) leaves the graph.
    pub fn set_cvid(&self, cvid: Cvid) {
        {
            let mut graph = self.graph.lock();
            let old = graph.local;
            if old == cvid {
                return;
            }
            if old != 0 {
                graph.nodes.remove(&old);
                graph
                    .edges
                    .retain(|(a, b), _| *a != old && *b != old);
            }
            graph.local = cvid;
            graph.nodes.insert(cvid);
        }
        info!(cvid, "Session id changed");
        let _ = self.events.send(NetworkEvent::CvidChanged(cvid));
    }

    /// Record a handshake-complete link in the graph
    pub fn on_link_established(&self, connection: &Connection) {
        let remote = connection.remote_cvid();
        let mut announce = None;
        {
            let mut graph = self.graph.lock();
            let local = graph.local;
            graph.add_edge(local, remote, connection.id());

            if self.instance != InstanceType::Server
                && cvid::extract_instance(remote) == InstanceType::Server
            {
                if graph.preferred == 0 {
                    graph.preferred = remote;
                }
                announce = Some(NetworkEvent::ServerEstablished(remote));
            }
        }
        debug!(remote, link = connection.id(), "Link added to topology");
        if let Some(event) = announce {
            let _ = self.events.send(event);
        }
    }

    /// Remove a lost link from the graph
    pub fn on_link_lost(&self, connection: &Connection) {
        let remote = connection.remote_cvid();
        if remote == 0 {
            return;
        }
        let mut announce = None;
        {
            let mut graph = self.graph.lock();
            let local = graph.local;
            if !graph.remove_link(local, remote, connection.id()) {
                return;
            }

            // The server is only lost once no parallel link remains
            if self.instance != InstanceType::Server
                && cvid::extract_instance(remote) == InstanceType::Server
                && !graph.adjacent(local, remote)
            {
                announce = Some(NetworkEvent::ServerLost(remote));
            }
            graph.prune(remote);
        }
        debug!(remote, link = connection.id(), "Link removed from topology");
        if let Some(event) = announce {
            let _ = self.events.send(event);
        }
    }

    /// The server this instance relays through, if any is reachable
    pub fn preferred_relay(&self) -> Option<Cvid> {
        self.graph.lock().preferred_server()
    }

    /// Send through the preferred relay regardless of adjacency.
    /// Returns the relay's session id.
    pub fn deliver(&self, envelope: &Envelope) -> NetResult<Cvid> {
        let relay = self.preferred_relay().ok_or(NetError::NoRelay)?;
        let connection = self
            .connections
            .get_by_cvid(relay)
            .ok_or(NetError::NoRelay)?;
        connection.send(envelope)?;
        Ok(relay)
    }

    /// Send directly when the destination is adjacent, otherwise relay.
    /// Returns the session id of the hop the message left on: the
    /// destination itself when direct, the relay otherwise.
    pub fn route(&self, envelope: &Envelope) -> NetResult<Cvid> {
        match self.next_hop(envelope.to) {
            Some(connection) => {
                connection.send(envelope)?;
                Ok(envelope.to)
            }
            None => self.deliver(envelope),
        }
    }

    /// Route a request and wait for its reply.
    ///
    /// The reply is claimed before the request leaves, so an immediate
    /// answer cannot be lost.
    pub async fn route_with_reply(&self, envelope: Envelope) -> NetResult<Envelope> {
        let connection = match self.next_hop(envelope.to) {
            Some(connection) => connection,
            None => {
                let relay = self.preferred_relay().ok_or(NetError::NoRelay)?;
                self.connections
                    .get_by_cvid(relay)
                    .ok_or(NetError::NoRelay)?
            }
        };
        let pending = connection.read(envelope.id);
        connection.send(&envelope)?;
        pending.wait(self.config.message_timeout).await
    }

    fn next_hop(&self, to: Cvid) -> Option<Arc<Connection>> {
        let adjacent = {
            let graph = self.graph.lock();
            graph.adjacent(graph.local, to)
        };
        if adjacent {
            self.connections.get_by_cvid(to)
        } else {
            None
        }
    }

    /// Nodes with at least one edge to `node`
    pub fn neighbors(&self, node: Cvid) -> Vec<Cvid> {
        let graph = self.graph.lock();
        graph
            .edges
            .keys()
            .filter_map(|(a, b)| {
                if *a == node {
                    Some(*b)
                } else if *b == node {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Connection ids of every link incident to `node`
    pub fn direct_links(&self, node: Cvid) -> Vec<ConnectionId> {
        let graph = self.graph.lock();
        graph
            .edges
            .iter()
            .filter(|((a, b), _)| *a == node || *b == node)
            .flat_map(|(_, links)| links.iter().copied())
            .collect()
    }

    /// Number of parallel links between two nodes
    pub fn links_between(&self, a: Cvid, b: Cvid) -> usize {
        self.graph
            .lock()
            .edges
            .get(&Topology::key(a, b))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn contains_node(&self, node: Cvid) -> bool {
        self.graph.lock().nodes.contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cvid::InstanceFlavor;
    use crate::envelope::{Frame, Payload};
    use crate::transport::{Link, LinkOptions, MemoryTransport};

    fn server_cvid() -> Cvid {
        cvid::mint(InstanceType::Server, InstanceFlavor::None).unwrap()
    }

    fn agent_cvid() -> Cvid {
        cvid::mint(InstanceType::Agent, InstanceFlavor::None).unwrap()
    }

    fn network(instance: InstanceType) -> Arc<NetworkStore> {
        let store = ConnectionStore::new(MemoryTransport::new(), &NetConfig::default());
        NetworkStore::new(store, instance, NetConfig::default())
    }

    /// A network with one established link to a server, backed by a real
    /// dialed connection so routed envelopes actually leave.
    async fn relayed(
        config: NetConfig,
    ) -> (
        Arc<NetworkStore>,
        Arc<Connection>,
        Link,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let transport = MemoryTransport::new();
        let mut incoming = transport.listen("server", 8768);
        let store = ConnectionStore::new(transport.clone(), &config);
        let network = NetworkStore::new(store.clone(), InstanceType::Agent, config);
        network.set_cvid(agent_cvid());

        let (conn, dialer_rx) = store
            .connect("server", 8768, &LinkOptions::default())
            .await
            .unwrap();
        let accepted = incoming.recv().await.unwrap();
        conn.set_local_cvid(network.local_cvid());
        conn.set_remote_cvid(server_cvid());
        network.on_link_established(&conn);
        (network, conn, accepted, dialer_rx)
    }

    fn fake_connection(
        id: ConnectionId,
        remote: Cvid,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(id, "test".into(), tx);
        conn.set_remote_cvid(remote);
        (conn, rx)
    }

    #[test]
    fn test_set_cvid_replaces_local_node() {
        let network = network(InstanceType::Agent);
        let mut events = network.subscribe();

        network.set_cvid(100);
        assert_eq!(network.local_cvid(), 100);
        assert!(network.contains_node(100));
        assert_eq!(events.try_recv().unwrap(), NetworkEvent::CvidChanged(100));

        network.set_cvid(200);
        assert!(!network.contains_node(100));
        assert!(network.contains_node(200));
    }

    #[test]
    fn test_link_established_updates_graph_and_announces_server() {
        let network = network(InstanceType::Agent);
        network.set_cvid(agent_cvid());
        let mut events = network.subscribe();

        let server = server_cvid();
        let (conn, _rx) = fake_connection(1, server);
        network.on_link_established(&conn);

        assert!(network.contains_node(server));
        assert_eq!(network.links_between(network.local_cvid(), server), 1);
        assert_eq!(network.preferred_relay(), Some(server));
        assert_eq!(
            events.try_recv().unwrap(),
            NetworkEvent::ServerEstablished(server)
        );
    }

    #[test]
    fn test_server_lost_only_after_last_parallel_link() {
        let network = network(InstanceType::Agent);
        network.set_cvid(agent_cvid());

        let server = server_cvid();
        let (first, _rx1) = fake_connection(1, server);
        let (second, _rx2) = fake_connection(2, server);
        network.on_link_established(&first);
        network.on_link_established(&second);
        assert_eq!(network.links_between(network.local_cvid(), server), 2);

        let mut events = network.subscribe();
        network.on_link_lost(&first);
        assert!(events.try_recv().is_err());
        assert!(network.contains_node(server));

        network.on_link_lost(&second);
        assert_eq!(events.try_recv().unwrap(), NetworkEvent::ServerLost(server));
        assert!(!network.contains_node(server));
        assert_eq!(network.preferred_relay(), None);
    }

    #[test]
    fn test_agent_peers_do_not_become_relays() {
        let network = network(InstanceType::Agent);
        network.set_cvid(agent_cvid());

        let peer = agent_cvid();
        let (conn, _rx) = fake_connection(1, peer);
        network.on_link_established(&conn);
        assert_eq!(network.preferred_relay(), None);
    }

    #[test]
    fn test_neighbors() {
        let network = network(InstanceType::Server);
        network.set_cvid(server_cvid());

        let a = agent_cvid();
        let b = agent_cvid();
        let (conn_a, _rx_a) = fake_connection(1, a);
        let (conn_b, _rx_b) = fake_connection(2, b);
        network.on_link_established(&conn_a);
        network.on_link_established(&conn_b);

        let mut neighbors = network.neighbors(network.local_cvid());
        neighbors.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(neighbors, expected);
    }

    #[test]
    fn test_direct_links_lists_incident_connections() {
        let network = network(InstanceType::Server);
        network.set_cvid(server_cvid());

        let a = agent_cvid();
        let b = agent_cvid();
        let (conn_a1, _rx_a1) = fake_connection(1, a);
        let (conn_a2, _rx_a2) = fake_connection(2, a);
        let (conn_b, _rx_b) = fake_connection(3, b);
        network.on_link_established(&conn_a1);
        network.on_link_established(&conn_a2);
        network.on_link_established(&conn_b);

        let mut local = network.direct_links(network.local_cvid());
        local.sort();
        assert_eq!(local, vec![1, 2, 3]);

        let mut via_a = network.direct_links(a);
        via_a.sort();
        assert_eq!(via_a, vec![1, 2]);

        assert!(network.direct_links(agent_cvid()).is_empty());
    }

    #[tokio::test]
    async fn test_route_without_relay_fails() {
        let network = network(InstanceType::Agent);
        network.set_cvid(agent_cvid());

        let envelope = Envelope::new(
            agent_cvid(),
            network.local_cvid(),
            crate::envelope::Payload::Opaque(vec![1, 2, 3]),
        );
        assert!(matches!(network.route(&envelope), Err(NetError::NoRelay)));
    }

    #[tokio::test]
    async fn test_route_reports_next_hop() {
        let (network, conn, _server_link, _dialer_rx) = relayed(NetConfig::default()).await;
        let server = conn.remote_cvid();

        // Adjacent destination is its own hop
        let direct = Envelope::new(server, network.local_cvid(), Payload::Opaque(vec![1]));
        assert_eq!(network.route(&direct).unwrap(), server);

        // Everything else leaves via the relay
        let peer = agent_cvid();
        let routed = Envelope::new(peer, network.local_cvid(), Payload::Opaque(vec![2]));
        assert_eq!(network.route(&routed).unwrap(), server);
        assert_eq!(network.deliver(&routed).unwrap(), server);
    }

    #[tokio::test]
    async fn test_route_with_reply_survives_instant_reply() {
        let (network, conn, mut server_link, _dialer_rx) = relayed(NetConfig::default()).await;
        let server = conn.remote_cvid();

        // Peer answers each request the moment it arrives
        let responder = conn.clone();
        tokio::spawn(async move {
            while let Some(bytes) = server_link.rx.recv().await {
                let request = Frame::decode(&bytes).unwrap().into_inner();
                let reply = request.reply(
                    request.to,
                    Payload::Outcome {
                        success: true,
                        message: String::new(),
                    },
                );
                responder.complete_reply(reply);
            }
        });

        for _ in 0..50 {
            let envelope = Envelope::new(server, network.local_cvid(), Payload::Opaque(vec![7]));
            let id = envelope.id;
            let reply = network.route_with_reply(envelope).await.unwrap();
            assert_eq!(reply.id, id);
            assert!(matches!(
                reply.payload,
                Payload::Outcome { success: true, .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_route_with_reply_falls_back_to_relay() {
        let (network, conn, mut server_link, _dialer_rx) = relayed(NetConfig::default()).await;
        let target = agent_cvid();

        // The relay answers on behalf of the non-adjacent destination
        let responder = conn.clone();
        let handle = tokio::spawn(async move {
            let bytes = server_link.rx.recv().await.unwrap();
            let request = Frame::decode(&bytes).unwrap().into_inner();
            let destination = request.to;
            let reply = request.reply(
                destination,
                Payload::Outcome {
                    success: true,
                    message: "relayed".into(),
                },
            );
            responder.complete_reply(reply);
            destination
        });

        let envelope = Envelope::new(
            target,
            network.local_cvid(),
            Payload::Opaque(vec![1]),
        );
        let reply = network.route_with_reply(envelope).await.unwrap();
        assert_eq!(handle.await.unwrap(), target);
        assert_eq!(reply.from, target);
        assert!(matches!(
            reply.payload,
            Payload::Outcome { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_route_with_reply_timeout_is_not_no_relay() {
        let config = NetConfig {
            message_timeout: Duration::from_millis(20),
            ..NetConfig::default()
        };
        let (network, conn, _server_link, _dialer_rx) = relayed(config).await;
        let server = conn.remote_cvid();

        // Relay present but silent: the wait expires
        let envelope = Envelope::new(
            server,
            network.local_cvid(),
            Payload::Opaque(vec![1]),
        );
        let result = network.route_with_reply(envelope).await;
        assert!(matches!(result, Err(NetError::Timeout)));

        // No relay at all fails immediately with the other variant
        let bare = NetworkStore::new(
            ConnectionStore::new(MemoryTransport::new(), &NetConfig::default()),
            InstanceType::Agent,
            NetConfig::default(),
        );
        bare.set_cvid(agent_cvid());
        let envelope = Envelope::new(server, bare.local_cvid(), Payload::Opaque(vec![1]));
        let result = bare.route_with_reply(envelope).await;
        assert!(matches!(result, Err(NetError::NoRelay)));
    }
}
