//! Network core for a distributed mesh of servers, clients, and agents
//!
//! Three concerns live here:
//!
//! - **Sessions**: every instance that joins the mesh is assigned a CVID, a
//!   positive 31-bit session id carrying its instance type and flavor. The
//!   handshake that assigns it is the first exchange on every link.
//! - **Topology**: observed links form an undirected multigraph used for
//!   routing. Direct when possible, relayed through the preferred server
//!   otherwise.
//! - **Entanglement**: subtrees of the local state tree can be kept
//!   synchronized with counterparts across the mesh, in either or both
//!   directions.
//!
//! ```text
//!    ┌────────────────────────────────────────────────────────────┐
//!    │                           Mesh                             │
//!    │  connect / accept / serve / entangle / route               │
//!    ├──────────────┬──────────────┬──────────────┬───────────────┤
//!    │  handshake   │   network    │   entangle   │    stream     │
//!    │ (CVID mint)  │ (graph+route)│ (replication)│ (event flows) │
//!    ├──────────────┴──────┬───────┴──────────────┴───────────────┤
//!    │     connections / connection (links, reply pairing)        │
//!    ├─────────────────────┴──────────────────────────────────────┤
//!    │              transport (byte frames, dialing)              │
//!    └────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod connections;
pub mod context;
pub mod cvid;
pub mod entangle;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod mesh;
pub mod network;
pub mod reconnect;
pub mod st;
pub mod stream;
pub mod transport;

pub use config::NetConfig;
pub use connection::{Connection, ConnectionId, ReplyFuture};
pub use connections::{ConnectionEvent, ConnectionStore};
pub use context::RequestContext;
pub use cvid::{Cvid, InstanceFlavor, InstanceType};
pub use entangle::{EntangleConfig, Entangled};
pub use envelope::{Direction, Envelope, Frame, MessageId, Payload};
pub use error::{NetError, NetResult};
pub use handshake::{HandshakeOutcome, HandshakeRequester, HandshakeResponder, HandshakeState};
pub use mesh::Mesh;
pub use network::{NetworkEvent, NetworkStore};
pub use reconnect::{ConnectionLoop, LoopConfig};
pub use st::{
    EphemeralAttribute, EphemeralDocument, StateChange, StateObject, StatePath, StateUpdate,
};
pub use stream::{InboundStreamAdapter, OutboundStreamAdapter, StreamSink, StreamSource};
pub use transport::{Link, LinkOptions, MemoryTransport, Transport};
