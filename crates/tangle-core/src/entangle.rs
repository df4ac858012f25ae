//! State entanglement
//!
//! An [`Entangled`] wraps a state-tree node and keeps it synchronized with a
//! counterpart on the other end of a connection. Depending on direction and
//! which side initiated, it acts as a source (watching the node and sending
//! deltas), a sink (applying arriving deltas), or both.
//!
//! ```text
//!          local tree                           remote tree
//!        ┌───────────┐   StreamEvent frames   ┌───────────┐
//!        │   node    │ ──────────────────────►│   node    │
//!        │ (source)  │ ◄────────────────────── │  (sink)   │
//!        └───────────┘      (bidirectional)    └───────────┘
//! ```
//!
//! A source first sends a full snapshot so the remote side converges, then
//! incremental deltas as listeners fire. A sink raises a merge flag while
//! applying, so in bidirectional mode the resulting listener events are not
//! echoed back to their origin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::envelope::Direction;
use crate::error::{NetError, NetResult};
use crate::st::{
    Listener, ListenerId, NodeKind, StateChange, StateObject, StateParent, StatePath, StateUpdate,
    Value,
};
use crate::stream::{self, InboundStreamAdapter, OutboundStreamAdapter, StreamSink, StreamSource};

/// How a node should be entangled
#[derive(Debug, Clone)]
pub struct EntangleConfig {
    /// State flow, from the initiator's point of view
    pub direction: Direction,
    /// Whether this side asked for the entanglement
    pub initiator: bool,
    /// Stream id both sides agreed on
    pub stream_id: i32,
    /// Requested update cadence, carried for the peer's benefit; updates
    /// are currently event-driven.
    pub update_period: Duration,
    /// When non-empty, only paths under these prefixes are replicated
    pub whitelist: Vec<StatePath>,
}

impl Default for EntangleConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Downstream,
            initiator: false,
            stream_id: stream::stream_id(),
            update_period: Duration::from_secs(1),
            whitelist: Vec::new(),
        }
    }
}

struct SourceState {
    listener: ListenerId,
    adapter: OutboundStreamAdapter,
}

/// A state-tree node synchronized with a remote counterpart
pub struct Entangled {
    node: Arc<dyn StateObject>,
    connection: Arc<Connection>,
    config: EntangleConfig,
    source: Mutex<Option<SourceState>>,
    sink: Mutex<Option<InboundStreamAdapter>>,
    merging: Arc<AtomicBool>,
    me: Weak<Entangled>,
}

impl Entangled {
    /// Entangle `node` with its counterpart across `connection`.
    ///
    /// The roles follow from direction and initiator:
    ///
    /// | direction     | initiator side | other side |
    /// |---------------|----------------|------------|
    /// | Downstream    | sink           | source     |
    /// | Upstream      | source         | sink       |
    /// | Bidirectional | both           | both       |
    pub fn new(
        node: Arc<dyn StateObject>,
        connection: Arc<Connection>,
        config: EntangleConfig,
    ) -> NetResult<Arc<Self>> {
        if node.entangled() {
            return Err(NetError::IllegalState("node is already entangled".into()));
        }

        let entangled = Arc::new_cyclic(|me| Self {
            node,
            connection,
            config,
            source: Mutex::new(None),
            sink: Mutex::new(None),
            merging: Arc::new(AtomicBool::new(false)),
            me: me.clone(),
        });

        // The sink half is live immediately, so no inbound event can beat
        // it; the source half waits for open().
        if entangled.roles().1 {
            entangled.start_sink();
        }
        Ok(entangled)
    }

    /// Start the source half, if this side's role calls for one.
    ///
    /// Separate from construction so an initiator can have its sink
    /// registered before the peer learns the stream exists.
    pub fn open(&self) -> NetResult<()> {
        if self.roles().0 && self.source.lock().is_none() {
            self.start_source()?;
        }
        debug!(
            stream_id = self.config.stream_id,
            direction = ?self.config.direction,
            initiator = self.config.initiator,
            "Entanglement started"
        );
        Ok(())
    }

    /// (source, sink) roles for this side
    fn roles(&self) -> (bool, bool) {
        match (self.config.direction, self.config.initiator) {
            (Direction::Bidirectional, _) => (true, true),
            (Direction::Downstream, true) | (Direction::Upstream, false) => (false, true),
            (Direction::Downstream, false) | (Direction::Upstream, true) => (true, false),
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.config.stream_id
    }

    fn start_sink(&self) {
        let sink = Arc::new(MergeSink {
            node: self.node.clone(),
            merging: self.merging.clone(),
        });
        *self.sink.lock() = Some(InboundStreamAdapter::attach(
            self.connection.clone(),
            self.config.stream_id,
            sink,
        ));
    }

    fn start_source(&self) -> NetResult<()> {
        let adapter = OutboundStreamAdapter::new(self.config.stream_id, self.connection.clone());

        // A live document is represented by the proxy while entangled
        if self.node.kind() == NodeKind::Document {
            if let (Some(parent), Some(id), Some(me)) =
                (self.node.parent(), self.node.path().last(), self.me.upgrade())
            {
                let proxy: Arc<dyn StateObject> = me;
                parent.set_node(id, proxy);
            }
        }

        // Converge the remote side before any deltas flow
        let snapshot = self.node.snapshot(&self.config.whitelist);
        if !snapshot.is_empty() {
            adapter.submit(snapshot)?;
        }

        let listener = source_listener(
            self.node.clone(),
            adapter.clone(),
            self.merging.clone(),
            self.config.whitelist.clone(),
        );
        let listener = self.node.add_listener(listener);

        *self.source.lock() = Some(SourceState { listener, adapter });
        Ok(())
    }

    /// Tear the entanglement down, restoring the node's own representation.
    /// No events flow in either direction after this returns.
    pub fn stop(&self) {
        if let Some(source) = self.source.lock().take() {
            self.node.remove_listener(source.listener);
            if self.node.kind() == NodeKind::Document {
                if let (Some(parent), Some(id)) = (self.node.parent(), self.node.path().last()) {
                    parent.set_node(id, self.node.clone());
                }
            }
        }
        if let Some(sink) = self.sink.lock().take() {
            sink.detach();
        }
        debug!(stream_id = self.config.stream_id, "Entanglement stopped");
    }
}

fn source_listener(
    node: Arc<dyn StateObject>,
    adapter: OutboundStreamAdapter,
    merging: Arc<AtomicBool>,
    whitelist: Vec<StatePath>,
) -> Listener {
    Arc::new(move |change: &StateChange| {
        // Events raised by our own sink's merge must not echo back
        if merging.load(Ordering::Acquire) {
            return;
        }
        if !whitelist.is_empty() && !whitelist.iter().any(|w| w.is_ancestor_of(change.path())) {
            return;
        }
        let update = match change {
            StateChange::AttributeChanged {
                path,
                new: Some(value),
                ..
            } => StateUpdate::change(path.clone(), value.clone()),
            StateChange::AttributeChanged { path, new: None, .. } => {
                StateUpdate::removal(path.clone())
            }
            StateChange::DocumentAdded { path } => node.snapshot(&[path.clone()]),
            StateChange::DocumentRemoved { path } => StateUpdate::removal(path.clone()),
        };
        if update.is_empty() {
            return;
        }
        if let Err(error) = adapter.submit(update) {
            debug!(%error, "Dropping update for dead stream");
        }
    })
}

/// Applies arriving updates under the merge flag
struct MergeSink {
    node: Arc<dyn StateObject>,
    merging: Arc<AtomicBool>,
}

impl StreamSink for MergeSink {
    fn on_next(&self, item: StateUpdate) {
        self.merging.store(true, Ordering::Release);
        self.node.merge(&item);
        self.merging.store(false, Ordering::Release);
    }
}

impl StreamSource for Entangled {
    fn start(&self) -> NetResult<()> {
        self.open()
    }

    fn stop(&self) {
        Entangled::stop(self);
    }
}

impl StateObject for Entangled {
    fn kind(&self) -> NodeKind {
        self.node.kind()
    }

    fn path(&self) -> StatePath {
        self.node.path()
    }

    fn parent(&self) -> Option<Arc<dyn StateParent>> {
        self.node.parent()
    }

    fn node(&self, id: &str) -> Option<Arc<dyn StateObject>> {
        self.node.node(id)
    }

    fn get(&self, path: &StatePath) -> Option<Value> {
        self.node.get(path)
    }

    fn set(&self, path: &StatePath, value: Value) {
        self.node.set(path, value);
    }

    fn merge(&self, update: &StateUpdate) {
        self.node.merge(update);
    }

    fn snapshot(&self, whitelist: &[StatePath]) -> StateUpdate {
        self.node.snapshot(whitelist)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        self.node.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.node.remove_listener(id);
    }

    fn entangled(&self) -> bool {
        true
    }
}

impl Drop for Entangled {
    fn drop(&mut self) {
        // Idempotent; explicit stop() is the normal path
        if self.source.lock().is_some() || self.sink.lock().is_some() {
            warn!(
                stream_id = self.config.stream_id,
                "Entanglement dropped without stop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::envelope::{Frame, Payload};
    use crate::st::EphemeralDocument;

    /// Two connections joined back to back, with pump tasks dispatching
    /// stream events the way the mesh read loop would.
    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Connection::new(1, "a".into(), a_tx);
        let b = Connection::new(2, "b".into(), b_tx);
        tokio::spawn(pump(a_rx, b.clone()));
        tokio::spawn(pump(b_rx, a.clone()));
        (a, b)
    }

    async fn pump(mut rx: mpsc::UnboundedReceiver<bytes::Bytes>, to: Arc<Connection>) {
        while let Some(bytes) = rx.recv().await {
            let envelope = Frame::decode(&bytes).unwrap().into_inner();
            if let Payload::StreamEvent { stream_id, update } = envelope.payload {
                if let Some(sink) = to.sink(stream_id) {
                    sink.on_next(update);
                }
            }
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn config(direction: Direction, initiator: bool, stream_id: i32) -> EntangleConfig {
        EntangleConfig {
            direction,
            initiator,
            stream_id,
            ..EntangleConfig::default()
        }
    }

    #[tokio::test]
    async fn test_downstream_snapshot_and_deltas() {
        let (initiator_conn, remote_conn) = pair();

        let remote_tree = EphemeralDocument::root();
        remote_tree.set(&StatePath::parse("/agent/hostname"), json!("box1"));
        let local_tree = EphemeralDocument::root();

        // Initiator of a downstream entanglement is the sink
        let sink_side = Entangled::new(
            local_tree.clone(),
            initiator_conn,
            config(Direction::Downstream, true, 7),
        )
        .unwrap();
        sink_side.open().unwrap();
        let source_side = Entangled::new(
            remote_tree.clone(),
            remote_conn,
            config(Direction::Downstream, false, 7),
        )
        .unwrap();
        source_side.open().unwrap();

        // Snapshot converges the sink
        eventually(|| local_tree.get(&StatePath::parse("/agent/hostname")) == Some(json!("box1")))
            .await;

        // Deltas follow
        remote_tree.set(&StatePath::parse("/agent/hostname"), json!("box2"));
        eventually(|| local_tree.get(&StatePath::parse("/agent/hostname")) == Some(json!("box2")))
            .await;

        // Sink-side writes do not flow upstream
        local_tree.set(&StatePath::parse("/agent/note"), json!("local"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote_tree.get(&StatePath::parse("/agent/note")), None);

        sink_side.stop();
        source_side.stop();
    }

    #[tokio::test]
    async fn test_stop_halts_replication() {
        let (a_conn, b_conn) = pair();
        let a_tree = EphemeralDocument::root();
        let b_tree = EphemeralDocument::root();

        let sink = Entangled::new(
            a_tree.clone(),
            a_conn,
            config(Direction::Downstream, true, 7),
        )
        .unwrap();
        sink.open().unwrap();
        let source = Entangled::new(
            b_tree.clone(),
            b_conn,
            config(Direction::Downstream, false, 7),
        )
        .unwrap();
        source.open().unwrap();

        b_tree.set(&StatePath::parse("/x"), json!(1));
        eventually(|| a_tree.get(&StatePath::parse("/x")) == Some(json!(1))).await;

        source.stop();
        sink.stop();

        b_tree.set(&StatePath::parse("/x"), json!(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a_tree.get(&StatePath::parse("/x")), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_bidirectional_converges_without_echo() {
        let (a_conn, b_conn) = pair();
        let a_tree = EphemeralDocument::root();
        let b_tree = EphemeralDocument::root();

        let a_side = Entangled::new(
            a_tree.clone(),
            a_conn,
            config(Direction::Bidirectional, true, 7),
        )
        .unwrap();
        let b_side = Entangled::new(
            b_tree.clone(),
            b_conn,
            config(Direction::Bidirectional, false, 7),
        )
        .unwrap();
        a_side.open().unwrap();
        b_side.open().unwrap();

        a_tree.set(&StatePath::parse("/from/a"), json!("a"));
        b_tree.set(&StatePath::parse("/from/b"), json!("b"));

        eventually(|| b_tree.get(&StatePath::parse("/from/a")) == Some(json!("a"))).await;
        eventually(|| a_tree.get(&StatePath::parse("/from/b")) == Some(json!("b"))).await;

        a_side.stop();
        b_side.stop();
    }

    #[tokio::test]
    async fn test_removals_propagate() {
        let (a_conn, b_conn) = pair();
        let a_tree = EphemeralDocument::root();
        let b_tree = EphemeralDocument::root();
        b_tree.set(&StatePath::parse("/doomed/x"), json!(1));

        let sink = Entangled::new(
            a_tree.clone(),
            a_conn,
            config(Direction::Downstream, true, 7),
        )
        .unwrap();
        sink.open().unwrap();
        let source = Entangled::new(
            b_tree.clone(),
            b_conn,
            config(Direction::Downstream, false, 7),
        )
        .unwrap();
        source.open().unwrap();

        eventually(|| a_tree.get(&StatePath::parse("/doomed/x")) == Some(json!(1))).await;

        b_tree.remove("doomed");
        eventually(|| a_tree.node_at(&StatePath::parse("/doomed")).is_none()).await;

        sink.stop();
        source.stop();
    }

    #[tokio::test]
    async fn test_whitelist_filters_source() {
        let (a_conn, b_conn) = pair();
        let a_tree = EphemeralDocument::root();
        let b_tree = EphemeralDocument::root();
        b_tree.set(&StatePath::parse("/wanted/x"), json!(1));
        b_tree.set(&StatePath::parse("/other/y"), json!(2));

        let sink = Entangled::new(
            a_tree.clone(),
            a_conn,
            config(Direction::Downstream, true, 7),
        )
        .unwrap();
        sink.open().unwrap();
        let source = Entangled::new(
            b_tree.clone(),
            b_conn,
            EntangleConfig {
                whitelist: vec![StatePath::parse("/wanted")],
                ..config(Direction::Downstream, false, 7)
            },
        )
        .unwrap();
        source.open().unwrap();

        eventually(|| a_tree.get(&StatePath::parse("/wanted/x")) == Some(json!(1))).await;

        b_tree.set(&StatePath::parse("/other/y"), json!(3));
        b_tree.set(&StatePath::parse("/wanted/x"), json!(4));
        eventually(|| a_tree.get(&StatePath::parse("/wanted/x")) == Some(json!(4))).await;
        assert_eq!(a_tree.get(&StatePath::parse("/other/y")), None);

        sink.stop();
        source.stop();
    }

    #[tokio::test]
    async fn test_document_source_swaps_representation() {
        let (_a_conn, b_conn) = pair();
        let tree = EphemeralDocument::root();
        tree.set(&StatePath::parse("/agent/x"), json!(1));
        let agent = tree.node_at(&StatePath::parse("/agent")).unwrap();

        let source = Entangled::new(agent, b_conn, config(Direction::Downstream, false, 7)).unwrap();
        source.open().unwrap();

        // While entangled, the tree resolves the proxy in the node's place
        assert!(tree.node("agent").unwrap().entangled());
        // Reads and writes still reach the underlying node
        assert_eq!(tree.get(&StatePath::parse("/agent/x")), Some(json!(1)));

        source.stop();
        assert!(!tree.node("agent").unwrap().entangled());
    }

    #[tokio::test]
    async fn test_entangled_drives_a_stream_source() {
        let (a_conn, b_conn) = pair();
        let a_tree = EphemeralDocument::root();
        let b_tree = EphemeralDocument::root();
        b_tree.set(&StatePath::parse("/x"), json!(1));

        let sink = Entangled::new(
            a_tree.clone(),
            a_conn,
            config(Direction::Downstream, true, 7),
        )
        .unwrap();
        sink.open().unwrap();

        // The source half is usable through the trait alone
        let source: Arc<dyn StreamSource> = Entangled::new(
            b_tree.clone(),
            b_conn,
            config(Direction::Downstream, false, 7),
        )
        .unwrap();
        source.start().unwrap();

        eventually(|| a_tree.get(&StatePath::parse("/x")) == Some(json!(1))).await;

        source.stop();
        b_tree.set(&StatePath::parse("/x"), json!(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a_tree.get(&StatePath::parse("/x")), Some(json!(1)));

        sink.stop();
    }

    #[tokio::test]
    async fn test_double_entangle_rejected() {
        let (_a_conn, b_conn) = pair();
        let tree = EphemeralDocument::root();
        tree.document("agent");

        let first = Entangled::new(
            tree.node("agent").unwrap(),
            b_conn.clone(),
            config(Direction::Downstream, false, 7),
        )
        .unwrap();
        first.open().unwrap();

        // The tree now hands out the proxy, which refuses a second layer
        assert!(matches!(
            Entangled::new(
                tree.node("agent").unwrap(),
                b_conn,
                config(Direction::Downstream, false, 8),
            ),
            Err(NetError::IllegalState(_))
        ));

        first.stop();
    }
}
