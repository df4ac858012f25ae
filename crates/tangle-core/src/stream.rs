//! Event streams over connections
//!
//! A stream is a long-lived flow of [`StateUpdate`] events riding an
//! established connection, identified by a stream id negotiated when the
//! stream is opened. The outbound adapter wraps updates in envelopes; the
//! inbound adapter registers a sink in the connection's demux table so
//! arriving events bypass request/reply handling.

use std::sync::Arc;

use crate::connection::Connection;
use crate::envelope::{Envelope, Payload};
use crate::error::NetResult;
use crate::st::StateUpdate;

/// Receives events from a stream
pub trait StreamSink: Send + Sync {
    fn on_next(&self, item: StateUpdate);
}

/// Produces events into a stream
pub trait StreamSource: Send + Sync {
    /// Begin emitting events
    fn start(&self) -> NetResult<()>;
    /// Stop emitting; no events flow after this returns
    fn stop(&self);
}

/// Generate a random positive stream id
pub fn stream_id() -> i32 {
    loop {
        let id = (rand::random::<u32>() & 0x7FFF_FFFF) as i32;
        if id != 0 {
            return id;
        }
    }
}

/// Sends stream events to the peer on the other end of a connection
#[derive(Clone)]
pub struct OutboundStreamAdapter {
    stream_id: i32,
    connection: Arc<Connection>,
}

impl OutboundStreamAdapter {
    pub fn new(stream_id: i32, connection: Arc<Connection>) -> Self {
        Self {
            stream_id,
            connection,
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Wrap an update in an envelope and transmit it
    pub fn submit(&self, update: StateUpdate) -> NetResult<()> {
        let envelope = Envelope::new(
            self.connection.remote_cvid(),
            self.connection.local_cvid(),
            Payload::StreamEvent {
                stream_id: self.stream_id,
                update,
            },
        );
        self.connection.send(&envelope)
    }
}

/// Receives stream events arriving on a connection
pub struct InboundStreamAdapter {
    stream_id: i32,
    connection: Arc<Connection>,
}

impl InboundStreamAdapter {
    /// Register `sink` for events carrying `stream_id` on this connection
    pub fn attach(connection: Arc<Connection>, stream_id: i32, sink: Arc<dyn StreamSink>) -> Self {
        connection.register_sink(stream_id, sink);
        Self {
            stream_id,
            connection,
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Deregister the sink; events for this stream id are dropped afterwards
    pub fn detach(&self) {
        self.connection.remove_sink(self.stream_id);
    }
}
