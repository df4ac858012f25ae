//! Wire format for mesh messages
//!
//! Every message travels as a [`Frame`] (a versioned wrapper, so the wire
//! format can evolve) containing an [`Envelope`]: addressing header plus one
//! [`Payload`] variant. Serialization is postcard throughout.
//!
//! Request/response pairing uses the envelope `id`: a reply carries the same
//! id as the request it answers, with the addressing fields swapped.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cvid::{Cvid, InstanceFlavor, InstanceType};
use crate::error::NetResult;
use crate::st::StateUpdate;

/// Correlates a request with its reply. Positive when set, 0 when unset.
pub type MessageId = i32;

/// Generate a random positive message id
pub fn message_id() -> MessageId {
    loop {
        let id = (rand::random::<u32>() & 0x7FFF_FFFF) as MessageId;
        if id != 0 {
            return id;
        }
    }
}

/// Message body variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// First message on a new link: the connecting side announces itself
    /// and asks for a session id.
    HandshakeRequest {
        instance: InstanceType,
        flavor: InstanceFlavor,
        uuid: String,
    },
    /// Handshake answer. An empty `server_uuid` signals rejection.
    HandshakeResponse {
        /// Session id assigned to the requester
        cvid: Cvid,
        /// The responder's own session id
        server_cvid: Cvid,
        /// The responder's long-term identity
        server_uuid: String,
    },
    /// Ask the remote side to open an entanglement stream
    EntangleRequest {
        stream_id: i32,
        path: String,
        update_period_ms: u64,
        direction: Direction,
        whitelist: Vec<String>,
    },
    /// Generic success/failure reply
    Outcome { success: bool, message: String },
    /// One update on an established entanglement stream
    StreamEvent { stream_id: i32, update: StateUpdate },
    /// Application payload carried opaquely through the mesh
    Opaque(Vec<u8>),
}

/// Which way state flows through an entanglement, from the initiator's
/// point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Initiator sends, remote applies
    Upstream,
    /// Remote sends, initiator applies
    Downstream,
    /// Both sides send and apply
    Bidirectional,
}

/// A routable message: addressing header plus payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination session id (0 when addressing is not yet known)
    pub to: Cvid,
    /// Origin session id (0 when the sender has no session yet)
    pub from: Cvid,
    /// Request/reply correlation id
    pub id: MessageId,
    pub payload: Payload,
}

impl Envelope {
    /// New envelope with a fresh correlation id
    pub fn new(to: Cvid, from: Cvid, payload: Payload) -> Self {
        Self {
            to,
            from,
            id: message_id(),
            payload,
        }
    }

    /// Build a reply: same correlation id, addressing swapped
    pub fn reply(&self, from: Cvid, payload: Payload) -> Self {
        Self {
            to: self.from,
            from,
            id: self.id,
            payload,
        }
    }
}

/// Versioned wire wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    V1(Envelope),
}

impl Frame {
    /// Serialize for transmission
    pub fn encode(&self) -> NetResult<Bytes> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    /// Deserialize from received bytes
    pub fn decode(bytes: &[u8]) -> NetResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn version(&self) -> u8 {
        match self {
            Frame::V1(_) => 1,
        }
    }

    pub fn into_inner(self) -> Envelope {
        match self {
            Frame::V1(envelope) => envelope,
        }
    }
}
