//! Session handshake
//!
//! The first exchange on every new link. The connecting side announces its
//! instance type, flavor, and UUID; the accepting side mints a fresh CVID
//! for it and answers with its own identity. One shot per link: after the
//! first response (good or bad) the handshake machinery is done.
//!
//! ```text
//!    requester                              responder
//!        │  HandshakeRequest{type,flavor,uuid}  │
//!        ├─────────────────────────────────────►│ mint CVID
//!        │                                      │
//!        │  HandshakeResponse{cvid,server_cvid, │
//!        │◄─────────────────────────────────────┤   server_uuid}
//!   adopt cvid                                  │
//! ```
//!
//! An empty `server_uuid` in the response signals rejection.

use crate::connection::Connection;
use crate::cvid::{self, Cvid, InstanceFlavor, InstanceType};
use crate::envelope::{Envelope, Payload};
use crate::error::{NetError, NetResult};
use crate::network::NetworkStore;
use tracing::{debug, warn};

/// Where a handshake stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    RequestSent,
    Established,
    Failed,
}

/// Identities agreed on by a completed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Our session id on this link
    pub local_cvid: Cvid,
    /// The peer's session id
    pub remote_cvid: Cvid,
}

/// Connecting-side handshake
pub struct HandshakeRequester {
    state: HandshakeState,
    instance: InstanceType,
    flavor: InstanceFlavor,
    uuid: String,
}

impl HandshakeRequester {
    pub fn new(instance: InstanceType, flavor: InstanceFlavor, uuid: String) -> Self {
        Self {
            state: HandshakeState::Init,
            instance,
            flavor,
            uuid,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Send the opening request. Neither side has addressing yet, so both
    /// envelope endpoints are unset.
    pub fn send_request(&mut self, connection: &Connection) -> NetResult<()> {
        if self.state != HandshakeState::Init {
            return Err(NetError::IllegalState("handshake already started".into()));
        }
        let request = Envelope::new(
            0,
            0,
            Payload::HandshakeRequest {
                instance: self.instance,
                flavor: self.flavor,
                uuid: self.uuid.clone(),
            },
        );
        connection.send(&request)?;
        self.state = HandshakeState::RequestSent;
        Ok(())
    }

    /// Consume the response, learning our own session id from it
    pub fn handle_response(
        &mut self,
        connection: &Connection,
        envelope: &Envelope,
    ) -> NetResult<HandshakeOutcome> {
        if self.state != HandshakeState::RequestSent {
            return Err(NetError::IllegalState("no handshake in flight".into()));
        }
        let Payload::HandshakeResponse {
            cvid,
            server_cvid,
            server_uuid,
        } = &envelope.payload
        else {
            self.state = HandshakeState::Failed;
            return Err(NetError::HandshakeFailed(
                "unexpected payload in handshake".into(),
            ));
        };

        if server_uuid.is_empty() || *cvid == 0 || *server_cvid == 0 {
            self.state = HandshakeState::Failed;
            warn!(peer = %connection.peer(), "Handshake rejected by peer");
            return Err(NetError::HandshakeFailed("rejected by peer".into()));
        }

        connection.set_local_cvid(*cvid);
        connection.set_remote_cvid(*server_cvid);
        connection.set_remote_uuid(server_uuid.clone());
        connection.set_remote_instance(cvid::extract_instance(*server_cvid));

        self.state = HandshakeState::Established;
        debug!(cvid, server_cvid, "Handshake established");
        Ok(HandshakeOutcome {
            local_cvid: *cvid,
            remote_cvid: *server_cvid,
        })
    }
}

/// Accepting-side handshake
pub struct HandshakeResponder {
    uuid: String,
}

impl HandshakeResponder {
    pub fn new(uuid: String) -> Self {
        Self { uuid }
    }

    /// Mint a session id for the requester and answer.
    ///
    /// On a malformed or unacceptable request a rejection (empty uuid) is
    /// sent and an error returned; the link itself stays open.
    pub fn handle_request(
        &self,
        network: &NetworkStore,
        connection: &Connection,
        envelope: &Envelope,
    ) -> NetResult<HandshakeOutcome> {
        let local = network.local_cvid();

        let Payload::HandshakeRequest {
            instance,
            flavor,
            uuid,
        } = &envelope.payload
        else {
            self.reject(connection, envelope)?;
            return Err(NetError::HandshakeFailed(
                "unexpected payload in handshake".into(),
            ));
        };

        if *instance == InstanceType::Unrecognized
            || *flavor == InstanceFlavor::Unrecognized
            || uuid.is_empty()
        {
            self.reject(connection, envelope)?;
            return Err(NetError::HandshakeFailed("invalid identity".into()));
        }

        // Regenerate on the rare id already present in our topology
        let assigned = loop {
            let candidate = cvid::mint(*instance, *flavor)?;
            if !network.contains_node(candidate) {
                break candidate;
            }
        };

        connection.set_local_cvid(local);
        connection.set_remote_cvid(assigned);
        connection.set_remote_uuid(uuid.clone());
        connection.set_remote_instance(*instance);

        let response = envelope.reply(
            local,
            Payload::HandshakeResponse {
                cvid: assigned,
                server_cvid: local,
                server_uuid: self.uuid.clone(),
            },
        );
        connection.send(&response)?;

        debug!(assigned, ?instance, "Handshake answered");
        Ok(HandshakeOutcome {
            local_cvid: local,
            remote_cvid: assigned,
        })
    }

    fn reject(&self, connection: &Connection, envelope: &Envelope) -> NetResult<()> {
        warn!(peer = %connection.peer(), "Rejecting handshake");
        connection.send(&envelope.reply(
            0,
            Payload::HandshakeResponse {
                cvid: 0,
                server_cvid: 0,
                server_uuid: String::new(),
            },
        ))
    }
}
