//! Packet dispatch and control handlers.
//!
//! The packet type is the first element of the structural payload. Types
//! 0x00-0x05 are handled here; anything else is offered to the registered
//! capabilities by id range. Any decode error on any field, at any depth,
//! produces exactly one Disconnect(BadProtocol) and fails the session
//! before partial state changes are visible to the remote.

use super::Session;
use crate::codec::Item;
use crate::node::{Endpoint, Origin};
use crate::protocol::{
    bare_packet, DisconnectReason, Hello, PacketType, ProtocolError,
};
use tracing::{debug, info, trace, warn};

impl Session {
    /// Decode and dispatch one frame payload. Returning `false` fails the
    /// session.
    pub(super) fn interpret_frame(&self, payload: &[u8]) -> bool {
        match self.dispatch(payload) {
            Ok(keep) => keep,
            Err(e) => {
                debug!(session = self.socket_id(), error = %e, "malformed packet");
                self.disconnect(DisconnectReason::BadProtocol);
                false
            }
        }
    }

    fn dispatch(&self, payload: &[u8]) -> Result<bool, ProtocolError> {
        let (item, _) = Item::decode(payload)?;
        let packet_id = item.at(0)?.as_uint()?;
        trace!(session = self.socket_id(), packet_id, "packet received");

        // No capability can claim an id outside the byte range.
        let Ok(packet_byte) = u8::try_from(packet_id) else {
            return Ok(false);
        };

        match PacketType::from_byte(packet_byte) {
            Some(PacketType::Hello) => self.on_hello(&item),
            Some(PacketType::Disconnect) => Ok(self.on_disconnect(&item)),
            Some(PacketType::Ping) => {
                self.on_ping();
                Ok(true)
            }
            Some(PacketType::Pong) => {
                self.on_pong();
                Ok(true)
            }
            Some(PacketType::GetPeers) => {
                self.on_get_peers();
                Ok(true)
            }
            Some(PacketType::Peers) => self.on_peers(&item),
            None => Ok(self.dispatch_capability(packet_byte, &item)),
        }
    }

    /// Handshake: validate the remote's identity and register the session.
    fn on_hello(&self, item: &Item) -> Result<bool, ProtocolError> {
        let hello = Hello::from_item(item)?;
        let Some(host) = self.host() else {
            return Ok(false);
        };

        // A fresh Hello resets any recorded disconnect on the record.
        let prior = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if let Some(node) = &state.node {
                node.clear_disconnect();
            }
            state.protocol_version = hello.protocol_version;
            state.client_version = hello.client_version.clone();
            state.listen_port = hello.listen_port;
            state.caps = hello.caps.clone();
            state.node.clone()
        };

        info!(
            session = self.socket_id(),
            client = %hello.client_version,
            version = hello.protocol_version,
            id = %hello.id.short(),
            port = hello.listen_port,
            "hello received"
        );

        if host.have_peer(&hello.id) {
            warn!(session = self.socket_id(), id = %hello.id.short(), "already connected to this identity");
            self.disconnect(DisconnectReason::DuplicatePeer);
            return Ok(false);
        }

        // An identity different from the one we dialled is only accepted
        // under force, or when the prior record was weakly sourced.
        let mut replaces = None;
        if let Some(prior) = &prior {
            if prior.id() != hello.id {
                if self.force_identity || prior.origin() <= Origin::SelfThird {
                    warn!(
                        session = self.socket_id(),
                        expected = %prior.id().short(),
                        actual = %hello.id.short(),
                        "remote identity changed since last contact; possible MitM, allowing"
                    );
                    replaces = Some(prior.id());
                } else {
                    warn!(
                        session = self.socket_id(),
                        expected = %prior.id().short(),
                        actual = %hello.id.short(),
                        "remote identity changed since last contact; possible MitM, disconnecting"
                    );
                    self.disconnect(DisconnectReason::UnexpectedIdentity);
                    return Ok(false);
                }
            }
        }

        if hello.id.is_null() {
            self.disconnect(DisconnectReason::NullIdentity);
            return Ok(false);
        }

        let endpoint = Endpoint::new(self.remote_addr.ip(), hello.listen_port);
        let record = host.note_node(hello.id, endpoint, Origin::Direct, false, replaces);
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.known_nodes.mark(record.index());
            state.node = Some(record);
        }

        if hello.protocol_version != host.protocol_version() {
            self.disconnect(DisconnectReason::IncompatibleProtocol);
            return Ok(false);
        }

        let Some(session) = self.weak_self.upgrade() else {
            return Ok(false);
        };
        host.register_session(&session, &hello.caps);
        Ok(true)
    }

    /// Remote disconnect: log the reason and fail the session so the read
    /// loop closes the socket.
    fn on_disconnect(&self, item: &Item) -> bool {
        let reason = item
            .at(1)
            .ok()
            .and_then(|r| r.as_uint().ok())
            .and_then(|v| u8::try_from(v).ok())
            .and_then(DisconnectReason::from_byte);
        match reason {
            Some(reason) => {
                info!(session = self.socket_id(), reason = %reason, "disconnect received")
            }
            None => info!(session = self.socket_id(), "disconnect received (unspecified reason)"),
        }
        false
    }

    fn on_ping(&self) {
        trace!(session = self.socket_id(), "ping received");
        self.seal_and_send(bare_packet(PacketType::Pong));
    }

    fn on_pong(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if let Some(sent_at) = state.ping_at {
            let rtt = sent_at.elapsed();
            state.last_ping = Some(rtt);
            trace!(
                session = self.socket_id(),
                latency_ms = rtt.as_millis() as u64,
                "pong received"
            );
        }
    }

    /// Offer a packet to the first capability whose id range claims it.
    fn dispatch_capability(&self, packet_id: u8, item: &Item) -> bool {
        let mut caps = self.capabilities.lock().expect("capability lock poisoned");
        for cap in caps.iter_mut() {
            if cap.claims(packet_id) {
                let local_id = packet_id - cap.id_offset;
                trace!(
                    session = self.socket_id(),
                    cap = %cap.info,
                    local_id,
                    "capability packet"
                );
                if cap.handler.interpret(local_id, item) {
                    return true;
                }
            }
        }
        debug!(session = self.socket_id(), packet_id, "unclaimed packet");
        false
    }
}
