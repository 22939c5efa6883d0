//! Peer-exchange policy.
//!
//! GetPeers is answered with up to ten randomly chosen candidates the
//! remote does not already know. Inbound Peers advertisements run a fixed
//! filter ladder; whatever survives is noted with the host and rewards the
//! informant.

use super::Session;
use crate::codec::Item;
use crate::identity::NodeId;
use crate::node::Origin;
use crate::protocol::{PacketType, PeerAdvert, ProtocolError, MAX_PEERS_PER_REPLY};
use tracing::{debug, trace};

/// Rating reward for a peer advertisement that passes every filter.
const RATING_PEER_TIP: u64 = 1000;

impl Session {
    /// Reply to GetPeers with candidates the remote does not yet know.
    /// An empty candidate set sends nothing at all.
    pub(super) fn on_get_peers(&self) {
        trace!(session = self.socket_id(), "get-peers received");
        let Some(host) = self.host() else {
            return;
        };

        let candidates = {
            let state = self.state.lock().expect("state lock poisoned");
            host.potential_peers(&state.known_nodes)
        };
        if candidates.is_empty() {
            return;
        }

        let selected = random_selection(candidates, MAX_PEERS_PER_REPLY);
        let mut items = vec![Item::uint(PacketType::Peers.to_byte() as u64)];
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            for candidate in &selected {
                trace!(
                    session = self.socket_id(),
                    id = %candidate.id.short(),
                    endpoint = %candidate.endpoint,
                    "advertising peer"
                );
                items.push(
                    PeerAdvert {
                        endpoint: candidate.endpoint,
                        id: candidate.id,
                    }
                    .to_item(),
                );
                state.known_nodes.mark(candidate.index);
            }
        }
        self.seal_and_send(Item::list(items));
    }

    /// Ingest a Peers packet, applying the filter ladder to every entry in
    /// order. An entry with a malformed address is a protocol error and
    /// aborts the whole packet.
    pub(super) fn on_peers(&self, item: &Item) -> Result<bool, ProtocolError> {
        let Some(host) = self.host() else {
            return Ok(false);
        };
        let entries = item.as_list()?;
        debug!(
            session = self.socket_id(),
            entries = entries.len().saturating_sub(1),
            "peers received"
        );

        let policy = host.policy();
        let our_id = host.id();
        let local_addresses = host.local_addresses();
        let listen_port = host.listen_port();
        let (informant_id, informant_origin) = {
            let state = self.state.lock().expect("state lock poisoned");
            match &state.node {
                Some(node) => (node.id(), node.origin()),
                None => (NodeId::null(), Origin::Unknown),
            }
        };

        for entry in &entries[1..] {
            let advert = PeerAdvert::from_item(entry)?;
            let endpoint = advert.endpoint;

            if endpoint.is_private() && !policy.local_networking {
                continue; // not routable from here
            }
            if advert.id.is_null() {
                continue;
            }
            if advert.id == our_id {
                continue; // our own entry
            }
            if advert.id == informant_id {
                continue; // they need not advertise themselves
            }
            if let Some(record) = host.node_record(&advert.id) {
                // Lazy public-address learn for nodes we only know behind
                // a private address. Acknowledged poisoning surface; see
                // NetworkPolicy.
                if record.endpoint().is_private() && !endpoint.is_private() {
                    record.set_endpoint(endpoint);
                }
                continue;
            }
            if endpoint.port == 0 {
                continue;
            }
            if endpoint.port == listen_port && local_addresses.contains(&endpoint.addr) {
                continue; // points back at us
            }
            if policy.pin_first_address && host.endpoint_in_use(&endpoint) {
                continue; // first-seen identity keeps the address
            }

            self.add_rating(RATING_PEER_TIP);
            let origin = if informant_origin == Origin::Perfect {
                Origin::PerfectThird
            } else {
                Origin::SelfThird
            };
            host.note_node(advert.id, endpoint, origin, true, None);
            trace!(
                session = self.socket_id(),
                id = %advert.id.short(),
                endpoint = %endpoint,
                "new peer noted"
            );
        }

        Ok(true)
    }
}

/// Select up to `n` elements by random removal.
///
/// Mildly biased on small populations; good enough for gossip and cheap.
fn random_selection<T>(mut candidates: Vec<T>, n: usize) -> Vec<T> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    while candidates.len() > n {
        let victim = rng.gen_range(0..candidates.len());
        candidates.swap_remove(victim);
    }
    candidates
}
