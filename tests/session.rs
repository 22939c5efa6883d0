//! End-to-end session tests over localhost TCP.
//!
//! Each test drives a real `Session` against a hand-rolled remote that
//! speaks the wire protocol directly, so framing, dispatch order, and
//! disconnect behaviour are observed on the socket rather than through
//! internal state.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wyre::frame;
use wyre::{
    Capability, CapabilityInfo, DisconnectReason, Endpoint, Host, Item, MemoryHost, NodeId,
    Origin, PeerAdvert, Session, PROTOCOL_VERSION,
};

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Harness
// ============================================================================

fn test_id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; 32])
}

fn endpoint(addr: &str, port: u16) -> Endpoint {
    Endpoint::new(addr.parse().unwrap(), port)
}

async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (server, client)
}

/// Create an inbound session on `host` and return it with the remote's
/// side of the socket.
async fn start_session(host: &Arc<dyn Host>) -> (Arc<Session>, TcpStream) {
    let (server, remote) = connected_pair().await;
    let manual = Endpoint::from(server.peer_addr().unwrap());
    let session = Session::new(host, server, manual).unwrap();
    session.start();
    (session, remote)
}

fn sealed(payload: &Item) -> Vec<u8> {
    frame::encode(payload)
}

fn hello_item(id: NodeId, version: u64, client: &str, caps: Vec<CapabilityInfo>, port: u16) -> Item {
    wyre::Hello {
        protocol_version: version,
        client_version: client.to_string(),
        caps,
        listen_port: port,
        id,
    }
    .to_item()
}

async fn read_frame(stream: &mut TcpStream) -> Item {
    tokio::time::timeout(TIMEOUT, async {
        let mut header = [0u8; frame::HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[..4], &frame::SYNC_TOKEN, "bad token on wire");
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        let (item, used) = Item::decode(&payload).unwrap();
        assert_eq!(used, len, "structural length mismatch on wire");
        item
    })
    .await
    .expect("timed out waiting for frame")
}

fn packet_type(item: &Item) -> u64 {
    item.at(0).unwrap().as_uint().unwrap()
}

/// Read the three frames `start()` sends: Hello, Ping, GetPeers.
async fn drain_startup(stream: &mut TcpStream) -> wyre::Hello {
    let hello = read_frame(stream).await;
    assert_eq!(packet_type(&hello), 0, "expected Hello first");
    let hello = wyre::Hello::from_item(&hello).unwrap();

    let ping = read_frame(stream).await;
    assert_eq!(packet_type(&ping), 2, "expected Ping second");

    let get_peers = read_frame(stream).await;
    assert_eq!(packet_type(&get_peers), 4, "expected GetPeers third");

    hello
}

async fn expect_disconnect(stream: &mut TcpStream, reason: DisconnectReason) {
    let item = read_frame(stream).await;
    assert_eq!(packet_type(&item), 1, "expected Disconnect");
    assert_eq!(
        item.at(1).unwrap().as_uint().unwrap(),
        reason.to_byte() as u64,
        "wrong disconnect reason"
    );
}

async fn expect_eof(stream: &mut TcpStream) {
    tokio::time::timeout(TIMEOUT, async {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    })
    .await
    .expect("timed out waiting for socket close");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

/// Capability that records the local ids it interprets.
struct RecordingCapability {
    calls: Arc<Mutex<Vec<u8>>>,
    fail_on: Option<u8>,
}

impl Capability for RecordingCapability {
    fn message_count(&self) -> u8 {
        8
    }

    fn interpret(&mut self, local_id: u8, _payload: &Item) -> bool {
        self.calls.lock().unwrap().push(local_id);
        self.fail_on != Some(local_id)
    }
}

fn capability_host(
    host_id: NodeId,
    fail_on: Option<u8>,
) -> (Arc<dyn Host>, Arc<MemoryHost>, Arc<Mutex<Vec<u8>>>) {
    let mem = Arc::new(MemoryHost::new(host_id, 30303));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let factory_calls = Arc::clone(&calls);
    mem.add_capability(
        CapabilityInfo::new("eth", 60),
        Box::new(move || {
            Box::new(RecordingCapability {
                calls: Arc::clone(&factory_calls),
                fail_on,
            })
        }),
    );
    let host: Arc<dyn Host> = mem.clone();
    (host, mem, calls)
}

/// Complete the handshake from the remote's side.
async fn handshake(remote: &mut TcpStream, remote_id: NodeId, caps: Vec<CapabilityInfo>) {
    drain_startup(remote).await;
    remote
        .write_all(&sealed(&hello_item(
            remote_id,
            PROTOCOL_VERSION,
            "rem/1.0",
            caps,
            30303,
        )))
        .await
        .unwrap();
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn handshake_happy_path() {
    let host_id = test_id(0xAA);
    let host: Arc<dyn Host> =
        Arc::new(MemoryHost::new(host_id, 30303).with_client_version("loc/1.0"));
    let (session, mut remote) = start_session(&host).await;

    let our_hello = drain_startup(&mut remote).await;
    assert_eq!(our_hello.id, host_id);
    assert_eq!(our_hello.protocol_version, PROTOCOL_VERSION);
    assert_eq!(our_hello.client_version, "loc/1.0");
    assert_eq!(our_hello.listen_port, 30303);

    let remote_id = test_id(0xBB);
    remote
        .write_all(&sealed(&hello_item(
            remote_id,
            PROTOCOL_VERSION,
            "rem/1.0",
            vec![CapabilityInfo::new("eth", 60)],
            30303,
        )))
        .await
        .unwrap();

    wait_until(|| session.id() == remote_id).await;
    assert!(host.have_peer(&remote_id));
    assert!(!session.is_closed());

    let info = session.peer_info();
    assert_eq!(info.id, remote_id);
    assert_eq!(info.client_version, "rem/1.0");
    assert_eq!(info.port, 30303);
    assert_eq!(info.caps, vec![CapabilityInfo::new("eth", 60)]);

    // The handshake recorded the remote with a direct-contact origin.
    let record = host.node_record(&remote_id).unwrap();
    assert_eq!(record.origin(), Origin::Direct);
    assert_eq!(record.endpoint().port, 30303);
}

#[tokio::test]
async fn handshake_null_identity_rejected() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;
    remote
        .write_all(&sealed(&hello_item(
            NodeId::null(),
            PROTOCOL_VERSION,
            "rem/1.0",
            vec![],
            30303,
        )))
        .await
        .unwrap();

    expect_disconnect(&mut remote, DisconnectReason::NullIdentity).await;
    assert!(session.id().is_null());
}

#[tokio::test]
async fn handshake_incompatible_protocol_rejected() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (_session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;
    remote
        .write_all(&sealed(&hello_item(
            test_id(0xBB),
            PROTOCOL_VERSION + 7,
            "rem/1.0",
            vec![],
            30303,
        )))
        .await
        .unwrap();

    expect_disconnect(&mut remote, DisconnectReason::IncompatibleProtocol).await;
}

#[tokio::test]
async fn handshake_duplicate_peer_rejected() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let remote_id = test_id(0xBB);

    // First session completes its handshake and stays up.
    let (first, mut remote1) = start_session(&host).await;
    handshake(&mut remote1, remote_id, vec![]).await;
    wait_until(|| first.id() == remote_id).await;

    // Second session from the same identity is refused.
    let (second, mut remote2) = start_session(&host).await;
    handshake(&mut remote2, remote_id, vec![]).await;

    expect_disconnect(&mut remote2, DisconnectReason::DuplicatePeer).await;
    assert!(second.id().is_null());
    assert!(!first.is_closed());
}

#[tokio::test]
async fn handshake_identity_change_rejected_for_strong_origin() {
    let host_id = test_id(0xAA);
    let mem = Arc::new(MemoryHost::new(host_id, 30303));
    let host: Arc<dyn Host> = mem.clone();

    // We dialled a node whose identity was pinned by the operator.
    let expected_id = test_id(0xBB);
    let (ours, mut remote) = connected_pair().await;
    let dialled = Endpoint::from(ours.peer_addr().unwrap());
    let record = mem.note_node(expected_id, dialled, Origin::Perfect, true, None);
    let session = Session::with_node(&host, ours, record, false).unwrap();
    session.start();

    drain_startup(&mut remote).await;
    remote
        .write_all(&sealed(&hello_item(
            test_id(0xCC),
            PROTOCOL_VERSION,
            "rem/1.0",
            vec![],
            30303,
        )))
        .await
        .unwrap();

    expect_disconnect(&mut remote, DisconnectReason::UnexpectedIdentity).await;
}

#[tokio::test]
async fn handshake_identity_change_allowed_with_force() {
    let host_id = test_id(0xAA);
    let mem = Arc::new(MemoryHost::new(host_id, 30303));
    let host: Arc<dyn Host> = mem.clone();

    let expected_id = test_id(0xBB);
    let actual_id = test_id(0xCC);
    let (ours, mut remote) = connected_pair().await;
    let dialled = Endpoint::from(ours.peer_addr().unwrap());
    let record = mem.note_node(expected_id, dialled, Origin::Perfect, true, None);
    let session = Session::with_node(&host, ours, record, true).unwrap();
    session.start();

    handshake(&mut remote, actual_id, vec![]).await;

    wait_until(|| session.id() == actual_id).await;
    assert!(!session.is_closed());
    // The wrong record was retired in favour of the real identity.
    assert!(mem.node_record(&expected_id).is_none());
    assert!(mem.node_record(&actual_id).is_some());
}

#[tokio::test]
async fn handshake_identity_change_allowed_for_weak_origin() {
    let host_id = test_id(0xAA);
    let mem = Arc::new(MemoryHost::new(host_id, 30303));
    let host: Arc<dyn Host> = mem.clone();

    let expected_id = test_id(0xBB);
    let actual_id = test_id(0xCC);
    let (ours, mut remote) = connected_pair().await;
    let dialled = Endpoint::from(ours.peer_addr().unwrap());
    // Identity only known third-hand; a change is tolerated without force.
    let record = mem.note_node(expected_id, dialled, Origin::SelfThird, true, None);
    let session = Session::with_node(&host, ours, record, false).unwrap();
    session.start();

    handshake(&mut remote, actual_id, vec![]).await;

    wait_until(|| session.id() == actual_id).await;
    assert!(!session.is_closed());
}

// ============================================================================
// Framing
// ============================================================================

#[tokio::test]
async fn bad_sync_token_disconnects() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;
    remote
        .write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();

    expect_disconnect(&mut remote, DisconnectReason::BadProtocol).await;

    drop(session);
    expect_eof(&mut remote).await;
}

#[tokio::test]
async fn corrupt_payload_disconnects() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (_session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;

    // Valid token and length, but the payload is not a structural item.
    let mut packet = Vec::from(frame::SYNC_TOKEN);
    packet.extend_from_slice(&4u32.to_be_bytes());
    packet.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    remote.write_all(&packet).await.unwrap();

    expect_disconnect(&mut remote, DisconnectReason::BadProtocol).await;
}

#[tokio::test]
async fn fragmented_stream_dispatches_in_order() {
    let (host, _mem, calls) = capability_host(test_id(0xAA), None);
    let (session, mut remote) = start_session(&host).await;

    handshake(
        &mut remote,
        test_id(0xBB),
        vec![CapabilityInfo::new("eth", 60)],
    )
    .await;
    wait_until(|| session.id() == test_id(0xBB)).await;

    // Three capability packets in one byte stream, written in 3-byte
    // slivers.
    let mut stream_bytes = Vec::new();
    for local_id in 0u8..3 {
        let payload = Item::list(vec![Item::uint(0x10 + local_id as u64), Item::uint(42)]);
        stream_bytes.extend_from_slice(&sealed(&payload));
    }
    for chunk in stream_bytes.chunks(3) {
        remote.write_all(chunk).await.unwrap();
        remote.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    wait_until(|| calls.lock().unwrap().len() == 3).await;
    assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn invalid_outbound_packet_is_logged_but_sent() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;

    // A buffer that fails frame validation goes out anyway.
    let bogus = vec![0x11u8; 12];
    session.send(bogus.clone());

    let mut received = [0u8; 12];
    tokio::time::timeout(TIMEOUT, remote.read_exact(&mut received))
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(&received[..], &bogus[..]);
}

// ============================================================================
// Egress ordering
// ============================================================================

#[tokio::test]
async fn egress_preserves_enqueue_order() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;

    for tag in 0u64..3 {
        let payload = Item::list(vec![Item::uint(0x10), Item::uint(tag)]);
        session.send(sealed(&payload));
    }

    for expected in 0u64..3 {
        let item = read_frame(&mut remote).await;
        assert_eq!(item.at(1).unwrap().as_uint().unwrap(), expected);
    }
}

// ============================================================================
// Ping / Pong
// ============================================================================

#[tokio::test]
async fn ping_elicits_pong() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (_session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;
    remote
        .write_all(&sealed(&Item::list(vec![Item::uint(2)])))
        .await
        .unwrap();

    let item = read_frame(&mut remote).await;
    assert_eq!(packet_type(&item), 3, "expected Pong");
}

#[tokio::test]
async fn pong_records_round_trip() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    // start() already sent a Ping; answer it after a measurable delay.
    drain_startup(&mut remote).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    remote
        .write_all(&sealed(&Item::list(vec![Item::uint(3)])))
        .await
        .unwrap();

    wait_until(|| session.peer_info().last_ping.is_some()).await;
    let rtt = session.peer_info().last_ping.unwrap();
    assert!(rtt >= Duration::from_millis(40), "rtt {:?} too small", rtt);
    assert!(rtt < Duration::from_secs(2), "rtt {:?} too large", rtt);
}

// ============================================================================
// Peer exchange
// ============================================================================

#[tokio::test]
async fn peers_ingestion_applies_filters() {
    let mem = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let host: Arc<dyn Host> = mem.clone();
    let (session, mut remote) = start_session(&host).await;

    let remote_id = test_id(0xBB);
    handshake(&mut remote, remote_id, vec![]).await;
    wait_until(|| session.id() == remote_id).await;

    let private_id = test_id(0xCC);
    let public_id = test_id(0xDD);
    let peers = Item::list(vec![
        Item::uint(5),
        PeerAdvert {
            endpoint: endpoint("10.0.0.1", 30303),
            id: private_id,
        }
        .to_item(),
        PeerAdvert {
            endpoint: endpoint("1.2.3.4", 30303),
            id: public_id,
        }
        .to_item(),
    ]);
    remote.write_all(&sealed(&peers)).await.unwrap();

    wait_until(|| mem.node_record(&public_id).is_some()).await;

    // The private address was dropped under the default policy.
    assert!(mem.node_record(&private_id).is_none());

    let record = mem.node_record(&public_id).unwrap();
    assert_eq!(record.endpoint(), endpoint("1.2.3.4", 30303));
    assert_eq!(record.origin(), Origin::SelfThird);

    // The informant was rewarded exactly once.
    assert_eq!(session.rating(), 1000);
}

#[tokio::test]
async fn peers_ingestion_drops_null_self_and_informant() {
    let mem = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let host: Arc<dyn Host> = mem.clone();
    let (session, mut remote) = start_session(&host).await;

    let remote_id = test_id(0xBB);
    handshake(&mut remote, remote_id, vec![]).await;
    wait_until(|| session.id() == remote_id).await;
    let nodes_before = mem.node_count();

    let keeper_id = test_id(0xEE);
    let peers = Item::list(vec![
        Item::uint(5),
        // Null identity.
        PeerAdvert {
            endpoint: endpoint("1.2.3.4", 30303),
            id: NodeId::null(),
        }
        .to_item(),
        // Our own identity.
        PeerAdvert {
            endpoint: endpoint("1.2.3.5", 30303),
            id: test_id(0xAA),
        }
        .to_item(),
        // The informant's identity.
        PeerAdvert {
            endpoint: endpoint("1.2.3.6", 30303),
            id: remote_id,
        }
        .to_item(),
        // Zero port.
        PeerAdvert {
            endpoint: endpoint("1.2.3.7", 0),
            id: test_id(0xDC),
        }
        .to_item(),
        // Survivor.
        PeerAdvert {
            endpoint: endpoint("1.2.3.8", 30303),
            id: keeper_id,
        }
        .to_item(),
    ]);
    remote.write_all(&sealed(&peers)).await.unwrap();

    wait_until(|| mem.node_record(&keeper_id).is_some()).await;
    assert_eq!(mem.node_count(), nodes_before + 1);
    assert!(mem.node_record(&test_id(0xDC)).is_none());
    assert_eq!(session.rating(), 1000);
}

#[tokio::test]
async fn peers_ingestion_bad_address_length_is_fatal() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (_session, mut remote) = start_session(&host).await;

    let remote_id = test_id(0xBB);
    handshake(&mut remote, remote_id, vec![]).await;

    let peers = Item::list(vec![
        Item::uint(5),
        Item::list(vec![
            Item::bytes(vec![1u8, 2, 3]), // neither 4 nor 16 bytes
            Item::uint(30303),
            Item::bytes(vec![0xCC; 32]),
        ]),
    ]);
    remote.write_all(&sealed(&peers)).await.unwrap();

    expect_disconnect(&mut remote, DisconnectReason::BadProtocol).await;
}

#[tokio::test]
async fn peers_ingestion_learns_public_address_for_private_record() {
    let mem = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let host: Arc<dyn Host> = mem.clone();

    // A node we only know behind a private address.
    let nat_id = test_id(0xCC);
    mem.note_node(nat_id, endpoint("10.0.0.9", 30303), Origin::SelfThird, true, None);

    let (session, mut remote) = start_session(&host).await;
    let remote_id = test_id(0xBB);
    handshake(&mut remote, remote_id, vec![]).await;
    wait_until(|| session.id() == remote_id).await;

    let peers = Item::list(vec![
        Item::uint(5),
        PeerAdvert {
            endpoint: endpoint("1.2.3.4", 30303),
            id: nat_id,
        }
        .to_item(),
    ]);
    remote.write_all(&sealed(&peers)).await.unwrap();

    wait_until(|| mem.node_record(&nat_id).unwrap().endpoint() == endpoint("1.2.3.4", 30303))
        .await;
    // Known node: address learned, but no reward and no new record.
    assert_eq!(session.rating(), 0);
}

#[tokio::test]
async fn get_peers_replies_and_marks_known() {
    let mem = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let host: Arc<dyn Host> = mem.clone();

    let a = test_id(0x01);
    let b = test_id(0x02);
    mem.note_node(a, endpoint("1.2.3.4", 30303), Origin::Direct, false, None);
    mem.note_node(b, endpoint("5.6.7.8", 30303), Origin::Direct, false, None);

    let (_session, mut remote) = start_session(&host).await;
    drain_startup(&mut remote).await;

    remote
        .write_all(&sealed(&Item::list(vec![Item::uint(4)])))
        .await
        .unwrap();

    let reply = read_frame(&mut remote).await;
    assert_eq!(packet_type(&reply), 5, "expected Peers");
    let entries = reply.as_list().unwrap();
    assert_eq!(entries.len() - 1, 2);

    let mut advertised: Vec<NodeId> = entries[1..]
        .iter()
        .map(|entry| PeerAdvert::from_item(entry).unwrap().id)
        .collect();
    advertised.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(advertised, expected);

    // Everything sent is now marked known: a second GetPeers sends no
    // Peers at all, so the next frame on the wire answers the Ping.
    remote
        .write_all(&sealed(&Item::list(vec![Item::uint(4)])))
        .await
        .unwrap();
    remote
        .write_all(&sealed(&Item::list(vec![Item::uint(2)])))
        .await
        .unwrap();

    let next = read_frame(&mut remote).await;
    assert_eq!(packet_type(&next), 3, "expected Pong, not another Peers");
}

// ============================================================================
// Capabilities
// ============================================================================

#[tokio::test]
async fn capability_receives_rebased_packet_id() {
    let (host, _mem, calls) = capability_host(test_id(0xAA), None);
    let (session, mut remote) = start_session(&host).await;

    handshake(
        &mut remote,
        test_id(0xBB),
        vec![CapabilityInfo::new("eth", 60)],
    )
    .await;
    wait_until(|| session.id() == test_id(0xBB)).await;

    // Wire id 0x13 lands in the capability as local id 3.
    let payload = Item::list(vec![Item::uint(0x13), Item::uint(7)]);
    remote.write_all(&sealed(&payload)).await.unwrap();

    wait_until(|| !calls.lock().unwrap().is_empty()).await;
    assert_eq!(*calls.lock().unwrap(), vec![3]);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn capability_rejection_fails_session() {
    let (host, _mem, calls) = capability_host(test_id(0xAA), Some(3));
    let (session, mut remote) = start_session(&host).await;

    handshake(
        &mut remote,
        test_id(0xBB),
        vec![CapabilityInfo::new("eth", 60)],
    )
    .await;
    wait_until(|| session.id() == test_id(0xBB)).await;

    let payload = Item::list(vec![Item::uint(0x13), Item::uint(7)]);
    remote.write_all(&sealed(&payload)).await.unwrap();

    wait_until(|| session.is_closed()).await;
    assert_eq!(*calls.lock().unwrap(), vec![3]);
    // Dropped, not disconnected: the socket closes without a Disconnect.
    expect_eof(&mut remote).await;
}

#[tokio::test]
async fn unclaimed_packet_fails_session() {
    let (host, _mem, _calls) = capability_host(test_id(0xAA), None);
    let (session, mut remote) = start_session(&host).await;

    handshake(
        &mut remote,
        test_id(0xBB),
        vec![CapabilityInfo::new("eth", 60)],
    )
    .await;
    wait_until(|| session.id() == test_id(0xBB)).await;

    // 0x18 is one past the capability's 8-packet range.
    let payload = Item::list(vec![Item::uint(0x18)]);
    remote.write_all(&sealed(&payload)).await.unwrap();

    wait_until(|| session.is_closed()).await;
    expect_eof(&mut remote).await;
}

#[tokio::test]
async fn unsupported_capability_is_not_registered() {
    // Remote advertises a capability the host does not carry.
    let (host, mem, calls) = capability_host(test_id(0xAA), None);
    let (session, mut remote) = start_session(&host).await;

    handshake(
        &mut remote,
        test_id(0xBB),
        vec![CapabilityInfo::new("shh", 2)],
    )
    .await;
    wait_until(|| session.id() == test_id(0xBB)).await;
    assert_eq!(mem.session_count(), 1);

    // No capability claims 0x10, so the session drops.
    let payload = Item::list(vec![Item::uint(0x10)]);
    remote.write_all(&sealed(&payload)).await.unwrap();

    wait_until(|| session.is_closed()).await;
    assert!(calls.lock().unwrap().is_empty());
}

// ============================================================================
// Disconnect flows
// ============================================================================

#[tokio::test]
async fn local_disconnect_sends_reason_and_stops_reading() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    let remote_id = test_id(0xBB);
    handshake(&mut remote, remote_id, vec![]).await;
    wait_until(|| session.id() == remote_id).await;

    session.disconnect(DisconnectReason::UselessPeer);

    expect_disconnect(&mut remote, DisconnectReason::UselessPeer).await;
    let record = host.node_record(&remote_id).unwrap();
    assert_eq!(record.last_disconnect(), Some(DisconnectReason::UselessPeer));

    // A second disconnect forces the socket closed.
    session.disconnect(DisconnectReason::UselessPeer);
    wait_until(|| session.is_closed()).await;
    expect_eof(&mut remote).await;
}

#[tokio::test]
async fn remote_disconnect_stops_session() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;
    remote
        .write_all(&sealed(&Item::list(vec![
            Item::uint(1),
            Item::uint(DisconnectReason::ClientQuit.to_byte() as u64),
        ])))
        .await
        .unwrap();

    wait_until(|| session.is_closed()).await;
}

#[tokio::test]
async fn remote_eof_stops_session_silently() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    drain_startup(&mut remote).await;
    drop(remote);

    // The read loop exits without sending anything; the session is not
    // marked closed by a transport error, it simply stops reading.
    wait_until(|| Arc::strong_count(&session) == 1).await;
}

// ============================================================================
// Ratings
// ============================================================================

#[tokio::test]
async fn rating_accumulates_monotonically() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new(test_id(0xAA), 30303));
    let (session, mut remote) = start_session(&host).await;

    let remote_id = test_id(0xBB);
    handshake(&mut remote, remote_id, vec![]).await;
    wait_until(|| session.id() == remote_id).await;

    assert_eq!(session.rating(), 0);
    session.add_rating(10);
    session.add_rating(0);
    session.add_rating(5);
    assert_eq!(session.rating(), 15);

    let record = host.node_record(&remote_id).unwrap();
    assert_eq!(record.score(), 15);
}
