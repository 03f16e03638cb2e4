//! Topology, routing and link-lifecycle tests across real loopback links.

use std::time::Duration;
use trellis_core::services::admit;
use trellis_core::{NodeLabel, OverlayContext, Role};
use trellis_crypto::LinkSecret;
use trellis_tests::{free_port, id, link, node, wait_until};

const DEADLINE: Option<Duration> = Some(Duration::from_secs(10));

#[tokio::test]
async fn two_node_sync() {
    let a = node(0x01, Role::Admin);
    let b = node(0x02, Role::Agent);

    link(&a, &b).await;
    a.sync().await.unwrap();

    // A's graph is exactly {(A,B)} and it routes B directly.
    let edges = a.topology_read(|t| t.edges());
    assert_eq!(edges.len(), 1);
    assert!(a.topology_read(|t| t.has_edge(id(0x01), id(0x02))));
    assert_eq!(a.topology_read(|t| t.next_hop(id(0x02))).unwrap(), id(0x02));

    // B routes A directly.
    assert_eq!(b.topology_read(|t| t.next_hop(id(0x01))).unwrap(), id(0x01));
}

#[tokio::test]
async fn three_node_relay_listen() {
    let a = node(0x01, Role::Admin);
    let b = node(0x02, Role::Agent);
    let c = node(0x03, Role::Agent);

    link(&a, &b).await;
    link(&c, &b).await;
    a.sync().await.unwrap();

    // A sees C two hops away, via B.
    assert_eq!(a.topology_read(|t| t.next_hop(id(0x03))).unwrap(), id(0x02));

    // LISTEN is relayed by B and C answers with exactly one reply.
    let port = free_port().await;
    admit::send_listen(&a, id(0x03), port, DEADLINE).await.unwrap();

    // The listener C opened admits new nodes.
    let d = node(0x04, Role::Agent);
    d.connect(format!("127.0.0.1:{port}").parse().unwrap())
        .await
        .unwrap();
    a.sync().await.unwrap();
    assert_eq!(a.topology_read(|t| t.next_hop(id(0x04))).unwrap(), id(0x02));
}

#[tokio::test]
async fn listen_on_taken_port_reports_failure() {
    let a = node(0x01, Role::Admin);
    let b = node(0x02, Role::Agent);
    link(&a, &b).await;
    a.sync().await.unwrap();

    // Hold the port so the agent's bind fails.
    let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = holder.local_addr().unwrap().port();

    let result = admit::send_listen(&a, id(0x02), port, DEADLINE).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn remote_connect_grows_overlay() {
    let a = node(0x01, Role::Admin);
    let b = node(0x02, Role::Agent);
    let c = node(0x03, Role::Agent);

    link(&a, &b).await;
    let c_addr = c.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    a.sync().await.unwrap();

    // Tell B to dial C.
    let std::net::SocketAddr::V4(c_addr) = c_addr else {
        panic!("loopback is v4");
    };
    admit::send_connect(&a, id(0x02), *c_addr.ip(), c_addr.port(), DEADLINE)
        .await
        .unwrap();

    a.sync().await.unwrap();
    assert_eq!(a.topology_read(|t| t.next_hop(id(0x03))).unwrap(), id(0x02));
}

#[tokio::test]
async fn wrong_secret_is_rejected_unregistered() {
    let a = node(0x01, Role::Admin);
    let imposter = OverlayContext::with_identity(
        id(0x66),
        Role::Agent,
        NodeLabel::default(),
        LinkSecret::from_passphrase("some other overlay"),
    );

    let addr = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    assert!(imposter.connect(addr).await.is_err());

    // The failed probe never registered a peer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.registry().is_empty());
}

#[tokio::test]
async fn peer_drop_cascades_and_reroutes() {
    let a = node(0x01, Role::Admin);
    let b = node(0x02, Role::Agent);
    let c = node(0x03, Role::Agent);

    link(&a, &b).await;
    link(&c, &b).await;
    a.sync().await.unwrap();
    assert!(a.topology_read(|t| t.next_hop(id(0x03))).is_ok());

    // Kill B; A must drop the link, and C must become unroutable.
    b.shutdown();

    let rerouted = wait_until(Duration::from_secs(10), || {
        a.topology_read(|t| t.next_hop(id(0x03))).is_err()
            && a.registry().lookup(id(0x02)).is_none()
    })
    .await;
    assert!(rerouted, "A kept routing through the dead node");
}

#[tokio::test]
async fn duplicate_direct_link_is_rejected_while_live() {
    let a = node(0x01, Role::Admin);
    let b = node(0x02, Role::Agent);

    link(&a, &b).await;

    // A second direct link from the same identity is a takeover attempt
    // and fails while the first is alive.
    let b_addr = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    assert!(a.connect(b_addr).await.is_err());
    assert!(!a.registry().lookup(id(0x02)).unwrap().is_closed());
}
