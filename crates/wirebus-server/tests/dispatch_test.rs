//! Integration tests for event dispatch: filter matching, the two data
//! slots, and the exact-only disconnect rule.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{io::AsyncWriteExt, net::TcpStream, time::Instant};
use wirebus_server::{Server, ServerConfig, Subscription};

async fn started_server() -> (Server, SocketAddr) {
    let server = Server::new();
    server.start(&ServerConfig { port: 0, ..ServerConfig::default() }).await.unwrap();
    let port = server.local_addr().await.unwrap().port();
    (server, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

async fn connect_and_accept(server: &Server, addr: SocketAddr) -> TcpStream {
    let pending = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    server.accept_client(Duration::from_secs(5)).await.unwrap();
    pending.await.unwrap()
}

/// Poll `cond` until it holds, failing the test after five seconds.
async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn wildcard_sees_data_from_every_connection() {
    let (server, addr) = started_server().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    server.subscribe(Subscription::any().on_data(move |_ip, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
        true
    }));

    let mut one = connect_and_accept(&server, addr).await;
    let mut two = connect_and_accept(&server, addr).await;
    one.write_all(b"from one").await.unwrap();
    two.write_all(b"from two").await.unwrap();

    wait_until("both chunks", || seen.lock().unwrap().len() == 2).await;

    // Delivery order across connections is not defined.
    let mut got = seen.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec![b"from one".to_vec(), b"from two".to_vec()]);

    server.close().await;
}

#[tokio::test]
async fn both_data_slots_fire_once_per_chunk() {
    let (server, addr) = started_server().await;

    let ip_hits = Arc::new(AtomicUsize::new(0));
    let conn_hits = Arc::new(AtomicUsize::new(0));
    let by_ip = Arc::clone(&ip_hits);
    let by_conn = Arc::clone(&conn_hits);
    server.subscribe(
        Subscription::any()
            .on_data(move |_ip, _bytes| {
                by_ip.fetch_add(1, Ordering::SeqCst);
                true
            })
            .on_connection_data(move |_conn, _bytes| {
                by_conn.fetch_add(1, Ordering::SeqCst);
                true
            }),
    );

    let mut client = connect_and_accept(&server, addr).await;
    client.write_all(b"first").await.unwrap();
    wait_until("first chunk on both slots", || {
        ip_hits.load(Ordering::SeqCst) == 1 && conn_hits.load(Ordering::SeqCst) == 1
    })
    .await;

    client.write_all(b"second").await.unwrap();
    wait_until("second chunk on both slots", || {
        ip_hits.load(Ordering::SeqCst) == 2 && conn_hits.load(Ordering::SeqCst) == 2
    })
    .await;

    server.close().await;
}

#[tokio::test]
async fn exact_filter_scopes_data_to_its_peer() {
    let (server, addr) = started_server().await;

    let matched = Arc::new(AtomicUsize::new(0));
    let foreign = Arc::new(AtomicUsize::new(0));

    let hits = Arc::clone(&matched);
    server.subscribe(
        Subscription::for_peer(IpAddr::V4(Ipv4Addr::LOCALHOST)).on_data(move |_ip, _bytes| {
            hits.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );
    let hits = Arc::clone(&foreign);
    server.subscribe(
        Subscription::for_peer(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9))).on_data(
            move |_ip, _bytes| {
                hits.fetch_add(1, Ordering::SeqCst);
                true
            },
        ),
    );

    let mut client = connect_and_accept(&server, addr).await;
    client.write_all(b"hello").await.unwrap();

    wait_until("the matching subscription", || matched.load(Ordering::SeqCst) == 1).await;
    assert_eq!(foreign.load(Ordering::SeqCst), 0, "filter for another peer must stay silent");

    server.close().await;
}

#[tokio::test]
async fn disconnects_go_only_to_exact_subscriptions() {
    let (server, addr) = started_server().await;

    let exact_hits = Arc::new(AtomicUsize::new(0));
    let wildcard_hits = Arc::new(AtomicUsize::new(0));

    let hits = Arc::clone(&exact_hits);
    server.subscribe(
        Subscription::for_peer(IpAddr::V4(Ipv4Addr::LOCALHOST)).on_disconnect(
            move |_ip, _reason| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
        ),
    );
    let hits = Arc::clone(&wildcard_hits);
    server.subscribe(Subscription::any().on_disconnect(move |_ip, _reason| {
        hits.fetch_add(1, Ordering::SeqCst);
    }));

    let client = connect_and_accept(&server, addr).await;
    drop(client);

    wait_until("the exact disconnect", || exact_hits.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        wildcard_hits.load(Ordering::SeqCst),
        0,
        "wildcard subscriptions must not observe disconnects"
    );

    server.close().await;
}

#[tokio::test]
async fn data_with_no_subscriptions_is_dropped_quietly() {
    let (server, addr) = started_server().await;

    let mut client = connect_and_accept(&server, addr).await;
    client.write_all(b"nobody is listening").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.connection_count().await, 1);
    server.close().await;
}
