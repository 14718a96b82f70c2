//! Integration tests for the multi-server pool.


use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use gearline::config::{PoolConfig, SelectionMode};
use gearline::pool::strategy_for;
use gearline::{Client, GearError, JobHandle, JobPriority, Pool};
use test_harness::{assert_eventually, test_client_config, MockJobServer, ScriptedPeer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const DEADLINE: Duration = Duration::from_secs(1);

fn test_pool() -> Pool {
    Pool::with_strategy(test_client_config(), strategy_for(SelectionMode::Weighted))
}

/// Address nothing is listening on
async fn dead_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// Stream that never yields data and fails to shut down
struct BrokenStream;

impl AsyncRead for BrokenStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer vanished")))
    }
}

#[tokio::test]
async fn test_empty_pool_fails_fast() {
    let pool = test_pool();

    assert!(pool.is_empty().await);
    assert!(matches!(pool.select_server().await, Err(GearError::EmptyPool)));
    assert!(matches!(pool.echo(b"x").await, Err(GearError::EmptyPool)));
    assert!(matches!(
        pool.submit(DEADLINE, "ToUpper", b"x", JobPriority::Normal, None).await,
        Err(GearError::EmptyPool)
    ));
    assert!(matches!(
        pool.submit_background(DEADLINE, "ToUpper", b"x", JobPriority::Normal).await,
        Err(GearError::EmptyPool)
    ));
}

#[tokio::test]
async fn test_single_server_is_always_selected() {
    let server = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&server.addr, 1).await.unwrap();

    for _ in 0..100 {
        assert_eq!(pool.select_server().await.unwrap(), server.addr);
    }

    let (addr, reply) = pool.echo(b"hello").await.unwrap();
    assert_eq!(addr, server.addr);
    assert_eq!(reply, b"hello");
}

#[tokio::test]
async fn test_add_existing_address_updates_weight() {
    let server = MockJobServer::start().await;
    let pool = test_pool();

    pool.add(&server.addr, 1).await.unwrap();
    pool.add(&server.addr, 5).await.unwrap();

    assert_eq!(pool.len().await, 1);
    assert_eq!(pool.weight(&server.addr).await, Some(5));
    assert_eventually(
        || async { server.connection_count().await == 1 },
        Duration::from_secs(1),
        "weight update should not open a second connection",
    )
    .await;
}

#[tokio::test]
async fn test_concurrent_add_keeps_one_connection() {
    let server = MockJobServer::start().await;
    let pool = Arc::new(test_pool());

    let mut tasks = Vec::new();
    for weight in 1..=4 {
        let pool = pool.clone();
        let addr = server.addr.clone();
        tasks.push(tokio::spawn(async move { pool.add(&addr, weight).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(pool.len().await, 1);
    assert!((1..=4).contains(&pool.weight(&server.addr).await.unwrap()));
    assert_eq!(pool.echo(b"one").await.unwrap().1, b"one");
}

#[tokio::test]
async fn test_add_unreachable_server_fails() {
    let pool = test_pool();
    let addr = dead_addr().await;

    assert!(pool.add(&addr, 1).await.is_err());
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn test_remove_hands_back_open_client() {
    let server = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&server.addr, 1).await.unwrap();

    let client = pool.remove(&server.addr).await.expect("entry should exist");
    assert!(pool.remove(&server.addr).await.is_none());
    assert!(matches!(pool.select_server().await, Err(GearError::EmptyPool)));

    // Still usable until the caller closes it
    assert!(!client.is_closed());
    assert_eq!(client.echo(b"still here").await.unwrap(), b"still here");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_server_is_not_found() {
    let server = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&server.addr, 1).await.unwrap();

    let missing = "10.255.255.1:4730";
    assert!(matches!(
        pool.echo_at(missing, b"x").await,
        Err(GearError::ServerNotFound(addr)) if addr == missing
    ));
    assert!(matches!(
        pool.status(missing, &JobHandle::from("H:1")).await,
        Err(GearError::ServerNotFound(_))
    ));
}

#[tokio::test]
async fn test_echo_at_targets_named_server() {
    let first = MockJobServer::start().await;
    let second = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&first.addr, 1).await.unwrap();
    pool.add(&second.addr, 1).await.unwrap();

    assert_eq!(pool.echo_at(&second.addr, b"direct").await.unwrap(), b"direct");
    // Empty address falls back to selection
    assert_eq!(pool.echo_at("", b"any").await.unwrap(), b"any");
}

#[tokio::test]
async fn test_submit_reports_server_for_status() {
    let first = MockJobServer::start().await;
    let second = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&first.addr, 1).await.unwrap();
    pool.add(&second.addr, 1).await.unwrap();

    for _ in 0..10 {
        let (addr, handle) = pool
            .submit_background(DEADLINE, "Delay", b"60000", JobPriority::Normal)
            .await
            .unwrap();
        assert!(addr == first.addr || addr == second.addr);

        let status = pool.status(&addr, &handle).await.unwrap();
        assert!(status.known, "handle should be known on the server that issued it");
        assert!(status.running);
    }

    let total = first.submissions().await.len() + second.submissions().await.len();
    assert_eq!(total, 10);
}

#[tokio::test]
async fn test_scheduled_submissions_through_pool() {
    let server = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&server.addr, 1).await.unwrap();

    let (addr, _) = pool
        .submit_cron(DEADLINE, "Report", "0 * * * *", b"hourly")
        .await
        .unwrap();
    assert_eq!(addr, server.addr);
    pool.submit_at(DEADLINE, "Wake", 1_893_456_000, b"once")
        .await
        .unwrap();

    assert_eq!(server.submissions().await.len(), 2);
}

#[tokio::test]
async fn test_weighted_selection_follows_weights() {
    let heavy = MockJobServer::start().await;
    let light = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&heavy.addr, 8).await.unwrap();
    pool.add(&light.addr, 2).await.unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..5_000 {
        *counts.entry(pool.select_server().await.unwrap()).or_insert(0) += 1;
    }

    let share = counts[&heavy.addr] as f64 / 5_000.0;
    assert!((share - 0.8).abs() < 0.05, "heavy server share was {:.3}", share);
}

#[tokio::test]
async fn test_uniform_selection_ignores_weights() {
    let heavy = MockJobServer::start().await;
    let light = MockJobServer::start().await;
    let pool = Pool::with_strategy(test_client_config(), strategy_for(SelectionMode::Uniform));
    pool.add(&heavy.addr, 9).await.unwrap();
    pool.add(&light.addr, 1).await.unwrap();

    let mut heavy_count = 0usize;
    for _ in 0..5_000 {
        if pool.select_server().await.unwrap() == heavy.addr {
            heavy_count += 1;
        }
    }

    let share = heavy_count as f64 / 5_000.0;
    assert!((share - 0.5).abs() < 0.05, "heavy server share was {:.3}", share);
}

#[tokio::test]
async fn test_connect_skips_unreachable_servers() {
    let server = MockJobServer::start().await;
    let config = PoolConfig {
        client: test_client_config(),
        ..PoolConfig::default()
    }
    .with_server(server.addr.clone(), 1)
    .with_server(dead_addr().await, 1);

    let pool = Pool::connect(config).await.unwrap();
    assert_eq!(pool.addresses().await, vec![server.addr.clone()]);

    let config = PoolConfig {
        client: test_client_config(),
        ..PoolConfig::default()
    }
    .with_server(dead_addr().await, 1);
    assert!(matches!(Pool::connect(config).await, Err(GearError::EmptyPool)));
}

#[tokio::test]
async fn test_close_with_one_broken_server() {
    let first = MockJobServer::start().await;
    let second = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&first.addr, 1).await.unwrap();
    pool.add(&second.addr, 1).await.unwrap();

    let broken = Client::from_stream("broken:4730", BrokenStream, test_client_config());
    pool.add_client(broken, 1).await.unwrap();

    let results = pool.close().await;
    assert_eq!(results.len(), 3);
    assert!(results["broken:4730"].is_err());
    assert!(results[&first.addr].is_ok());
    assert!(results[&second.addr].is_ok());

    // Closed entries refuse further work
    assert!(matches!(
        pool.echo_at(&first.addr, b"x").await,
        Err(GearError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_close_is_not_held_up_by_stalled_server() {
    let first = MockJobServer::start().await;
    let second = MockJobServer::start().await;
    let pool = Arc::new(test_pool());
    // Zero weight keeps selection on the stalled server
    pool.add(&first.addr, 0).await.unwrap();
    pool.add(&second.addr, 0).await.unwrap();

    let (stalled, _peer) = ScriptedPeer::connect("stalled:4730", 64);
    pool.add_client(stalled, 1).await.unwrap();

    let submit = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.submit_background(Duration::from_secs(30), "ToUpper", &[b'x'; 4096], JobPriority::Normal)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!submit.is_finished(), "write should be stalled on the full stream");

    let results = tokio::time::timeout(Duration::from_secs(3), pool.close())
        .await
        .expect("pool close should not hang on one stalled server");
    assert_eq!(results.len(), 3);
    assert!(results[&first.addr].is_ok());
    assert!(results[&second.addr].is_ok());

    let submitted = tokio::time::timeout(Duration::from_secs(2), submit)
        .await
        .expect("stalled submit should be released by close")
        .unwrap();
    assert!(matches!(submitted, Err(GearError::ConnectionClosed)), "got {:?}", submitted);
}

#[tokio::test]
async fn test_add_client_rejects_duplicate_address() {
    let server = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&server.addr, 1).await.unwrap();

    let duplicate = Client::connect(&server.addr, test_client_config()).await.unwrap();
    assert!(matches!(
        pool.add_client(duplicate, 1).await,
        Err(GearError::DuplicateKey(_))
    ));
}

#[tokio::test]
async fn test_error_handler_reaches_current_and_future_clients() {
    let first = MockJobServer::start().await;
    let second = MockJobServer::start().await;
    let pool = test_pool();
    pool.add(&first.addr, 1).await.unwrap();

    let observed = Arc::new(AtomicUsize::new(0));
    let observed_clone = observed.clone();
    pool.set_error_handler(Arc::new(move |_err: &GearError| {
        observed_clone.fetch_add(1, Ordering::SeqCst);
    }))
    .await;
    pool.add(&second.addr, 1).await.unwrap();

    for server in [&first, &second] {
        assert_eventually(
            || async { server.connection_count().await == 1 },
            Duration::from_secs(1),
            "server should register the connection",
        )
        .await;
    }
    first.disconnect_all().await;
    second.disconnect_all().await;

    assert_eventually(
        || async { observed.load(Ordering::SeqCst) == 2 },
        Duration::from_secs(2),
        "both clients should report their lost connection",
    )
    .await;
}
