// Copyright 2020 Joyent, Inc.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use resilient_pool::bounded_pool::types::BoundedPoolOptions;
use resilient_pool::bounded_pool::BoundedPool;
use resilient_pool::connection::{AsyncConnection, Connection};
use resilient_pool::retry::RetryPolicy;
use resilient_pool::unbounded_pool::{UnboundedPool, UnboundedPoolOptions};

use resilient_pool_tcp_stream_connection::{TcpStreamConfig, TcpStreamWrapper};

fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

// An address nobody is listening on
fn closed_addr() -> SocketAddr {
    let (listener, addr) = listen();
    drop(listener);
    addr
}

fn quick_retry_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 10,
        ..RetryPolicy::default()
    }
}

#[test]
fn connect_and_ping() {
    let (listener, addr) = listen();
    let mut conn = TcpStreamWrapper::new(addr.into());

    assert!(conn.ping().is_err());
    conn.connect().unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    assert!(conn.ping().is_ok());
    assert!(!conn.has_broken());

    // Unread data does not count against the connection
    peer.write_all(b"hello").unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(conn.ping().is_ok());

    conn.close().unwrap();
    assert!(conn.stream.is_none());
}

#[test]
fn ping_detects_peer_close() {
    let (listener, addr) = listen();
    let mut conn = TcpStreamWrapper::new(addr.into());
    conn.connect().unwrap();

    let (peer, _) = listener.accept().unwrap();
    drop(peer);
    thread::sleep(Duration::from_millis(50));

    let err = conn.ping().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
}

#[test]
fn unbounded_pool_gives_up_on_closed_port() {
    let config = TcpStreamConfig {
        addr: closed_addr(),
        connect_timeout: Some(500),
        command_timeout: None,
    };
    let opts = UnboundedPoolOptions {
        retry_policy: Some(quick_retry_policy()),
        log: None,
    };
    let pool =
        UnboundedPool::new(opts, TcpStreamWrapper::connection_creator(config));

    let err = pool.acquire().unwrap_err();
    let cause = err.into_connect_failure().unwrap();
    assert_eq!(cause.kind(), ErrorKind::ConnectionRefused);
}

#[test]
fn bounded_pool_pre_ping_replaces_closed_stream() {
    let (listener, addr) = listen();
    let opts = BoundedPoolOptions {
        pool_size: Some(1),
        max_overflow: Some(0),
        acquire_timeout: Some(1000),
        pre_ping: true,
        retry_policy: Some(quick_retry_policy()),
        log: None,
    };
    let pool =
        BoundedPool::new(opts, TcpStreamWrapper::connection_creator(addr.into()));

    let first_id = pool.acquire().unwrap().id();
    let (peer, _) = listener.accept().unwrap();
    drop(peer);
    thread::sleep(Duration::from_millis(50));

    let conn = pool.acquire().unwrap();
    assert_ne!(conn.id(), first_id);
    assert!(conn.stream.is_some());
}

#[tokio::test]
async fn connect_async_yields_blocking_stream() {
    let (listener, addr) = listen();
    let mut conn = TcpStreamWrapper::new(addr.into());
    conn.connect_async().await.unwrap();
    let _peer = listener.accept().unwrap();

    assert!(conn.ping().is_ok());
}

#[tokio::test]
async fn connect_async_reports_refusal() {
    let mut conn = TcpStreamWrapper::new(closed_addr().into());
    let err = conn.connect_async().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}
