//! End-to-end forwarding scenarios over loopback sockets: raw TCP,
//! SOCKS5, HTTP proxying with audit pairing, WebSocket passthrough and
//! mixed-mode detection. All mappings use empty chains (direct connect);
//! chain behavior is covered by the SSH pool unit tests.

use std::sync::Arc;
use std::time::Duration;

use bastion_core::app::session;
use bastion_core::audit::store::LogQuery;
use bastion_core::audit::{self, Auditor, AuditorConfig};
use bastion_core::error::CoreError;
use bastion_core::ssh::chain::{ChainConfig, RusshConnector};
use bastion_core::ssh::pool::{PoolConfig, SshPool};
use bastion_core::store::{ConfigStore, Mapping, MappingType, MemoryStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// The auditor's consumer task lives on the runtime of the test that
// started it, so audit-observing tests each install a fresh pipeline and
// run one at a time.
static AUDIT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn fresh_auditor() -> Arc<Auditor> {
    let auditor = Auditor::start(AuditorConfig::default());
    audit::install(Arc::clone(&auditor));
    auditor
}

fn test_pool() -> Arc<SshPool> {
    SshPool::new(
        PoolConfig::default(),
        Box::new(RusshConnector::new(ChainConfig::default())),
    )
}

fn mapping(id: &str, port: u16, mapping_type: MappingType) -> Mapping {
    Mapping {
        id: id.to_string(),
        local_host: "127.0.0.1".to_string(),
        local_port: port,
        mapping_type,
        remote_host: String::new(),
        remote_port: 0,
        chain: vec![],
        allow_cidrs: vec![],
        deny_cidrs: vec![],
        auto_start: false,
    }
}

async fn start_session(m: Mapping, pool: Arc<SshPool>) -> Arc<session::Session> {
    let store = MemoryStore::new();
    let id = m.id.clone();
    store.put_mapping(m);
    let store: Arc<dyn ConfigStore> = Arc::new(store);
    session::start(&store, pool, &id).await.expect("session start")
}

/// Echo server: copies every received byte back until EOF.
async fn spawn_echo_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("echo bind");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

/// One-shot HTTP server: reads a request head, answers, closes.
async fn spawn_http_server(port: u16, response: &'static [u8]) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("http bind");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            });
        }
    });
}

/// WebSocket-ish server: answers 101 and then echoes the tunnel bytes.
async fn spawn_upgrade_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("ws bind");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let resp = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
                if stream.write_all(resp).await.is_err() {
                    return;
                }
                let mut frame = [0u8; 4096];
                loop {
                    match stream.read(&mut frame).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&frame[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn tcp_mapping_pipes_and_counts_bytes() {
    spawn_echo_server(20002).await;

    let mut m = mapping("t-tcp", 20001, MappingType::Tcp);
    m.remote_host = "127.0.0.1".to_string();
    m.remote_port = 20002;
    let session = start_session(m, test_pool()).await;

    let mut client = TcpStream::connect("127.0.0.1:20001").await.unwrap();
    client.write_all(b"ping\n").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping\n");
    drop(client);

    wait_until("counters to settle", || {
        let stats = session.stats();
        stats.bytes_up == 5 && stats.bytes_down == 5 && stats.active_conns == 0
    })
    .await;

    session.stop().await;
}

#[tokio::test]
async fn socks5_mapping_completes_handshake_and_pipes() {
    spawn_echo_server(20000).await;
    let session = start_session(mapping("t-socks", 21080, MappingType::Socks5), test_pool()).await;

    let mut client = TcpStream::connect("127.0.0.1:21080").await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x4E, 0x20])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    session.stop().await;
}

#[tokio::test]
async fn http_proxy_audits_plain_get() {
    let _serial = AUDIT_LOCK.lock().await;
    let auditor = fresh_auditor();
    spawn_http_server(
        23130,
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;
    let session = start_session(mapping("t-http", 23128, MappingType::Http), test_pool()).await;

    let mut client = TcpStream::connect("127.0.0.1:23128").await.unwrap();
    client
        .write_all(b"GET http://127.0.0.1:23130/hello HTTP/1.1\r\nHost: 127.0.0.1:23130\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello"));

    let query = LogQuery {
        local_port: Some(23128),
        ..Default::default()
    };
    wait_until("audit log to land", || {
        auditor.store().query(&query, 1, 10).1 >= 1
    })
    .await;

    let (items, _) = auditor.store().query(&query, 1, 10);
    let log = &items[0];
    assert_eq!(log.method, "GET");
    assert_eq!(log.status_code, 200);
    assert!(log.req_size > 0);
    assert!(log.resp_size >= 34);
    assert!(!log.is_gzipped);
    assert!(log.duration_ms >= 0);
    assert!(log.bastion_chain.is_empty());
    assert_eq!(log.mapping_id, "t-http");

    session.stop().await;
}

#[tokio::test]
async fn websocket_upgrade_tunnels_without_further_audit() {
    let _serial = AUDIT_LOCK.lock().await;
    let auditor = fresh_auditor();
    spawn_upgrade_server(23131).await;
    let session = start_session(mapping("t-ws", 23129, MappingType::Http), test_pool()).await;

    let mut client = TcpStream::connect("127.0.0.1:23129").await.unwrap();
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: 127.0.0.1:23131\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = client.read(&mut chunk).await.unwrap();
        assert!(n > 0, "upgrade response truncated");
        head.extend_from_slice(&chunk[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));

    // bytes flow both ways after the upgrade
    client.write_all(b"frame-one").await.unwrap();
    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"frame-one");

    let query = LogQuery {
        local_port: Some(23129),
        ..Default::default()
    };
    wait_until("handshake pair to land", || {
        auditor.store().query(&query, 1, 10).1 >= 1
    })
    .await;

    // more tunneled traffic must not add audit entries
    client.write_all(b"frame-two").await.unwrap();
    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (items, total) = auditor.store().query(&query, 1, 10);
    assert_eq!(total, 1);
    assert_eq!(items[0].status_code, 101);

    session.stop().await;
}

#[tokio::test]
async fn mixed_mapping_serves_socks5_and_http_in_parallel() {
    spawn_echo_server(25001).await;
    spawn_http_server(25002, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let session = start_session(mapping("t-mixed", 25000, MappingType::Mixed), test_pool()).await;

    let socks_task = async {
        let mut client = TcpStream::connect("127.0.0.1:25000").await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x61, 0xA9])
            .await
            .unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply[1], 0x00);
        client.write_all(b"abc").await.unwrap();
        let mut echoed = [0u8; 3];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"abc");
    };

    let http_task = async {
        let mut client = TcpStream::connect("127.0.0.1:25000").await.unwrap();
        client
            .write_all(b"GET http://127.0.0.1:25002/ HTTP/1.1\r\nHost: 127.0.0.1:25002\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));
    };

    tokio::join!(socks_task, http_task);
    session.stop().await;
}

#[tokio::test]
async fn deny_rule_closes_connection_at_accept() {
    spawn_echo_server(25101).await;

    let mut m = mapping("t-acl", 25100, MappingType::Tcp);
    m.remote_host = "127.0.0.1".to_string();
    m.remote_port = 25101;
    m.deny_cidrs = vec!["127.0.0.0/8".to_string()];
    let session = start_session(m, test_pool()).await;

    let mut client = TcpStream::connect("127.0.0.1:25100").await.unwrap();
    let mut buf = [0u8; 1];
    // the session drops us without reading; EOF must arrive promptly
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("denied connection should close quickly")
        .unwrap_or(0);
    assert_eq!(n, 0);

    assert_eq!(session.stats().bytes_up, 0);
    session.stop().await;
}

#[tokio::test]
async fn second_bind_reports_structured_conflict() {
    let pool = test_pool();

    let store = MemoryStore::new();
    let mut first = mapping("t-bind-a", 25200, MappingType::Socks5);
    first.chain = vec![];
    store.put_mapping(first);
    let mut second = mapping("t-bind-b", 25200, MappingType::Socks5);
    second.chain = vec![];
    store.put_mapping(second);
    let store: Arc<dyn ConfigStore> = Arc::new(store);

    let session = session::start(&store, Arc::clone(&pool), "t-bind-a")
        .await
        .expect("first bind");

    let err = session::start(&store, pool, "t-bind-b").await.unwrap_err();
    match err {
        CoreError::Conflict {
            message,
            diagnostics,
        } => {
            assert!(message.contains("25200"));
            let diagnostics = diagnostics.expect("bind diagnostics attached");
            assert_eq!(diagnostics.addr, "127.0.0.1:25200");
            assert!(diagnostics
                .conflicting_mappings
                .iter()
                .any(|c| c.mapping_id == "t-bind-a" && c.running));
        }
        other => panic!("expected Conflict, got {:?}", other),
    }

    session.stop().await;
}
