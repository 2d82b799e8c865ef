//! Concurrent calls against a running server over TCP.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dcerpc_engine::config::{ClientConfig, SecurityConfig, ServerConfig};
use dcerpc_engine::core::syntax::{SyntaxId, Uuid};
use dcerpc_engine::protocol::{CallContext, Connection, ConnectionOptions, ContextRequest, DispatchTable, HandlerError};
use dcerpc_engine::security::{AuthLevel, EcdhProvider, MechanismProvider};
use dcerpc_engine::service::{RpcServer, ServerOptions};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

fn iface() -> SyntaxId {
    SyntaxId::new(Uuid::from_fields(0x1234_5778, 0x1234, 0xabcd, [0xef, 0, 1, 2, 3, 4, 5, 6]), 1, 0)
}

fn table() -> DispatchTable {
    let mut table = DispatchTable::new(iface(), "jobs");
    table
        .register(0, "square", |n: u64, _ctx: CallContext| async move {
            Ok::<_, HandlerError>(n.wrapping_mul(n))
        })
        .register(1, "delay_echo", |(ms, data): (u32, Vec<u8>), _ctx: CallContext| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
            Ok::<_, HandlerError>(data)
        });
    table
}

async fn start(
    providers: Vec<Arc<dyn MechanismProvider>>,
) -> (String, mpsc::Sender<()>, tokio::task::JoinHandle<()>) {
    let config = ServerConfig {
        binding: "ncacn_ip_tcp:127.0.0.1[0]".into(),
        ..ServerConfig::default()
    };
    let mut options = ServerOptions::new(config);
    options.providers = providers;
    let server = RpcServer::bind(options).await.expect("bind server");
    server.register(table()).unwrap();
    let binding = server.local_binding().to_string();

    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        server.serve_with_shutdown(rx).await.expect("server run");
    });
    (binding, tx, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_on_one_connection() {
    let (binding, shutdown, handle) = start(Vec::new()).await;
    let conn = Connection::open(
        &binding.parse().unwrap(),
        &[ContextRequest::ndr20(iface())],
        ConnectionOptions::default(),
    )
    .await
    .expect("connect");

    let mut tasks = JoinSet::new();
    for i in 0..200u64 {
        let conn = conn.clone();
        tasks.spawn(async move {
            let sq: u64 = conn.call(0, 0, &i).await.unwrap();
            assert_eq!(sq, i * i);
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    conn.close().await.unwrap();
    shutdown.send(()).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sealed_calls_with_fragments() {
    let provider: Arc<dyn MechanismProvider> = Arc::new(EcdhProvider::new());
    let (binding, shutdown, handle) = start(vec![Arc::clone(&provider)]).await;

    let options = ConnectionOptions::new(
        ClientConfig {
            max_xmit_frag: 1432,
            ..ClientConfig::default()
        },
        SecurityConfig {
            level: AuthLevel::Privacy,
            mechanisms: vec!["ecdh".into()],
            ..SecurityConfig::default()
        },
    )
    .with_provider(provider);
    let conn = Connection::open(&binding.parse().unwrap(), &[ContextRequest::ndr20(iface())], options)
        .await
        .expect("connect");

    let mut tasks = JoinSet::new();
    for i in 0..24u32 {
        let conn = conn.clone();
        tasks.spawn(async move {
            let data = vec![i as u8; 3000 + i as usize * 97];
            let ms = (24 - i) * 3;
            let echoed: Vec<u8> = conn.call(0, 1, &(ms, data.clone())).await.unwrap();
            assert_eq!(echoed, data);
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    assert!(conn.is_active());

    drop(conn);
    shutdown.send(()).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn connections_share_assigned_group() {
    let (binding, shutdown, handle) = start(Vec::new()).await;
    let binding = binding.parse().unwrap();
    let first = Connection::open(&binding, &[ContextRequest::ndr20(iface())], ConnectionOptions::default())
        .await
        .unwrap();

    let mut options = ConnectionOptions::default();
    options.config.assoc_group_id = first.assoc_group_id();
    let second = Connection::open(&binding, &[ContextRequest::ndr20(iface())], options)
        .await
        .unwrap();
    assert_eq!(first.assoc_group_id(), second.assoc_group_id());

    shutdown.send(()).await.unwrap();
    handle.await.unwrap();
}
