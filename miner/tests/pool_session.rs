//! End-to-end session tests against an in-process pool.

use ember_miner::config::{Dialect, Endpoint, Security, SessionOptions};
use ember_miner::stratum::difficulty::diff_to_target;
use ember_miner::stratum::{ClientEvent, PoolClient};
use ember_miner::work::{Solution, WorkPackage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct FakePool {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl FakePool {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.expect("accept");
        let (read_half, write_half) = socket.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("pool read timed out")
            .expect("pool read failed");
        assert!(n > 0, "client closed the connection");
        serde_json::from_str(line.trim()).expect("client sent invalid JSON")
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn endpoint(port: u16, dialect: Dialect) -> Endpoint {
    Endpoint {
        host: "127.0.0.1".into(),
        port,
        user: "0xwallet.rig0".into(),
        pass: "x".into(),
        email: None,
        security: Security::None,
        dialect,
    }
}

fn short_timeouts() -> SessionOptions {
    SessionOptions {
        work_timeout: Duration::from_secs(10),
        response_timeout: Duration::from_millis(300),
        hashrate_debounce: Duration::from_millis(50),
        report_hashrate: true,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no client event in time")
        .expect("event channel closed")
}

const ZERO_SEED: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

#[tokio::test]
async fn stratum_handshake_work_and_submit() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client = Arc::new(PoolClient::new(
        endpoint(port, Dialect::Stratum),
        short_timeouts(),
        events_tx,
    ));

    let accept = FakePool::accept(&listener);
    let (connect, mut pool) = tokio::join!(client.connect(), accept);
    connect.expect("connect");

    // id=1 subscribe.
    let subscribe = pool.recv().await;
    assert_eq!(subscribe["id"], 1);
    assert_eq!(subscribe["method"], "mining.subscribe");
    pool.send(r#"{"id":1,"result":true,"error":null}"#).await;

    // id=3 authorize follows.
    let authorize = pool.recv().await;
    assert_eq!(authorize["id"], 3);
    assert_eq!(authorize["method"], "mining.authorize");
    assert_eq!(authorize["params"][0], "0xwallet.rig0");
    assert_eq!(authorize["params"][1], "x");
    pool.send(r#"{"id":3,"result":true,"error":null}"#).await;

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    // Noise on the wire is discarded without killing the session.
    pool.send("garbage that is not a frame").await;

    // Work notification with a shortened target.
    let header = format!("0x{}", "ab".repeat(32));
    pool.send(&format!(
        r#"{{"id":null,"method":"mining.notify","params":["job9","{}","{}","0x1234",77]}}"#,
        header, ZERO_SEED
    ))
    .await;

    let work = match next_event(&mut events).await {
        ClientEvent::WorkReceived(work) => work,
        other => panic!("expected work, got {:?}", other),
    };
    assert_eq!(work.job_id, "job9");
    assert_eq!(work.height, 77);
    assert_eq!(work.epoch, 0);
    assert_eq!(work.boundary[30], 0x12);
    assert_eq!(work.boundary[31], 0x34);

    // Submit a solution and observe the exact payload.
    client.submit(Solution {
        nonce: 0xDEAD_BEEF_0000_0001,
        mix_hash: [0x5Au8; 32],
        work: work.clone(),
        stale: false,
    });
    let submit = pool.recv().await;
    assert_eq!(submit["id"], 4);
    assert_eq!(submit["method"], "mining.submit");
    assert_eq!(submit["params"][0], "0xwallet.rig0");
    assert_eq!(submit["params"][1], "job9");
    assert_eq!(submit["params"][2], "0xdeadbeef00000001");
    assert_eq!(submit["params"][3], format!("0x{}", "ab".repeat(32)));
    assert_eq!(submit["params"][4], format!("0x{}", "5a".repeat(32)));

    pool.send(r#"{"id":4,"result":true,"error":null}"#).await;
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::SolutionAccepted { stale: false }
    ));

    client.disconnect();
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Disconnected
    ));
}

#[tokio::test]
async fn ethereum_stratum_full_chain() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client = Arc::new(PoolClient::new(
        endpoint(port, Dialect::EthereumStratum),
        short_timeouts(),
        events_tx,
    ));

    let accept = FakePool::accept(&listener);
    let (connect, mut pool) = tokio::join!(client.connect(), accept);
    connect.expect("connect");

    let subscribe = pool.recv().await;
    assert_eq!(subscribe["id"], 1);
    assert_eq!(subscribe["params"][1], "EthereumStratum/1.0.0");
    pool.send(
        r#"{"id":1,"result":[["mining.notify","s","EthereumStratum/1.0.0"],"08c0"],"error":null}"#,
    )
    .await;

    // id=2 then id=3, in order.
    let extranonce = pool.recv().await;
    assert_eq!(extranonce["id"], 2);
    assert_eq!(extranonce["method"], "mining.extranonce.subscribe");
    let authorize = pool.recv().await;
    assert_eq!(authorize["id"], 3);
    pool.send(r#"{"id":3,"result":true,"error":null}"#).await;
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    // Difficulty then a notify; the boundary must derive from it and
    // the nonce range from the subscription extranonce.
    pool.send(r#"{"id":null,"method":"mining.set_difficulty","params":[1.0]}"#)
        .await;
    let header = format!("0x{}", "cd".repeat(32));
    pool.send(&format!(
        r#"{{"id":null,"method":"mining.notify","params":["j1","{}","{}",30042]}}"#,
        ZERO_SEED, header
    ))
    .await;

    let work = match next_event(&mut events).await {
        ClientEvent::WorkReceived(work) => work,
        other => panic!("expected work, got {:?}", other),
    };
    assert_eq!(work.start_nonce, 0x08c0_0000_0000_0000);
    assert_eq!(work.extra_size_bits, 16);
    assert_eq!(work.boundary, diff_to_target(1.0));
    assert_eq!(work.job_len, 2);
    assert_eq!(work.height, 30042);

    // Submit: the nonce must lose its extranonce prefix and the job id
    // its padding.
    client.submit(Solution {
        nonce: 0x08c0_1122_3344_5566,
        mix_hash: [0u8; 32],
        work: work.clone(),
        stale: false,
    });
    let submit = pool.recv().await;
    assert_eq!(submit["params"][1], "j1");
    assert_eq!(submit["params"][2], "112233445566");

    // A new job lands while the submission is outstanding: the pending
    // share is answered as stale.
    let header2 = format!("0x{}", "ef".repeat(32));
    pool.send(&format!(
        r#"{{"id":null,"method":"mining.notify","params":["j2","{}","{}",30043]}}"#,
        ZERO_SEED, header2
    ))
    .await;
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::WorkReceived(_)
    ));
    pool.send(r#"{"id":4,"result":false,"error":[23,"stale",null]}"#)
        .await;
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::SolutionRejected { stale: true }
    ));

    client.disconnect();
}

#[tokio::test]
async fn ethproxy_login_and_getwork() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut ep = endpoint(port, Dialect::EthProxy);
    ep.email = Some("ops@example.com".into());
    let client = Arc::new(PoolClient::new(ep, short_timeouts(), events_tx));

    let accept = FakePool::accept(&listener);
    let (connect, mut pool) = tokio::join!(client.connect(), accept);
    connect.expect("connect");

    // Login splits the account from the worker at the first dot.
    let login = pool.recv().await;
    assert_eq!(login["id"], 1);
    assert_eq!(login["method"], "eth_submitLogin");
    assert_eq!(login["worker"], "rig0");
    assert_eq!(login["params"][0], "0xwallet");
    assert_eq!(login["params"][1], "ops@example.com");
    pool.send(r#"{"id":1,"result":true,"error":null}"#).await;
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    // The id=5 kickstart follows; answer it with work.
    let get_work = pool.recv().await;
    assert_eq!(get_work["id"], 5);
    assert_eq!(get_work["method"], "eth_getWork");
    let header = format!("0x{}", "99".repeat(32));
    pool.send(&format!(
        r#"{{"id":5,"result":["{}","{}","0x00ff","0x2a"],"error":null}}"#,
        header, ZERO_SEED
    ))
    .await;

    let work = match next_event(&mut events).await {
        ClientEvent::WorkReceived(work) => work,
        other => panic!("expected work, got {:?}", other),
    };
    assert_eq!(work.height, 42);
    assert_eq!(work.extra_size_bits, -1);

    // Submission carries the worker name at the top level.
    client.submit(Solution {
        nonce: 1,
        mix_hash: [0u8; 32],
        work,
        stale: false,
    });
    let submit = pool.recv().await;
    assert_eq!(submit["method"], "eth_submitWork");
    assert_eq!(submit["worker"], "rig0");

    client.disconnect();
}

#[tokio::test]
async fn silent_pool_trips_the_response_timer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let client = Arc::new(PoolClient::new(
        endpoint(port, Dialect::Stratum),
        short_timeouts(),
        events_tx,
    ));

    let accept = FakePool::accept(&listener);
    let (connect, mut pool) = tokio::join!(client.connect(), accept);
    connect.expect("connect");

    let _ = pool.recv().await;
    pool.send(r#"{"id":1,"result":true,"error":null}"#).await;
    let _ = pool.recv().await;
    pool.send(r#"{"id":3,"result":true,"error":null}"#).await;
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected));

    let mut work = WorkPackage::default();
    work.header = [1u8; 32];
    work.job_id = "j".into();
    work.job_len = 1;
    client.submit(Solution {
        nonce: 7,
        mix_hash: [0u8; 32],
        work,
        stale: false,
    });
    let _ = pool.recv().await;

    // Never answer: the 300 ms response timer must disconnect us.
    let started = std::time::Instant::now();
    loop {
        match next_event(&mut events).await {
            ClientEvent::Disconnected => break,
            _ => continue,
        }
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn client_answers_get_version() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let client = Arc::new(PoolClient::new(
        endpoint(port, Dialect::Stratum),
        short_timeouts(),
        events_tx,
    ));

    let accept = FakePool::accept(&listener);
    let (connect, mut pool) = tokio::join!(client.connect(), accept);
    connect.expect("connect");

    let _ = pool.recv().await; // subscribe
    pool.send(r#"{"id":9,"method":"client.get_version","params":[]}"#)
        .await;
    // Skip the authorize the client sends only after the subscribe
    // response; the version reply arrives independently.
    let reply = pool.recv().await;
    assert_eq!(reply["id"], 9);
    assert!(reply["error"].is_null());
    assert!(reply["result"].as_str().unwrap().starts_with("ember-miner/"));

    client.disconnect();
}
