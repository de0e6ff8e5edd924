//! End-to-end tests over a real loopback socket.
//!
//! These drive the control protocol exactly as a client would: connect,
//! send one line, read the reply, observe the connection close.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use egd_core::persist::Persister;
use egd_core::pool::Pool;
use egd_daemon::control::ControlServer;

struct Harness {
    pool: Arc<Mutex<Pool>>,
    persister: Arc<Persister>,
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    start_against(dir, Pool::new(10 * 1024 * 1024, 64 * 1024)).await
}

async fn start_against(dir: tempfile::TempDir, pool: Pool) -> Harness {
    let pool = Arc::new(Mutex::new(pool));
    let persister = Arc::new(Persister::new(dir.path().join("pool.egd")));
    let cancel = CancellationToken::new();
    let server = ControlServer::bind(0, Arc::clone(&pool), Arc::clone(&persister), cancel.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());
    Harness {
        pool,
        persister,
        addr,
        cancel,
        server: handle,
        _dir: dir,
    }
}

/// Send one command; return the header line and any raw payload after it.
async fn send(addr: std::net::SocketAddr, command: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    let split = reply
        .iter()
        .position(|&b| b == b'\n')
        .expect("reply has a header line");
    let header = String::from_utf8(reply[..split].to_vec()).unwrap();
    (header, reply[split + 1..].to_vec())
}

#[tokio::test]
async fn cold_start_reports_empty_pool() {
    let h = start().await;
    let (header, body) = send(h.addr, "status").await;
    assert_eq!(
        header,
        "OK total_bytes=0 total_bits=0 max_bytes=10485760 chunks=0"
    );
    assert!(body.is_empty());
    h.cancel.cancel();
    h.server.await.unwrap();
}

#[tokio::test]
async fn withdrawal_under_starvation_returns_zero_bytes() {
    let h = start().await;
    let (header, body) = send(h.addr, "getentropy 32").await;
    assert_eq!(header, "OK bytes=0 bits=0");
    assert!(body.is_empty());
    h.cancel.cancel();
    h.server.await.unwrap();
}

#[tokio::test]
async fn append_then_withdraw_accounting() {
    let h = start().await;
    h.pool.lock().unwrap().append(&[0x42u8; 1000], 800);

    let (header, body) = send(h.addr, "getentropy 500").await;
    assert_eq!(header, "OK bytes=500 bits=400");
    assert_eq!(body.len(), 500);
    assert!(body.iter().all(|&b| b == 0x42));

    let (status, _) = send(h.addr, "status").await;
    assert_eq!(
        status,
        "OK total_bytes=500 total_bits=400 max_bytes=10485760 chunks=1"
    );
    h.cancel.cancel();
    h.server.await.unwrap();
}

#[tokio::test]
async fn oversized_request_is_clamped_with_note() {
    let h = start().await;
    let (header, body) = send(h.addr, "getentropy 999999999").await;
    assert_eq!(header, "OK bytes=0 bits=0 clamped=16777216");
    assert!(body.is_empty());
    h.cancel.cancel();
    h.server.await.unwrap();
}

#[tokio::test]
async fn malformed_commands_get_err_replies() {
    let h = start().await;
    for bad in ["getentropy", "getentropy -3", "getentropy 0", "nonsense"] {
        let (header, _) = send(h.addr, bad).await;
        assert!(header.starts_with("ERR "), "{bad:?} → {header}");
    }
    h.cancel.cancel();
    h.server.await.unwrap();
}

#[tokio::test]
async fn persist_then_restart_restores_identical_totals() {
    let h = start().await;
    {
        let mut pool = h.pool.lock().unwrap();
        pool.append(&[1u8; 700], 5000);
        pool.append(&[2u8; 300], 100);
    }
    let (status_before, _) = send(h.addr, "status").await;

    let (header, _) = send(h.addr, "persist").await;
    assert!(header.starts_with("OK persisted="), "{header}");

    // "Kill" the first daemon and bring up a second one over the same
    // snapshot file.
    h.cancel.cancel();
    h.server.await.unwrap();

    let blob = h.persister.load(1 << 24).unwrap().expect("snapshot on disk");
    let mut restored = Pool::new(10 * 1024 * 1024, 64 * 1024);
    restored.load(&blob).unwrap();
    let h2 = start_against(h._dir, restored).await;

    let (status_after, _) = send(h2.addr, "status").await;
    assert_eq!(status_before, status_after);
    h2.cancel.cancel();
    h2.server.await.unwrap();
}

#[tokio::test]
async fn stop_command_shuts_the_server_down() {
    let h = start().await;
    let (header, _) = send(h.addr, "stop").await;
    assert_eq!(header, "OK stopping");
    // The accept loop must exit on its own now.
    h.server.await.unwrap();
    match TcpStream::connect(h.addr).await {
        Err(_) => {}
        Ok(mut s) => {
            // Some platforms let a connect land while the socket drains;
            // nothing may answer on it either way.
            s.write_all(b"status\n").await.ok();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.ok();
            assert!(buf.is_empty(), "server answered after stop");
        }
    }
}

#[tokio::test]
async fn one_command_per_connection() {
    let h = start().await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(b"status\nstatus\n").await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    // Exactly one reply line, then EOF.
    assert_eq!(reply.iter().filter(|&&b| b == b'\n').count(), 1);
    h.cancel.cancel();
    h.server.await.unwrap();
}
