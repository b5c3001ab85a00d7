//! End-to-end exercise of the hook exchange: client-side transport over a
//! real Unix socket, descriptor passing, server dispatch, and lease store
//! effects.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nacd_core::config::ServerConfig;
use nacd_core::wire;
use nacd_daemon::server::LeaseServer;
use nacd_daemon::store::LeaseStore;
use tempfile::TempDir;
use tokio::sync::watch;

struct RunningServer {
    socket_path: PathBuf,
    store: Arc<LeaseStore>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    _tmp: TempDir,
}

async fn start_server() -> RunningServer {
    let tmp = TempDir::new().unwrap();
    let config = ServerConfig {
        socket_path: tmp.path().join("dhcp-script.sock"),
        max_connections: 4,
    };
    let store = Arc::new(LeaseStore::open_in_memory().unwrap());
    let server = LeaseServer::bind(&config, Arc::clone(&store)).unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server.run(shutdown_rx));
    RunningServer {
        socket_path: config.socket_path,
        store,
        shutdown,
        task,
        _tmp: tmp,
    }
}

impl RunningServer {
    async fn stop(self) {
        self.shutdown.send(true).ok();
        self.task.await.unwrap();
    }
}

/// One full client exchange, the way the hook binary performs it. Returns
/// the status byte and whatever the server wrote to the passed stdout.
fn client_exchange(path: &Path, argv: &[&str], env: &[(&str, &str)]) -> (u8, String) {
    let argv: Vec<Vec<u8>> = argv.iter().map(|a| a.as_bytes().to_vec()).collect();
    let env: Vec<(Vec<u8>, Vec<u8>)> = env
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();

    let mut stream = UnixStream::connect(path).unwrap();
    let stdin = File::open("/dev/null").unwrap();
    let mut stdout = tempfile::tempfile().unwrap();
    let stderr = tempfile::tempfile().unwrap();

    wire::send_invocation(
        &stream,
        &argv,
        &env,
        [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()],
    )
    .unwrap();
    let status = wire::recv_status(&mut stream).unwrap();

    // The server's descriptor shares this open file description, so its
    // writes are visible here after the status byte arrived.
    let mut captured = String::new();
    stdout.seek(SeekFrom::Start(0)).unwrap();
    stdout.read_to_string(&mut captured).unwrap();
    (status, captured)
}

async fn exchange(server: &RunningServer, argv: &[&str], env: &[(&str, &str)]) -> (u8, String) {
    let path = server.socket_path.clone();
    let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
    let env: Vec<(String, String)> = env
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    tokio::task::spawn_blocking(move || {
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let env: Vec<(&str, &str)> = env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        client_exchange(&path, &argv, &env)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_then_delete_leaves_no_lease() {
    let server = start_server().await;

    let (status, _) = exchange(
        &server,
        &[
            "nacd-dhcp-script",
            "add",
            "de:ad:be:ef:00:00",
            "192.168.1.13",
            "test",
        ],
        &[("DNSMASQ_TIME_REMAINING", "3600")],
    )
    .await;
    assert_eq!(status, wire::exit::OK);
    assert_eq!(server.store.len().unwrap(), 1);

    let (status, _) = exchange(
        &server,
        &["nacd-dhcp-script", "del", "de:ad:be:ef:00:00", "192.168.1.13"],
        &[],
    )
    .await;
    assert_eq!(status, wire::exit::OK);
    assert!(server.store.is_empty().unwrap());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_init_dumps_both_leases_regardless_of_order() {
    let server = start_server().await;

    for (mac, ip) in [
        ("de:ad:be:ef:00:01", "10.0.0.7"),
        ("de:ad:be:ef:00:02", "10.0.0.3"),
    ] {
        let (status, _) = exchange(
            &server,
            &["nacd-dhcp-script", "add", mac, ip, "host"],
            &[("DNSMASQ_LEASE_EXPIRES", "1700000000")],
        )
        .await;
        assert_eq!(status, wire::exit::OK);
    }

    let (status, dump) = exchange(&server, &["nacd-dhcp-script", "init"], &[]).await;
    assert_eq!(status, wire::exit::OK);
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(
        lines,
        vec![
            "1700000000 de:ad:be:ef:00:02 10.0.0.3 host *",
            "1700000000 de:ad:be:ef:00:01 10.0.0.7 host *",
        ]
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_renew_updates_in_place() {
    let server = start_server().await;

    exchange(
        &server,
        &[
            "nacd-dhcp-script",
            "add",
            "de:ad:be:ef:00:00",
            "10.0.0.7",
            "old-name",
        ],
        &[],
    )
    .await;
    let (status, _) = exchange(
        &server,
        &[
            "nacd-dhcp-script",
            "old",
            "de:ad:be:ef:00:00",
            "10.0.0.7",
            "new-name",
        ],
        &[("DNSMASQ_OLD_HOSTNAME", "old-name")],
    )
    .await;
    assert_eq!(status, wire::exit::OK);

    let records = server.store.snapshot().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].hostname.as_deref(), Some("new-name"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_command_reports_usage_error() {
    let server = start_server().await;

    let (status, _) = exchange(&server, &["nacd-dhcp-script", "tftp", "whatever"], &[]).await;
    assert_eq!(status, wire::exit::USAGE);
    assert!(server.store.is_empty().unwrap());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_garbage_connection_does_not_poison_the_server() {
    let server = start_server().await;

    // A connection that violates the protocol (no descriptors, no valid
    // envelope) gets a data-error status byte...
    let path = server.socket_path.clone();
    let status = tokio::task::spawn_blocking(move || {
        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"this is not an envelope").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        wire::recv_status(&mut stream).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(status, wire::exit::DATA_ERR);

    // ...and the next, well-formed exchange succeeds untouched.
    let (status, _) = exchange(
        &server,
        &[
            "nacd-dhcp-script",
            "add",
            "de:ad:be:ef:00:00",
            "192.168.1.13",
        ],
        &[],
    )
    .await;
    assert_eq!(status, wire::exit::OK);
    assert_eq!(server.store.len().unwrap(), 1);

    server.stop().await;
}
