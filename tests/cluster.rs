//! End-to-end tests over a real TCP fleet.
//!
//! Each test spins up in-process storage servers on ephemeral ports, builds
//! a partition pointing at them and drives the POSIX-like client surface
//! through full write/read/namespace cycles, including a server loss with
//! replication enabled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stripefs::api::{SeekWhence, StripeFs};
use stripefs::config::{
    PartitionConfig, ReplicaWritePolicy, ServerConfig, WorkerMode,
};
use stripefs::constants::control;
use stripefs::rpc::control_request;
use stripefs::server::{DiskBackend, Server};

struct TestServer {
    root: tempfile::TempDir,
    control_port: u16,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            control_port: 0,
            data_port: 0,
            storage_root: PathBuf::from(root.path()),
            worker_mode: WorkerMode::default(),
            nested_partition: None,
            log_level: "info".to_string(),
        };
        let backend = Arc::new(DiskBackend::new(root.path()));
        let server = Server::bind(&config, backend).await.unwrap();
        let control_port = server.control_port();
        let handle = tokio::spawn(server.run());
        Self {
            root,
            control_port,
            handle,
        }
    }

    fn url(&self) -> String {
        format!("tcp://127.0.0.1:{}/", self.control_port)
    }

    /// Stop the server and wait for its run loop to exit.
    async fn stop(self) -> tempfile::TempDir {
        let addr = format!("127.0.0.1:{}", self.control_port);
        let ack = control_request(&addr, control::FINISH_AWAIT).await.unwrap();
        assert_eq!(ack, control::FINISH_AWAIT);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        self.root
    }
}

async fn spawn_fleet(count: usize) -> Vec<TestServer> {
    let mut fleet = Vec::with_capacity(count);
    for _ in 0..count {
        fleet.push(TestServer::spawn().await);
    }
    fleet
}

fn partition(fleet: &[TestServer], block_size: usize, replication_level: usize) -> PartitionConfig {
    PartitionConfig {
        name: "cluster-test".to_string(),
        servers: fleet.iter().map(TestServer::url).collect(),
        block_size,
        replication_level,
        session_file: false,
        session_dir: false,
        connectionless: false,
        replica_write_policy: ReplicaWritePolicy::Abort,
        controller: None,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

#[tokio::test]
async fn test_megabyte_stripes_across_three_servers() {
    let fleet = spawn_fleet(3).await;
    let fs = StripeFs::new(partition(&fleet, 1024, 0)).unwrap();

    let data = pattern(1024 * 1024);
    let fd = fs.create("/big.dat", 0o644).await.unwrap();
    assert_eq!(fs.write(fd, &data).await.unwrap(), data.len());

    fs.lseek(fd, 0, SeekWhence::Set).await.unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(fs.read(fd, &mut back).await.unwrap(), data.len());
    assert_eq!(back, data);
    fs.close(fd).await.unwrap();

    // 1024 blocks over 3 servers: every root holds a share.
    for server in &fleet {
        let len = std::fs::metadata(server.root.path().join("big.dat"))
            .unwrap()
            .len();
        assert!(len > 0, "server {} holds no fragment", server.url());
    }
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replicated_file_survives_one_server_loss() {
    let mut fleet = spawn_fleet(3).await;
    let fs = StripeFs::new(partition(&fleet, 1024, 1)).unwrap();

    let data = pattern(8 * 1024 + 300);
    let fd = fs.create("/survivor", 0o644).await.unwrap();
    fs.write(fd, &data).await.unwrap();
    fs.close(fd).await.unwrap();

    // Kill the last server; every block still has a live copy. The file's
    // metadata lives on its master server, which may be any of the three,
    // so reopen before stopping anything.
    let fd = fs.open("/survivor", 0, 0).await.unwrap();
    let _root = fleet.pop().unwrap().stop().await;

    let mut back = vec![0u8; data.len()];
    assert_eq!(fs.pread(fd, 0, &mut back).await.unwrap(), data.len());
    assert_eq!(back, data);
    fs.close(fd).await.unwrap();
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_namespace_operations_over_tcp() {
    let fleet = spawn_fleet(2).await;
    let fs = StripeFs::new(partition(&fleet, 2048, 0)).unwrap();

    fs.mkdir("/proj", 0o755).await.unwrap();
    for name in ["a.dat", "b.dat", "c.dat"] {
        let fd = fs.create(&format!("/proj/{name}"), 0o644).await.unwrap();
        fs.write(fd, b"payload").await.unwrap();
        fs.close(fd).await.unwrap();
    }

    // Listing is stable across repeated scans.
    for _ in 0..2 {
        let dir = fs.opendir("/proj").await.unwrap();
        let mut names = Vec::new();
        while let Some(name) = fs.readdir(dir).await.unwrap() {
            names.push(name);
        }
        fs.closedir(dir).await.unwrap();
        assert_eq!(names, ["a.dat", "b.dat", "c.dat"]);
    }

    fs.rename("/proj/a.dat", "/proj/renamed.dat").await.unwrap();
    assert_eq!(fs.getattr("/proj/a.dat").await.unwrap_err().errno(), 2);
    assert_eq!(
        fs.getattr("/proj/renamed.dat").await.unwrap().size.get(),
        7
    );

    for name in ["renamed.dat", "b.dat", "c.dat"] {
        fs.unlink(&format!("/proj/{name}")).await.unwrap();
    }
    fs.rmdir("/proj").await.unwrap();
    assert_eq!(fs.getattr("/proj").await.unwrap_err().errno(), 2);
    fs.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_descriptors_match_stateless_results() {
    let fleet = spawn_fleet(2).await;

    let mut stateless_cfg = partition(&fleet, 512, 0);
    stateless_cfg.name = "stateless".to_string();
    let mut session_cfg = partition(&fleet, 512, 0);
    session_cfg.name = "session".to_string();
    session_cfg.session_file = true;
    session_cfg.session_dir = true;

    let stateless = StripeFs::new(stateless_cfg).unwrap();
    let session = StripeFs::new(session_cfg).unwrap();

    let data = pattern(3 * 512 + 77);
    let fd = session.create("/shared", 0o644).await.unwrap();
    session.write(fd, &data).await.unwrap();
    session.close(fd).await.unwrap();

    // The other client sees the same bytes through path-based access.
    let fd = stateless.open("/shared", 0, 0).await.unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(stateless.read(fd, &mut back).await.unwrap(), data.len());
    assert_eq!(back, data);
    stateless.close(fd).await.unwrap();

    session.shutdown().await.unwrap();
    stateless.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_clients_interleave_on_one_fleet() {
    let fleet = spawn_fleet(3).await;
    let writer = StripeFs::new(partition(&fleet, 1024, 0)).unwrap();
    let reader = StripeFs::new(partition(&fleet, 1024, 0)).unwrap();

    let data = pattern(6000);
    let fd = writer.create("/handoff", 0o644).await.unwrap();
    writer.write(fd, &data).await.unwrap();
    writer.close(fd).await.unwrap();

    // Size comes from the metadata record, so a fresh client sees the
    // logical length and not any single fragment's.
    let attr = reader.getattr("/handoff").await.unwrap();
    assert_eq!(attr.size.get(), 6000);

    let fd = reader.open("/handoff", 0, 0).await.unwrap();
    assert_eq!(reader.lseek(fd, 0, SeekWhence::End).await.unwrap(), 6000);
    let mut tail = vec![0u8; 500];
    assert_eq!(reader.pread(fd, 5500, &mut tail).await.unwrap(), 500);
    assert_eq!(&tail[..], &data[5500..]);
    reader.close(fd).await.unwrap();

    writer.shutdown().await.unwrap();
    reader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_completes_inflight_transfers() {
    // The server runs on its own runtime so that run() returning tears the
    // runtime down; a transfer still in flight at that point would be cut
    // off mid-stream instead of draining cleanly.
    let root = tempfile::tempdir().unwrap();
    let storage = PathBuf::from(root.path());
    let (port_tx, port_rx) = std::sync::mpsc::channel();
    let server_thread = std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let config = ServerConfig {
                bind_host: "127.0.0.1".to_string(),
                control_port: 0,
                data_port: 0,
                storage_root: storage,
                worker_mode: WorkerMode::default(),
                nested_partition: None,
                log_level: "info".to_string(),
            };
            let backend = Arc::new(DiskBackend::new(&config.storage_root));
            let server = Server::bind(&config, backend).await.unwrap();
            port_tx.send(server.control_port()).unwrap();
            server.run().await.unwrap();
        });
    });
    let control_port = port_rx.recv().unwrap();

    let config = PartitionConfig {
        name: "inflight".to_string(),
        servers: vec![format!("tcp://127.0.0.1:{control_port}/")],
        block_size: 64 * 1024 * 1024,
        replication_level: 0,
        session_file: false,
        session_dir: false,
        connectionless: false,
        replica_write_policy: ReplicaWritePolicy::Abort,
        controller: None,
    };
    let fs = Arc::new(StripeFs::new(config).unwrap());

    let data = pattern(32 * 1024 * 1024);
    let fd = fs.create("/large", 0o644).await.unwrap();
    assert_eq!(fs.write(fd, &data).await.unwrap(), data.len());

    // Start a whole-file read, then order a shutdown while its chunk
    // stream is still going out.
    let reader = {
        let fs = Arc::clone(&fs);
        let len = data.len();
        tokio::spawn(async move {
            let mut buf = vec![0u8; len];
            let n = fs.pread(fd, 0, &mut buf).await.unwrap();
            (n, buf)
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let addr = format!("127.0.0.1:{control_port}");
    let ack = control_request(&addr, control::FINISH_AWAIT).await.unwrap();
    assert_eq!(ack, control::FINISH_AWAIT);

    let (n, buf) = reader.await.unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    server_thread.join().unwrap();
}

#[tokio::test]
async fn test_statistics_count_served_operations() {
    let fleet = spawn_fleet(1).await;
    let fs = StripeFs::new(partition(&fleet, 1024, 0)).unwrap();

    let fd = fs.create("/counted", 0o644).await.unwrap();
    fs.write(fd, b"1234").await.unwrap();
    fs.close(fd).await.unwrap();
    fs.shutdown().await.unwrap();

    let addr = format!("127.0.0.1:{}", fleet[0].control_port);
    let snapshot = stripefs::rpc::control_stats(&addr, false).await.unwrap();
    assert!(snapshot.total() > 0);
}
