//! Server dispatch core
//!
//! Two listeners per server: the well-known control port answers short
//! administrative exchanges (session handshake, ping, stats, shutdown), the
//! data port carries envelope traffic. Each data connection is served by
//! one task running the READING_OP / EXECUTING / REPLIED loop; operations
//! from one connection execute in issue order because the exchange owns the
//! stream until the reply is out. Cross-connection concurrency is bounded
//! by the configured worker discipline.
//!
//! Shutdown is cooperative: FINALIZE on a data connection or FINISH on the
//! control port raises the shutdown flag and wakes the accept loops; no
//! in-flight operation is preempted.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::config::{ServerConfig, WorkerMode};
use crate::constants::control;
use crate::proto::OpCode;
use crate::rpc::stream::{read_full, recv_envelope, write_full};
use crate::rpc::RpcError;

pub mod backend;
mod handlers;
pub mod nested;
mod stats;

pub use backend::{DirRef, DiskBackend, FileRef, FsBackend};
pub use nested::NestedBackend;
pub use stats::ServerStats;

/// Cooperative shutdown latch shared by every loop in one server.
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve when shutdown has been triggered, whether before or after
    /// this call.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// One storage server: bound listeners plus shared dispatch state.
pub struct Server {
    backend: Arc<dyn FsBackend>,
    stats: Arc<ServerStats>,
    shutdown: Arc<Shutdown>,
    limiter: Option<Arc<Semaphore>>,
    control: TcpListener,
    data: TcpListener,
    control_port: u16,
    data_port: u16,
}

impl Server {
    /// Bind both listeners. A zero port in the config asks the OS for an
    /// ephemeral one; the chosen data port is what the ACCEPT handshake
    /// reports to clients.
    pub async fn bind(config: &ServerConfig, backend: Arc<dyn FsBackend>) -> io::Result<Self> {
        let control =
            TcpListener::bind((config.bind_host.as_str(), config.control_port)).await?;
        let data = TcpListener::bind((config.bind_host.as_str(), config.data_port)).await?;
        let control_port = control.local_addr()?.port();
        let data_port = data.local_addr()?.port();

        let limiter = match config.worker_mode {
            WorkerMode::Pool { workers } => Some(Arc::new(Semaphore::new(workers))),
            WorkerMode::Sequential => Some(Arc::new(Semaphore::new(1))),
            WorkerMode::OnDemand => None,
        };

        Ok(Self {
            backend,
            stats: Arc::new(ServerStats::new()),
            shutdown: Shutdown::new(),
            limiter,
            control,
            data,
            control_port,
            data_port,
        })
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Serve until shutdown is triggered.
    pub async fn run(self) -> io::Result<()> {
        let Self {
            backend,
            stats,
            shutdown,
            limiter,
            control,
            data,
            control_port,
            data_port,
        } = self;
        tracing::info!(
            "serving: control port {}, data port {}",
            control_port,
            data_port
        );

        let accept_task = tokio::spawn(accept_data(
            data,
            Arc::clone(&backend),
            Arc::clone(&stats),
            limiter,
            Arc::clone(&shutdown),
        ));

        loop {
            tokio::select! {
                accepted = control.accept() => {
                    let (stream, peer) = accepted?;
                    let stats = Arc::clone(&stats);
                    let shutdown = Arc::clone(&shutdown);
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_control(stream, data_port, &stats, &shutdown).await
                        {
                            tracing::debug!("control exchange with {} failed: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.wait() => break,
            }
        }

        let _ = accept_task.await;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

async fn accept_data(
    listener: TcpListener,
    backend: Arc<dyn FsBackend>,
    stats: Arc<ServerStats>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: Arc<Shutdown>,
) {
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("data accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.wait() => break,
        };
        tracing::debug!("data connection from {}", peer);
        let backend = Arc::clone(&backend);
        let stats = Arc::clone(&stats);
        let limiter = limiter.clone();
        let shutdown = Arc::clone(&shutdown);
        connections.spawn(async move {
            serve_peer(stream, backend, stats, limiter, shutdown).await;
            tracing::debug!("data connection from {} closed", peer);
        });
    }
    // In-flight exchanges finish before the server reports done; each peer
    // loop exits at its next envelope boundary once shutdown is triggered.
    while connections.join_next().await.is_some() {}
}

/// Per-connection dispatch loop.
async fn serve_peer(
    mut stream: TcpStream,
    backend: Arc<dyn FsBackend>,
    stats: Arc<ServerStats>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: Arc<Shutdown>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }
    loop {
        let envelope = tokio::select! {
            received = recv_envelope(&mut stream) => match received {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!("peer loop ended: {}", e);
                    break;
                }
            },
            _ = shutdown.wait() => break,
        };

        stats.record(envelope.op);
        match envelope.op {
            OpCode::Disconnect => break,
            OpCode::Finalize => {
                shutdown.trigger();
                break;
            }
            _ => {
                let _permit = match &limiter {
                    Some(semaphore) => semaphore.acquire().await.ok(),
                    None => None,
                };
                if let Err(e) =
                    handlers::dispatch(&envelope, &mut stream, backend.as_ref()).await
                {
                    tracing::warn!("operation {:?} failed the connection: {}", envelope.op, e);
                    break;
                }
            }
        }
    }
}

/// One control-port exchange: a 4-byte code, a short fixed reply.
async fn handle_control(
    mut stream: TcpStream,
    data_port: u16,
    stats: &ServerStats,
    shutdown: &Shutdown,
) -> Result<(), RpcError> {
    use zerocopy::IntoBytes;

    let mut buf = [0u8; 4];
    read_full(&mut stream, &mut buf).await?;
    let code = u32::from_le_bytes(buf);
    match code {
        control::ACCEPT | control::CONNECTIONLESS_PORT => {
            write_full(&mut stream, &(data_port as u32).to_le_bytes()).await?;
        }
        control::PING => {
            write_full(&mut stream, &control::PING.to_le_bytes()).await?;
        }
        control::STATS => {
            write_full(&mut stream, stats.snapshot_total().as_bytes()).await?;
        }
        control::STATS_WINDOW => {
            write_full(&mut stream, stats.snapshot_window().as_bytes()).await?;
        }
        control::FINISH => {
            shutdown.trigger();
        }
        control::FINISH_AWAIT => {
            shutdown.trigger();
            write_full(&mut stream, &control::FINISH_AWAIT.to_le_bytes()).await?;
        }
        other => {
            tracing::warn!("unknown control code {}", other);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{control_request, control_stats};
    use std::path::PathBuf;

    fn test_config() -> (tempfile::TempDir, ServerConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            control_port: 0,
            data_port: 0,
            storage_root: PathBuf::from(dir.path()),
            worker_mode: WorkerMode::default(),
            nested_partition: None,
            log_level: "info".to_string(),
        };
        (dir, config)
    }

    async fn spawn_server() -> (tempfile::TempDir, u16, tokio::task::JoinHandle<io::Result<()>>)
    {
        let (dir, config) = test_config();
        let backend = Arc::new(DiskBackend::new(&config.storage_root));
        let server = Server::bind(&config, backend).await.unwrap();
        let control_port = server.control_port();
        let handle = tokio::spawn(server.run());
        (dir, control_port, handle)
    }

    #[tokio::test]
    async fn test_control_ping_echoes() {
        let (_dir, port, _handle) = spawn_server().await;
        let addr = format!("127.0.0.1:{port}");
        let echoed = control_request(&addr, control::PING).await.unwrap();
        assert_eq!(echoed, control::PING);
    }

    #[tokio::test]
    async fn test_accept_reports_usable_data_port() {
        let (_dir, port, _handle) = spawn_server().await;
        let addr = format!("127.0.0.1:{port}");
        let data_port = control_request(&addr, control::ACCEPT).await.unwrap();
        assert!(data_port > 0);
        assert!(data_port <= u16::MAX as u32);
        let connectionless = control_request(&addr, control::CONNECTIONLESS_PORT)
            .await
            .unwrap();
        assert_eq!(connectionless, data_port);
    }

    #[tokio::test]
    async fn test_fresh_server_stats_are_empty() {
        let (_dir, port, _handle) = spawn_server().await;
        let addr = format!("127.0.0.1:{port}");
        let snapshot = control_stats(&addr, false).await.unwrap();
        assert_eq!(snapshot.total(), 0);
    }

    #[tokio::test]
    async fn test_finish_await_shuts_the_server_down() {
        let (_dir, port, handle) = spawn_server().await;
        let addr = format!("127.0.0.1:{port}");
        let ack = control_request(&addr, control::FINISH_AWAIT).await.unwrap();
        assert_eq!(ack, control::FINISH_AWAIT);
        let run_result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server did not stop after FINISH_AWAIT")
            .unwrap();
        assert!(run_result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_latch_is_level_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        // A waiter arriving after the trigger must not block.
        tokio::time::timeout(std::time::Duration::from_millis(100), shutdown.wait())
            .await
            .expect("late waiter missed the trigger");
    }
}
