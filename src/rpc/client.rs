//! Per-server session management
//!
//! Session establishment is two-phase: a short handshake on the server's
//! well-known control port returns a dynamically chosen data port, then the
//! real data connection is opened against that port. Connect attempts run
//! inside a bounded retry budget before surfacing a failure.
//!
//! A stream session must never be driven by two tasks at once, so the
//! socket sits behind an async mutex which callers hold for the full
//! request+response exchange.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use zerocopy::FromBytes;

use super::stream::{read_full, send_envelope, write_full};
use super::RpcError;
use crate::constants::{control, CONNECT_RETRY_DELAY_MS, CONNECT_TIMEOUT_MS};
use crate::proto::messages::StatsSnapshot;
use crate::proto::{Envelope, OpCode};

/// One established data connection to a storage server.
pub struct ServerSession {
    addr: String,
    stream: Mutex<TcpStream>,
}

impl ServerSession {
    /// Connect to a server through its control port.
    ///
    /// Sends ACCEPT on the control channel, receives the data port chosen by
    /// the server for this session, then connects to it.
    pub async fn connect(host: &str, control_port: u16) -> Result<Self, RpcError> {
        let control_addr = format!("{host}:{control_port}");
        let data_port = control_request(&control_addr, control::ACCEPT).await?;
        if data_port == 0 || data_port > u16::MAX as u32 {
            return Err(RpcError::Handshake {
                addr: control_addr,
                reason: format!("server returned invalid data port {data_port}"),
            });
        }

        let addr = format!("{host}:{data_port}");
        let stream = connect_with_retry(&addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!("session established with {}", addr);
        Ok(Self {
            addr,
            stream: Mutex::new(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Acquire exclusive use of the data stream.
    ///
    /// The guard must be held across the entire request+response exchange;
    /// interleaving two logical operations on one stream corrupts both.
    pub async fn lock(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }

    /// Send DISCONNECT and drop the session. The server ends this peer's
    /// dispatch loop without side effects.
    pub async fn disconnect(&self, tag: u64) -> Result<(), RpcError> {
        let mut stream = self.stream.lock().await;
        send_envelope(&mut *stream, &Envelope::control(OpCode::Disconnect, tag)).await?;
        tracing::debug!("disconnected from {}", self.addr);
        Ok(())
    }

    /// Send FINALIZE: ends this peer's loop and asks the whole server to
    /// shut down after finishing in-flight work.
    pub async fn finalize(&self, tag: u64) -> Result<(), RpcError> {
        let mut stream = self.stream.lock().await;
        send_envelope(&mut *stream, &Envelope::control(OpCode::Finalize, tag)).await?;
        Ok(())
    }
}

/// TCP connect with a bounded retry loop: fixed total budget, fixed
/// inter-attempt sleep.
async fn connect_with_retry(addr: &str) -> Result<TcpStream, RpcError> {
    let deadline = Instant::now() + Duration::from_millis(CONNECT_TIMEOUT_MS);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if Instant::now() >= deadline {
                    tracing::warn!("connect to {} exhausted retry budget: {}", addr, e);
                    return Err(RpcError::ConnectTimeout {
                        addr: addr.to_string(),
                        budget_ms: CONNECT_TIMEOUT_MS,
                    });
                }
                tracing::trace!("connect to {} failed ({}), retrying", addr, e);
                tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS)).await;
            }
        }
    }
}

/// One-shot control-channel exchange: send a code, read the 4-byte reply.
///
/// Used for ACCEPT (reply = data port), CONNECTIONLESS_PORT (reply = port),
/// PING (reply = echo), FINISH and FINISH_AWAIT (reply = ack, only awaited
/// for the AWAIT variant).
pub async fn control_request(addr: &str, code: u32) -> Result<u32, RpcError> {
    let mut stream = connect_with_retry(addr).await?;
    write_full(&mut stream, &code.to_le_bytes()).await?;
    if code == control::FINISH {
        // Fire-and-forget shutdown: no acknowledgement expected.
        return Ok(0);
    }
    let mut reply = [0u8; 4];
    read_full(&mut stream, &mut reply).await?;
    Ok(u32::from_le_bytes(reply))
}

/// Query the server's operation counters over the control channel.
pub async fn control_stats(addr: &str, window: bool) -> Result<StatsSnapshot, RpcError> {
    let code = if window {
        control::STATS_WINDOW
    } else {
        control::STATS
    };
    let mut stream = connect_with_retry(addr).await?;
    write_full(&mut stream, &code.to_le_bytes()).await?;
    let mut buf = [0u8; StatsSnapshot::SIZE];
    read_full(&mut stream, &mut buf).await?;
    StatsSnapshot::read_from_bytes(&buf).map_err(|_| RpcError::Handshake {
        addr: addr.to_string(),
        reason: "malformed stats snapshot".to_string(),
    })
}

/// Monotonic correlation-tag allocator.
///
/// Process-scoped state injected into the components that need it rather
/// than an ambient global; the zero tag is reserved for control traffic.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    next: std::sync::atomic::AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self {
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_nonzero() {
        let alloc = RequestIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_connect_retry_times_out_on_dead_address() {
        // Port 1 on localhost refuses connections; the loop must give up
        // within the budget rather than hang.
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS + 5_000),
            connect_with_retry("127.0.0.1:1"),
        )
        .await
        .expect("retry loop exceeded its own budget");
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(CONNECT_RETRY_DELAY_MS));
    }
}
