//! Local port forwarding.
//!
//! A tokio listener accepts local sockets; each accepted socket gets its own
//! tunnel, pumped by a dedicated thread because tunnel I/O is blocking.

use crate::error::{EngineError, EngineResult};
use crate::ssh::transport::{Transport, Tunnel};
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};

const BUFFER_SIZE: usize = 32 * 1024;
const PUMP_IDLE: Duration = Duration::from_millis(5);

/// Description of an active forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardInfo {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub started_at: i64,
}

/// A running forward; stops when dropped
pub struct PortForward {
    info: ForwardInfo,
    listener_task: JoinHandle<()>,
}

impl PortForward {
    /// Bind `127.0.0.1:local_port` and forward accepted sockets to
    /// `remote_host:remote_port` through `transport`. Port 0 picks a free port.
    pub async fn start(
        transport: Arc<dyn Transport>,
        connection_id: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> EngineResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| EngineError::Connection(format!("Failed to bind local port {}: {}", local_port, e)))?;
        let local_port = listener.local_addr()?.port();

        let info = ForwardInfo {
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            started_at: chrono::Utc::now().timestamp(),
        };

        tracing::info!(
            "Forwarding 127.0.0.1:{} -> {}:{} via {}",
            local_port,
            remote_host,
            remote_port,
            connection_id
        );

        let listener_task = tokio::spawn(accept_loop(
            listener,
            transport,
            connection_id.to_string(),
            info.remote_host.clone(),
            remote_port,
        ));

        Ok(Self { info, listener_task })
    }

    pub fn info(&self) -> &ForwardInfo {
        &self.info
    }

    pub fn local_port(&self) -> u16 {
        self.info.local_port
    }

    /// Close the listener and every open tunnel
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    connection_id: String,
    remote_host: String,
    remote_port: u16,
) {
    // Dropping the set on abort drops every splice, closing its socket and tunnel
    let mut splices = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!("Accepted forward socket from {} on {}", peer, connection_id);
                    let transport = Arc::clone(&transport);
                    let remote_host = remote_host.clone();
                    let connection_id = connection_id.clone();
                    splices.spawn(async move {
                        if let Err(e) = splice(socket, transport, remote_host, remote_port).await {
                            tracing::warn!("Forward socket error on {}: {}", connection_id, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept forward socket on {}: {}", connection_id, e);
                }
            },
            Some(_) = splices.join_next(), if !splices.is_empty() => {}
        }
    }
}

/// Pipe one local socket through a fresh tunnel until either side closes
async fn splice(
    socket: TcpStream,
    transport: Arc<dyn Transport>,
    remote_host: String,
    remote_port: u16,
) -> EngineResult<()> {
    let tunnel = tokio::task::spawn_blocking(move || transport.open_tunnel(&remote_host, remote_port))
        .await
        .map_err(|e| EngineError::Connection(format!("Tunnel task failed: {}", e)))??;

    let (mut local_read, mut local_write) = socket.into_split();
    let (tx_to_remote, rx_to_remote) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_to_local, mut rx_to_local) = mpsc::unbounded_channel::<Vec<u8>>();

    // Set when this future ends or is dropped mid-splice
    let stop = PumpStop::default();
    let pump_flag = stop.flag();
    let pump_thread = std::thread::spawn(move || pump(tunnel, rx_to_remote, tx_to_local, &pump_flag));

    let local_to_remote = async move {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx_to_remote.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    };

    let remote_to_local = async move {
        while let Some(data) = rx_to_local.recv().await {
            if local_write.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = local_write.shutdown().await;
    };

    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
    }
    drop(stop);

    let _ = tokio::task::spawn_blocking(move || {
        let _ = pump_thread.join();
    })
    .await;

    Ok(())
}

/// Raises the pump's stop flag when dropped
#[derive(Default)]
struct PumpStop(Arc<AtomicBool>);

impl PumpStop {
    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl Drop for PumpStop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Move bytes between the channels and the tunnel until either side ends
fn pump(
    mut tunnel: Box<dyn Tunnel>,
    mut to_remote: UnboundedReceiver<Vec<u8>>,
    to_local: UnboundedSender<Vec<u8>>,
    stop: &AtomicBool,
) {
    let mut buf = vec![0u8; BUFFER_SIZE];

    'outer: while !stop.load(Ordering::SeqCst) {
        let mut idle = true;

        loop {
            match to_remote.try_recv() {
                Ok(data) => {
                    idle = false;
                    if let Err(e) = tunnel.write_all(&data) {
                        tracing::debug!("Tunnel write error: {}", e);
                        break 'outer;
                    }
                    let _ = tunnel.flush();
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        match tunnel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                idle = false;
                if to_local.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::debug!("Tunnel read error: {}", e);
                break;
            }
        }

        if tunnel.eof() {
            break;
        }
        if idle {
            std::thread::sleep(PUMP_IDLE);
        }
    }

    tunnel.shutdown();
}
