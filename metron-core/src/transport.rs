//! Collector Transport
//!
//! Hands serialized payloads to the local collector daemon. The exporter
//! treats every implementation as fire-and-forget; failures are reported
//! through the `Result` only so the boundary can log them.

use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::error::{MetronError, Result};

/// Trait for payload transports
pub trait Transport: Send + Sync {
    /// Hand one serialized payload to the collector
    fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Get the transport name
    fn name(&self) -> &'static str;
}

/// Discards every payload; for disabled deployments
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _payload: Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// In-memory transport capturing payloads for inspection in tests
#[derive(Clone, Default)]
pub struct MemoryTransport {
    payloads: std::sync::Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryTransport {
    /// Create an empty capture transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of captured payloads
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing was captured
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Clone out all captured payloads
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        match self.payloads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.lock().push(payload);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Writes one payload per connection to the collector's unix socket
#[cfg(unix)]
pub struct UdsTransport {
    socket_path: std::path::PathBuf,
    write_timeout: std::time::Duration,
}

#[cfg(unix)]
impl UdsTransport {
    /// Create a transport for the given socket path
    pub fn new(socket_path: impl Into<std::path::PathBuf>, write_timeout: std::time::Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            write_timeout,
        }
    }

    /// Create a transport from the transport configuration
    pub fn from_config(config: &crate::config::TransportConfig) -> Self {
        Self::new(config.socket_path.clone(), config.write_timeout)
    }
}

#[cfg(unix)]
impl Transport for UdsTransport {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            MetronError::Transport(format!(
                "connect to {} failed: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        stream
            .set_write_timeout(Some(self.write_timeout))
            .map_err(|e| MetronError::Transport(format!("set write timeout failed: {}", e)))?;
        stream
            .write_all(&payload)
            .map_err(|e| MetronError::Transport(format!("write failed: {}", e)))?;
        stream
            .shutdown(std::net::Shutdown::Write)
            .map_err(|e| MetronError::Transport(format!("shutdown failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "uds"
    }
}

/// Bounded handoff queue in front of another transport.
///
/// `send` never blocks: when the queue is full the payload is dropped and
/// reported, so `stop()` cannot stall request completion. A background
/// thread drains the queue; dropping the transport closes the queue and
/// joins the thread after the remaining payloads are delivered.
pub struct QueuedTransport {
    tx: Option<SyncSender<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl QueuedTransport {
    /// Spawn the drain thread over the inner transport
    pub fn new(inner: Box<dyn Transport>, capacity: usize) -> Result<Self> {
        let (tx, rx) = sync_channel::<Vec<u8>>(capacity.max(1));

        let handle = std::thread::Builder::new()
            .name("metron-transport".to_string())
            .spawn(move || {
                while let Ok(payload) = rx.recv() {
                    if let Err(err) = inner.send(payload) {
                        tracing::warn!(transport = inner.name(), %err, "payload dropped");
                    }
                }
            })
            .map_err(|e| MetronError::Transport(format!("failed to spawn drain thread: {}", e)))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl Transport for QueuedTransport {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(MetronError::Transport("queue closed".to_string()));
        };

        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MetronError::Transport(
                "handoff queue full, payload dropped".to_string(),
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(MetronError::Transport("drain thread gone".to_string()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "queued"
    }
}

impl Drop for QueuedTransport {
    fn drop(&mut self) {
        // Closing the sender lets the drain thread finish the backlog.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
