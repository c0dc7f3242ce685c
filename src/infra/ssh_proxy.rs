//! SSH TCP forwarder
//!
//! Maintains one listener per workspace SSH host port. Each listener is bound
//! to an ephemeral external port and copies bytes between accepted
//! connections and the container's loopback SSH port.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;

struct ProxyEntry {
    external_port: u16,
    generation: u64,
    task: JoinHandle<()>,
}

struct ClosedListener {
    host_port: u16,
    generation: u64,
}

/// Fleet of per-workspace SSH listeners, keyed by the container's host port
pub struct SshProxy {
    entries: Arc<Mutex<HashMap<u16, ProxyEntry>>>,
    closed_tx: mpsc::UnboundedSender<ClosedListener>,
    generation: AtomicU64,
}

impl SshProxy {
    pub fn new() -> Self {
        let entries: Arc<Mutex<HashMap<u16, ProxyEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<ClosedListener>();

        let eviction_entries = entries.clone();
        tokio::spawn(async move {
            while let Some(closed) = closed_rx.recv().await {
                let mut entries = eviction_entries.lock().unwrap();
                // A newer listener may have taken over this host port; only
                // the listener that died may evict itself.
                if let Some(entry) = entries.get(&closed.host_port) {
                    if entry.generation == closed.generation {
                        entries.remove(&closed.host_port);
                        info!(
                            "Evicted SSH forwarder entry for host port {}",
                            closed.host_port
                        );
                    }
                }
            }
        });

        Self {
            entries,
            closed_tx,
            generation: AtomicU64::new(0),
        }
    }

    /// Bind a fresh external listener forwarding to `127.0.0.1:host_port`.
    ///
    /// Re-adding a host port replaces the previous listener; the engine may
    /// have rebound a different host port after a container restart.
    pub async fn add_entry(&self, host_port: u16) -> Result<u16> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let external_port = listener.local_addr()?.port();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(accept_loop(
            listener,
            host_port,
            generation,
            self.closed_tx.clone(),
        ));

        let mut entries = self.entries.lock().unwrap();
        if let Some(prev) = entries.insert(
            host_port,
            ProxyEntry {
                external_port,
                generation,
                task,
            },
        ) {
            prev.task.abort();
        }

        info!(
            "SSH forwarder listening on :{} for host port {}",
            external_port, host_port
        );

        Ok(external_port)
    }

    /// External port currently serving the given host port
    pub fn external_port_for(&self, host_port: u16) -> Option<u16> {
        self.entries
            .lock()
            .unwrap()
            .get(&host_port)
            .map(|e| e.external_port)
    }
}

impl Default for SshProxy {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(
    listener: TcpListener,
    host_port: u16,
    generation: u64,
    closed_tx: mpsc::UnboundedSender<ClosedListener>,
) {
    loop {
        match listener.accept().await {
            Ok((inbound, peer)) => {
                debug!("Accepted SSH connection from {}", peer);
                tokio::spawn(forward_connection(inbound, host_port));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionReset
                        | ErrorKind::Interrupted
                ) =>
            {
                error!("Error accepting connection for host port {}: {}", host_port, e);
            }
            Err(e) => {
                error!(
                    "Fatal listener error for host port {}, closing: {}",
                    host_port, e
                );
                let _ = closed_tx.send(ClosedListener {
                    host_port,
                    generation,
                });
                return;
            }
        }
    }
}

async fn forward_connection(inbound: TcpStream, host_port: u16) {
    let outbound = match TcpStream::connect(("127.0.0.1", host_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Error connecting to container SSH at port {}: {}", host_port, e);
            return;
        }
    };

    let (mut inbound_read, mut inbound_write) = inbound.into_split();
    let (mut outbound_read, mut outbound_write) = outbound.into_split();

    // The first direction to finish, whether EOF or error, tears down the
    // other; half-close is not propagated.
    tokio::select! {
        _ = tokio::io::copy(&mut inbound_read, &mut outbound_write) => {}
        _ = tokio::io::copy(&mut outbound_read, &mut inbound_write) => {}
    }
}
