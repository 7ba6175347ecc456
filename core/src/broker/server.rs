//! Broker server — registry plus dumb relay
//!
//! One task per client: the first frame must claim a free endpoint name,
//! after that the read loop routes dials, answers, payloads, and closes to
//! the named counterpart. When a client drops, every endpoint it was linked
//! with gets a `CloseLink` so peers learn about the loss without waiting
//! for heartbeats to go stale.

use super::protocol::{read_frame, write_frame, BrokerFrame, FrameError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Default)]
struct Registry {
    /// Outbound frame queues per registered endpoint.
    clients: HashMap<String, mpsc::UnboundedSender<BrokerFrame>>,
    /// Established links per endpoint, for disconnect notification.
    links: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn route(&self, endpoint: &str, frame: BrokerFrame) -> bool {
        match self.clients.get(endpoint) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn link(&mut self, a: &str, b: &str) {
        self.links.entry(a.to_string()).or_default().insert(b.to_string());
        self.links.entry(b.to_string()).or_default().insert(a.to_string());
    }

    fn unlink(&mut self, a: &str, b: &str) {
        if let Some(set) = self.links.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.links.get_mut(b) {
            set.remove(a);
        }
    }

    fn drop_client(&mut self, endpoint: &str) -> Vec<String> {
        self.clients.remove(endpoint);
        let partners: Vec<String> = self
            .links
            .remove(endpoint)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for partner in &partners {
            if let Some(set) = self.links.get_mut(partner) {
                set.remove(endpoint);
            }
        }
        partners
    }
}

/// The rendezvous broker. `bind` then `run` (typically inside
/// `tokio::spawn`); drop the returned handle's task to stop serving.
pub struct BrokerServer {
    listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
}

impl BrokerServer {
    /// Bind the broker to `addr` (use port 0 for an ephemeral port).
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "broker listening");
        Ok(Self {
            listener,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the task is dropped or the listener errors.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, registry).await {
                            tracing::debug!(%addr, "client session ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("broker accept failed: {e}");
                    break;
                }
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    registry: Arc<Mutex<Registry>>,
) -> Result<(), FrameError> {
    let (mut reader, writer) = stream.into_split();

    // First frame must be a registration for a free name.
    let endpoint = match read_frame(&mut reader).await? {
        BrokerFrame::Register { endpoint } => endpoint,
        other => {
            tracing::warn!("first frame was {}, dropping client", other.tag());
            return Ok(());
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let accepted = {
        let mut reg = registry.lock();
        if reg.clients.contains_key(&endpoint) {
            false
        } else {
            reg.clients.insert(endpoint.clone(), tx.clone());
            true
        }
    };

    let writer_task = tokio::spawn(write_loop(writer, rx, accepted));
    if !accepted {
        tracing::debug!(%endpoint, "registration rejected: name taken");
        let _ = writer_task.await;
        return Ok(());
    }
    tracing::debug!(%endpoint, "endpoint registered");

    let result = read_loop(&mut reader, &endpoint, &registry).await;

    // Teardown: unregister and tell link partners.
    let partners = registry.lock().drop_client(&endpoint);
    for partner in partners {
        registry.lock().route(
            &partner,
            BrokerFrame::CloseLink {
                peer: endpoint.clone(),
            },
        );
    }
    drop(tx);
    let _ = writer_task.await;
    tracing::debug!(%endpoint, "endpoint unregistered");
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<BrokerFrame>,
    accepted: bool,
) {
    if write_frame(&mut writer, &BrokerFrame::RegisterAck { ok: accepted })
        .await
        .is_err()
        || !accepted
    {
        return;
    }
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!("broker write failed: {e}");
            break;
        }
    }
}

async fn read_loop(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    endpoint: &str,
    registry: &Arc<Mutex<Registry>>,
) -> Result<(), FrameError> {
    loop {
        let frame = match read_frame(reader).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(%endpoint, "client read ended: {e}");
                return Ok(());
            }
        };
        match frame {
            BrokerFrame::Dial { target } => {
                let delivered = registry.lock().route(
                    &target,
                    BrokerFrame::DialRequest {
                        from: endpoint.to_string(),
                    },
                );
                if !delivered {
                    registry.lock().route(
                        endpoint,
                        BrokerFrame::DialResult { target, ok: false },
                    );
                }
            }
            BrokerFrame::DialAnswer { from, accept } => {
                let mut reg = registry.lock();
                if accept {
                    reg.link(endpoint, &from);
                }
                reg.route(
                    &from,
                    BrokerFrame::DialResult {
                        target: endpoint.to_string(),
                        ok: accept,
                    },
                );
            }
            BrokerFrame::Send { to, payload } => {
                let delivered = registry.lock().route(
                    &to,
                    BrokerFrame::Deliver {
                        from: endpoint.to_string(),
                        payload,
                    },
                );
                if !delivered {
                    // Target vanished between link and send; tell the sender.
                    registry.lock().route(
                        endpoint,
                        BrokerFrame::CloseLink { peer: to },
                    );
                }
            }
            BrokerFrame::CloseLink { peer } => {
                let mut reg = registry.lock();
                reg.unlink(endpoint, &peer);
                reg.route(
                    &peer,
                    BrokerFrame::CloseLink {
                        peer: endpoint.to_string(),
                    },
                );
            }
            other => {
                tracing::warn!(%endpoint, "unexpected client frame {}", other.tag());
            }
        }
    }
}
