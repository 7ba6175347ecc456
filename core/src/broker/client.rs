//! Broker client — the `Transport` implementation peers actually use
//!
//! One TCP connection to the broker carries everything: registration, dial
//! signaling, and relayed payloads. Losing that socket is the "disconnected
//! from broker" signal, surfaced as `TransportEvent::EndpointLost` so the
//! connection manager can run its bounded reconnection.

use super::protocol::{read_frame, write_frame, BrokerFrame};
use crate::transport::{
    EventReceiver, Transport, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Default)]
struct ClientState {
    /// Outstanding dials keyed by target, completed by `DialResult`.
    pending_dials: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    /// Inbound requests awaiting our accept/reject.
    pending_inbound: Mutex<HashSet<String>>,
    /// Established links.
    links: Mutex<HashSet<String>>,
    /// Set on deliberate shutdown so the read task stays quiet.
    closed: AtomicBool,
}

/// Factory for broker-backed endpoints: one TCP connection per endpoint.
#[derive(Debug, Clone)]
pub struct BrokerConnector {
    addr: String,
}

impl BrokerConnector {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl TransportFactory for BrokerConnector {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &BrokerFrame::Register {
                endpoint: endpoint.to_string(),
            },
        )
        .await
        .map_err(|e| TransportError::Broker(e.to_string()))?;

        match read_frame(&mut reader).await {
            Ok(BrokerFrame::RegisterAck { ok: true }) => {}
            Ok(BrokerFrame::RegisterAck { ok: false }) => {
                return Err(TransportError::EndpointTaken(endpoint.to_string()));
            }
            Ok(other) => {
                return Err(TransportError::Broker(format!(
                    "unexpected registration reply {}",
                    other.tag()
                )));
            }
            Err(e) => return Err(TransportError::Broker(e.to_string())),
        }
        tracing::debug!(%endpoint, broker = %self.addr, "endpoint registered with broker");

        let state = Arc::new(ClientState::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_task(reader, Arc::clone(&state), event_tx));
        let writer_task = tokio::spawn(write_task(writer, out_rx));

        let transport = Arc::new(BrokerTransport {
            name: endpoint.to_string(),
            out: Mutex::new(Some(out_tx)),
            state,
            tasks: Mutex::new(vec![reader_task, writer_task]),
        });
        Ok((transport, event_rx))
    }
}

async fn write_task(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<BrokerFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::debug!("broker write failed: {e}");
            break;
        }
    }
}

async fn read_task(
    mut reader: OwnedReadHalf,
    state: Arc<ClientState>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(BrokerFrame::DialRequest { from }) => {
                state.pending_inbound.lock().insert(from.clone());
                let _ = events.send(TransportEvent::ConnectionRequested { remote: from });
            }
            Ok(BrokerFrame::DialResult { target, ok }) => {
                if ok {
                    state.links.lock().insert(target.clone());
                }
                if let Some(done) = state.pending_dials.lock().remove(&target) {
                    let _ = done.send(ok);
                }
            }
            Ok(BrokerFrame::Deliver { from, payload }) => {
                let _ = events.send(TransportEvent::Data {
                    remote: from,
                    payload,
                });
            }
            Ok(BrokerFrame::CloseLink { peer }) => {
                let was_linked = state.links.lock().remove(&peer);
                state.pending_inbound.lock().remove(&peer);
                if let Some(done) = state.pending_dials.lock().remove(&peer) {
                    let _ = done.send(false);
                }
                if was_linked {
                    let _ = events.send(TransportEvent::PeerClosed { remote: peer });
                }
            }
            Ok(other) => {
                tracing::warn!("unexpected broker frame {}", other.tag());
            }
            Err(e) => {
                if !state.closed.load(Ordering::SeqCst) {
                    let _ = events.send(TransportEvent::EndpointLost {
                        reason: e.to_string(),
                    });
                }
                break;
            }
        }
    }
}

/// A named endpoint held open through the broker.
pub struct BrokerTransport {
    name: String,
    /// Taken on shutdown; a closed sender ends the write task and the socket.
    out: Mutex<Option<mpsc::UnboundedSender<BrokerFrame>>>,
    state: Arc<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerTransport {
    fn push(&self, frame: BrokerFrame) -> Result<(), TransportError> {
        let guard = self.out.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::EndpointClosed),
            None => Err(TransportError::EndpointClosed),
        }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn dial(&self, remote: &str) -> Result<(), TransportError> {
        if self.state.links.lock().contains(remote) {
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.state
            .pending_dials
            .lock()
            .insert(remote.to_string(), done_tx);
        if let Err(e) = self.push(BrokerFrame::Dial {
            target: remote.to_string(),
        }) {
            self.state.pending_dials.lock().remove(remote);
            return Err(e);
        }
        match done_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Rejected(remote.to_string())),
            Err(_) => Err(TransportError::EndpointClosed),
        }
    }

    async fn accept(&self, remote: &str) -> Result<(), TransportError> {
        self.state.pending_inbound.lock().remove(remote);
        self.state.links.lock().insert(remote.to_string());
        self.push(BrokerFrame::DialAnswer {
            from: remote.to_string(),
            accept: true,
        })
    }

    async fn send(&self, remote: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.state.links.lock().contains(remote) {
            return Err(TransportError::NotConnected(remote.to_string()));
        }
        self.push(BrokerFrame::Send {
            to: remote.to_string(),
            payload,
        })
        .map_err(|e| TransportError::SendFailed(remote.to_string(), e.to_string()))
    }

    async fn close(&self, remote: &str) -> Result<(), TransportError> {
        if self.state.pending_inbound.lock().remove(remote) {
            // Rejecting a pending inbound request.
            return self.push(BrokerFrame::DialAnswer {
                from: remote.to_string(),
                accept: false,
            });
        }
        if self.state.links.lock().remove(remote) {
            return self.push(BrokerFrame::CloseLink {
                peer: remote.to_string(),
            });
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.out.lock().take();
        self.state.links.lock().clear();
        self.state.pending_inbound.lock().clear();
        self.state.pending_dials.lock().clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_transport() -> BrokerTransport {
        BrokerTransport {
            name: "cats-vs-dogs-1".to_string(),
            out: Mutex::new(None),
            state: Arc::new(ClientState::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_no_pending_entry() {
        let transport = closed_transport();
        match transport.dial("cats-vs-dogs-2").await {
            Err(TransportError::EndpointClosed) => {}
            other => panic!("expected EndpointClosed, got {other:?}"),
        }
        assert!(transport.state.pending_dials.lock().is_empty());
    }
}
