//! In-process transport hub
//!
//! All endpoints live in one registry; dial/accept handshakes and link
//! teardown behave like the broker transport, minus the sockets. Tests use
//! this to run whole rooms of peers inside a single process.

use super::{EventReceiver, Transport, TransportError, TransportEvent, TransportFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct HubState {
    /// Event senders per open endpoint.
    endpoints: HashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    /// Pending dials keyed by (dialer, target); completed by accept/close.
    pending: HashMap<(String, String), oneshot::Sender<bool>>,
    /// Established links, stored in both directions.
    links: HashSet<(String, String)>,
}

impl HubState {
    fn emit(&self, endpoint: &str, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(endpoint) {
            // Receiver may already be dropped mid-teardown; fine.
            let _ = tx.send(event);
        }
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        self.links.contains(&(a.to_string(), b.to_string()))
    }

    fn link(&mut self, a: &str, b: &str) {
        self.links.insert((a.to_string(), b.to_string()));
        self.links.insert((b.to_string(), a.to_string()));
    }

    fn unlink(&mut self, a: &str, b: &str) {
        self.links.remove(&(a.to_string(), b.to_string()));
        self.links.remove(&(b.to_string(), a.to_string()));
    }
}

/// The shared in-process registry. Clone-cheap; every endpoint holds one.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints currently open, mostly for test assertions.
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

#[async_trait]
impl TransportFactory for MemoryHub {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if state.endpoints.contains_key(endpoint) {
                return Err(TransportError::EndpointTaken(endpoint.to_string()));
            }
            state.endpoints.insert(endpoint.to_string(), tx);
        }
        let transport = Arc::new(MemoryTransport {
            hub: self.state.clone(),
            name: endpoint.to_string(),
        });
        Ok((transport, rx))
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<Mutex<HubState>>,
    name: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn dial(&self, remote: &str) -> Result<(), TransportError> {
        let rx = {
            let mut state = self.hub.lock();
            if !state.endpoints.contains_key(&self.name) {
                return Err(TransportError::EndpointClosed);
            }
            if !state.endpoints.contains_key(remote) {
                return Err(TransportError::NoRoute(remote.to_string()));
            }
            if state.linked(&self.name, remote) {
                return Ok(());
            }
            let (done_tx, done_rx) = oneshot::channel();
            state
                .pending
                .insert((self.name.clone(), remote.to_string()), done_tx);
            state.emit(
                remote,
                TransportEvent::ConnectionRequested {
                    remote: self.name.clone(),
                },
            );
            done_rx
        };
        // Unanswered dials park here until the caller's timeout abandons
        // them; an answer arriving later lands in a dropped receiver.
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Rejected(remote.to_string())),
            Err(_) => Err(TransportError::NoRoute(remote.to_string())),
        }
    }

    async fn accept(&self, remote: &str) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        match state.pending.remove(&(remote.to_string(), self.name.clone())) {
            Some(done) => {
                state.link(&self.name, remote);
                let _ = done.send(true);
                Ok(())
            }
            None => Err(TransportError::NotConnected(remote.to_string())),
        }
    }

    async fn send(&self, remote: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let state = self.hub.lock();
        if !state.linked(&self.name, remote) {
            return Err(TransportError::NotConnected(remote.to_string()));
        }
        state.emit(
            remote,
            TransportEvent::Data {
                remote: self.name.clone(),
                payload,
            },
        );
        Ok(())
    }

    async fn close(&self, remote: &str) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        // A close may target a pending inbound request (rejection)...
        if let Some(done) = state.pending.remove(&(remote.to_string(), self.name.clone())) {
            let _ = done.send(false);
            return Ok(());
        }
        // ...or an established link.
        if state.linked(&self.name, remote) {
            state.unlink(&self.name, remote);
            state.emit(
                remote,
                TransportEvent::PeerClosed {
                    remote: self.name.clone(),
                },
            );
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.hub.lock();
        state.endpoints.remove(&self.name);
        let partners: Vec<String> = state
            .links
            .iter()
            .filter(|(a, _)| *a == self.name)
            .map(|(_, b)| b.clone())
            .collect();
        for partner in partners {
            state.unlink(&self.name, &partner);
            state.emit(
                &partner,
                TransportEvent::PeerClosed {
                    remote: self.name.clone(),
                },
            );
        }
        // Reject anything still waiting on us.
        let waiting: Vec<(String, String)> = state
            .pending
            .keys()
            .filter(|(_, target)| *target == self.name)
            .cloned()
            .collect();
        for key in waiting {
            if let Some(done) = state.pending.remove(&key) {
                let _ = done.send(false);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_rejects_duplicate_names() {
        let hub = MemoryHub::new();
        let _a = hub.open("room-1").await.unwrap();
        match hub.open("room-1").await {
            Err(TransportError::EndpointTaken(name)) => assert_eq!(name, "room-1"),
            Err(other) => panic!("expected EndpointTaken, got {other:?}"),
            Ok(_) => panic!("expected EndpointTaken, got Ok"),
        }
    }

    #[tokio::test]
    async fn test_dial_accept_send() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.open("room-1").await.unwrap();
        let (b, mut b_rx) = hub.open("room-2").await.unwrap();

        let dial = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.dial("room-2").await }
        });

        match b_rx.recv().await.unwrap() {
            TransportEvent::ConnectionRequested { remote } => {
                assert_eq!(remote, "room-1");
                b.accept("room-1").await.unwrap();
            }
            other => panic!("unexpected event {other:?}"),
        }
        dial.await.unwrap().unwrap();

        a.send("room-2", vec![1, 2, 3]).await.unwrap();
        match b_rx.recv().await.unwrap() {
            TransportEvent::Data { remote, payload } => {
                assert_eq!(remote, "room-1");
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dial_unknown_endpoint_fails_fast() {
        let hub = MemoryHub::new();
        let (a, _rx) = hub.open("room-1").await.unwrap();
        assert!(matches!(
            a.dial("room-99").await,
            Err(TransportError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_dial() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.open("room-1").await.unwrap();
        let (b, mut b_rx) = hub.open("other-room-2").await.unwrap();

        let dial = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.dial("other-room-2").await }
        });
        match b_rx.recv().await.unwrap() {
            TransportEvent::ConnectionRequested { remote } => {
                b.close(&remote).await.unwrap();
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            dial.await.unwrap(),
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.open("room-1").await.unwrap();
        let _b = hub.open("room-2").await.unwrap();
        assert!(matches!(
            a.send("room-2", vec![0]).await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_partners_and_frees_name() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.open("room-1").await.unwrap();
        let (b, mut b_rx) = hub.open("room-2").await.unwrap();

        let dial = tokio::spawn({
            let a = Arc::clone(&a);
            async move { a.dial("room-2").await }
        });
        if let Some(TransportEvent::ConnectionRequested { remote }) = b_rx.recv().await {
            b.accept(&remote).await.unwrap();
        }
        dial.await.unwrap().unwrap();

        a.shutdown().await;
        match tokio::time::timeout(Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            TransportEvent::PeerClosed { remote } => assert_eq!(remote, "room-1"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(hub.endpoint_count(), 1);
        // Name is reusable after shutdown.
        assert!(hub.open("room-1").await.is_ok());
    }
}
