//! Transport abstraction — message channels keyed by string endpoint names
//!
//! The core assumes nothing about the wire beyond "reliable, ordered per
//! connection, at-least-once-ish delivery with possible duplication". Two
//! implementations ship with the crate: an in-process hub for tests and
//! single-process demos ([`memory::MemoryHub`]), and a TCP rendezvous-broker
//! client ([`crate::broker::client::BrokerConnector`]).

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Events surfaced by an open endpoint, serialized onto one channel so the
/// consumer never needs locking across handlers.
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote endpoint wants a link. The consumer must `accept` or
    /// `close`; the dialer's `dial` resolves accordingly.
    ConnectionRequested { remote: String },
    /// Bytes arrived over an established link.
    Data { remote: String, payload: Vec<u8> },
    /// An established link went away (remote close or transport failure).
    PeerClosed { remote: String },
    /// The endpoint itself is gone — for the broker transport, the broker
    /// socket dropped. Triggers bounded reconnection upstream.
    EndpointLost { reason: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint id already taken: {0}")]
    EndpointTaken(String),
    #[error("endpoint is closed")]
    EndpointClosed,
    #[error("no endpoint named {0}")]
    NoRoute(String),
    #[error("connection rejected by {0}")]
    Rejected(String),
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("broker unreachable: {0}")]
    Broker(String),
    #[error("send to {0} failed: {1}")]
    SendFailed(String, String),
}

/// An open, named local endpoint with point-to-point links to other named
/// endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The local endpoint name this transport is bound to.
    fn endpoint(&self) -> &str;

    /// Establish a link to a named remote endpoint. Resolves once the
    /// remote side accepted. Callers bound this with their own timeout.
    async fn dial(&self, remote: &str) -> Result<(), TransportError>;

    /// Accept a pending inbound link from `remote`.
    async fn accept(&self, remote: &str) -> Result<(), TransportError>;

    /// Send bytes over an established link.
    async fn send(&self, remote: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Tear down one link (or reject a pending inbound request).
    async fn close(&self, remote: &str) -> Result<(), TransportError>;

    /// Release the endpoint and every link. Idempotent.
    async fn shutdown(&self);
}

/// Receiver half of an endpoint's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Opens named endpoints. Opening an already-taken name fails with
/// [`TransportError::EndpointTaken`]; the caller regenerates its id.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn Transport>, EventReceiver), TransportError>;
}
