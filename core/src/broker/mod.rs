//! Rendezvous broker — named-endpoint signaling and relay over TCP
//!
//! Peers cannot find each other's sockets from a room-scoped name alone, so
//! a small broker fills the gap: clients register their endpoint name over
//! one TCP connection, and the broker relays dial requests, dial answers,
//! data frames, and close notices between registered names. The broker
//! holds no vote state and understands none of the vote protocol; it moves
//! opaque payloads.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::BrokerConnector;
pub use server::BrokerServer;
