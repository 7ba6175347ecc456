//! Peer discovery — probe the room's enumerable id space
//!
//! There is no directory service. Peer ids in a room are drawn from a
//! small known range, so finding peers means dialing every candidate id
//! concurrently and keeping whatever answers before the race deadline.

use crate::config::SyncConfig;
use crate::room;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Dial every candidate id in the room except ourselves and collect the
/// peers that completed a handshake before the discovery deadline.
///
/// Never fails: an empty result means "first peer in the room". Individual
/// attempts are bounded by the handshake timeout; the race as a whole by
/// the discovery timeout. Attempts still in flight at the deadline are
/// abandoned, not cancelled at the transport level — their tasks run to
/// completion and a late success lands in a dropped channel, which is a
/// no-op by construction.
pub async fn discover(
    transport: Arc<dyn Transport>,
    room_id: &str,
    self_peer_id: &str,
    config: &SyncConfig,
) -> Vec<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, bool)>();
    let mut attempts = 0usize;

    for suffix in 1..=config.peer_suffix_max {
        let candidate = room::peer_id_for(room_id, suffix);
        if candidate == self_peer_id {
            continue;
        }
        let transport = Arc::clone(&transport);
        let tx = tx.clone();
        let handshake = config.handshake_timeout;
        tokio::spawn(async move {
            let ok = matches!(
                tokio::time::timeout(handshake, transport.dial(&candidate)).await,
                Ok(Ok(()))
            );
            let _ = tx.send((candidate, ok));
        });
        attempts += 1;
    }
    drop(tx);

    let deadline = Instant::now() + config.discovery_timeout;
    let mut found = Vec::new();
    let mut settled = 0usize;
    while settled < attempts && found.len() < config.max_connections {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::ZERO {
            tracing::debug!(
                found = found.len(),
                outstanding = attempts - settled,
                "discovery deadline reached, abandoning outstanding attempts"
            );
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some((candidate, true))) => {
                tracing::debug!(peer = %candidate, "discovered peer");
                found.push(candidate);
                settled += 1;
            }
            Ok(Some((_, false))) => settled += 1,
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(
                    found = found.len(),
                    outstanding = attempts - settled,
                    "discovery deadline reached, abandoning outstanding attempts"
                );
                break;
            }
        }
    }
    found
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use crate::transport::{TransportEvent, TransportFactory};
    use std::time::Duration;

    /// Endpoint that accepts every inbound request, standing in for an
    /// already-present peer.
    async fn accept_all(hub: &MemoryHub, name: &str) {
        let (transport, mut rx) = hub.open(name).await.unwrap();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let TransportEvent::ConnectionRequested { remote } = event {
                    let _ = transport.accept(&remote).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_discover_finds_present_peers() {
        let hub = MemoryHub::new();
        let room = "cats-vs-dogs";
        accept_all(&hub, "cats-vs-dogs-1").await;
        accept_all(&hub, "cats-vs-dogs-3").await;
        let (me, _rx) = hub.open("cats-vs-dogs-2").await.unwrap();

        let config = SyncConfig::fast(8);
        let mut found = discover(me, room, "cats-vs-dogs-2", &config).await;
        found.sort();
        assert_eq!(found, vec!["cats-vs-dogs-1", "cats-vs-dogs-3"]);
    }

    #[tokio::test]
    async fn test_discover_empty_room_is_ok() {
        let hub = MemoryHub::new();
        let (me, _rx) = hub.open("cats-vs-dogs-1").await.unwrap();
        let config = SyncConfig::fast(8);
        let found = discover(me, "cats-vs-dogs", "cats-vs-dogs-1", &config).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_discover_returns_within_deadline_with_silent_candidates() {
        let hub = MemoryHub::new();
        // Endpoints that never answer ConnectionRequested: dials hang until
        // the race deadline.
        for n in [1u16, 3, 4] {
            let name = format!("cats-vs-dogs-{n}");
            let (_t, rx) = hub.open(&name).await.unwrap();
            std::mem::forget(rx); // keep the channel alive, never drain it
        }
        let (me, _rx) = hub.open("cats-vs-dogs-2").await.unwrap();

        let mut config = SyncConfig::fast(4);
        config.handshake_timeout = Duration::from_secs(30);
        config.discovery_timeout = Duration::from_millis(300);

        let started = Instant::now();
        let found = discover(me, "cats-vs-dogs", "cats-vs-dogs-2", &config).await;
        assert!(found.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_discover_caps_at_max_connections() {
        let hub = MemoryHub::new();
        for n in 1..=6u16 {
            if n != 4 {
                accept_all(&hub, &format!("cats-vs-dogs-{n}")).await;
            }
        }
        let (me, _rx) = hub.open("cats-vs-dogs-4").await.unwrap();
        let mut config = SyncConfig::fast(6);
        config.max_connections = 2;
        let found = discover(me, "cats-vs-dogs", "cats-vs-dogs-4", &config).await;
        assert_eq!(found.len(), 2);
    }
}
