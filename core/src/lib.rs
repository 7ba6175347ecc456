// Versus Core — peer-to-peer vote synchronization
//
// "Does this help two people on two devices agree on the score
//  without a server owning the votes?"
//
// If the answer is no, it doesn't belong here.

pub mod broker;
pub mod config;
pub mod discovery;
pub mod ledger;
pub mod manager;
pub mod protocol;
pub mod reconcile;
pub mod room;
pub mod router;
pub mod transport;

pub use broker::{BrokerConnector, BrokerServer};
pub use config::SyncConfig;
pub use ledger::{device_fingerprint, LedgerError, VoteLedger, VoteLedgerRecord};
pub use manager::{ConnectionManager, ConnectionStatus, PeerConnection, SyncDelegate, SyncError};
pub use protocol::{Envelope, Payload, ProtocolError};
pub use reconcile::{BattleSession, Outcome, Tally, Vote, VoteReconciler};
pub use room::{peer_id, room_id, same_room};
pub use transport::memory::MemoryHub;
pub use transport::{Transport, TransportError, TransportEvent, TransportFactory};
