//! Bastion consensus networking.
//!
//! Carries consensus traffic between committee members over
//! length-prefixed TCP streams:
//!
//! - **Propagation**: proposals, votes and certificates are wrapped in a
//!   [`message::SignedEnvelope`] and broadcast to every known peer.
//! - **Admission**: the [`router`] rate limits each source, checks envelope
//!   and message signatures, and forwards only authenticated messages to the
//!   consensus thread.
//! - **Peers**: the [`peer_manager`] tracks liveness, commit frontiers and
//!   a misbehaviour score that bans peers once it runs out.
//! - **Catch-up**: the [`sync`] client asks peers for certified batches a
//!   restarted or lagging validator is missing.
//!
//! ```text
//!            consensus thread
//!       ^ RoutedMessage    | outbound ConsensusMessage
//!       | (crossbeam)      v
//!  +----------+      +-------------+      +------------+
//!  |  Router  |----->| PeerManager |<-----| SyncClient |
//!  +----------+      +-------------+      +------------+
//!       ^                                       |
//!       | InboundEnvelope                       | SyncRequest
//!  +----------------------------------------------------+
//!  | Transport (TcpListener, send / broadcast helpers)  |
//!  +----------------------------------------------------+
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod message;
pub mod peer_manager;
pub mod router;
pub mod sync;
pub mod transport;

pub use {
    cache::Cache,
    config::ConsensusNetConfig,
    error::{ConsensusNetError, Result},
    message::{ConsensusNetMessage, PeerInfo, SignedEnvelope},
    peer_manager::{Penalty, PeerManager},
    router::{RoutedMessage, Router},
    sync::SyncClient,
    transport::{InboundEnvelope, TransportHandle, TransportListener},
};
