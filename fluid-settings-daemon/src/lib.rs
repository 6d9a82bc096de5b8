//! Fluid Settings Daemon
//!
//! The daemon half of the fluid-settings system:
//! - **Server**: single actor owning the store, the subscription registry
//!   and the peer table; everything else feeds it events over one channel
//! - **dispatch**: validation and reply logic for the control vocabulary
//! - **messenger**: the permanent communicator-bus connection
//! - **peers**: the TCP peer listener and the inbound/outbound
//!   replication links with their gossip tie-break
//! - **config**: daemon configuration from defaults, file and environment

pub mod config;
pub mod dispatch;
pub mod messenger;
pub mod peers;
pub mod server;

pub use config::{DaemonConfig, DaemonError};
pub use server::{ChangeOrigin, PeerId, PeerKind, Server, ServerEvent};
