//! Fluid Settings Model
//!
//! Primitives shared by the settings engine, the daemon, the client session
//! library and the CLI:
//! - **name**: canonical setting names and service qualification
//! - **Priority**: bounded `[0, 99]` value priorities and the query sentinel
//! - **Timestamp**: nanosecond wall-clock timestamps with a sanity floor
//! - **Message**: the control-message envelope and its line-oriented codec
//! - **commands**: the command-name vocabulary
//! - **escape**: value escaping for replication blobs and csv replies

pub mod commands;
pub mod escape;
pub mod message;
pub mod name;
pub mod priority;
pub mod timestamp;

mod error;

pub use error::ModelError;
pub use message::{Address, Message};
pub use priority::{Priority, PriorityQuery};
pub use timestamp::Timestamp;
