//! Fluid Settings
//!
//! The settings engine shared by the daemon and the client tooling:
//! - **Schema**: setting definitions loaded from `.ini` files
//! - **ValueSet**: per-name priority-stratified records with
//!   last-writer-wins resolution
//! - **SettingsStore**: schema-gated get/set/reset plus the replication
//!   serialization
//! - **persist**: atomic save/load of the store to a flat file
//! - **SubscriptionRegistry**: who listens to which setting
//! - **connection**: the client session layer services embed to read,
//!   write and watch settings over the communicator bus
//! - **LocalOptions**: client-side option table the session overlays

pub mod connection;
pub mod options;
pub mod persist;
pub mod schema;
pub mod store;
pub mod subscriptions;
pub mod value;

mod error;

pub use connection::{FluidSettings, SessionConfig, SettingEvent, SettingStatus};
pub use error::SettingsError;
pub use options::{LocalOptions, OptionSource, OverlayResult};
pub use schema::{Definition, Schema, SettingType};
pub use store::{GetResult, ResetResult, SettingsStore};
pub use subscriptions::{Subscriber, SubscriptionRegistry};
pub use value::{Record, SetResult, ValueSet};
