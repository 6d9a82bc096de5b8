//! Command names understood across the fluid-settings system.
//!
//! The first group is the request vocabulary handled by the daemon, the
//! second the replies and pushes it emits, the last the generic bus
//! commands every connection understands.

// requests
pub const GET: &str = "FLUID_SETTINGS_GET";
pub const PUT: &str = "FLUID_SETTINGS_PUT";
pub const DELETE: &str = "FLUID_SETTINGS_DELETE";
pub const LIST: &str = "FLUID_SETTINGS_LIST";
pub const LISTEN: &str = "FLUID_SETTINGS_LISTEN";
pub const FORGET: &str = "FLUID_SETTINGS_FORGET";
pub const GOSSIP: &str = "FLUID_SETTINGS_GOSSIP";
pub const CONNECTED: &str = "FLUID_SETTINGS_CONNECTED";

/// Peer-to-peer replication push; never travels over the bus.
pub const VALUE_CHANGED: &str = "VALUE_CHANGED";

// replies and pushes
pub const VALUE: &str = "FLUID_SETTINGS_VALUE";
pub const ALL_VALUES: &str = "FLUID_SETTINGS_ALL_VALUES";
pub const DEFAULT_VALUE: &str = "FLUID_SETTINGS_DEFAULT_VALUE";
pub const NOT_SET: &str = "FLUID_SETTINGS_NOT_SET";
pub const UPDATED: &str = "FLUID_SETTINGS_UPDATED";
pub const DELETED: &str = "FLUID_SETTINGS_DELETED";
pub const OPTIONS: &str = "FLUID_SETTINGS_OPTIONS";
pub const REGISTERED: &str = "FLUID_SETTINGS_REGISTERED";
pub const VALUE_UPDATED: &str = "FLUID_SETTINGS_VALUE_UPDATED";
pub const FLUID_READY: &str = "FLUID_SETTINGS_READY";
pub const INVALID: &str = "FLUID_SETTINGS_INVALID";

// communicator-bus commands
pub const REGISTER: &str = "REGISTER";
pub const UNREGISTER: &str = "UNREGISTER";
pub const READY: &str = "READY";
pub const STATUS: &str = "STATUS";
pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
pub const STOP: &str = "STOP";
pub const QUITTING: &str = "QUITTING";
pub const RESTART: &str = "RESTART";
pub const UNKNOWN: &str = "UNKNOWN";
