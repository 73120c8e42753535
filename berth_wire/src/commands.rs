//! Command names: the textual wire contract.
//!
//! Dispatch inside the client is by static table (see `berth::reactor`), but
//! the strings themselves are what travels on the wire and what the broker
//! matches on.

// Sent by the client.
pub const UPLOAD_REQUIREMENTS: &str = "upload_requirements";
pub const UPLOAD: &str = "upload";
pub const SPAWN_CONTAINER: &str = "spawn_container";
pub const DESTROY_CONTAINER: &str = "destroy_container";
pub const SPAWN_PROCESS: &str = "spawn_process";
pub const STDIN_PROCESS: &str = "stdin_process";
pub const DESTROY_PROCESS: &str = "destroy_process";
pub const FETCH: &str = "fetch";
pub const PUT: &str = "put";
pub const FETCH_LOG: &str = "fetch_log";
pub const ALLOW_CONNECTION: &str = "allow_connection";
pub const DISALLOW_CONNECTION: &str = "disallow_connection";
pub const CREATE_TUNNEL: &str = "create_tunnel";
pub const DESTROY_TUNNEL: &str = "destroy_tunnel";
pub const TO_PROXY: &str = "to_proxy";

// Sent by the broker.
pub const RESOURCE_OFFER: &str = "resource_offer";
pub const TUNNEL_UP: &str = "tunnel_up";
pub const FROM_PROXY: &str = "from_proxy";
pub const LOG: &str = "log";
pub const KICKED: &str = "kicked";

// Sent by either end: the broker closes one proxied TCP connection, or the
// client reports that its local end went away.
pub const CLOSE_PROXY: &str = "close_proxy";

/// The params key a failed operation's reply carries instead of a result.
pub const EXCEPTION: &str = "exception";
