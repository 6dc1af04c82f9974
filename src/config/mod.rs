//! Bridge configuration
//!
//! [`BridgeConfig`] is read from a JSON file once at startup; every section
//! falls back to its defaults when absent.

mod schema;
mod store;

pub use schema::{BridgeConfig, P2PSettings};
pub use store::{
    apply_env_overrides, ConfigChange, ConfigStore, MAX_CONNECTIONS_ENV, STUN_SERVERS_ENV,
};
