//! Connection manager
//!
//! Bounded registry of named connection records. It does not own peers or
//! protocol clients; the host reports state into it and observes changes
//! through callbacks or the [`EventBus`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::webrtc::PeerState;

/// `(connection_id, state)`
pub type ConnectionStateCallback = Arc<dyn Fn(&str, PeerState) + Send + Sync>;
/// `(connection_id, message)`
pub type ConnectionErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionManagerConfig {
    /// Maximum concurrent connections (at least 1)
    pub max_connections: usize,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self { max_connections: 8 }
    }
}

impl ConnectionManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(BridgeError::InvalidArgument(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub name: String,
    pub server_url: String,
    pub state: PeerState,
    /// Unix time of creation (ms)
    pub created_at_ms: i64,
}

/// Bounded set of connection records
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    /// Insertion order
    connections: Mutex<Vec<ConnectionRecord>>,
    on_state: Option<ConnectionStateCallback>,
    on_error: Option<ConnectionErrorCallback>,
    events: Option<Arc<EventBus>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connections: Mutex::new(Vec::new()),
            on_state: None,
            on_error: None,
            events: None,
        })
    }

    pub fn with_state_callback(mut self, on_state: ConnectionStateCallback) -> Self {
        self.on_state = Some(on_state);
        self
    }

    pub fn with_error_callback(mut self, on_error: ConnectionErrorCallback) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Publish lifecycle events on `events`
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, event: BridgeEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }

    /// Register a connection and return its id
    pub fn create_connection(&self, server_url: &str, name: &str) -> Result<String> {
        let record = {
            let mut connections = self.connections.lock();
            if connections.len() >= self.config.max_connections {
                return Err(BridgeError::ResourceExhausted(format!(
                    "Maximum connections ({}) reached",
                    self.config.max_connections
                )));
            }

            let record = ConnectionRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                server_url: server_url.to_string(),
                state: PeerState::New,
                created_at_ms: chrono::Utc::now().timestamp_millis(),
            };
            connections.push(record.clone());
            record
        };

        info!(
            "Connection created: {} ({} -> {})",
            record.id, record.name, record.server_url
        );
        let id = record.id.clone();
        self.publish(BridgeEvent::ConnectionCreated {
            id: record.id,
            name: record.name,
            server_url: record.server_url,
        });
        Ok(id)
    }

    /// Remove a connection; `false` if the id is unknown
    pub fn remove_connection(&self, id: &str) -> bool {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.iter().position(|c| c.id == id) {
                Some(index) => {
                    connections.remove(index);
                    true
                }
                None => false,
            }
        };

        if removed {
            info!("Connection removed: {}", id);
            self.publish(BridgeEvent::ConnectionRemoved { id: id.to_string() });
        }
        removed
    }

    pub fn remove_all_connections(&self) {
        let removed: Vec<ConnectionRecord> = std::mem::take(&mut *self.connections.lock());
        if !removed.is_empty() {
            info!("Removed all {} connections", removed.len());
        }
        for record in removed {
            self.publish(BridgeEvent::ConnectionRemoved { id: record.id });
        }
    }

    pub fn connection_info(&self, id: &str) -> Result<ConnectionRecord> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("connection {}", id)))
    }

    /// Snapshot of every record, in insertion order
    pub fn all_connections(&self) -> Vec<ConnectionRecord> {
        self.connections.lock().clone()
    }

    /// Record a state change and notify
    pub fn update_connection_state(&self, id: &str, state: PeerState) -> Result<()> {
        {
            let mut connections = self.connections.lock();
            let record = connections
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| BridgeError::NotFound(format!("connection {}", id)))?;
            record.state = state;
        }

        debug!("Connection {} state: {}", id, state);
        if let Some(ref on_state) = self.on_state {
            on_state(id, state);
        }
        self.publish(BridgeEvent::ConnectionStateChanged {
            id: id.to_string(),
            state,
        });
        Ok(())
    }

    /// Forward an error for `id`; the record is left untouched
    pub fn report_error(&self, id: &str, message: &str) {
        warn!("Connection {} error: {}", id, message);
        if let Some(ref on_error) = self.on_error {
            on_error(id, message);
        }
        self.publish(BridgeEvent::ConnectionError {
            id: id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn has_available_slots(&self) -> bool {
        self.connection_count() < self.config.max_connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }
}
