use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::DeviceChannel;
use crate::storage::PersistedRecord;

/// Placeholder label until a device reports its own
pub const UNNAMED: &str = "unnamed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Unavailable,
    Available,
    Occupied,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Unavailable => "unavailable",
            TargetStatus::Available => "available",
            TargetStatus::Occupied => "occupied",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical device, addressed by a stable identity that survives
/// disconnects. `status == Unavailable` holds exactly when `connection` is
/// `None`; the handshake and disconnect paths in the registry maintain that
/// invariant, and `occupied` is only ever set through the orchestration API.
#[derive(Debug)]
pub struct RunTarget {
    pub identity: String,
    pub display_name: String,
    pub status: TargetStatus,
    pub connection: Option<DeviceChannel>,
    /// Registration order, used for stable listings
    pub seq: u64,
    pub registered_at: DateTime<Utc>,
}

impl RunTarget {
    /// First contact: a freshly identified, connected target.
    pub fn new(
        identity: String,
        display_name: Option<String>,
        connection: DeviceChannel,
        seq: u64,
    ) -> Self {
        Self {
            identity,
            display_name: display_name.unwrap_or_else(|| UNNAMED.to_string()),
            status: TargetStatus::Available,
            connection: Some(connection),
            seq,
            registered_at: Utc::now(),
        }
    }

    /// A known-but-disconnected target restored from the persistence store.
    pub fn from_record(record: PersistedRecord, seq: u64) -> Self {
        Self {
            identity: record.identity,
            display_name: record.display_name,
            status: TargetStatus::Unavailable,
            connection: None,
            seq,
            registered_at: record.registered_at,
        }
    }

    /// Transplant a live connection onto this target.
    pub fn attach(&mut self, connection: DeviceChannel) {
        self.connection = Some(connection);
        self.status = TargetStatus::Available;
    }

    /// Clear the connection; identity and durable fields are retained.
    pub fn detach(&mut self) {
        self.connection = None;
        self.status = TargetStatus::Unavailable;
    }

    /// Public projection published to observers and the HTTP API.
    pub fn info(&self) -> TargetInfo {
        TargetInfo {
            identity: Some(self.identity.clone()),
            display_name: self.display_name.clone(),
            status: self.status,
        }
    }

    /// Durable subset written to the persistence store.
    pub fn record(&self) -> PersistedRecord {
        PersistedRecord {
            identity: self.identity.clone(),
            display_name: self.display_name.clone(),
            registered_at: self.registered_at,
        }
    }
}

/// What observers see; `identity` is null for connections that have not
/// completed the handshake yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub identity: Option<String>,
    pub display_name: String,
    pub status: TargetStatus,
}
