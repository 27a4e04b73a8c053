use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DatabaseError;

/// Namespace a room mapping lives in. A remote room may have one mapping of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKind {
    Live,
    Historical,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::Live => "live",
            MappingKind::Historical => "historical",
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingKind {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "live" => Ok(MappingKind::Live),
            "historical" => Ok(MappingKind::Historical),
            other => Err(DatabaseError::Query(format!("unknown mapping kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMapping {
    pub id: i64,
    pub remote_room_id: String,
    pub matrix_room_id: String,
    pub kind: MappingKind,
    pub created_at: DateTime<Utc>,
}

impl RoomMapping {
    pub fn new(remote_room_id: &str, matrix_room_id: &str, kind: MappingKind) -> Self {
        Self {
            id: 0,
            remote_room_id: remote_room_id.to_string(),
            matrix_room_id: matrix_room_id.to_string(),
            kind,
            created_at: Utc::now(),
        }
    }
}

/// A Matrix ghost user the bridge registered on behalf of a remote user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualUser {
    pub id: i64,
    pub remote_user_id: String,
    pub matrix_user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
