use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Kind of row change captured by the queue triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Statement {
    Insert,
    Update,
    Delete,
    Snapshot,
}

impl Statement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statement::Insert => "INSERT",
            Statement::Update => "UPDATE",
            Statement::Delete => "DELETE",
            Statement::Snapshot => "SNAPSHOT",
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Statement::Insert),
            "UPDATE" => Ok(Statement::Update),
            "DELETE" => Ok(Statement::Delete),
            "SNAPSHOT" => Ok(Statement::Snapshot),
            other => Err(format!("unknown statement '{}'", other)),
        }
    }
}

/// Opaque identifier of the source row, used as the message key.
///
/// Serialized as a JSON string. Bytes that are not valid UTF-8 cannot be
/// represented in the payload and fail serialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExternalId(Bytes);

impl ExternalId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for ExternalId {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl Serialize for ExternalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = std::str::from_utf8(&self.0).map_err(|e| {
            serde::ser::Error::custom(format!("external_id is not valid UTF-8: {}", e))
        })?;
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self(Bytes::from(s)))
    }
}

/// One captured row change, as stored in the outbound event queue.
///
/// `id`, `table_name` and `processed` are queue bookkeeping and never appear
/// in the published payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip)]
    pub id: i64,
    pub uuid: String,
    pub external_id: Option<ExternalId>,
    #[serde(skip)]
    pub table_name: String,
    pub statement: Statement,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub processed: bool,
}

impl Event {
    /// Message key: the external id bytes, empty when the row has none.
    pub fn key(&self) -> &[u8] {
        self.external_id
            .as_ref()
            .map(ExternalId::as_bytes)
            .unwrap_or_default()
    }
}
