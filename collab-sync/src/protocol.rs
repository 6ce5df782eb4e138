//! Binary wire protocol between sync clients and the server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message.
//! Messages are closed sum types, so adding a message kind is a compile-time
//! checked change on both ends.
//!
//! ```text
//! client                                   server
//!   │ ── Connect { document_key, token } ──► │  auth gate + registry resolve
//!   │ ◄── Authenticated { session_id, .. } ─ │
//!   │ ◄── SyncStep2(full state) ──────────── │
//!   │ ── Update(fragment) ─────────────────► │  merge, fan out to peers
//!   │ ◄── Update(fragment) ───────────────── │  (never echoed to its origin)
//!   │ ── SyncStep1(state vector) ──────────► │
//!   │ ◄── SyncStep2(diff) ────────────────── │
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest accepted `{entityType}:{entityId}` string.
pub const MAX_DOCUMENT_KEY_LEN: usize = 512;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on every connection.
    Connect {
        /// `{entityType}:{entityId}`; the tenant comes from the credential
        document_key: String,
        /// Bearer token; may instead travel in the query string or header
        token: Option<String>,
    },
    /// Incremental CRDT update fragment
    Update(Vec<u8>),
    /// Encoded state vector; asks for everything the client is missing
    SyncStep1(Vec<u8>),
    /// Application-level heartbeat
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Authentication succeeded; the session is attached to the document.
    Authenticated {
        session_id: Uuid,
        user_id: String,
        tenant_id: String,
        document_key: String,
    },
    /// Authentication failed; the connection closes right after.
    Unauthorized { reason: String },
    /// Full state (on join) or a diff against a client state vector
    SyncStep2(Vec<u8>),
    /// Fragment merged from another session on the same document
    Update(Vec<u8>),
    /// Reply to `ClientMessage::Ping`
    Pong,
    /// Non-fatal protocol complaint (malformed fragment, bad state vector)
    Error { reason: String },
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Fully-qualified document identity: `{tenant}:{entityType}:{entityId}`.
///
/// Clients only ever name `{entityType}:{entityId}`; the tenant is taken from
/// the authenticated identity so one tenant cannot address another's documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    tenant_id: String,
    entity_type: String,
    entity_id: String,
}

/// Rejected document keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentKeyError {
    #[error("document key must be of the form <entityType>:<entityId>")]
    MissingSeparator,
    #[error("document key has an empty {0}")]
    EmptyComponent(&'static str),
    #[error("document key exceeds {} bytes", MAX_DOCUMENT_KEY_LEN)]
    TooLong,
    #[error("document key contains control characters")]
    ControlCharacter,
    #[error("tenant id may not contain ':'")]
    InvalidTenant,
}

impl DocumentKey {
    /// Build a key from its parts.
    pub fn new(
        tenant_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Result<Self, DocumentKeyError> {
        let key = Self {
            tenant_id: tenant_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        };
        key.validate()?;
        Ok(key)
    }

    /// Parse a client-supplied `{entityType}:{entityId}` under `tenant_id`.
    ///
    /// Splits on the first `:`; the entity id may itself contain colons.
    pub fn from_client(tenant_id: &str, raw: &str) -> Result<Self, DocumentKeyError> {
        if raw.len() > MAX_DOCUMENT_KEY_LEN {
            return Err(DocumentKeyError::TooLong);
        }
        let (entity_type, entity_id) = raw
            .trim()
            .split_once(':')
            .ok_or(DocumentKeyError::MissingSeparator)?;
        Self::new(tenant_id, entity_type, entity_id)
    }

    fn validate(&self) -> Result<(), DocumentKeyError> {
        let parts = [
            ("tenant id", &self.tenant_id),
            ("entity type", &self.entity_type),
            ("entity id", &self.entity_id),
        ];
        for (name, value) in parts {
            if value.is_empty() {
                return Err(DocumentKeyError::EmptyComponent(name));
            }
            if value.chars().any(char::is_control) {
                return Err(DocumentKeyError::ControlCharacter);
            }
        }
        if self.tenant_id.contains(':') || self.entity_type.contains(':') {
            return Err(DocumentKeyError::InvalidTenant);
        }
        if self.entity_type.len() + self.entity_id.len() + 1 > MAX_DOCUMENT_KEY_LEN {
            return Err(DocumentKeyError::TooLong);
        }
        Ok(())
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The `{entityType}:{entityId}` form clients use.
    pub fn client_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.entity_type, self.entity_id)
    }
}
