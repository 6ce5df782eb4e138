//! # collab-sync: real-time collaborative document sync
//!
//! Multi-tenant WebSocket server that merges concurrent edits to shared
//! documents with a CRDT and persists the merged state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per user)  │     Binary Proto    │  session task per connection │
//! └─────────────┘                     └──────┬───────────────────────┘
//!                                            │ AuthGate (token -> tenant)
//!                                            ▼
//!                                     ┌──────────────────┐
//!                                     │ DocumentRegistry │  refcounted, flush on last detach
//!                                     └──────┬───────────┘
//!                                            ▼
//!                                     ┌──────────────────┐     ┌───────────────┐
//!                                     │ Document (Yrs)   │ ──► │ SnapshotStore │
//!                                     │ + BroadcastGroup │     │ RocksDB/memory│
//!                                     └──────────────────┘     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol and document keys
//! - [`auth`]: Token extraction and verification
//! - [`storage`]: Snapshot and journal persistence
//! - [`document`]: CRDT merge engine for one document
//! - [`broadcast`]: Per-document fan-out excluding the origin
//! - [`registry`]: Live document map with drain-on-last-detach
//! - [`session`]: Per-connection state machine
//! - [`lifecycle`]: Graceful shutdown
//! - [`server`]: Accept loop and process hooks
//! - [`client`]: WebSocket sync client with offline queue

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, AuthGate, Claims, Identity, JwtVerifier, StaticTokenVerifier, TokenVerifier};
pub use broadcast::BroadcastGroup;
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent, TokenPlacement};
pub use config::ServerConfig;
pub use document::{ApplyOutcome, Document, MergeError};
pub use lifecycle::{Lifecycle, ShutdownReport};
pub use protocol::{ClientMessage, DocumentKey, ProtocolError, ServerMessage};
pub use registry::{DocumentHandle, DocumentRegistry};
pub use server::{ServerError, SyncServer};
pub use stats::ServerStats;
pub use storage::{MemoryStore, RocksStore, SnapshotRecord, SnapshotStore, StorageError, StoreConfig};
