//! # Pagewise
//!
//! Upload a document, let it be parsed and indexed in the background, then
//! chat with it. Answers stream token by token while a paginated local
//! history stays consistent with the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌──────────────┐
//! │ Storage  │──▶│   Ingestion    │──▶│    SQLite    │
//! │  fs/http │   │ parse + embed  │   │ docs/msgs/vec│
//! └──────────┘   └────────────────┘   └──────┬───────┘
//!                                            │
//!                     ┌──────────────────────┤
//!                     ▼                      ▼
//!              ┌─────────────┐       ┌──────────────┐
//!              │ HTTP server │◀─────▶│ Chat engine  │
//!              │  (axum)     │ stream│ (client side)│
//!              └─────────────┘       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Record store and vector index on SQLite |
//! | [`storage`] | Object storage for uploaded bytes |
//! | [`extract`] | Page-level text extraction |
//! | [`embedding`] | Embedding providers |
//! | [`ingest`] | The ingestion pipeline |
//! | [`status`] | Status projection and ownership checks |
//! | [`responder`] | Retrieval and streamed answering |
//! | [`reply`] | The send path: persist, stream, persist |
//! | [`chat`] | Chat synchronization engine |
//! | [`client`] | HTTP transport for the engine |
//! | [`server`] | HTTP API |

pub mod api;
pub mod chat;
pub mod client;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod reply;
pub mod responder;
pub mod server;
pub mod sqlite_store;
pub mod status;
pub mod storage;

pub use pagewise_core as core;
