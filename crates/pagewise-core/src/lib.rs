//! # Pagewise Core
//!
//! Runtime-agnostic logic for Pagewise: data models, the record store and
//! vector index contracts (plus an in-memory backend), the embedding trait,
//! and the pure pieces of the chat synchronization engine: the paginated
//! [`timeline::Timeline`] with its merge functions and the incremental
//! [`stream::ResponseFold`] over streamed response bytes.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! `pagewise` app crate wires these pieces to real collaborators.

pub mod embedding;
pub mod error;
pub mod models;
pub mod store;
pub mod stream;
pub mod timeline;
