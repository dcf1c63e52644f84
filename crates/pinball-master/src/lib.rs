//! # Token Master
//!
//! The persistent, in-memory authority of the pinball platform.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MasterService                           │
//! │        (gRPC frontend, recovery gate, conversions)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ FIFO request queue
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Master actor                          │
//! │   (validate → persist → apply to index → reply, one at a    │
//! │    time; fresh versions from a persisted counter)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TokenStore                            │
//! │  (PostgreSQL: current_tokens, archived_tokens, counter)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Mutation is concentrated in one single-threaded actor over a
//! write-through store; the whole system is one atomic log of batches.

pub mod index;
pub mod master;
pub mod persistence;
pub mod service;

pub use index::TokenIndex;
pub use master::{Master, MasterConfig, MasterHandle};
pub use persistence::{InMemoryTokenStore, PostgresTokenStore, StoreError, TokenStore, WriteBatch};
pub use service::MasterService;
