//! Durable write-through persistence for the master.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTokenStore;
pub use postgres::PostgresTokenStore;
pub use store::{StoreError, TokenStore, WriteBatch};
