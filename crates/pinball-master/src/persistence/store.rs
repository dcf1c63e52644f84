//! TokenStore trait definition

use async_trait::async_trait;
use futures::stream::BoxStream;

use pinball_core::Token;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// A persisted row could not be decoded into a token
    #[error("corrupt row {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

/// One transactional unit of persistence.
///
/// The master assembles a batch per handled request: updated/inserted tokens
/// (versions already assigned), deleted names, tokens moving into the
/// archive namespace (already renamed), and the new version-counter value.
/// Either the whole batch commits or none of it does.
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Tokens to insert or overwrite in the current namespace.
    pub updates: Vec<Token>,

    /// Names to remove from the current namespace.
    pub deletes: Vec<String>,

    /// Tokens to insert into the archive namespace, already carrying their
    /// archive-side names.
    pub archives: Vec<Token>,

    /// Version counter value after this batch.
    pub last_version: i64,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty() && self.archives.is_empty()
    }
}

/// Durable write-through backing for the master.
///
/// `persist` is the master's durability barrier: the master must not mutate
/// its in-memory index, nor acknowledge a client, before it returns.
/// Archive rows are write-once and never read back by the master; the
/// archive read path serves UIs and other read-side clients.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Commit a batch transactionally and durably, then return.
    async fn persist(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Stream every current (non-archived) token, for memory rebuild at
    /// startup.
    fn load_all(&self) -> BoxStream<'_, Result<Token, StoreError>>;

    /// The persisted version counter, seeding the master's version source
    /// across restarts.
    async fn last_version(&self) -> Result<i64, StoreError>;

    /// Stream archived tokens under a name prefix. Read-side only.
    fn read_archive(&self, name_prefix: &str) -> BoxStream<'_, Result<Token, StoreError>>;
}
