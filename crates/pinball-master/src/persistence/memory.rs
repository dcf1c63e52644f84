//! In-memory implementation of TokenStore for testing

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::RwLock;

use pinball_core::Token;

use super::store::*;

/// In-memory implementation of TokenStore
///
/// This is primarily for tests and local development. It provides the same
/// semantics as the PostgreSQL implementation — batches apply atomically,
/// archive rows are write-once — without the durability.
///
/// A master restarted against the same store instance recovers the state it
/// acknowledged, which is what the durability tests exercise.
#[derive(Default)]
pub struct InMemoryTokenStore {
    current: RwLock<BTreeMap<String, Token>>,
    archived: RwLock<BTreeMap<String, Token>>,
    last_version: RwLock<i64>,
}

impl InMemoryTokenStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of current tokens
    pub fn current_count(&self) -> usize {
        self.current.read().len()
    }

    /// Number of archived tokens
    pub fn archived_count(&self) -> usize {
        self.archived.read().len()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn persist(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut current = self.current.write();
        let mut archived = self.archived.write();

        // Archive rows are write-once; reject the whole batch up front so a
        // failure leaves no partial state, like a rolled-back transaction.
        for token in &batch.archives {
            if archived.contains_key(&token.name) {
                return Err(StoreError::Database(format!(
                    "archived token already exists: {}",
                    token.name
                )));
            }
        }

        for token in batch.updates {
            current.insert(token.name.clone(), token);
        }
        for name in &batch.deletes {
            current.remove(name);
        }
        for token in batch.archives {
            archived.insert(token.name.clone(), token);
        }
        *self.last_version.write() = batch.last_version;
        Ok(())
    }

    fn load_all(&self) -> BoxStream<'_, Result<Token, StoreError>> {
        let tokens: Vec<_> = self.current.read().values().cloned().collect();
        stream::iter(tokens.into_iter().map(Ok)).boxed()
    }

    async fn last_version(&self) -> Result<i64, StoreError> {
        Ok(*self.last_version.read())
    }

    fn read_archive(&self, name_prefix: &str) -> BoxStream<'_, Result<Token, StoreError>> {
        let tokens: Vec<_> = self
            .archived
            .read()
            .range(name_prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(name_prefix))
            .map(|(_, token)| token.clone())
            .collect();
        stream::iter(tokens.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn token(name: &str, version: i64) -> Token {
        Token {
            version: Some(version),
            ..Token::new(name, b"x".to_vec())
        }
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = InMemoryTokenStore::new();
        store
            .persist(WriteBatch {
                updates: vec![token("/a", 1), token("/b", 2)],
                last_version: 2,
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded: Vec<Token> = store.load_all().try_collect().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(store.last_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_archive_is_write_once() {
        let store = InMemoryTokenStore::new();
        let batch = |version| WriteBatch {
            archives: vec![token("/__ARCHIVE__/a", version)],
            last_version: version,
            ..Default::default()
        };

        store.persist(batch(1)).await.unwrap();
        let err = store.persist(batch(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        // The failed batch left no trace.
        assert_eq!(store.last_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_archive_by_prefix() {
        let store = InMemoryTokenStore::new();
        store
            .persist(WriteBatch {
                archives: vec![
                    token("/__ARCHIVE__/workflow/w/i1/a", 1),
                    token("/__ARCHIVE__/workflow/w/i2/b", 2),
                ],
                last_version: 2,
                ..Default::default()
            })
            .await
            .unwrap();

        let hits: Vec<Token> = store
            .read_archive("/__ARCHIVE__/workflow/w/i1/")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "/__ARCHIVE__/workflow/w/i1/a");
    }
}
