//! The single-threaded token authority.
//!
//! All requests are serialized into one FIFO queue and handled to
//! completion, one at a time. A handler has exactly one suspension point,
//! the call to `TokenStore::persist`; the in-memory index is mutated only
//! after persist returns, so clients never observe unacknowledged state and
//! a restart recovers exactly the acknowledged history.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use pinball_core::{name, Clock, MasterError, Token, TokenMaster, TokenQuery};

use crate::index::TokenIndex;
use crate::persistence::{StoreError, TokenStore, WriteBatch};

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Depth of the FIFO request queue feeding the actor.
    pub request_queue_depth: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            request_queue_depth: 128,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, MasterError>>;

enum Request {
    Group {
        name_prefix: String,
        group_suffix: String,
        reply: Reply<BTreeMap<String, u64>>,
    },
    Query {
        queries: Vec<TokenQuery>,
        reply: Reply<Vec<Vec<Token>>>,
    },
    Modify {
        updates: Vec<Token>,
        deletes: Vec<Token>,
        reply: Reply<Vec<Token>>,
    },
    QueryAndOwn {
        owner: String,
        expiration_time: i64,
        query: TokenQuery,
        reply: Reply<Vec<Token>>,
    },
    Archive {
        tokens: Vec<Token>,
        reply: Reply<()>,
    },
}

/// The token authority: an in-memory index over a write-through store.
pub struct Master {
    index: TokenIndex,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    last_version: i64,
}

impl Master {
    /// Rebuild the in-memory index from the store and seed the version
    /// counter. The master answers no requests until this completes.
    pub async fn recover(
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let mut index = TokenIndex::new();
        let mut max_token_version = 0;

        let mut tokens = store.load_all();
        while let Some(token) = tokens.next().await {
            let token = token?;
            max_token_version = max_token_version.max(token.version.unwrap_or(0));
            index.insert(token);
        }
        drop(tokens);

        let last_version = store.last_version().await?.max(max_token_version);
        info!(tokens = index.len(), last_version, "master recovered");

        Ok(Self {
            index,
            store,
            clock,
            last_version,
        })
    }

    /// Start the actor; the returned handle is the only way in.
    pub fn spawn(self, config: MasterConfig) -> (MasterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.request_queue_depth);
        let join = tokio::spawn(self.run(rx));
        (MasterHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            if let Err(e) = self.handle(request).await {
                // A failed persist leaves the store's state unknowable from
                // here; fail-stop rather than serve state we cannot prove
                // durable.
                error!(error = %e, "persist failed, master stopping");
                return;
            }
        }
        info!("master request queue closed, exiting");
    }

    async fn handle(&mut self, request: Request) -> Result<(), StoreError> {
        match request {
            Request::Group {
                name_prefix,
                group_suffix,
                reply,
            } => {
                let _ = reply.send(Ok(self.group(&name_prefix, &group_suffix)));
                Ok(())
            }
            Request::Query { queries, reply } => {
                let _ = reply.send(Ok(self.query(&queries)));
                Ok(())
            }
            Request::Modify {
                updates,
                deletes,
                reply,
            } => self.apply(reply, |m| m.modify(updates, deletes)).await,
            Request::QueryAndOwn {
                owner,
                expiration_time,
                query,
                reply,
            } => {
                self.apply(reply, |m| m.query_and_own(owner, expiration_time, query))
                    .await
            }
            Request::Archive { tokens, reply } => {
                self.apply(reply, |m| m.archive(tokens)).await
            }
        }
    }

    /// Run a mutating operation: validate, persist, then apply to the index
    /// and reply. A store error is returned for fail-stop after answering
    /// the caller with UNKNOWN.
    async fn apply<T>(
        &mut self,
        reply: Reply<T>,
        op: impl FnOnce(&mut Self) -> Result<(WriteBatch, Applied, T), MasterError>,
    ) -> Result<(), StoreError> {
        match op(self) {
            Err(e) => {
                let _ = reply.send(Err(e));
                Ok(())
            }
            Ok((batch, applied, result)) => {
                if !batch.is_empty() {
                    if let Err(e) = self.store.persist(batch).await {
                        let _ = reply.send(Err(MasterError::unknown(format!(
                            "persistence failure: {e}"
                        ))));
                        return Err(e);
                    }
                }
                applied.commit(&mut self.index);
                let _ = reply.send(Ok(result));
                Ok(())
            }
        }
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    fn group(&self, name_prefix: &str, group_suffix: &str) -> BTreeMap<String, u64> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for token in self.index.scan_prefix(name_prefix) {
            let rest = &token.name[name_prefix.len()..];
            let group = if group_suffix.is_empty() {
                rest
            } else {
                match rest.find(group_suffix) {
                    Some(pos) => &rest[..pos + group_suffix.len()],
                    None => rest,
                }
            };
            *counts.entry(group.to_string()).or_default() += 1;
        }
        counts
    }

    fn query(&self, queries: &[TokenQuery]) -> Vec<Vec<Token>> {
        queries
            .iter()
            .map(|q| {
                self.index
                    .scan_prefix(&q.name_prefix)
                    .take(q.max_tokens)
                    .cloned()
                    .collect()
            })
            .collect()
    }

    // ========================================================================
    // Mutating operations
    // ========================================================================

    fn modify(
        &mut self,
        updates: Vec<Token>,
        deletes: Vec<Token>,
    ) -> Result<(WriteBatch, Applied, Vec<Token>), MasterError> {
        let mut seen = HashSet::new();
        for token in updates.iter().chain(deletes.iter()) {
            if token.name.is_empty() {
                return Err(MasterError::input("token name must not be empty"));
            }
            if !seen.insert(token.name.as_str()) {
                return Err(MasterError::input(format!(
                    "token named more than once in batch: {}",
                    token.name
                )));
            }
        }

        // All preconditions are checked before any mutation.
        for token in &updates {
            if !token.priority.is_finite() {
                return Err(MasterError::input(format!(
                    "priority of {} is not finite",
                    token.name
                )));
            }
            let held = self.index.get(&token.name).and_then(|t| t.version);
            match (token.version, held) {
                // Versioned update must match the held version exactly.
                (Some(v), Some(h)) if v == h => {}
                (Some(v), h) => {
                    return Err(MasterError::conflict(&token.name, Some(v), h));
                }
                // Insert must not collide with an existing token: someone
                // inserted it first, so this is a conflict, not input error.
                (None, Some(h)) => {
                    return Err(MasterError::conflict(&token.name, None, Some(h)));
                }
                (None, None) => {}
            }
        }
        for token in &deletes {
            let version = token.version.ok_or_else(|| {
                MasterError::input(format!("delete of {} must supply a version", token.name))
            })?;
            match self.index.get(&token.name).and_then(|t| t.version) {
                None => return Err(MasterError::NotFound(token.name.clone())),
                Some(h) if h != version => {
                    return Err(MasterError::conflict(&token.name, Some(version), Some(h)));
                }
                Some(_) => {}
            }
        }

        let written: Vec<Token> = updates
            .into_iter()
            .map(|mut token| {
                token.version = Some(self.next_version());
                token
            })
            .collect();
        let deleted: Vec<String> = deletes.into_iter().map(|t| t.name).collect();

        let batch = WriteBatch {
            updates: written.clone(),
            deletes: deleted.clone(),
            archives: vec![],
            last_version: self.last_version,
        };
        debug!(
            updates = written.len(),
            deletes = deleted.len(),
            "modify validated"
        );
        let applied = Applied {
            written: written.clone(),
            deleted,
        };
        Ok((batch, applied, written))
    }

    fn query_and_own(
        &mut self,
        owner: String,
        expiration_time: i64,
        query: TokenQuery,
    ) -> Result<(WriteBatch, Applied, Vec<Token>), MasterError> {
        if owner.is_empty() {
            return Err(MasterError::input("owner must not be empty"));
        }
        let now = self.clock.now();
        if expiration_time <= now {
            return Err(MasterError::input(format!(
                "expiration time {expiration_time} is not in the future (now {now})"
            )));
        }

        // Claimability is evaluated at request-handle time; ranking is
        // priority first, name as the tie-break.
        let mut candidates: Vec<Token> = self
            .index
            .scan_prefix(&query.name_prefix)
            .filter(|t| t.is_claimable(now))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates.truncate(query.max_tokens);

        let claimed: Vec<Token> = candidates
            .into_iter()
            .map(|mut token| {
                token.own(owner.clone(), expiration_time);
                token.version = Some(self.next_version());
                token
            })
            .collect();

        debug!(owner = %owner, claimed = claimed.len(), "query_and_own");
        let batch = WriteBatch {
            updates: claimed.clone(),
            deletes: vec![],
            archives: vec![],
            last_version: self.last_version,
        };
        let applied = Applied {
            written: claimed.clone(),
            deleted: vec![],
        };
        Ok((batch, applied, claimed))
    }

    fn archive(
        &mut self,
        tokens: Vec<Token>,
    ) -> Result<(WriteBatch, Applied, ()), MasterError> {
        // The archived content is the live token, renamed; nothing moves if
        // any precondition fails.
        let mut seen = HashSet::new();
        let mut archives = Vec::with_capacity(tokens.len());
        for token in &tokens {
            if !seen.insert(token.name.as_str()) {
                return Err(MasterError::input(format!(
                    "token named more than once in batch: {}",
                    token.name
                )));
            }
            let version = token.version.ok_or_else(|| {
                MasterError::input(format!("archive of {} must supply a version", token.name))
            })?;
            let live = self
                .index
                .get(&token.name)
                .ok_or_else(|| MasterError::NotFound(token.name.clone()))?;
            if live.version != Some(version) {
                return Err(MasterError::conflict(&token.name, Some(version), live.version));
            }
            let mut archived = live.clone();
            archived.name = name::archived(&token.name);
            archives.push(archived);
        }

        let deleted: Vec<String> = tokens.into_iter().map(|t| t.name).collect();
        debug!(tokens = deleted.len(), "archive validated");
        let batch = WriteBatch {
            updates: vec![],
            deletes: deleted.clone(),
            archives,
            last_version: self.last_version,
        };
        let applied = Applied {
            written: vec![],
            deleted,
        };
        Ok((batch, applied, ()))
    }

    fn next_version(&mut self) -> i64 {
        self.last_version += 1;
        self.last_version
    }
}

/// Index mutations held back until persist succeeds.
struct Applied {
    written: Vec<Token>,
    deleted: Vec<String>,
}

impl Applied {
    fn commit(self, index: &mut TokenIndex) {
        for name in &self.deleted {
            index.remove(name);
        }
        for token in self.written {
            index.insert(token);
        }
    }
}

/// Clonable handle feeding the master's FIFO queue.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<Request>,
}

impl MasterHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, MasterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| MasterError::unknown("master unavailable"))?;
        rx.await
            .map_err(|_| MasterError::unknown("master unavailable"))?
    }
}

#[async_trait]
impl TokenMaster for MasterHandle {
    #[instrument(skip(self))]
    async fn group(
        &self,
        name_prefix: &str,
        group_suffix: &str,
    ) -> Result<BTreeMap<String, u64>, MasterError> {
        let (name_prefix, group_suffix) = (name_prefix.to_string(), group_suffix.to_string());
        self.call(|reply| Request::Group {
            name_prefix,
            group_suffix,
            reply,
        })
        .await
    }

    async fn query(&self, queries: Vec<TokenQuery>) -> Result<Vec<Vec<Token>>, MasterError> {
        self.call(|reply| Request::Query { queries, reply }).await
    }

    async fn modify(
        &self,
        updates: Vec<Token>,
        deletes: Vec<Token>,
    ) -> Result<Vec<Token>, MasterError> {
        self.call(|reply| Request::Modify {
            updates,
            deletes,
            reply,
        })
        .await
    }

    async fn query_and_own(
        &self,
        owner: &str,
        expiration_time: i64,
        query: TokenQuery,
    ) -> Result<Vec<Token>, MasterError> {
        let owner = owner.to_string();
        self.call(|reply| Request::QueryAndOwn {
            owner,
            expiration_time,
            query,
            reply,
        })
        .await
    }

    async fn archive(&self, tokens: Vec<Token>) -> Result<(), MasterError> {
        self.call(|reply| Request::Archive { tokens, reply }).await
    }
}
