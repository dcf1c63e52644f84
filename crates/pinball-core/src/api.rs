//! The client-facing master API.
//!
//! `TokenMaster` is the seam between the workflow runtime and the transport:
//! the master crate implements it on its in-process handle, the worker crate
//! implements it on the gRPC client, and everything above (workers, the
//! scheduler, tests) is written against the trait.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::MasterError;
use crate::token::Token;

/// A prefix query with a result cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenQuery {
    /// Tokens whose name starts with this prefix match.
    pub name_prefix: String,

    /// At most this many tokens are returned, ascending by name.
    pub max_tokens: usize,
}

impl TokenQuery {
    pub fn new(name_prefix: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            max_tokens,
        }
    }
}

/// The five atomic operations of the token master.
#[async_trait]
pub trait TokenMaster: Send + Sync {
    /// Count tokens under `name_prefix`, grouped by the substring after the
    /// prefix up to and including the first `group_suffix` occurrence (the
    /// whole remainder when the suffix is absent).
    async fn group(
        &self,
        name_prefix: &str,
        group_suffix: &str,
    ) -> Result<BTreeMap<String, u64>, MasterError>;

    /// Run prefix queries; results preserve query order, each ascending by
    /// name and capped at the query's `max_tokens`.
    async fn query(&self, queries: Vec<TokenQuery>) -> Result<Vec<Vec<Token>>, MasterError>;

    /// Atomically apply a batch of inserts/updates and deletes. Updates with
    /// a version must match it exactly; updates without a version are
    /// inserts and must not collide; deletes must name the current version.
    /// Returns the written tokens with their freshly assigned versions, in
    /// input order.
    async fn modify(
        &self,
        updates: Vec<Token>,
        deletes: Vec<Token>,
    ) -> Result<Vec<Token>, MasterError>;

    /// Atomically claim up to `max_tokens` claimable tokens under the
    /// query's prefix, ordered by (priority descending, name ascending),
    /// leasing each to `owner` until `expiration_time`. An empty result is
    /// a valid answer.
    async fn query_and_own(
        &self,
        owner: &str,
        expiration_time: i64,
        query: TokenQuery,
    ) -> Result<Vec<Token>, MasterError>;

    /// Atomically move the given tokens (which must exist at the supplied
    /// versions) into the archive namespace.
    async fn archive(&self, tokens: Vec<Token>) -> Result<(), MasterError>;
}
