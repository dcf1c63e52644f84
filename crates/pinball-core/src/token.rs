//! The token record and its ownership predicate.
//!
//! A token is the unit of state in the master: a unique hierarchical name, a
//! master-assigned version, an optional ownership lease, a claim priority and
//! an opaque payload. Everything else in the system is built from atomic
//! operations over these records.

use serde::{Deserialize, Serialize};

/// Reserved owner for tokens that must never be handed out by
/// `query_and_own`: waiting job tokens, event tokens and signal tokens are
/// all parked under this owner with an infinite lease.
pub const PARKED_OWNER: &str = "!parked";

/// Lease end marking a token as permanently unclaimable.
pub const INFINITE_EXPIRATION: i64 = i64::MAX;

/// The unit of state held by the master.
///
/// `version` is `None` only on insert requests; every live token carries a
/// master-assigned version that is unique across the master's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Unique, immutable, slash-separated hierarchical name.
    pub name: String,

    /// Master-assigned version; `None` on insert requests.
    pub version: Option<i64>,

    /// Lease holder; empty or unset means unowned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Lease end in Unix seconds; only meaningful together with `owner`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,

    /// Claim priority; higher is claimed first, ties break by name.
    #[serde(default)]
    pub priority: f64,

    /// Opaque payload, typically a JSON-serialized application record.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Token {
    /// A fresh unowned token ready for insertion.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            version: None,
            owner: None,
            expiration_time: None,
            priority: 0.0,
            data,
        }
    }

    /// A token parked under the reserved owner with an infinite lease, so it
    /// can never be returned by `query_and_own`.
    pub fn parked(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            owner: Some(PARKED_OWNER.to_string()),
            expiration_time: Some(INFINITE_EXPIRATION),
            ..Self::new(name, data)
        }
    }

    /// Set the priority, builder-style.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// A token is owned iff it has a non-empty owner whose lease has not yet
    /// expired at `now` (Unix seconds).
    pub fn is_owned(&self, now: i64) -> bool {
        let has_owner = self.owner.as_deref().is_some_and(|o| !o.is_empty());
        has_owner && self.expiration_time.is_some_and(|exp| exp > now)
    }

    /// A token is claimable iff it is not owned.
    pub fn is_claimable(&self, now: i64) -> bool {
        !self.is_owned(now)
    }

    /// Clear the ownership lease.
    pub fn release(&mut self) {
        self.owner = None;
        self.expiration_time = None;
    }

    /// Take the lease for `owner` until `expiration_time`.
    pub fn own(&mut self, owner: impl Into<String>, expiration_time: i64) {
        self.owner = Some(owner.into());
        self.expiration_time = Some(expiration_time);
    }

    /// Park the token under the reserved owner with an infinite lease.
    pub fn park(&mut self) {
        self.own(PARKED_OWNER, INFINITE_EXPIRATION);
    }
}
