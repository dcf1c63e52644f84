//! gRPC client for the token master.
//!
//! A thin typed wrapper: convert, call, convert back. Implements the
//! `TokenMaster` trait so the runtime is transport-agnostic.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::info;

use pinball_core::{MasterError, Token, TokenMaster, TokenQuery};

use crate::proto::{ArchiveRequest, GroupRequest, ModifyRequest, QueryAndOwnRequest, QueryRequest};
use crate::{
    proto_to_tokens, query_to_proto, status_to_error, tokens_to_proto, TokenMasterServiceClient,
};

/// Client for the master's gRPC service
#[derive(Clone)]
pub struct MasterClient {
    inner: TokenMasterServiceClient<Channel>,
}

impl MasterClient {
    /// Connect to a master at `host:port`
    pub async fn connect(addr: &str) -> Result<Self, MasterError> {
        let endpoint = format!("http://{addr}");
        info!(%endpoint, "connecting to master");
        let inner = TokenMasterServiceClient::connect(endpoint)
            .await
            .map_err(|e| MasterError::unknown(format!("failed to connect to master: {e}")))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl TokenMaster for MasterClient {
    async fn group(
        &self,
        name_prefix: &str,
        group_suffix: &str,
    ) -> Result<BTreeMap<String, u64>, MasterError> {
        let mut client = self.inner.clone();
        let response = client
            .group(GroupRequest {
                name_prefix: name_prefix.to_string(),
                group_suffix: group_suffix.to_string(),
            })
            .await
            .map_err(|s| status_to_error(&s))?;
        Ok(response.into_inner().counts.into_iter().collect())
    }

    async fn query(&self, queries: Vec<TokenQuery>) -> Result<Vec<Vec<Token>>, MasterError> {
        let mut client = self.inner.clone();
        let response = client
            .query(QueryRequest {
                queries: queries.into_iter().map(query_to_proto).collect(),
            })
            .await
            .map_err(|s| status_to_error(&s))?;
        Ok(response
            .into_inner()
            .results
            .into_iter()
            .map(|list| proto_to_tokens(list.tokens))
            .collect())
    }

    async fn modify(
        &self,
        updates: Vec<Token>,
        deletes: Vec<Token>,
    ) -> Result<Vec<Token>, MasterError> {
        let mut client = self.inner.clone();
        let response = client
            .modify(ModifyRequest {
                updates: tokens_to_proto(updates),
                deletes: tokens_to_proto(deletes),
            })
            .await
            .map_err(|s| status_to_error(&s))?;
        Ok(proto_to_tokens(response.into_inner().updates))
    }

    async fn query_and_own(
        &self,
        owner: &str,
        expiration_time: i64,
        query: TokenQuery,
    ) -> Result<Vec<Token>, MasterError> {
        let mut client = self.inner.clone();
        let response = client
            .query_and_own(QueryAndOwnRequest {
                owner: owner.to_string(),
                expiration_time,
                query: Some(query_to_proto(query)),
            })
            .await
            .map_err(|s| status_to_error(&s))?;
        Ok(proto_to_tokens(response.into_inner().tokens))
    }

    async fn archive(&self, tokens: Vec<Token>) -> Result<(), MasterError> {
        let mut client = self.inner.clone();
        client
            .archive(ArchiveRequest {
                tokens: tokens_to_proto(tokens),
            })
            .await
            .map_err(|s| status_to_error(&s))?;
        Ok(())
    }
}
