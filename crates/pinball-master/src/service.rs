//! gRPC frontend for the master.
//!
//! The service is a thin boundary: convert, forward to the actor handle,
//! convert back. It watches the recovery state and answers a retryable
//! `Unavailable` until the actor is serving.

use tokio::sync::watch;
use tonic::{Request, Response, Status};

use pinball_core::{MasterError, TokenMaster};
use pinball_proto::proto::{
    ArchiveRequest, ArchiveResponse, GroupRequest, GroupResponse, ModifyRequest, ModifyResponse,
    QueryAndOwnRequest, QueryAndOwnResponse, QueryRequest, QueryResponse, TokenList,
};
use pinball_proto::{
    error_to_status, proto_to_query, proto_to_tokens, tokens_to_proto, TokenMasterService,
    TokenMasterServiceServer,
};

use crate::master::MasterHandle;

/// gRPC service implementation for the token master
pub struct MasterService {
    master: watch::Receiver<Option<MasterHandle>>,
}

impl MasterService {
    /// Create the service over the recovery-state watch. The sender side
    /// publishes the actor handle once recovery finishes.
    pub fn new(master: watch::Receiver<Option<MasterHandle>>) -> Self {
        Self { master }
    }

    /// Create a tonic server for this service
    pub fn into_server(self) -> TokenMasterServiceServer<Self> {
        TokenMasterServiceServer::new(self)
    }

    fn handle(&self) -> Result<MasterHandle, Status> {
        self.master
            .borrow()
            .clone()
            .ok_or_else(|| error_to_status(&MasterError::NotReady))
    }
}

#[tonic::async_trait]
impl TokenMasterService for MasterService {
    async fn group(
        &self,
        request: Request<GroupRequest>,
    ) -> Result<Response<GroupResponse>, Status> {
        let master = self.handle()?;
        let req = request.into_inner();
        let counts = master
            .group(&req.name_prefix, &req.group_suffix)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(GroupResponse {
            counts: counts.into_iter().collect(),
        }))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryResponse>, Status> {
        let master = self.handle()?;
        let queries = request
            .into_inner()
            .queries
            .into_iter()
            .map(proto_to_query)
            .collect();
        let results = master
            .query(queries)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(QueryResponse {
            results: results
                .into_iter()
                .map(|tokens| TokenList {
                    tokens: tokens_to_proto(tokens),
                })
                .collect(),
        }))
    }

    async fn modify(
        &self,
        request: Request<ModifyRequest>,
    ) -> Result<Response<ModifyResponse>, Status> {
        let master = self.handle()?;
        let req = request.into_inner();
        let written = master
            .modify(proto_to_tokens(req.updates), proto_to_tokens(req.deletes))
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(ModifyResponse {
            updates: tokens_to_proto(written),
        }))
    }

    async fn query_and_own(
        &self,
        request: Request<QueryAndOwnRequest>,
    ) -> Result<Response<QueryAndOwnResponse>, Status> {
        let master = self.handle()?;
        let req = request.into_inner();
        let query = req
            .query
            .map(proto_to_query)
            .ok_or_else(|| Status::invalid_argument("query is required"))?;
        let claimed = master
            .query_and_own(&req.owner, req.expiration_time, query)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(QueryAndOwnResponse {
            tokens: tokens_to_proto(claimed),
        }))
    }

    async fn archive(
        &self,
        request: Request<ArchiveRequest>,
    ) -> Result<Response<ArchiveResponse>, Status> {
        let master = self.handle()?;
        let tokens = proto_to_tokens(request.into_inner().tokens);
        master
            .archive(tokens)
            .await
            .map_err(|e| error_to_status(&e))?;
        Ok(Response::new(ArchiveResponse {}))
    }
}
