// Wire protocol for master <-> client communication
//
// Decision: gRPC with tonic; the proto is the transport layer, the
// pinball-core types remain the source of truth
// Decision: typed errors travel as a prost-encoded MasterError in the status
// details, with a deterministic status-code mapping for clients that only
// look at codes

use prost::Message;
use tonic::{Code, Status};

use pinball_core::{MasterError, Token, TokenQuery};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("pinball.master");
}

pub mod client;

// Re-export for convenience
pub use client::MasterClient;
pub use proto::token_master_service_client::TokenMasterServiceClient;
pub use proto::token_master_service_server::{TokenMasterService, TokenMasterServiceServer};

// ============================================================================
// Token conversions
// ============================================================================

/// Convert a core token to its wire form.
pub fn token_to_proto(token: Token) -> proto::Token {
    proto::Token {
        version: token.version,
        name: token.name,
        owner: token.owner,
        expiration_time: token.expiration_time,
        priority: token.priority,
        data: token.data,
    }
}

/// Convert a wire token to its core form.
pub fn proto_to_token(token: proto::Token) -> Token {
    Token {
        name: token.name,
        version: token.version,
        owner: token.owner,
        expiration_time: token.expiration_time,
        priority: token.priority,
        data: token.data,
    }
}

pub fn tokens_to_proto(tokens: Vec<Token>) -> Vec<proto::Token> {
    tokens.into_iter().map(token_to_proto).collect()
}

pub fn proto_to_tokens(tokens: Vec<proto::Token>) -> Vec<Token> {
    tokens.into_iter().map(proto_to_token).collect()
}

/// Convert a core query to its wire form.
pub fn query_to_proto(query: TokenQuery) -> proto::TokenQuery {
    proto::TokenQuery {
        name_prefix: query.name_prefix,
        max_tokens: query.max_tokens as u32,
    }
}

/// Convert a wire query to its core form.
pub fn proto_to_query(query: proto::TokenQuery) -> TokenQuery {
    TokenQuery {
        name_prefix: query.name_prefix,
        max_tokens: query.max_tokens as usize,
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn wire_parts(err: &MasterError) -> (proto::ErrorCode, String) {
    match err {
        MasterError::VersionConflict(msg) => (proto::ErrorCode::VersionConflict, msg.clone()),
        MasterError::NotFound(name) => (proto::ErrorCode::NotFound, name.clone()),
        MasterError::Input(msg) => (proto::ErrorCode::InputError, msg.clone()),
        MasterError::NotReady | MasterError::Unknown(_) => {
            (proto::ErrorCode::Unknown, err.to_string())
        }
    }
}

fn status_code(err: &MasterError) -> Code {
    match err {
        MasterError::VersionConflict(_) => Code::Aborted,
        MasterError::NotFound(_) => Code::NotFound,
        MasterError::Input(_) => Code::InvalidArgument,
        MasterError::NotReady => Code::Unavailable,
        MasterError::Unknown(_) => Code::Internal,
    }
}

/// Encode a master error into a `tonic::Status` carrying the typed error in
/// its details.
pub fn error_to_status(err: &MasterError) -> Status {
    if matches!(err, MasterError::NotReady) {
        // Not part of the wire taxonomy: a plain retryable Unavailable.
        return Status::unavailable(err.to_string());
    }
    let (error_code, error_message) = wire_parts(err);
    let details = proto::MasterError {
        error_code: error_code as i32,
        error_message,
    };
    Status::with_details(status_code(err), err.to_string(), details.encode_to_vec().into())
}

/// Decode a `tonic::Status` back into a master error. Falls back to the
/// status-code mapping when no typed details are present.
pub fn status_to_error(status: &Status) -> MasterError {
    if let Ok(details) = proto::MasterError::decode(status.details()) {
        if !status.details().is_empty() {
            let msg = details.error_message;
            return match proto::ErrorCode::try_from(details.error_code) {
                Ok(proto::ErrorCode::VersionConflict) => MasterError::VersionConflict(msg),
                Ok(proto::ErrorCode::NotFound) => MasterError::NotFound(msg),
                Ok(proto::ErrorCode::InputError) => MasterError::Input(msg),
                _ => MasterError::Unknown(msg),
            };
        }
    }
    match status.code() {
        Code::Aborted => MasterError::VersionConflict(status.message().to_string()),
        Code::NotFound => MasterError::NotFound(status.message().to_string()),
        Code::InvalidArgument => MasterError::Input(status.message().to_string()),
        Code::Unavailable => MasterError::NotReady,
        _ => MasterError::Unknown(status.message().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let token = Token {
            name: "/workflow/w/i/job/runnable/j".to_string(),
            version: Some(7),
            owner: Some("worker-1".to_string()),
            expiration_time: Some(1_700_000_000),
            priority: 2.5,
            data: b"{}".to_vec(),
        };
        assert_eq!(proto_to_token(token_to_proto(token.clone())), token);
    }

    #[test]
    fn test_insert_token_has_no_version() {
        let token = Token::new("/a", vec![1, 2, 3]);
        let wire = token_to_proto(token.clone());
        assert_eq!(wire.version, None);
        assert_eq!(proto_to_token(wire), token);
    }

    #[test]
    fn test_error_round_trip_via_details() {
        let errors = [
            MasterError::VersionConflict("/k: expected Some(1), found Some(2)".to_string()),
            MasterError::NotFound("/missing".to_string()),
            MasterError::Input("empty name".to_string()),
            MasterError::Unknown("persistence failure".to_string()),
        ];
        for err in errors {
            let status = error_to_status(&err);
            let back = status_to_error(&status);
            match err {
                // UNKNOWN flattens to its display form on the wire.
                MasterError::Unknown(_) => {
                    assert_eq!(back, MasterError::Unknown(err.to_string()))
                }
                _ => assert_eq!(back, err),
            }
        }
    }

    #[test]
    fn test_not_ready_maps_to_unavailable() {
        let status = error_to_status(&MasterError::NotReady);
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status_to_error(&status), MasterError::NotReady);
    }

    #[test]
    fn test_status_code_fallback() {
        let status = Status::new(Code::Aborted, "conflict elsewhere");
        assert_eq!(
            status_to_error(&status),
            MasterError::VersionConflict("conflict elsewhere".to_string())
        );
        let status = Status::new(Code::Unavailable, "starting");
        assert_eq!(status_to_error(&status), MasterError::NotReady);
    }
}
