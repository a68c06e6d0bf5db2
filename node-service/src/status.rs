//! Single dispatch point mapping `NodeError` onto gRPC status codes, so no
//! individual RPC handler has to pick a `tonic::Status` constructor itself.

use node_core::NodeError;
use tonic::Status;

pub fn to_status(err: NodeError) -> Status {
    match err {
        NodeError::UnknownTag(_) | NodeError::ConfigInvalid(_) | NodeError::Serde(_) => {
            Status::invalid_argument(err.to_string())
        }
        NodeError::UnknownUser(_) | NodeError::UnknownBackend(_) => Status::not_found(err.to_string()),
        NodeError::DuplicateUser(_) => Status::already_exists(err.to_string()),
        NodeError::EngineDown(_) => Status::unavailable(err.to_string()),
        NodeError::Timeout => Status::deadline_exceeded(err.to_string()),
        NodeError::ChildSpawnFailed(_) | NodeError::PortBindFailed(_) | NodeError::Io(_) | NodeError::Internal(_) => {
            Status::internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn unknown_tag_is_invalid_argument() {
        assert_eq!(to_status(NodeError::UnknownTag("x".into())).code(), Code::InvalidArgument);
    }

    #[test]
    fn unknown_backend_is_not_found() {
        assert_eq!(to_status(NodeError::UnknownBackend("x".into())).code(), Code::NotFound);
    }

    #[test]
    fn engine_down_is_unavailable() {
        assert_eq!(to_status(NodeError::EngineDown("xray".into())).code(), Code::Unavailable);
    }

    #[test]
    fn child_spawn_failure_is_internal() {
        assert_eq!(to_status(NodeError::ChildSpawnFailed("enoent".into())).code(), Code::Internal);
    }
}
