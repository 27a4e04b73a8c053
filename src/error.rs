use std::fmt;

use thiserror::Error;

use crate::db::{DatabaseError, MappingKind};
use crate::matrix::HomeserverRejection;

/// Why a media download produced no buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    Status(u16),
    Transport(String),
    TooLarge { limit: usize },
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadFailure::Status(status) => write!(f, "http status {status}"),
            DownloadFailure::Transport(reason) => write!(f, "transport error: {reason}"),
            DownloadFailure::TooLarge { limit } => {
                write!(f, "response exceeds the {limit} byte limit")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] DatabaseError),
    #[error(
        "{kind} mapping already exists for remote room {remote_room_id} or matrix room {matrix_room_id}"
    )]
    AlreadyMapped {
        remote_room_id: String,
        matrix_room_id: String,
        kind: MappingKind,
    },
    #[error("failed to resolve {matrix_user_id}: {reason}")]
    ResolutionFailed {
        matrix_user_id: String,
        reason: String,
    },
    #[error("download failed: {0}")]
    DownloadFailed(DownloadFailure),
    #[error("invalid media reference: {0:?}")]
    InvalidMediaReference(String),
    #[error("matrix request failed: {0}")]
    MatrixRequest(String),
    #[error("matrix request rejected: {0}")]
    MatrixRejected(String),
}

impl BridgeError {
    /// Classifies a failed homeserver call. Permanent rejections are never retried.
    pub fn from_matrix(err: anyhow::Error) -> Self {
        match err.downcast_ref::<HomeserverRejection>() {
            Some(rejection) if rejection.is_permanent() => {
                BridgeError::MatrixRejected(format!("{err:#}"))
            }
            _ => BridgeError::MatrixRequest(format!("{err:#}")),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::StoreUnavailable(_)
                | BridgeError::ResolutionFailed { .. }
                | BridgeError::DownloadFailed(_)
                | BridgeError::MatrixRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_store_faults_are_transient() {
        assert!(BridgeError::StoreUnavailable(DatabaseError::Connection("down".into())).is_transient());
        assert!(BridgeError::DownloadFailed(DownloadFailure::Status(502)).is_transient());
        assert!(
            BridgeError::ResolutionFailed {
                matrix_user_id: "@a:b".into(),
                reason: "timeout".into()
            }
            .is_transient()
        );
        assert!(!BridgeError::InvalidMediaReference("abc".into()).is_transient());
        assert!(!BridgeError::Configuration("levels".into()).is_transient());
        assert!(
            !BridgeError::AlreadyMapped {
                remote_room_id: "r".into(),
                matrix_room_id: "!m:b".into(),
                kind: MappingKind::Live,
            }
            .is_transient()
        );
    }

    #[test]
    fn forbidden_matrix_responses_are_permanent() {
        let forbidden = anyhow::Error::new(HomeserverRejection {
            request: "writing power levels of !room:example.org".to_string(),
            status: Some(403),
            errcode: Some("M_FORBIDDEN".to_string()),
            detail: String::new(),
        });
        let err = BridgeError::from_matrix(forbidden);
        assert!(matches!(err, BridgeError::MatrixRejected(_)));
        assert!(!err.is_transient());

        let reset = BridgeError::from_matrix(anyhow::anyhow!("connection reset by peer"));
        assert!(matches!(reset, BridgeError::MatrixRequest(_)));
        assert!(reset.is_transient());
    }

    #[test]
    fn download_failure_renders_reason() {
        let err = BridgeError::DownloadFailed(DownloadFailure::TooLarge { limit: 10 });
        assert_eq!(
            err.to_string(),
            "download failed: response exceeds the 10 byte limit"
        );
    }
}
