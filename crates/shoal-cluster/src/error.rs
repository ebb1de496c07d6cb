//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("bucket {index:#x} is not hosted on this node")]
    NotOwned {
        index: u64,
        /// Known primary address for the redirect, if any.
        primary: Option<String>,
    },

    #[error("bucket {index:#x} requires the primary replica")]
    NotPrimary {
        index: u64,
        primary: Option<String>,
    },

    #[error("a bucket transfer is already in flight")]
    TransferConflict,

    #[error("peer unreachable: {0}")]
    NodeUnreachable(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] shoal_core::Error),

    #[error(transparent)]
    Wire(#[from] shoal_proto::WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// The redirect address carried by dispatch errors.
    pub fn redirect(&self) -> Option<&str> {
        match self {
            ClusterError::NotOwned { primary, .. } | ClusterError::NotPrimary { primary, .. } => {
                primary.as_deref()
            }
            _ => None,
        }
    }
}
