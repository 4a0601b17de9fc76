//! Controller error types.

use gamefleet_reconcile::ReconcileError;
use thiserror::Error;

use crate::cluster::ClusterError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors raised while reconciling a game deployment.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Observation source call failed.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Decision primitive rejected its input.
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// The deployment selector is malformed or does not match its template.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// An in-place update would change a field other than a container image.
    #[error("in-place update cannot change {path}")]
    InvalidInPlaceUpdate { path: String },

    /// A canary step cannot be scheduled.
    #[error("invalid canary step: {0}")]
    InvalidCanaryStep(String),

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(String),

    /// Scale-out stopped after a failed batch.
    #[error("created {created} of {requested} instances: {source}")]
    PartialCreate {
        created: usize,
        requested: usize,
        #[source]
        source: ClusterError,
    },

    /// Revision payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every candidate revision name is held by a foreign revision.
    #[error("no free revision name for {deployment} after {attempts} attempts")]
    RevisionNameExhausted { deployment: String, attempts: i32 },
}

impl ControllerError {
    /// Permanent errors are surfaced as conditions and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ControllerError::InvalidSelector(_)
                | ControllerError::InvalidInPlaceUpdate { .. }
                | ControllerError::InvalidCanaryStep(_)
                | ControllerError::MissingField(_)
                | ControllerError::Serialization(_)
                | ControllerError::Reconcile(_)
        ) || matches!(self, ControllerError::Cluster(e) if e.is_invalid())
    }

    /// Short machine-readable reason for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Cluster(_) => "ClusterError",
            ControllerError::Reconcile(_) => "InvalidStrategy",
            ControllerError::InvalidSelector(_) => "InvalidSelector",
            ControllerError::InvalidInPlaceUpdate { .. } => "InvalidInPlaceUpdate",
            ControllerError::InvalidCanaryStep(_) => "InvalidCanaryStep",
            ControllerError::MissingField(_) => "MissingField",
            ControllerError::PartialCreate { .. } => "PartialCreate",
            ControllerError::Serialization(_) => "InvalidRevision",
            ControllerError::RevisionNameExhausted { .. } => "RevisionNameExhausted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(ControllerError::InvalidSelector("empty".into()).is_permanent());
        assert!(ControllerError::InvalidInPlaceUpdate {
            path: "/spec/template/labels/app".into()
        }
        .is_permanent());
        assert!(!ControllerError::Cluster(ClusterError::Conflict("rv".into())).is_permanent());
        assert!(!ControllerError::PartialCreate {
            created: 1,
            requested: 3,
            source: ClusterError::Unavailable("quota".into()),
        }
        .is_permanent());
        assert!(ControllerError::Cluster(ClusterError::Invalid("bad".into())).is_permanent());
    }

    #[test]
    fn test_partial_create_message() {
        let err = ControllerError::PartialCreate {
            created: 3,
            requested: 7,
            source: ClusterError::Unavailable("quota exceeded".into()),
        };
        assert_eq!(
            err.to_string(),
            "created 3 of 7 instances: cluster unavailable: quota exceeded"
        );
    }
}
