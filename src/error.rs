//! Custom error types for suo.

use thiserror::Error;

/// Errors that can occur while driving a cluster upgrade.
#[derive(Error, Debug)]
pub enum SuoError {
    #[error("[{0}] Kubernetes API error: {1}")]
    KubernetesApi(String, String),

    #[error("[{0}] conflicting update, will retry: {1}")]
    Conflict(String, String),

    #[error("[{0}] resource not found: {1}")]
    NotFound(String, String),

    #[error("Member group not found: {0}")]
    MemberGroupNotFound(String),

    #[error("Precheck error: {0}")]
    Precheck(String),

    #[error("Rollout error: {0}")]
    Rollout(String),

    #[error("Health probe error: {0}")]
    HealthProbe(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SuoError {
    /// Classify a `kube::Error` raised by `component`.
    ///
    /// HTTP 409 becomes [`SuoError::Conflict`] so callers can abandon the
    /// transition instead of failing the attempt; HTTP 404 becomes
    /// [`SuoError::NotFound`].
    pub fn kube(component: &str, err: kube::Error) -> Self {
        let component = component.to_string();
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 => {
                Self::Conflict(component, resp.message.clone())
            }
            kube::Error::Api(ref resp) if resp.code == 404 => {
                Self::NotFound(component, resp.message.clone())
            }
            other => Self::KubernetesApi(component, other.to_string()),
        }
    }

    /// Returns true if this error is an optimistic-concurrency conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_, _))
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KubernetesApi(_, _) | Self::Conflict(_, _) | Self::HealthProbe(_)
        )
    }
}
