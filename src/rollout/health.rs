//! Cluster-wide health probe consulted after every member group converges.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::ClusterRef;
use crate::error::SuoError;

/// Application-level health verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `endpoint`; with no endpoint the cluster is considered healthy.
    async fn check(&self, cluster: &ClusterRef, endpoint: Option<&str>) -> Result<Health, SuoError>;
}

/// [`HealthProbe`] issuing an HTTP GET and treating 2xx as healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, SuoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SuoError::HealthProbe(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, cluster: &ClusterRef, endpoint: Option<&str>) -> Result<Health, SuoError> {
        let Some(endpoint) = endpoint else {
            return Ok(Health::Healthy);
        };

        debug!(cluster = %cluster, endpoint, "Probing cluster health");
        let resp = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| SuoError::HealthProbe(format!("{endpoint}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            Ok(Health::Healthy)
        } else {
            Ok(Health::Unhealthy(format!("{endpoint} returned {status}")))
        }
    }
}
