//! Persistence of the upgrade record, intent signals and status on the
//! `StatefulCluster` custom resource.

pub mod record;
pub mod signals;

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::debug;

pub use record::{StoredState, UpgradeRecord};
pub use signals::{Intent, SignalKind, Signals};

use crate::cluster::ClusterRef;
use crate::crd::{StatefulCluster, StatefulClusterSpec, StatefulClusterStatus};
use crate::error::SuoError;

pub const ANNOTATION_PREFIX: &str = "suo.io/";

/// Written by the backup tooling; read by the backup freshness check.
pub const LAST_BACKUP_ANNOTATION: &str = "suo.io/last-backup-time";

const FIELD_MANAGER: &str = "suo";

/// Everything the orchestrator reads about one cluster in one invocation.
#[derive(Clone, Debug)]
pub struct StoredCluster {
    pub cluster: ClusterRef,
    pub generation: i64,
    pub resource_version: Option<String>,
    pub spec: StatefulClusterSpec,
    pub status: StatefulClusterStatus,
    pub annotations: BTreeMap<String, String>,
    pub record: UpgradeRecord,
    pub signals: Signals,
}

impl StoredCluster {
    pub fn from_resource(obj: &StatefulCluster) -> Self {
        let annotations = obj.annotations().clone();
        Self {
            cluster: ClusterRef::from_resource(obj),
            generation: obj.metadata.generation.unwrap_or(0),
            resource_version: obj.resource_version(),
            spec: obj.spec.clone(),
            status: obj.status.clone().unwrap_or_default(),
            record: UpgradeRecord::parse(&annotations),
            signals: Signals::parse(&annotations),
            annotations,
        }
    }
}

/// One atomic set of writes. Annotations map to `None` are removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Commit {
    pub annotations: BTreeMap<String, Option<String>>,
    pub status: Option<StatefulClusterStatus>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty() && self.status.is_none()
    }

    /// Remove a signal and its metadata.
    pub fn consume(&mut self, kind: SignalKind) {
        for key in kind.keys() {
            self.annotations.insert(key, None);
        }
    }
}

/// Durable storage for the orchestrator.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the cluster; `None` when the object no longer exists.
    async fn load(&self, cluster: &ClusterRef) -> Result<Option<StoredCluster>, SuoError>;

    /// Write the status projection, then the annotations (the commit point).
    ///
    /// Both writes are guarded by `resource_version`; a concurrent update
    /// yields [`SuoError::Conflict`].
    async fn commit(
        &self,
        cluster: &ClusterRef,
        resource_version: Option<&str>,
        commit: Commit,
    ) -> Result<(), SuoError>;
}

/// [`StateStore`] backed by the Kubernetes API.
pub struct KubeStateStore {
    client: kube::Client,
}

impl KubeStateStore {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, cluster: &ClusterRef) -> Api<StatefulCluster> {
        Api::namespaced(self.client.clone(), &cluster.namespace)
    }
}

#[async_trait]
impl StateStore for KubeStateStore {
    async fn load(&self, cluster: &ClusterRef) -> Result<Option<StoredCluster>, SuoError> {
        let obj = self
            .api(cluster)
            .get_opt(&cluster.name)
            .await
            .map_err(|e| SuoError::kube("store::load", e))?;
        Ok(obj.as_ref().map(StoredCluster::from_resource))
    }

    async fn commit(
        &self,
        cluster: &ClusterRef,
        resource_version: Option<&str>,
        commit: Commit,
    ) -> Result<(), SuoError> {
        let api = self.api(cluster);
        let params = PatchParams::apply(FIELD_MANAGER);
        let mut resource_version = resource_version.map(str::to_string);

        if let Some(status) = &commit.status {
            debug!(cluster = %cluster, phase = ?status.phase, "Patching status");
            let patch = json!({
                "metadata": { "resourceVersion": resource_version },
                "status": status,
            });
            let updated = api
                .patch_status(&cluster.name, &params, &Patch::Merge(&patch))
                .await
                .map_err(|e| SuoError::kube("store::commit_status", e))?;
            resource_version = updated.resource_version();
        }

        if !commit.annotations.is_empty() {
            debug!(cluster = %cluster, keys = commit.annotations.len(), "Patching annotations");
            let patch = json!({
                "metadata": {
                    "resourceVersion": resource_version,
                    "annotations": commit.annotations,
                },
            });
            api.patch(&cluster.name, &params, &Patch::Merge(&patch))
                .await
                .map_err(|e| SuoError::kube("store::commit_annotations", e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::crd::spec::MemberGroupSpec;

    /// In-memory [`StateStore`] with a monotonically increasing resource version.
    pub struct MemoryStore {
        inner: Mutex<Inner>,
    }

    struct Inner {
        cluster: Option<StoredCluster>,
        version: u64,
        conflicts: u32,
        split_next: bool,
        commits: Vec<Commit>,
    }

    impl MemoryStore {
        pub fn new(spec: StatefulClusterSpec) -> Self {
            let annotations = BTreeMap::new();
            let cluster = StoredCluster {
                cluster: ClusterRef::new("db", "main"),
                generation: 1,
                resource_version: Some("1".to_string()),
                spec,
                status: StatefulClusterStatus::default(),
                record: UpgradeRecord::parse(&annotations),
                signals: Signals::parse(&annotations),
                annotations,
            };
            Self {
                inner: Mutex::new(Inner {
                    cluster: Some(cluster),
                    version: 1,
                    conflicts: 0,
                    split_next: false,
                    commits: Vec::new(),
                }),
            }
        }

        pub fn empty() -> Self {
            let store = Self::new(spec("registry.local/db:11.3.0"));
            store.inner.lock().unwrap().cluster = None;
            store
        }

        /// Simulate an operator (or another writer) editing annotations.
        pub fn annotate(&self, key: &str, value: &str) {
            self.edit(|c| {
                c.annotations.insert(key.to_string(), value.to_string());
            });
        }

        pub fn remove_annotation(&self, key: &str) {
            self.edit(|c| {
                c.annotations.remove(key);
            });
        }

        pub fn set_image(&self, image: &str) {
            self.edit(|c| {
                c.spec.image = image.to_string();
                c.generation += 1;
            });
        }

        pub fn edit_status(&self, f: impl FnOnce(&mut StatefulClusterStatus)) {
            self.edit(|c| f(&mut c.status));
        }

        /// Fail the next `n` commits with a conflict.
        pub fn fail_next_commits(&self, n: u32) {
            self.inner.lock().unwrap().conflicts = n;
        }

        /// Let the next commit write its status, then fail the annotation
        /// write with a conflict.
        pub fn split_next_commit(&self) {
            self.inner.lock().unwrap().split_next = true;
        }

        pub fn snapshot(&self) -> StoredCluster {
            self.inner.lock().unwrap().cluster.clone().unwrap()
        }

        pub fn annotation(&self, key: &str) -> Option<String> {
            self.snapshot().annotations.get(key).cloned()
        }

        pub fn commit_count(&self) -> usize {
            self.inner.lock().unwrap().commits.len()
        }

        fn edit(&self, f: impl FnOnce(&mut StoredCluster)) {
            let mut inner = self.inner.lock().unwrap();
            inner.version += 1;
            let version = inner.version;
            let cluster = inner.cluster.as_mut().unwrap();
            f(cluster);
            cluster.resource_version = Some(version.to_string());
            cluster.record = UpgradeRecord::parse(&cluster.annotations);
            cluster.signals = Signals::parse(&cluster.annotations);
        }
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn load(&self, _cluster: &ClusterRef) -> Result<Option<StoredCluster>, SuoError> {
            Ok(self.inner.lock().unwrap().cluster.clone())
        }

        async fn commit(
            &self,
            cluster: &ClusterRef,
            resource_version: Option<&str>,
            commit: Commit,
        ) -> Result<(), SuoError> {
            let split = {
                let mut inner = self.inner.lock().unwrap();
                if inner.conflicts > 0 {
                    inner.conflicts -= 1;
                    return Err(SuoError::Conflict(
                        "store::commit".to_string(),
                        format!("{cluster} was modified"),
                    ));
                }
                let current = inner
                    .cluster
                    .as_ref()
                    .and_then(|c| c.resource_version.clone());
                if resource_version.is_some() && resource_version != current.as_deref() {
                    return Err(SuoError::Conflict(
                        "store::commit".to_string(),
                        format!("{cluster} resource version is stale"),
                    ));
                }
                if std::mem::take(&mut inner.split_next) {
                    true
                } else {
                    inner.commits.push(commit.clone());
                    false
                }
            };
            if split {
                if let Some(status) = commit.status {
                    self.edit(|c| c.status = status);
                }
                return Err(SuoError::Conflict(
                    "store::commit_annotations".to_string(),
                    format!("{cluster} was modified after the status write"),
                ));
            }
            self.edit(|c| {
                if let Some(status) = commit.status {
                    c.status = status;
                }
                for (key, value) in commit.annotations {
                    match value {
                        Some(value) => c.annotations.insert(key, value),
                        None => c.annotations.remove(&key),
                    };
                }
            });
            Ok(())
        }
    }

    pub fn spec(image: &str) -> StatefulClusterSpec {
        StatefulClusterSpec {
            image: image.to_string(),
            container_name: "server".to_string(),
            member_groups: vec![
                MemberGroupSpec {
                    name: "data".to_string(),
                    replicas: 3,
                },
                MemberGroupSpec {
                    name: "query".to_string(),
                    replicas: 2,
                },
            ],
            health_endpoint: None,
            license_secret: None,
            timeouts: None,
            precheck: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MemoryStore, spec};
    use super::*;
    use crate::crd::UpgradeState;

    #[test]
    fn test_commit_consume_removes_metadata() {
        let mut commit = Commit::default();
        commit.consume(SignalKind::Cancel);
        assert_eq!(commit.annotations.len(), 4);
        assert!(commit.annotations.values().all(Option::is_none));
        assert!(!commit.is_empty());
    }

    #[test]
    fn test_empty_commit() {
        assert!(Commit::default().is_empty());
    }

    #[test]
    fn test_stored_cluster_from_resource() {
        let mut obj = StatefulCluster::new("main", spec("registry.local/db:11.4.0"));
        obj.metadata.namespace = Some("db".to_string());
        obj.metadata.resource_version = Some("42".to_string());
        obj.metadata.annotations = Some(BTreeMap::from([
            (
                "suo.io/upgrade-state".to_string(),
                "WaitingForApproval".to_string(),
            ),
            (
                "suo.io/proceed-with-upgrade".to_string(),
                "true".to_string(),
            ),
        ]));

        let stored = StoredCluster::from_resource(&obj);
        assert_eq!(stored.cluster.to_string(), "db/main");
        assert_eq!(stored.resource_version.as_deref(), Some("42"));
        assert_eq!(stored.record.state(), UpgradeState::WaitingForApproval);
        assert!(stored.signals.proceed);
        assert_eq!(stored.status, StatefulClusterStatus::default());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_version() {
        let store = MemoryStore::new(spec("registry.local/db:11.3.0"));
        let cluster = ClusterRef::new("db", "main");
        let loaded = store.load(&cluster).await.unwrap().unwrap();

        store.annotate("suo.io/trigger-upgrade", "true");

        let mut commit = Commit::default();
        commit.consume(SignalKind::Trigger);
        let err = store
            .commit(&cluster, loaded.resource_version.as_deref(), commit)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            store.annotation("suo.io/trigger-upgrade").as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_memory_store_applies_commit() {
        let store = MemoryStore::new(spec("registry.local/db:11.3.0"));
        store.annotate("suo.io/trigger-upgrade", "true");
        let cluster = ClusterRef::new("db", "main");
        let loaded = store.load(&cluster).await.unwrap().unwrap();

        let mut commit = Commit::default();
        commit.consume(SignalKind::Trigger);
        commit.annotations.extend(
            UpgradeRecord {
                state: StoredState::Known(UpgradeState::PrecheckStarted),
                ..Default::default()
            }
            .to_annotations(),
        );
        store
            .commit(&cluster, loaded.resource_version.as_deref(), commit)
            .await
            .unwrap();

        let after = store.snapshot();
        assert!(!after.signals.trigger);
        assert_eq!(after.record.state(), UpgradeState::PrecheckStarted);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_split_commit_keeps_annotations() {
        let store = MemoryStore::new(spec("registry.local/db:11.3.0"));
        store.annotate("suo.io/trigger-upgrade", "true");
        store.split_next_commit();
        let cluster = ClusterRef::new("db", "main");
        let loaded = store.load(&cluster).await.unwrap().unwrap();

        let mut commit = Commit::default();
        commit.consume(SignalKind::Trigger);
        commit.status = Some(StatefulClusterStatus {
            current_image: Some("registry.local/db:11.3.0".to_string()),
            ..Default::default()
        });
        let err = store
            .commit(&cluster, loaded.resource_version.as_deref(), commit)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        let after = store.snapshot();
        assert_eq!(
            after.status.current_image.as_deref(),
            Some("registry.local/db:11.3.0")
        );
        assert!(after.signals.trigger);
        assert_ne!(after.resource_version, loaded.resource_version);
        assert_eq!(store.commit_count(), 0);
    }
}
