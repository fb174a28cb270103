//! Precheck check builders.
//!
//! Each builder is a pure function of gathered facts; the runner adds the
//! timestamp and duration.

use chrono::{DateTime, Utc};

use super::inspect::PodFacts;
use super::report::CheckStatus;
use crate::cluster::MemberGroup;

pub const IMAGE_AVAILABILITY: &str = "Image Availability";
pub const CLUSTER_HEALTH: &str = "Cluster Health";
pub const DATA_STORE_CONNECTIVITY: &str = "Data Store Connectivity";
pub const FOREST_HEALTH: &str = "Forest Health";
pub const RESOURCE_HEADROOM: &str = "Resource Headroom";
pub const BACKUP_FRESHNESS: &str = "Backup Freshness";
pub const LICENSE_VALIDITY: &str = "License Validity";
pub const NETWORK_CONNECTIVITY: &str = "Network Connectivity";

/// Outcome of one check before timing is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    pub detail: Option<String>,
    pub remediation: Option<String>,
}

/// Ready endpoint count of one member group's headless Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEndpoints {
    pub group: String,
    pub ready_replicas: i32,
    /// `None` when no EndpointSlice exists for the Service.
    pub ready_endpoints: Option<usize>,
}

impl CheckOutcome {
    const fn new(name: &'static str, status: CheckStatus, message: String) -> Self {
        Self {
            name,
            status,
            message,
            detail: None,
            remediation: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    /// Facts for a check could not be gathered.
    pub fn not_evaluated(name: &'static str, error: &str) -> Self {
        Self::new(
            name,
            CheckStatus::Warn,
            "Check could not be evaluated".to_string(),
        )
        .with_detail(error)
    }

    /// Validate the target image reference.
    pub fn image_availability(target: &str, current: Option<&str>) -> Self {
        let reference = match ImageReference::parse(target) {
            Ok(reference) => reference,
            Err(reason) => {
                return Self::new(
                    IMAGE_AVAILABILITY,
                    CheckStatus::Fail,
                    format!("Invalid image reference '{target}': {reason}"),
                )
                .with_remediation("Set spec.image to a valid repository[:tag] reference");
            }
        };

        if current == Some(target) {
            return Self::new(
                IMAGE_AVAILABILITY,
                CheckStatus::Warn,
                format!("Target image {target} is already the current image"),
            );
        }

        if reference.is_floating() {
            return Self::new(
                IMAGE_AVAILABILITY,
                CheckStatus::Warn,
                format!("Target image {target} does not pin a version"),
            )
            .with_remediation("Use an explicit version tag or digest");
        }

        Self::new(
            IMAGE_AVAILABILITY,
            CheckStatus::Pass,
            format!("Target image {target} is a valid reference"),
        )
    }

    /// Every member group exists and is fully ready.
    pub fn cluster_health(groups: &[MemberGroup]) -> Self {
        let missing: Vec<&str> = groups
            .iter()
            .filter(|g| !g.found)
            .map(|g| g.name.as_str())
            .collect();
        let degraded: Vec<String> = groups
            .iter()
            .filter(|g| g.found && !g.is_ready())
            .map(|g| format!("{} ({}/{})", g.name, g.ready_replicas, g.desired_replicas))
            .collect();

        if !missing.is_empty() {
            return Self::new(
                CLUSTER_HEALTH,
                CheckStatus::Fail,
                format!("Member group(s) not found: {}", missing.join(", ")),
            )
            .with_remediation("Create the StatefulSets named in spec.memberGroups");
        }
        if !degraded.is_empty() {
            return Self::new(
                CLUSTER_HEALTH,
                CheckStatus::Fail,
                format!("Member group(s) not fully ready: {}", degraded.join(", ")),
            )
            .with_remediation("Wait for all members to become ready before upgrading");
        }

        Self::new(
            CLUSTER_HEALTH,
            CheckStatus::Pass,
            format!("All {} member group(s) ready", groups.len()),
        )
    }

    /// The client Service has ready endpoints.
    pub fn data_store_connectivity(service: &str, ready_endpoints: Option<usize>) -> Self {
        match ready_endpoints {
            None => Self::new(
                DATA_STORE_CONNECTIVITY,
                CheckStatus::Warn,
                format!("No EndpointSlice found for service {service}"),
            ),
            Some(0) => Self::new(
                DATA_STORE_CONNECTIVITY,
                CheckStatus::Fail,
                format!("Service {service} has no ready endpoints"),
            )
            .with_remediation("Restore client connectivity before upgrading"),
            Some(n) => Self::new(
                DATA_STORE_CONNECTIVITY,
                CheckStatus::Pass,
                format!("Service {service} has {n} ready endpoint(s)"),
            ),
        }
    }

    /// Per-group resource health: pods ready with restarts at or below `max_restarts`.
    pub fn forest_health(pods: &[PodFacts], max_restarts: i32) -> Self {
        let unhealthy: Vec<String> = pods
            .iter()
            .filter_map(|pod| {
                if !pod.ready {
                    Some(format!("{} not ready", pod.name))
                } else if pod.restarts > max_restarts {
                    Some(format!("{} restarted {} times", pod.name, pod.restarts))
                } else {
                    None
                }
            })
            .collect();

        if unhealthy.is_empty() {
            Self::new(
                FOREST_HEALTH,
                CheckStatus::Pass,
                format!("All {} pod(s) healthy", pods.len()),
            )
        } else {
            Self::new(
                FOREST_HEALTH,
                CheckStatus::Warn,
                format!("{} pod(s) unhealthy", unhealthy.len()),
            )
            .with_detail(unhealthy.join("; "))
            .with_remediation("Investigate the pods or set suo.io/skip-forest-check=true")
        }
    }

    pub fn forest_health_skipped() -> Self {
        Self::new(
            FOREST_HEALTH,
            CheckStatus::Pass,
            "Forest health check skipped per annotation".to_string(),
        )
    }

    /// No cluster pods are waiting for scheduling.
    pub fn resource_headroom(pods: &[PodFacts]) -> Self {
        let pending: Vec<&str> = pods
            .iter()
            .filter(|p| p.phase == "Pending")
            .map(|p| p.name.as_str())
            .collect();

        if pending.is_empty() {
            Self::new(
                RESOURCE_HEADROOM,
                CheckStatus::Pass,
                "No pending pods".to_string(),
            )
        } else {
            Self::new(
                RESOURCE_HEADROOM,
                CheckStatus::Warn,
                format!("{} pod(s) pending scheduling", pending.len()),
            )
            .with_detail(pending.join(", "))
            .with_remediation("Ensure the nodes have capacity for a rolling restart")
        }
    }

    /// The last recorded backup is recent enough.
    pub fn backup_freshness(
        last_backup: Option<&str>,
        now: DateTime<Utc>,
        max_age_hours: u64,
    ) -> Self {
        let remediation = "Take a backup and record it in suo.io/last-backup-time";
        let Some(raw) = last_backup else {
            return Self::new(
                BACKUP_FRESHNESS,
                CheckStatus::Warn,
                "No backup recorded".to_string(),
            )
            .with_remediation(remediation);
        };

        let Ok(taken) = DateTime::parse_from_rfc3339(raw.trim()) else {
            return Self::new(
                BACKUP_FRESHNESS,
                CheckStatus::Warn,
                format!("Unparseable backup timestamp '{raw}'"),
            )
            .with_remediation(remediation);
        };

        let age_hours = now
            .signed_duration_since(taken.with_timezone(&Utc))
            .num_hours();
        if age_hours > i64::try_from(max_age_hours).unwrap_or(i64::MAX) {
            Self::new(
                BACKUP_FRESHNESS,
                CheckStatus::Warn,
                format!("Last backup is {age_hours}h old (max {max_age_hours}h)"),
            )
            .with_remediation(remediation)
        } else {
            Self::new(
                BACKUP_FRESHNESS,
                CheckStatus::Pass,
                format!("Last backup is {age_hours}h old"),
            )
        }
    }

    /// The license Secret exists when one is configured.
    pub fn license_validity(secret: Option<&str>, exists: bool) -> Self {
        match secret {
            None => Self::new(
                LICENSE_VALIDITY,
                CheckStatus::Pass,
                "No license secret configured".to_string(),
            ),
            Some(name) if exists => Self::new(
                LICENSE_VALIDITY,
                CheckStatus::Pass,
                format!("License secret {name} present"),
            ),
            Some(name) => Self::new(
                LICENSE_VALIDITY,
                CheckStatus::Fail,
                format!("License secret {name} not found"),
            )
            .with_remediation("Create the license Secret referenced by spec.licenseSecret"),
        }
    }

    /// Each group's headless Service routes to all of its ready members.
    pub fn network_connectivity(groups: &[GroupEndpoints]) -> Self {
        let problems: Vec<String> = groups
            .iter()
            .filter_map(|g| match g.ready_endpoints {
                None => Some(format!("{}: no EndpointSlice", g.group)),
                Some(n) if i64::try_from(n).unwrap_or(i64::MAX) < i64::from(g.ready_replicas) => {
                    Some(format!(
                        "{}: {n}/{} endpoints ready",
                        g.group, g.ready_replicas
                    ))
                }
                Some(_) => None,
            })
            .collect();

        if problems.is_empty() {
            Self::new(
                NETWORK_CONNECTIVITY,
                CheckStatus::Pass,
                format!("All {} member service(s) reachable", groups.len()),
            )
        } else {
            Self::new(
                NETWORK_CONNECTIVITY,
                CheckStatus::Warn,
                format!("{} member service(s) degraded", problems.len()),
            )
            .with_detail(problems.join("; "))
        }
    }
}

/// Parsed `[registry/]repository[:tag][@digest]` reference.
#[derive(Debug, PartialEq, Eq)]
struct ImageReference<'a> {
    repository: &'a str,
    tag: Option<&'a str>,
    digest: Option<&'a str>,
}

impl<'a> ImageReference<'a> {
    fn parse(raw: &'a str) -> Result<Self, &'static str> {
        if raw.is_empty() {
            return Err("empty reference");
        }
        if raw.chars().any(char::is_whitespace) {
            return Err("contains whitespace");
        }

        let (name, digest) = match raw.split_once('@') {
            Some((_, "")) => return Err("empty digest"),
            Some((name, digest)) => (name, Some(digest)),
            None => (raw, None),
        };

        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name[split + 1..];
                if tag.is_empty() {
                    return Err("empty tag");
                }
                (&name[..split], Some(tag))
            }
            None => (name, None),
        };

        let components: Vec<&str> = repository.split('/').collect();
        for (i, component) in components.iter().enumerate() {
            let is_registry = i == 0 && components.len() > 1;
            let valid = !component.is_empty()
                && component.chars().all(|c| {
                    c.is_ascii_lowercase()
                        || c.is_ascii_digit()
                        || matches!(c, '.' | '_' | '-')
                        || (is_registry && (c == ':' || c.is_ascii_uppercase()))
                });
            if !valid {
                return Err("invalid repository");
            }
        }

        Ok(Self {
            repository,
            tag,
            digest,
        })
    }

    fn is_floating(&self) -> bool {
        self.digest.is_none() && matches!(self.tag, None | Some("latest"))
    }
}
