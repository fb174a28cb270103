//! `StatefulCluster` CRD type definition.

pub mod spec;
pub mod status;
pub mod types;

pub use spec::{StatefulCluster, StatefulClusterSpec};
pub use status::{AttemptRecord, CommandRecord, StatefulClusterStatus, UpgradeCondition};
pub use types::{AttemptOutcome, UpgradeState};
