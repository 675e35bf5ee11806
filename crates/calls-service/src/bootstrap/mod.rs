//! Cluster-wide bootstrap tasks.
//!
//! Bot provisioning and state reconciliation run on every node during
//! activation and rely on a named
//! [`DistributedMutex`](crate::cluster::mutex::DistributedMutex) so their side
//! effects happen once per cluster. The recording job service check is local
//! to each node and never blocks activation.

pub mod bot;
pub mod identity;
pub mod jobs;
pub mod reconciler;

pub use bot::BotIdentityProvisioner;
pub use identity::{BotAccountSpec, BotSession, BotUser, HttpIdentityClient, IdentityService};
pub use jobs::{HttpJobServiceClient, JobService};
pub use reconciler::{CleanupReport, CleanupScope, ClusterStateReconciler};
