//! Fleetplane resource model
//!
//! Declarative resources consumed and reported on by the orchestrator:
//! node sets, deployments, services and the condition ledgers they carry.

pub mod condition;
pub mod deployment;
pub mod error;
pub mod meta;
pub mod nodeset;
pub mod objects;
pub mod service;
pub mod vars;

pub use condition::{reasons, types, Condition, ConditionLedger, ConditionStatus, Severity};
pub use deployment::{Deployment, DeploymentSpec, DeploymentStatus, ExecFilter};
pub use error::ApiError;
pub use meta::{ObjectMeta, OwnerReference, Resource};
pub use nodeset::{EffectiveNode, NodeSet, NodeSetSpec, NodeSetStatus};
pub use objects::{ConfigMap, Secret};
pub use service::{Service, ServiceSpec};
pub use vars::{merge_shallow, EnvVar, VarMap, VarValue};
