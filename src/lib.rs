//! k8s-label-sync: label-based Kubernetes service registration
//!
//! This crate lets a clustered server process advertise its runtime state
//! (active/standby, sealed/unsealed, initialized, version) as labels on the
//! Kubernetes Service fronting the cluster, so external load balancers route
//! traffic only to eligible members. The core is a lightweight authenticated
//! API client that recovers transparently from service-account token
//! rotation.

pub mod client;
pub mod config;
pub mod error;
pub mod registration;

pub use crate::client::{KubeClient, LabelOp, ObjectDetails, ObjectKind};
pub use crate::config::{ClusterConfig, ConfigSource, InClusterSource, ServiceAccountPaths};
pub use crate::error::{Error, Result};
pub use crate::registration::{MemberState, ServiceRegistration};
