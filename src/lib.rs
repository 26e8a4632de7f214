//! Zero-trust call mediation for agent processes.
//!
//! Every call between agents passes through four components composed by the
//! [`orchestrator::CallOrchestrator`]:
//!
//! - [`identity::IdentityManager`] keeps the short-lived workload identity current.
//! - [`trust::TrustBundleStore`] holds verification anchors per trust domain.
//! - [`authz::AuthorizationEngine`] asks a remote policy service, caches, fails closed.
//! - [`transport::TransportManager`] pools mutually authenticated channels.

#![forbid(unsafe_code)]

pub mod audit;
pub mod authz;
pub mod breaker;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod transport;
pub mod trust;
pub mod types;
