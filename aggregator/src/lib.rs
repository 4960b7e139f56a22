//! Aggregates the components of OLM operators into their `Operator` status
//!
//! # Overview
//!
//! An operator is installed as a scatter of cluster objects: namespaces,
//! service accounts, RBAC, CRDs, deployments, and the OLM objects that drive
//! the installation. This crate keeps a single cluster-scoped `Operator`
//! resource per operator, whose `status.components` lists every such object,
//! found by the label `operators.coreos.com/<name>` or by following owner
//! references from the subscription that installed the operator.
//!
//! The main modules are:
//!
//! - [`core`](crate::core) with label keys, component references and the `Operator` type
//! - [`client`](crate::client) with the [`ClusterClient`](crate::client::ClusterClient) seam and its kube implementation
//! - [`runtime`](crate::runtime) with the [`Controller`](crate::runtime::Controller), watch fan-in, adoption and status publishing
//!
//! # Running the controller
//!
//! ```no_run
//! use aggregator::{
//!     client::KubeClient,
//!     runtime::{Controller, ControllerConfig},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = KubeClient::try_default().await?;
//!     let shutdown = CancellationToken::new();
//!     Controller::new(client, ControllerConfig::default()).run(shutdown).await;
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

#[doc(inline)]
pub use aggregator_client as client;
#[doc(inline)]
pub use aggregator_core as core;
#[doc(inline)]
pub use aggregator_runtime as runtime;

#[doc(inline)]
pub use aggregator_core::{derive_label_key, ComponentRef, Operator};
#[doc(inline)]
pub use aggregator_runtime::{Controller, ControllerConfig};

#[cfg(test)]
mod mock_tests;
