//! Cluster access for the operator component aggregator
//!
//! The aggregator talks to the cluster exclusively through the
//! [`ClusterClient`] trait: resolving kinds, list-then-watch of arbitrary
//! resources, and optimistic status writes. [`KubeClient`] implements it
//! against a real API server with [`kube`]; tests use the in-memory cluster in
//! `aggregator-test`.
//!
//! ```rust,no_run
//! use aggregator_client::{ClusterClient, KubeClient};
//! use kube::core::GroupVersionKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = KubeClient::try_default().await?;
//!     let ar = client.resolve(&GroupVersionKind::gvk("", "v1", "Namespace")).await?;
//!     for ns in client.list(&ar, None).await? {
//!         println!("found namespace {:?}", ns.metadata.name);
//!     }
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

mod cluster;
pub use cluster::{ClusterClient, WatchStream};

pub mod discovery;

mod live;
pub use live::KubeClient;

pub mod error;
pub use error::{api_error, Error, ErrorResponse};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
