//! Client-less types for aggregating the components of an operator
//!
//! Everything here is pure: deriving label keys, referencing component
//! objects, and the schema of the `Operator` aggregate whose status lists them.
//! The cluster-facing pieces live in `aggregator-client` and `aggregator-runtime`.
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod kinds;

pub mod labels;
pub use labels::{component_selector, derive_label_key, ComponentSelector, Selector, LABEL_DOMAIN};

pub mod operator;
pub use operator::{components_of, package_operator_name, Components, Operator, OperatorSpec, OperatorStatus};

pub mod reference;
pub use reference::{conditions_of, ComponentCondition, ComponentRef, RichReference};

mod error;
pub use error::Error;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
