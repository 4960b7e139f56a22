//! Runtime for aggregating the components of operators
//!
//! This crate contains the moving parts that keep an `Operator`'s
//! `status.components` current: resilient watches, a per-instance fan-in of
//! watch tasks, the owner index shared by all instances, the reference set
//! state machine and the status publisher.
//!
//! Newcomers should generally get started with the [`Controller`], which
//! runs one unit per operator and manages all state internals for you.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions)]

pub mod adoption;
pub mod controller;
pub mod manager;
pub mod publisher;
pub mod reconciler;
pub mod wait;
pub mod watcher;

pub use adoption::{AdoptionConfig, AdoptionError, OwnerIndex};
pub use controller::{Controller, ControllerConfig, KindSelection};
pub use manager::WatchManager;
pub use publisher::StatusPublisher;
pub use reconciler::Reconciler;
pub use watcher::watcher;
