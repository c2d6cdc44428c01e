//! core
//!
//! Core domain types, schemas, and algorithms for stackguard.
//!
//! # Modules
//!
//! - [`types`] - Strong types: StateId, HolderId, BucketName, etc.
//! - [`graph`] - Dependency graph, cycle detection and ordering
//! - [`config`] - Module configuration resolution (include, merge, substitute)
//! - [`settings`] - User settings and loading
//! - [`retry`] - Bounded retry policy for remote calls
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - Schemas are strict and self-describing
//! - Resolution and ordering are deterministic

pub mod config;
pub mod graph;
pub mod retry;
pub mod settings;
pub mod types;
