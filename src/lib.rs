//! stackguard - Locking, remote state and stack orchestration for Terraform
//!
//! stackguard sits in front of the provisioning tool. Before a module is
//! applied it bootstraps the state bucket and lock table, takes a lock on
//! the module's state, runs the tool, and releases the lock on every exit
//! path. Across a directory tree it discovers modules, orders them by their
//! declared dependencies, and runs them one at a time.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to engine)
//! - [`engine`] - Module pipeline, discovery and stack execution
//! - [`lock`] - Distributed lock manager on top of a lock table
//! - [`remote`] - Object stores, lock tables and state bootstrap
//! - [`core`] - Domain types, configuration resolution, settings and retry
//! - [`ui`] - User interaction utilities
//!
//! # Correctness Invariants
//!
//! 1. At most one holder owns a state's lock at any time
//! 2. A holder never removes a lock it does not hold
//! 3. A lock taken by a run is released before the run returns
//! 4. A stack stops at its first failing module

pub mod cli;
pub mod core;
pub mod engine;
pub mod lock;
pub mod remote;
pub mod ui;
