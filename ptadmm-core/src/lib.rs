//! ptadmm-core
//!
//! This library provides the distributed coordination layer for joint
//! ptychography-tomography reconstruction with ADMM: the process topology, the
//! partitioning and re-slicing collectives, and the iteration state machine that
//! couples the two subproblems.
//! It is meant for usage with the `tokio` runtime. The numerical solvers for both
//! subproblems are consumed through the traits in [`solver`].
//!
//! # Functionality
//!
//! - Deterministic array partitioning along any axis
//! - Collectives over an in-process SPMD group
//! - ADMM problem formulation and solving
//! - Timing, logging and compressed exports
//!
//! # Features
//!
//! - `rayon` - Run the per-view ptychography updates of a rank in parallel
//!

/// Collective communication between ranks
pub mod comm;

/// Run configuration
pub mod config;

/// Error types
pub mod error;

/// Chunking arrays along an axis
pub mod partition;

/// Problem formulation and solving
pub mod problem;

/// The joint ptychography-tomography coordinator
pub mod ptychotomo;

/// External solver interfaces
pub mod solver;

/// Compressed exports to the local filesystem
pub mod storage;

/// Timing and logging utilities
pub mod timing;
