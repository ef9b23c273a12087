use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use thiserror::Error;

use crate::comm::Collective;

/// A split axis is too short to hand every process a non-empty chunk.
///
/// Raised by `scatter` on the coordinating process and by the re-slice
/// collectives on every process. The error travels inside the scatter parcel
/// so that every rank of the group fails with the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("cannot partition axis {axis} of length {len} across {parts} processes")]
pub struct PartitionError {
    /// Index of the axis being split
    pub axis: usize,
    /// Length of that axis
    pub len: usize,
    /// Number of partitions requested (the process count)
    pub parts: usize,
}

/// The per-view arrays handed to the coordinator disagree in length.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("per-view arrays disagree in length: data={data}, theta={theta}, v={v}, h={h}")]
pub struct ShapeMismatchError {
    pub data: usize,
    pub theta: usize,
    pub v: usize,
    pub h: usize,
}

impl ShapeMismatchError {
    /// Returns `Ok(views)` when all four lengths agree.
    pub fn check(data: usize, theta: usize, v: usize, h: usize) -> Result<usize, Self> {
        if data == theta && theta == v && v == h {
            Ok(data)
        } else {
            Err(ShapeMismatchError { data, theta, v, h })
        }
    }
}

/// Error reported by an external subproblem solver.
///
/// # Example
///
/// ```rust
/// # use ptadmm_core::error::SolverError;
///
/// fn might_fail() -> Result<(), SolverError> {
///     Err(SolverError::from_string("line search diverged".to_string()))
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverError {
    /// The error message describing what went wrong
    message: String,
}

impl SolverError {
    /// Creates a new `SolverError` from a string message.
    pub fn from_string(message: String) -> Self {
        SolverError { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for SolverError {}

/// Primary error type for the coordination layer.
#[derive(Error, Debug)]
pub enum AdmmError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatchError),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Rank {rank} lost every peer of its group")]
    Disconnected { rank: usize },
    #[error(
        "Rank {rank} expected {expected:?} for collective #{sequence} but rank {source_rank} sent {received:?}"
    )]
    CollectiveMismatch {
        rank: usize,
        source_rank: usize,
        sequence: u64,
        expected: Collective,
        received: Collective,
    },
    #[error("The coordinating process supplied no value for {0:?}")]
    MissingRootValue(Collective),
    #[error("Object must have 3 or 4 axes, got {0}")]
    ObjectRank(usize),
    #[error("Coordinator step called before the problem was scattered")]
    NotScattered,
    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Rank task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
