//! Unified error type for the repa public API.
//!
//! Contract violations (domain errors, metric size mismatches, unknown
//! commands) are recoverable: the partitioner has not mutated any state and
//! stays usable. Protocol failures during `repartition` are not: the
//! instance transitions to an invalid state and every further operation
//! reports [`RepaError::GridInvalidated`].

use thiserror::Error;

use crate::index::{GlobalCell, Rank};

/// Error type for all fallible repa operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RepaError {
    /// Position lies outside the simulation box (after face snapping).
    #[error("position [{0}, {1}, {2}] is outside the simulation box")]
    PositionOutsideBox(f64, f64, f64),
    /// Position resolves to a cell that is not owned by this process.
    #[error("position [{0}, {1}, {2}] is not in the local subdomain")]
    PositionNotLocal(f64, f64, f64),
    /// Position resolves to a cell whose ownership is not cached locally.
    #[error("cell {0} is not resolvable from this process")]
    OwnershipNotCached(GlobalCell),
    /// Position does not lie in the ghost layer of this process.
    #[error("rank {0} is not a neighbor of this process")]
    RankNotNeighbor(Rank),
    /// A cell index was outside the local (or local+ghost) range.
    #[error("cell index {index} out of range ({limit} cells)")]
    CellIndexOutOfRange { index: usize, limit: usize },
    /// A full-shell neighbor index was outside `[0, 27)`.
    #[error("neighbor index {0} out of range [0, 27)")]
    NeighborIndexOutOfRange(usize),

    /// The metric returned a weight vector of the wrong length.
    #[error("metric returned {got} weights, expected {expected}")]
    MetricSizeMismatch { expected: usize, got: usize },
    /// `command` received a string no partitioner option matches.
    #[error("could not interpret command `{0}'")]
    UnknownCommand(String),

    /// A repartitioning step produced a state that cannot be reconciled
    /// across ranks (zero-cell rank, unresolved ownership after the
    /// neighborhood exchange, failed external partitioner).
    #[error("fatal partitioning failure: {0}")]
    FatalPartition(String),
    /// The instance went through a fatal repartitioning failure earlier.
    #[error("grid was invalidated by a previous repartitioning failure")]
    GridInvalidated,
    /// Operation requires `after_construction` to have run.
    #[error("grid is not initialized; call after_construction first")]
    NotInitialized,

    /// Box or minimum cell size do not describe a usable grid.
    #[error("invalid grid geometry: {0}")]
    InvalidGeometry(String),
    /// Requested grid kind is recognized but not provided by this crate.
    #[error("grid type `{0}' is not supported by this build")]
    UnsupportedGrid(&'static str),
    /// Requested grid kind is not a known factory name.
    #[error("unknown grid type `{0}'")]
    UnknownGridType(String),

    /// A message exchange failed.
    #[error("communication error: {0}")]
    Comm(String),
}

/// Crate-wide result alias.
pub type Result<T, E = RepaError> = std::result::Result<T, E>;
