//! # repa
//!
//! Repa is a library for dynamic load balancing of three-dimensional
//! linked-cell grids in distributed particle simulations. A cubical
//! simulation box is subdivided into a regular grid of cells; each cell is
//! owned by exactly one participating process, and every process keeps a
//! one-cell-thick ghost layer around its owned cells so that short-ranged
//! pair interactions can be evaluated locally.
//!
//! The crate provides interchangeable partitioners behind the
//! [`ParallelGrid`](crate::grids::ParallelGrid) trait:
//!
//! - [`DiffusionGrid`](crate::grids::diffusion::DiffusionGrid): pairwise
//!   load diffusion between neighboring processes (Willebeek-Le Mair /
//!   Reeves scheme),
//! - [`SfcGrid`](crate::grids::sfc::SfcGrid): contiguous arcs of a
//!   Morton/Z-order curve, sized by prefix sums of the cell weights,
//! - [`GraphGrid`](crate::grids::graph::GraphGrid): weighted dual-graph
//!   construction handed to a k-way graph partitioner.
//!
//! All partitioners share a globally replicated cell→owner map and the
//! deterministic local/ghost rebuild in [`partition_map`], which also
//! produces the pairwise ghost-exchange descriptors.
//!
//! Communication runs over the pluggable [`comm::Communicator`] trait:
//! [`comm::NoComm`] for single-process use, [`comm::ThreadComm`] for
//! multi-rank tests on threads, and `comm::MpiComm` for real MPI runs
//! (feature `mpi-support`).
//!
//! ## Usage
//!
//! ```
//! use repa::grids::{make_grid, GridType};
//! use repa::comm::NoComm;
//!
//! let mut grid = make_grid(GridType::Diffusion, NoComm, [1.0, 1.0, 1.0], 0.1).unwrap();
//! assert_eq!(grid.n_local_cells(), 1000);
//! let moved = grid
//!     .repartition(&|| vec![1.0; 1000], &mut |_view| { /* migrate particles */ })
//!     .unwrap();
//! assert!(moved);
//! ```

pub mod comm;
pub mod error;
pub mod globox;
pub mod grids;
pub mod index;
pub mod metric;
pub mod morton;
pub mod partition_map;

mod invariants;

/// 3D position / box-size vector.
pub type Vec3d = [f64; 3];
/// 3D integer grid-dimension vector.
pub type Vec3i = [i32; 3];

/// A convenient prelude importing the most-used types and traits.
pub mod prelude {
    pub use crate::comm::{CommTag, Communicator, NoComm, ThreadComm, Wait};
    pub use crate::error::RepaError;
    pub use crate::globox::GlobalBox;
    pub use crate::grids::{make_grid, GridType, ParallelGrid};
    pub use crate::index::{CellIndex, GhostCell, GlobalCell, LocalCell, Rank};
    pub use crate::metric::Metric;
    pub use crate::partition_map::{GhostExchangeDesc, PartitionMap};
    pub use crate::{Vec3d, Vec3i};
}
