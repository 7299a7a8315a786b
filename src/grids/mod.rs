//! Parallel linked-cell grid implementations.
//!
//! [`ParallelGrid`] is the host-facing contract every partitioner
//! fulfills. A grid is constructed over a communicator, a box size and a
//! minimum cell size; after [`after_construction`](ParallelGrid::after_construction)
//! it answers indexing queries and can be rebalanced with
//! [`repartition`](ParallelGrid::repartition).
//!
//! `repartition` is collective: every rank must call it with the same
//! metric semantics. When it returns `true`, all previously issued local,
//! ghost and neighbor indices are invalidated and silently take on new
//! meanings; when it returns `false`, nothing has changed. The migration
//! callback passed in runs exactly once, at the moment `position_to_rank`
//! already answers according to the new partition while the local indexing
//! still reflects the old one; the host packages and ships its particles
//! from within the callback, using the read-only grid view it receives.

use crate::comm::Communicator;
use crate::error::{RepaError, Result};
use crate::index::{CellIndex, GlobalCell, LocalCell, Rank};
use crate::metric::Metric;
use crate::partition_map::GhostExchangeDesc;
use crate::{Vec3d, Vec3i};

pub mod diffusion;
pub(crate) mod glomethod;
pub mod graph;
pub mod sfc;

/// Host-facing interface of a parallel linked-cell grid.
pub trait ParallelGrid {
    /// Install the initial partition; must run once before any query.
    fn after_construction(&mut self) -> Result<()>;

    /// Number of cells owned by this process.
    fn n_local_cells(&self) -> usize;

    /// Number of ghost cells around the owned cells.
    fn n_ghost_cells(&self) -> usize;

    /// Ranks owning cells in the ghost layer; ascending, no duplicates.
    fn neighbor_ranks(&self) -> &[Rank];

    /// Edge lengths of a grid cell.
    fn cell_size(&self) -> Vec3d;

    /// Number of grid cells in each direction.
    fn grid_size(&self) -> Vec3i;

    /// The `k`-th full-shell neighbor of an owned cell, `k ∈ [0, 27)`.
    ///
    /// `k = 0` is the cell itself, `k ∈ [1, 14)` the half shell and
    /// `k ∈ [14, 27)` the mirrored half; see [`crate::globox`] for the
    /// published enumeration.
    fn cell_neighbor_index(&self, cell: LocalCell, k: usize) -> Result<CellIndex>;

    /// Ghost exchange descriptors, one per neighbor rank.
    fn get_boundary_info(&self) -> &[GhostExchangeDesc];

    /// Index of the owned cell containing `pos`.
    fn position_to_cell_index(&self, pos: Vec3d) -> Result<LocalCell>;

    /// Rank responsible for the cell containing `pos`.
    ///
    /// The space-filling-curve grid answers for the whole domain; the
    /// others answer only within the locally cached region.
    fn position_to_rank(&self, pos: Vec3d) -> Result<Rank>;

    /// Index into [`neighbor_ranks`](Self::neighbor_ranks) of the process
    /// owning the cell at `pos`, which must lie in the ghost layer.
    fn position_to_neighbor_index(&self, pos: Vec3d) -> Result<usize>;

    /// Global index of a local or ghost cell.
    ///
    /// Only meaningful in debug builds; release builds return a constant.
    fn global_hash(&self, cell: CellIndex) -> GlobalCell;

    /// Rebalance according to `metric`. Returns whether ownership changed.
    ///
    /// `exchange_start` is invoked exactly once if and only if the result
    /// is `Ok(true)`. At that moment `position_to_rank` on the passed view
    /// already answers per the new ownership, while local and ghost
    /// indices still mean what they meant before the call.
    fn repartition(
        &mut self,
        metric: &dyn Metric,
        exchange_start: &mut dyn FnMut(&dyn ParallelGrid),
    ) -> Result<bool>;

    /// Deliver an implementation-defined tuning command.
    fn command(&mut self, cmd: &str) -> Result<()> {
        Err(RepaError::UnknownCommand(cmd.to_owned()))
    }
}

/// Partitioner selection for [`make_grid`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GridType {
    /// Static Cartesian process grid (external collaborator).
    Cartesian,
    /// Pairwise load diffusion between neighboring processes.
    Diffusion,
    /// Morton-curve arcs sized by weight prefix sums.
    SpaceFillingCurve,
    /// Weighted dual graph handed to a k-way partitioner.
    Graph,
    /// k-d tree decomposition (external collaborator).
    KdTree,
    /// Displaced-grid tetrahedral decomposition (external collaborator).
    GridBased,
    /// Alternating graph/diffusion hybrid (external collaborator).
    HybridGpDiff,
}

impl std::str::FromStr for GridType {
    type Err = RepaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Cart" => Ok(GridType::Cartesian),
            "Diffusion" => Ok(GridType::Diffusion),
            "SFC" => Ok(GridType::SpaceFillingCurve),
            "Graph" => Ok(GridType::Graph),
            "KDTree" => Ok(GridType::KdTree),
            "GridBased" => Ok(GridType::GridBased),
            "HybridGPDiff" => Ok(GridType::HybridGpDiff),
            other => Err(RepaError::UnknownGridType(other.to_owned())),
        }
    }
}

/// Construct and initialize a grid of the requested kind.
///
/// The initial partition of every kind is the linear Morton split:
/// contiguous arcs of the Z-order curve, one per rank, each holding a
/// `1/size` share of the cells.
pub fn make_grid<C: Communicator>(
    kind: GridType,
    comm: C,
    box_size: Vec3d,
    min_cell_size: f64,
) -> Result<Box<dyn ParallelGrid>> {
    let mut grid: Box<dyn ParallelGrid> = match kind {
        GridType::Diffusion => Box::new(diffusion::DiffusionGrid::new(comm, box_size, min_cell_size)?),
        GridType::SpaceFillingCurve => Box::new(sfc::SfcGrid::new(comm, box_size, min_cell_size)?),
        GridType::Graph => Box::new(graph::GraphGrid::new(comm, box_size, min_cell_size)?),
        GridType::Cartesian => return Err(RepaError::UnsupportedGrid("Cart")),
        GridType::KdTree => return Err(RepaError::UnsupportedGrid("KDTree")),
        GridType::GridBased => return Err(RepaError::UnsupportedGrid("GridBased")),
        GridType::HybridGpDiff => return Err(RepaError::UnsupportedGrid("HybridGPDiff")),
    };
    grid.after_construction()?;
    Ok(grid)
}
