//! Shared scaffolding of the global-map partitioners.
//!
//! Every partitioner in this crate mutates the replicated
//! [`PartitionMap`] and derives its local view from it. [`GloCore`]
//! bundles the pieces all of them share (communicator, grid indexing,
//! partition map, local indexing, lifecycle state) and implements the
//! query surface of [`super::ParallelGrid`] once. The concrete grids embed
//! a `GloCore` and supply only their repartitioning protocol.

use crate::comm::Communicator;
use crate::error::{RepaError, Result};
use crate::globox::GlobalBox;
use crate::index::{CellIndex, GlobalCell, LocalCell, Rank};
use crate::invariants::ensure;
use crate::metric::Metric;
use crate::partition_map::{LocalIndexing, PartitionMap};
use crate::{Vec3d, Vec3i};

/// Lifecycle of a grid instance.
///
/// `Fresh` instances only accept `after_construction`. A fatal
/// repartitioning failure moves the instance to `Invalid` permanently:
/// partial partition states cannot be reconciled across ranks without a
/// consensus round the library does not offer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Fresh,
    Ready,
    Invalid,
}

/// State and query implementations shared by all partitioners.
pub(crate) struct GloCore<C: Communicator> {
    pub comm: C,
    pub gbox: GlobalBox,
    pub part: PartitionMap,
    pub ix: LocalIndexing,
    pub state: Lifecycle,
    /// Whether rebuilds forget ownership of far-away cells.
    compress: bool,
}

impl<C: Communicator> GloCore<C> {
    pub fn new(comm: C, box_size: Vec3d, min_cell_size: f64, compress: bool) -> Result<Self> {
        let gbox = GlobalBox::new(box_size, min_cell_size)?;
        if gbox.ncells() < comm.size() as u64 {
            return Err(RepaError::FatalPartition(format!(
                "{} cells cannot give each of {} ranks at least one cell",
                gbox.ncells(),
                comm.size()
            )));
        }
        let part = PartitionMap::new(gbox.ncells(), comm.size() as u32);
        Ok(GloCore {
            comm,
            gbox,
            part,
            ix: LocalIndexing::default(),
            state: Lifecycle::Fresh,
            compress,
        })
    }

    #[inline]
    pub fn me(&self) -> Rank {
        Rank::new(self.comm.rank() as u32)
    }

    /// All global cells, ascending by Morton index.
    pub fn cells_in_morton_order(&self) -> Vec<GlobalCell> {
        let mut order: Vec<GlobalCell> = (0..self.gbox.ncells()).map(GlobalCell::new).collect();
        order.sort_unstable_by_key(|&g| self.gbox.morton_of_cell(g));
        order
    }

    /// Install the linear Morton split: contiguous Z-curve arcs, one per
    /// rank, in proportion `1/size`.
    pub fn install_initial_partition(&mut self) {
        let n = self.gbox.ncells();
        let p = self.comm.size() as u64;
        for (j, g) in self.cells_in_morton_order().into_iter().enumerate() {
            self.part.set(g, Rank::new((j as u64 * p / n) as u32));
        }
    }

    /// Fresh → Ready: initial partition plus first rebuild. A no-op on an
    /// instance that is already initialized.
    pub fn after_construction(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Fresh => {
                self.install_initial_partition();
                // The fresh map is fully populated; whole-domain queries
                // stay valid until the first repartition compresses it.
                self.rebuild_with(false);
                self.state = Lifecycle::Ready;
                Ok(())
            }
            Lifecycle::Ready => Ok(()),
            Lifecycle::Invalid => Err(RepaError::GridInvalidated),
        }
    }

    /// Rebuild the local/ghost indexing from the partition map.
    pub fn reinit(&mut self) {
        self.rebuild_with(self.compress);
    }

    fn rebuild_with(&mut self, compress: bool) {
        let me = self.me();
        self.ix = LocalIndexing::rebuild(&mut self.part, &self.gbox, me, compress);
        log::debug!(
            "rank {}: {} local cells, {} ghost cells, {} neighbors",
            self.me(),
            self.ix.n_local,
            self.ix.n_ghost,
            self.ix.neighbors.len()
        );
    }

    pub fn check_ready(&self) -> Result<()> {
        match self.state {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Fresh => Err(RepaError::NotInitialized),
            Lifecycle::Invalid => Err(RepaError::GridInvalidated),
        }
    }

    /// Mark the instance unusable and produce the fatal error.
    pub fn invalidate(&mut self, why: String) -> RepaError {
        self.state = Lifecycle::Invalid;
        RepaError::FatalPartition(why)
    }

    /// Fetch and validate the metric's weight vector.
    pub fn fetch_weights(&self, metric: &dyn Metric) -> Result<Vec<f64>> {
        let weights = metric.cell_weights();
        if weights.len() != self.ix.n_local {
            return Err(RepaError::MetricSizeMismatch {
                expected: self.ix.n_local,
                got: weights.len(),
            });
        }
        Ok(weights)
    }

    // --- query surface shared by all grids ---

    pub fn cell_neighbor_index(&self, cell: LocalCell, k: usize) -> Result<CellIndex> {
        self.check_ready()?;
        let g = self.ix.global_of_local(cell)?;
        let neigh = self.gbox.neighbor(g, k)?;
        let idx = self.ix.global_to_local.get(&neigh).copied();
        ensure!(
            idx.is_some(),
            "shell cell {neigh} of owned cell {g} is neither local nor ghost"
        );
        Ok(idx.unwrap())
    }

    pub fn position_to_cell_index(&self, pos: Vec3d) -> Result<LocalCell> {
        self.check_ready()?;
        let g = self.gbox.cell_at_pos(pos)?;
        match self.ix.global_to_local.get(&g) {
            Some(CellIndex::Local(l)) => Ok(*l),
            _ => Err(RepaError::PositionNotLocal(pos[0], pos[1], pos[2])),
        }
    }

    pub fn position_to_rank(&self, pos: Vec3d) -> Result<Rank> {
        self.check_ready()?;
        let g = self.gbox.cell_at_pos(pos)?;
        self.part.get(g).ok_or(RepaError::OwnershipNotCached(g))
    }

    pub fn position_to_neighbor_index(&self, pos: Vec3d) -> Result<usize> {
        let rank = self.position_to_rank(pos)?;
        self.ix.neighbor_index_of(rank)
    }

    #[cfg(debug_assertions)]
    pub fn global_hash(&self, cell: CellIndex) -> GlobalCell {
        self.ix.global_of(cell)
    }

    /// Cross-rank index checks are a debug facility; release builds
    /// return a constant.
    #[cfg(not(debug_assertions))]
    pub fn global_hash(&self, _cell: CellIndex) -> GlobalCell {
        GlobalCell::new(0)
    }

    pub fn cell_size(&self) -> Vec3d {
        self.gbox.cell_size()
    }

    pub fn grid_size(&self) -> Vec3i {
        self.gbox.grid_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    fn core() -> GloCore<NoComm> {
        let mut core = GloCore::new(NoComm, [1.0, 1.0, 1.0], 0.25, false).unwrap();
        core.after_construction().unwrap();
        core
    }

    #[test]
    fn initial_partition_covers_everything() {
        let core = core();
        assert_eq!(core.ix.n_local, 64);
        assert_eq!(core.ix.n_ghost, 0);
        for raw in 0..64 {
            assert_eq!(core.part.get(GlobalCell::new(raw)), Some(Rank::new(0)));
        }
    }

    #[test]
    fn fresh_instances_reject_queries() {
        let core = GloCore::new(NoComm, [1.0; 3], 0.25, false).unwrap();
        assert!(matches!(
            core.position_to_rank([0.5; 3]),
            Err(RepaError::NotInitialized)
        ));
    }

    #[test]
    fn single_cell_grid_constructs() {
        assert!(GloCore::new(NoComm, [1.0; 3], 2.0, false).is_ok());
    }

    #[test]
    fn neighbor_queries_resolve_everywhere() {
        let core = core();
        for k in 0..27 {
            let idx = core.cell_neighbor_index(LocalCell::new(0), k).unwrap();
            assert!(idx.is_local());
        }
        assert!(core.cell_neighbor_index(LocalCell::new(0), 27).is_err());
        assert!(core.cell_neighbor_index(LocalCell::new(64), 0).is_err());
    }

    #[test]
    fn position_queries_agree() {
        let core = core();
        let pos = [0.1, 0.6, 0.9];
        let l = core.position_to_cell_index(pos).unwrap();
        assert_eq!(core.position_to_rank(pos).unwrap(), Rank::new(0));
        assert_eq!(
            core.ix.global_of_local(l).unwrap(),
            core.gbox.cell_at_pos(pos).unwrap()
        );
    }

    #[test]
    fn morton_order_is_a_permutation() {
        let core = core();
        let order = core.cells_in_morton_order();
        assert_eq!(order.len(), 64);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert!(sorted.windows(2).all(|w| w[0] < w[1]));
    }
}
