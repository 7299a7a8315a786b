//! Space-filling-curve partitioner.
//!
//! Ownership is always a sequence of contiguous arcs of the Morton curve
//! over the cell grid, one arc per rank in rank order. Rebalancing walks
//! the local cell weights in curve order against the global weight prefix
//! and re-cuts the curve so that every rank carries close to `1/size` of
//! the total load.
//!
//! Because the first Morton index of every rank's arc is replicated in
//! `node_first_cell_idx`, `position_to_rank` answers for the *whole*
//! domain with one binary search; this partitioner (together with the
//! static Cartesian decomposition) is the one to use when global position
//! queries must stay available.

use itertools::Itertools;

use crate::comm::collectives::{allreduce_sum_f64, allreduce_sum_u64_vec, exscan_sum_f64};
use crate::comm::{CommTag, Communicator};
use crate::error::Result;
use crate::index::{CellIndex, GlobalCell, LocalCell, Rank};
use crate::invariants::{ensure, ensure_unreachable};
use crate::metric::Metric;
use crate::morton;
use crate::partition_map::GhostExchangeDesc;
use crate::{Vec3d, Vec3i};

use super::glomethod::GloCore;
use super::ParallelGrid;

const LOAD_SUM_TAG: CommTag = CommTag::new(6);
const LOAD_SCAN_TAG: CommTag = CommTag::new(7);
const ARC_COUNT_TAG: CommTag = CommTag::new(8);

/// Linked-cell grid rebalanced by re-cutting the Morton curve.
pub struct SfcGrid<C: Communicator> {
    core: GloCore<C>,
    /// All global cells in ascending Morton order; identical on all ranks.
    morton_order: Vec<GlobalCell>,
    /// Morton index of the first cell of each rank's arc; the final entry
    /// is the cell count of the padded power-of-two cube.
    node_first_cell_idx: Vec<u64>,
}

impl<C: Communicator> SfcGrid<C> {
    pub fn new(comm: C, box_size: Vec3d, min_cell_size: f64) -> Result<Self> {
        let core = GloCore::new(comm, box_size, min_cell_size, false)?;
        let morton_order = core.cells_in_morton_order();
        Ok(SfcGrid {
            core,
            morton_order,
            node_first_cell_idx: Vec::new(),
        })
    }

    /// Recompute the arc boundary table from the partition map.
    ///
    /// Ownership must consist of contiguous Morton arcs in rank order
    /// with every rank owning at least one cell.
    fn refresh_arc_table(&mut self) {
        let nranks = self.core.part.nranks() as usize;
        let side = morton::padded_side(self.core.gbox.grid_size());
        let mut table = vec![u64::MAX; nranks + 1];
        table[nranks] = side * side * side;

        let mut prev: Option<Rank> = None;
        for &g in &self.morton_order {
            let owner = self
                .core
                .part
                .get(g)
                .unwrap_or_else(|| ensure_unreachable!("cell {g} has no owner in a curve partition"));
            if prev != Some(owner) {
                ensure!(
                    prev.map_or(true, |p| p < owner),
                    "ownership along the curve is not a sequence of rank-ordered arcs at cell {g}"
                );
                table[owner.index()] = self.core.gbox.morton_of_cell(g);
                prev = Some(owner);
            }
        }
        ensure!(
            table.iter().all(|&m| m != u64::MAX),
            "a rank owns no cells; the arc table is incomplete"
        );
        self.node_first_cell_idx = table;
    }

    /// Local cells ordered along the curve.
    fn local_cells_in_curve_order(&self) -> Vec<LocalCell> {
        (0..self.core.ix.n_local)
            .map(|i| LocalCell::new(i as u32))
            .sorted_by_key(|l| {
                self.core
                    .gbox
                    .morton_of_cell(self.core.ix.cells[l.index()])
            })
            .collect()
    }
}

impl<C: Communicator> ParallelGrid for SfcGrid<C> {
    fn after_construction(&mut self) -> Result<()> {
        self.core.after_construction()?;
        self.refresh_arc_table();
        Ok(())
    }

    fn n_local_cells(&self) -> usize {
        self.core.ix.n_local
    }

    fn n_ghost_cells(&self) -> usize {
        self.core.ix.n_ghost
    }

    fn neighbor_ranks(&self) -> &[Rank] {
        &self.core.ix.neighbors
    }

    fn cell_size(&self) -> Vec3d {
        self.core.cell_size()
    }

    fn grid_size(&self) -> Vec3i {
        self.core.grid_size()
    }

    fn cell_neighbor_index(&self, cell: LocalCell, k: usize) -> Result<CellIndex> {
        self.core.cell_neighbor_index(cell, k)
    }

    fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        &self.core.ix.exchange
    }

    fn position_to_cell_index(&self, pos: Vec3d) -> Result<LocalCell> {
        self.core.position_to_cell_index(pos)
    }

    /// Whole-domain query through the replicated arc boundary table.
    fn position_to_rank(&self, pos: Vec3d) -> Result<Rank> {
        self.core.check_ready()?;
        let g = self.core.gbox.cell_at_pos(pos)?;
        let m = self.core.gbox.morton_of_cell(g);
        let idx = self.node_first_cell_idx.partition_point(|&first| first <= m);
        ensure!(
            idx >= 1 && idx <= self.core.part.nranks() as usize,
            "morton index {m} is outside the arc table"
        );
        Ok(Rank::new((idx - 1) as u32))
    }

    fn position_to_neighbor_index(&self, pos: Vec3d) -> Result<usize> {
        let rank = self.position_to_rank(pos)?;
        self.core.ix.neighbor_index_of(rank)
    }

    fn global_hash(&self, cell: CellIndex) -> GlobalCell {
        self.core.global_hash(cell)
    }

    fn repartition(
        &mut self,
        metric: &dyn Metric,
        exchange_start: &mut dyn FnMut(&dyn ParallelGrid),
    ) -> Result<bool> {
        self.core.check_ready()?;
        let weights = self.core.fetch_weights(metric)?;

        let nranks = self.core.part.nranks() as usize;
        let local_load: f64 = weights.iter().sum();
        let total = allreduce_sum_f64(&self.core.comm, LOAD_SUM_TAG, local_load)?;
        let prefix = exscan_sum_f64(&self.core.comm, LOAD_SCAN_TAG, local_load)?;
        let target = total / nranks as f64;

        // Cut the curve: cells go to the rank their weight prefix falls
        // into. The local arc starts at this rank's global prefix.
        let mut arc_counts = vec![0u64; nranks];
        let mut running = prefix;
        for l in self.local_cells_in_curve_order() {
            let proc = ((running / target) as usize).min(nranks - 1);
            arc_counts[proc] += 1;
            running += weights[l.index()];
        }
        let arc_counts = allreduce_sum_u64_vec(&self.core.comm, ARC_COUNT_TAG, &arc_counts)?;

        if let Some(empty) = arc_counts.iter().position(|&n| n == 0) {
            // Identical on every rank, so all ranks fail together.
            return Err(self.core.invalidate(format!(
                "rank {empty} would receive no cells; adjust the metric or use fewer ranks"
            )));
        }

        // Materialize the new arcs and detect whether anything moved.
        let mut changed = false;
        let mut along_curve = self.morton_order.iter();
        for (r, &count) in arc_counts.iter().enumerate() {
            let owner = Rank::new(r as u32);
            for _ in 0..count {
                let g = *along_curve
                    .next()
                    .unwrap_or_else(|| ensure_unreachable!("arc counts exceed the number of grid cells"));
                if self.core.part.get(g) != Some(owner) {
                    changed = true;
                    self.core.part.set(g, owner);
                }
            }
        }
        ensure!(
            along_curve.next().is_none(),
            "arc counts do not cover the curve exactly"
        );

        if !changed {
            return Ok(false);
        }

        self.refresh_arc_table();

        // The arc table answers position_to_rank per the new ownership;
        // local indices still reflect the old layout.
        exchange_start(&*self);

        self.core.reinit();
        Ok(true)
    }
}
