//! Dual-graph partitioner.
//!
//! The cell grid is expressed as a weighted graph (one vertex per cell,
//! edges to the 26 full-shell neighbors, vertex weights from the metric,
//! edge weights from the optional cell-pair metric) and handed to a k-way
//! graph partitioner through the [`KWayPartitioner`] seam.
//!
//! Cell weights are replicated with an allgather first, so every rank
//! partitions identical input and deterministically computes the identical
//! ownership vector; no staged propagation is needed afterwards. The
//! built-in backend is a deterministic greedy graph-growing routine;
//! enabling the `metis-support` feature switches to METIS's multilevel
//! k-way partitioner.

use std::collections::VecDeque;

use rayon::prelude::*;

use crate::comm::collectives::allgather_bytes;
use crate::comm::{CommTag, Communicator};
use crate::error::{RepaError, Result};
use crate::globox::GlobalBox;
use crate::index::{CellIndex, GlobalCell, LocalCell, Rank};
use crate::invariants::ensure;
use crate::metric::Metric;
use crate::partition_map::GhostExchangeDesc;
use crate::{Vec3d, Vec3i};

use super::glomethod::GloCore;
use super::ParallelGrid;

const WEIGHT_GATHER_TAG: CommTag = CommTag::new(9);

/// Integer budget vertex weights are scaled into.
const VERTEX_WEIGHT_SCALE: f64 = 65536.0;

/// CSR dual graph of the cell grid.
///
/// Vertex `i` is global cell `i`; neighbor lists are sorted, deduplicated
/// and free of self-loops, so the layout is identical on every rank.
#[derive(Debug, Clone)]
pub struct CellGraph {
    pub xadj: Vec<usize>,
    pub adjncy: Vec<usize>,
    pub vwgt: Vec<i64>,
    pub adjwgt: Vec<i64>,
}

impl CellGraph {
    pub fn nvertices(&self) -> usize {
        self.vwgt.len()
    }

    fn neighbors_of(&self, v: usize) -> &[usize] {
        &self.adjncy[self.xadj[v]..self.xadj[v + 1]]
    }
}

/// Seam to the k-way graph partitioning routine: CSR plus weights in,
/// one owner per vertex out. Every rank must compute the same result from
/// the same input.
pub trait KWayPartitioner: Send + Sync {
    fn partition(&self, graph: &CellGraph, nparts: usize) -> Result<Vec<Rank>>;
}

/// Deterministic greedy graph growing: parts are grown one after the
/// other from the smallest unassigned vertex, absorbing frontier vertices
/// breadth-first until the part reaches its share of the remaining weight.
/// Every part receives at least one vertex.
pub struct GreedyGrowingPartitioner;

impl KWayPartitioner for GreedyGrowingPartitioner {
    fn partition(&self, graph: &CellGraph, nparts: usize) -> Result<Vec<Rank>> {
        let n = graph.nvertices();
        if nparts == 0 || n < nparts {
            return Err(RepaError::FatalPartition(format!(
                "cannot split {n} cells into {nparts} parts"
            )));
        }

        let mut owner: Vec<Option<Rank>> = vec![None; n];
        let mut unassigned = n;

        for r in 0..nparts {
            let rank = Rank::new(r as u32);
            if r == nparts - 1 {
                for o in owner.iter_mut().filter(|o| o.is_none()) {
                    *o = Some(rank);
                }
                break;
            }

            let remaining_weight: i64 = owner
                .iter()
                .zip(&graph.vwgt)
                .filter(|(o, _)| o.is_none())
                .map(|(_, &w)| w)
                .sum();
            let target = remaining_weight as f64 / (nparts - r) as f64;

            let mut acc = 0.0;
            let mut taken = 0usize;
            let mut queue: VecDeque<usize> = VecDeque::new();
            let mut seed_scan = 0usize;

            loop {
                if taken > 0 && acc >= target {
                    break;
                }
                // Leave enough vertices for the parts still to come.
                if unassigned <= nparts - r - 1 {
                    break;
                }

                let v = loop {
                    match queue.pop_front() {
                        Some(v) if owner[v].is_none() => break Some(v),
                        Some(_) => continue,
                        None => {
                            // Grow from the next untouched vertex when the
                            // frontier dries up (disconnected remainder).
                            while seed_scan < n && owner[seed_scan].is_some() {
                                seed_scan += 1;
                            }
                            break (seed_scan < n).then_some(seed_scan);
                        }
                    }
                };
                let Some(v) = v else { break };

                owner[v] = Some(rank);
                acc += graph.vwgt[v] as f64;
                taken += 1;
                unassigned -= 1;
                for &u in graph.neighbors_of(v) {
                    if owner[u].is_none() {
                        queue.push_back(u);
                    }
                }
            }
        }

        Ok(owner
            .into_iter()
            .map(|o| o.expect("greedy growing left a vertex unassigned"))
            .collect())
    }
}

#[cfg(feature = "metis-support")]
mod metis {
    //! Minimal binding to `METIS_PartGraphKway`; linked by build.rs.

    use super::{CellGraph, KWayPartitioner, RepaError, Result};
    use crate::index::Rank;

    pub type Idx = i32;
    const METIS_OK: std::os::raw::c_int = 1;
    const METIS_NOPTIONS: usize = 40;

    extern "C" {
        fn METIS_SetDefaultOptions(options: *mut Idx) -> std::os::raw::c_int;
        fn METIS_PartGraphKway(
            nvtxs: *mut Idx,
            ncon: *mut Idx,
            xadj: *mut Idx,
            adjncy: *mut Idx,
            vwgt: *mut Idx,
            vsize: *mut Idx,
            adjwgt: *mut Idx,
            nparts: *mut Idx,
            tpwgts: *mut f32,
            ubvec: *mut f32,
            options: *mut Idx,
            objval: *mut Idx,
            part: *mut Idx,
        ) -> std::os::raw::c_int;
    }

    /// Multilevel k-way partitioning via METIS.
    pub struct MetisPartitioner;

    impl KWayPartitioner for MetisPartitioner {
        fn partition(&self, graph: &CellGraph, nparts: usize) -> Result<Vec<Rank>> {
            let clamp = |w: i64| -> Idx { w.clamp(1, Idx::MAX as i64) as Idx };
            let mut nvtxs = graph.nvertices() as Idx;
            let mut ncon: Idx = 1;
            let mut nparts_idx = nparts as Idx;
            let mut xadj: Vec<Idx> = graph.xadj.iter().map(|&x| x as Idx).collect();
            let mut adjncy: Vec<Idx> = graph.adjncy.iter().map(|&x| x as Idx).collect();
            let mut vwgt: Vec<Idx> = graph.vwgt.iter().map(|&w| clamp(w)).collect();
            let mut adjwgt: Vec<Idx> = graph.adjwgt.iter().map(|&w| clamp(w)).collect();
            let mut options = [0 as Idx; METIS_NOPTIONS];
            let mut objval: Idx = 0;
            let mut part = vec![0 as Idx; graph.nvertices()];

            let ret = unsafe {
                METIS_SetDefaultOptions(options.as_mut_ptr());
                METIS_PartGraphKway(
                    &mut nvtxs,
                    &mut ncon,
                    xadj.as_mut_ptr(),
                    adjncy.as_mut_ptr(),
                    vwgt.as_mut_ptr(),
                    std::ptr::null_mut(),
                    adjwgt.as_mut_ptr(),
                    &mut nparts_idx,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    options.as_mut_ptr(),
                    &mut objval,
                    part.as_mut_ptr(),
                )
            };
            if ret != METIS_OK {
                return Err(RepaError::FatalPartition(format!(
                    "METIS_PartGraphKway failed with status {ret}"
                )));
            }
            part.into_iter()
                .map(|p| {
                    u32::try_from(p).map(Rank::new).map_err(|_| {
                        RepaError::FatalPartition(format!("METIS returned invalid part {p}"))
                    })
                })
                .collect()
        }
    }
}

fn default_backend() -> Box<dyn KWayPartitioner> {
    #[cfg(feature = "metis-support")]
    {
        Box::new(metis::MetisPartitioner)
    }
    #[cfg(not(feature = "metis-support"))]
    {
        Box::new(GreedyGrowingPartitioner)
    }
}

/// Build the weighted dual graph of the whole grid.
fn build_cell_graph(gbox: &GlobalBox, weights: &[f64], metric: &dyn Metric) -> CellGraph {
    let n = weights.len();

    // Neighbor rows are independent of each other; build them in parallel.
    let rows: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|raw| {
            let g = GlobalCell::new(raw as u64);
            let mut nbrs: Vec<usize> = gbox
                .full_shell_neigh_without_center(g)
                .map(|h| h.index())
                .filter(|&h| h != raw)
                .collect();
            nbrs.sort_unstable();
            nbrs.dedup();
            nbrs
        })
        .collect();

    let max_weight = weights.iter().copied().fold(0.0f64, f64::max);
    let vwgt: Vec<i64> = if max_weight > 0.0 {
        weights
            .iter()
            .map(|&w| ((w * VERTEX_WEIGHT_SCALE / max_weight).round() as i64).max(1))
            .collect()
    } else {
        vec![1; n]
    };

    let mut xadj = Vec::with_capacity(n + 1);
    let mut adjncy = Vec::new();
    let mut adjwgt = Vec::new();
    xadj.push(0);
    for (raw, row) in rows.into_iter().enumerate() {
        let g = GlobalCell::new(raw as u64);
        for h in row {
            adjwgt.push(
                (metric
                    .cell_pair_weight(g, GlobalCell::new(h as u64))
                    .round() as i64)
                    .max(1),
            );
            adjncy.push(h);
        }
        xadj.push(adjncy.len());
    }

    CellGraph {
        xadj,
        adjncy,
        vwgt,
        adjwgt,
    }
}

/// Linked-cell grid rebalanced by k-way graph partitioning.
pub struct GraphGrid<C: Communicator> {
    core: GloCore<C>,
    backend: Box<dyn KWayPartitioner>,
}

impl<C: Communicator> GraphGrid<C> {
    pub fn new(comm: C, box_size: Vec3d, min_cell_size: f64) -> Result<Self> {
        Ok(GraphGrid {
            core: GloCore::new(comm, box_size, min_cell_size, false)?,
            backend: default_backend(),
        })
    }

    /// Gather every rank's `(cell, weight)` pairs so all ranks hold the
    /// full weight vector.
    fn replicate_weights(&self, weights: &[f64]) -> Result<Vec<f64>> {
        let mut blob = Vec::with_capacity(weights.len() * 16);
        for (i, &w) in weights.iter().enumerate() {
            blob.extend_from_slice(&self.core.ix.cells[i].get().to_le_bytes());
            blob.extend_from_slice(&w.to_le_bytes());
        }
        let gathered = allgather_bytes(&self.core.comm, WEIGHT_GATHER_TAG, &blob)?;

        let n = self.core.part.ncells() as usize;
        let mut all = vec![None; n];
        for (rank, bytes) in gathered.iter().enumerate() {
            if bytes.len() % 16 != 0 {
                return Err(RepaError::Comm(format!(
                    "malformed weight message from rank {rank}"
                )));
            }
            for pair in bytes.chunks_exact(16) {
                let cell = u64::from_le_bytes(pair[..8].try_into().unwrap()) as usize;
                let w = f64::from_le_bytes(pair[8..].try_into().unwrap());
                ensure!(cell < n, "weight reported for out-of-range cell {cell}");
                all[cell] = Some(w);
            }
        }
        all.into_iter()
            .enumerate()
            .map(|(cell, w)| {
                w.ok_or_else(|| {
                    RepaError::FatalPartition(format!("no rank reported a weight for cell {cell}"))
                })
            })
            .collect()
    }
}

impl<C: Communicator> ParallelGrid for GraphGrid<C> {
    fn after_construction(&mut self) -> Result<()> {
        self.core.after_construction()
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

    fn position_to_rank(&self, pos: Vec3d) -> Result<Rank> {
        self.core.position_to_rank(pos)
    }

    fn position_to_neighbor_index(&self, pos: Vec3d) -> Result<usize> {
        self.core.position_to_neighbor_index(pos)
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

        let all_weights = self.replicate_weights(&weights)?;
        let graph = build_cell_graph(&self.core.gbox, &all_weights, metric);

        let nranks = self.core.part.nranks() as usize;
        let new_owners = match self.backend.partition(&graph, nranks) {
            Ok(o) => o,
            Err(e) => return Err(self.core.invalidate(e.to_string())),
        };
        ensure!(
            new_owners.len() == graph.nvertices(),
            "partitioner returned {} owners for {} cells",
            new_owners.len(),
            graph.nvertices()
        );

        let mut counts = vec![0u64; nranks];
        for o in &new_owners {
            counts[o.index()] += 1;
        }
        if let Some(empty) = counts.iter().position(|&c| c == 0) {
            return Err(self.core.invalidate(format!(
                "rank {empty} would receive no cells from the graph partitioner"
            )));
        }

        // Deterministic input, deterministic routine: every rank sees the
        // same result and the same change verdict.
        let changed = (0..new_owners.len())
            .any(|raw| self.core.part.get(GlobalCell::new(raw as u64)) != Some(new_owners[raw]));
        if !changed {
            return Ok(false);
        }

        for (raw, &owner) in new_owners.iter().enumerate() {
            self.core.part.set(GlobalCell::new(raw as u64), owner);
        }

        exchange_start(&*self);

        self.core.reinit();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    fn chain_graph(n: usize) -> CellGraph {
        // Path graph with unit weights.
        let mut xadj = vec![0];
        let mut adjncy = Vec::new();
        for v in 0..n {
            if v > 0 {
                adjncy.push(v - 1);
            }
            if v + 1 < n {
                adjncy.push(v + 1);
            }
            xadj.push(adjncy.len());
        }
        let nedges = adjncy.len();
        CellGraph {
            xadj,
            adjncy,
            vwgt: vec![1; n],
            adjwgt: vec![1; nedges],
        }
    }

    #[test]
    fn greedy_growing_balances_a_chain() {
        let graph = chain_graph(12);
        let owners = GreedyGrowingPartitioner.partition(&graph, 3).unwrap();
        for r in 0..3 {
            let count = owners.iter().filter(|o| o.index() == r).count();
            assert_eq!(count, 4, "part {r} is unbalanced: {owners:?}");
        }
        // Parts of a chain grown greedily are contiguous.
        assert!(owners.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn greedy_growing_gives_every_part_a_vertex() {
        let graph = chain_graph(5);
        let owners = GreedyGrowingPartitioner.partition(&graph, 5).unwrap();
        let mut seen = vec![false; 5];
        for o in owners {
            seen[o.index()] = true;
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn greedy_growing_rejects_too_many_parts() {
        let graph = chain_graph(3);
        assert!(GreedyGrowingPartitioner.partition(&graph, 4).is_err());
    }

    #[test]
    fn heavy_vertices_shrink_their_part() {
        let mut graph = chain_graph(8);
        graph.vwgt = vec![7, 1, 1, 1, 1, 1, 1, 1];
        let owners = GreedyGrowingPartitioner.partition(&graph, 2).unwrap();
        // Vertex 0 carries half the total weight alone.
        assert_eq!(owners.iter().filter(|o| o.index() == 0).count(), 1);
    }

    #[test]
    fn dual_graph_has_expected_shape() {
        let gbox = GlobalBox::new([1.0; 3], 0.25).unwrap();
        let weights = vec![1.0; 64];
        let metric = || vec![1.0; 64];
        let graph = build_cell_graph(&gbox, &weights, &metric);
        assert_eq!(graph.nvertices(), 64);
        assert_eq!(graph.xadj.len(), 65);
        // On a 4^3 periodic grid every cell has all 26 distinct neighbors.
        for v in 0..64 {
            assert_eq!(graph.neighbors_of(v).len(), 26);
            assert!(graph.neighbors_of(v).windows(2).all(|w| w[0] < w[1]));
        }
        assert!(graph.vwgt.iter().all(|&w| w >= 1));
    }

    #[test]
    fn single_rank_repartition_changes_nothing() {
        let mut g = GraphGrid::new(NoComm, [1.0; 3], 0.25).unwrap();
        g.after_construction().unwrap();
        let changed = g
            .repartition(&|| vec![1.0; 64], &mut |_| {
                panic!("no migration may start when nothing moves")
            })
            .unwrap();
        assert!(!changed);
        assert_eq!(g.n_local_cells(), 64);
    }
}
