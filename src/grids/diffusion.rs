//! Pairwise load diffusion between neighboring processes.
//!
//! Rebalancing follows the scheme of Willebeek-Le Mair and Reeves (IEEE
//! Tr. Par. Distr. Sys. 4(9), 1993): every rank compares its load against
//! the average over its process neighborhood and, when overloaded, sends
//! border cells to underloaded neighbors in proportion to their
//! deficiency. The scheme is stable (no cell moves when all neighbors are
//! at or above the average) and converges under repeated application.
//!
//! Cells to give away are drawn from a max-heap that prefers cells
//! introducing the fewest new border relations and, among those, the
//! heaviest ones: an approximation to shrinking the exchange surface while
//! meeting the requested volume.
//!
//! Ownership updates propagate in two stages separated by completed
//! receives. Stage A ships the complete send-list matrix (every list, not
//! only the receiver's slice, each tagged with its target rank) to every
//! neighbor, so that ownership reaches ranks whose neighborhood relations
//! are only now coming into existence. Stage B ships, for every moved
//! cell, the owners of its 26-cell shell as seen by the old owner, which
//! resolves the unknown entries around freshly imported cells.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytemuck::{Pod, Zeroable};

use crate::comm::collectives::neighbor_allgather_f64;
use crate::comm::{CommTag, Communicator, DiffusionCommTags, Wait};
use crate::error::{RepaError, Result};
use crate::index::{CellIndex, GlobalCell, LocalCell, Rank};
use crate::invariants::ensure;
use crate::metric::Metric;
use crate::partition_map::{GhostExchangeDesc, PartitionMap};
use crate::{Vec3d, Vec3i};

use super::glomethod::GloCore;
use super::ParallelGrid;

/// Tag for the neighborhood load allgather.
const LOAD_EXCHANGE_TAG: CommTag = CommTag::new(2);
/// Tags for the two propagation stages.
const PROPAGATION_TAGS: DiffusionCommTags = DiffusionCommTags::from_base(CommTag::new(3));

/// Full-shell ownership of one shipped cell, as seen by its old owner.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CellNeighborhood {
    cell: u64,
    owners: [i32; 26],
}

/// Bounds-checked little-endian reader over a received message.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(RepaError::Comm(
                "malformed cell migration message".to_owned(),
            ));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Border cell offered for migration; max-heap key.
#[derive(Copy, Clone, Debug)]
struct Candidate {
    /// `27 - (same-owner border cells in the full shell)`: popping high
    /// values first moves cells that leave the fewest new border relations
    /// behind.
    surface_score: i32,
    weight: f64,
    cell: LocalCell,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.surface_score
            .cmp(&other.surface_score)
            .then(self.weight.total_cmp(&other.weight))
            .then(self.cell.cmp(&other.cell))
    }
}

/// Linked-cell grid rebalanced by neighborhood load diffusion.
pub struct DiffusionGrid<C: Communicator> {
    core: GloCore<C>,
}

impl<C: Communicator> DiffusionGrid<C> {
    pub fn new(comm: C, box_size: Vec3d, min_cell_size: f64) -> Result<Self> {
        Ok(DiffusionGrid {
            // Rebuilds forget far-away ownership; the propagation stages
            // restore what the new neighborhood needs.
            core: GloCore::new(comm, box_size, min_cell_size, true)?,
        })
    }

    /// Load volume to ship to each neighbor, in neighbor-list order.
    /// Collective over the process neighborhood.
    fn compute_send_volume(&self, load: f64) -> Result<Vec<f64>> {
        let neighbors = &self.core.ix.neighbors;
        let neighloads =
            neighbor_allgather_f64(&self.core.comm, neighbors, LOAD_EXCHANGE_TAG, load)?;

        let avg = (neighloads.iter().sum::<f64>() + load) / (neighloads.len() + 1) as f64;
        if load < avg {
            return Ok(vec![0.0; neighloads.len()]);
        }

        let deficiency: Vec<f64> = neighloads.iter().map(|&l| (avg - l).max(0.0)).collect();
        let total: f64 = deficiency.iter().sum();
        if total <= 0.0 {
            // Everyone in the neighborhood is at or above average.
            return Ok(vec![0.0; neighloads.len()]);
        }

        let overload = load - avg;
        Ok(deficiency.into_iter().map(|d| overload * d / total).collect())
    }

    /// Pick border cells to ship until the per-neighbor volumes are spent.
    /// Returns one global-cell list per neighbor.
    fn compute_send_list(
        &self,
        mut send_loads: Vec<f64>,
        weights: &[f64],
    ) -> Vec<Vec<GlobalCell>> {
        let ix = &self.core.ix;
        let me = self.core.me();

        let mut heap = BinaryHeap::with_capacity(ix.border_cells.len());
        for &b in &ix.border_cells {
            let weight = weights[b.index()];
            if weight <= 0.0 {
                continue;
            }
            // Same-owner border cells around b: these turn into new border
            // cells when b leaves.
            let g = ix.cells[b.index()];
            let mut nadditional = 0;
            for neigh in self.core.gbox.full_shell_neigh_without_center(g) {
                if self.core.part.get(neigh) != Some(me) {
                    continue;
                }
                if let Some(CellIndex::Local(l)) = ix.global_to_local.get(&neigh) {
                    if ix.border_cells.binary_search(l).is_ok() {
                        nadditional += 1;
                    }
                }
            }
            heap.push(Candidate {
                surface_score: 27 - nadditional,
                weight,
                cell: b,
            });
        }

        let mut to_send = vec![Vec::new(); send_loads.len()];
        while let Some(c) = heap.pop() {
            for &neighrank in &ix.border_cell_neighbors[&c.cell] {
                let ni = match ix.neighbor_index_of(neighrank) {
                    Ok(ni) => ni,
                    Err(_) => continue,
                };
                if c.weight <= send_loads[ni] {
                    to_send[ni].push(ix.cells[c.cell.index()]);
                    send_loads[ni] -= c.weight;
                    break;
                }
            }
            // Cells without an eligible neighbor simply stay.
        }
        to_send
    }

    /// Stage A payload: the complete send-list matrix, every list tagged
    /// with its target rank. Identical bytes go to every neighbor.
    fn encode_send_matrix(neighbors: &[Rank], to_send: &[Vec<GlobalCell>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(to_send.len() as u32).to_le_bytes());
        for (dest, cells) in neighbors.iter().zip(to_send) {
            buf.extend_from_slice(&dest.get().to_le_bytes());
            buf.extend_from_slice(&(cells.len() as u32).to_le_bytes());
            for g in cells {
                buf.extend_from_slice(&g.get().to_le_bytes());
            }
        }
        buf
    }

    /// Apply a received stage A matrix to the partition map.
    fn apply_send_matrix(part: &mut PartitionMap, bytes: &[u8]) -> Result<()> {
        let mut reader = Reader { buf: bytes };
        let nlists = reader.read_u32()?;
        for _ in 0..nlists {
            let target = reader.read_u32()?;
            ensure!(
                target < part.nranks(),
                "received cells for rank {target}, but communicator has {} ranks",
                part.nranks()
            );
            let count = reader.read_u32()?;
            for _ in 0..count {
                let cell = reader.read_u64()?;
                ensure!(
                    cell < part.ncells(),
                    "received out-of-range cell index {cell}"
                );
                part.set(GlobalCell::new(cell), Rank::new(target));
            }
        }
        Ok(())
    }

    /// Stage B payload for one neighbor: the shell owners of every cell
    /// shipped to it.
    fn encode_neighborhoods(&self, cells: &[GlobalCell]) -> Vec<u8> {
        let records: Vec<CellNeighborhood> = cells
            .iter()
            .map(|&g| {
                let mut owners = [-1i32; 26];
                for (k, neigh) in self
                    .core
                    .gbox
                    .full_shell_neigh_without_center(g)
                    .enumerate()
                {
                    if let Some(r) = self.core.part.get(neigh) {
                        owners[k] = r.to_wire();
                    }
                }
                CellNeighborhood {
                    cell: g.get(),
                    owners,
                }
            })
            .collect();
        bytemuck::cast_slice(&records).to_vec()
    }

    /// Apply received stage B shell ownerships.
    fn apply_neighborhoods(&mut self, bytes: &[u8]) -> Result<()> {
        let record = std::mem::size_of::<CellNeighborhood>();
        if bytes.len() % record != 0 {
            return Err(RepaError::Comm(
                "malformed neighborhood update message".to_owned(),
            ));
        }
        for chunk in bytes.chunks_exact(record) {
            let update: CellNeighborhood = bytemuck::pod_read_unaligned(chunk);
            let g = GlobalCell::new(update.cell);
            ensure!(
                update.cell < self.core.part.ncells(),
                "neighborhood update for out-of-range cell {g}"
            );
            for (k, neigh) in self
                .core
                .gbox
                .full_shell_neigh_without_center(g)
                .enumerate()
            {
                if let Some(owner) = Rank::from_wire(update.owners[k]) {
                    self.core.part.set(neigh, owner);
                }
            }
        }
        Ok(())
    }

    /// Exchange `payloads[i]` with neighbor `i` on `tag` and feed every
    /// received message through `apply`.
    fn exchange_with_neighbors(
        &mut self,
        tag: CommTag,
        payloads: Vec<Vec<u8>>,
        mut apply: impl FnMut(&mut Self, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let neighbors = self.core.ix.neighbors.clone();
        let sends: Vec<_> = neighbors
            .iter()
            .zip(&payloads)
            .map(|(n, p)| self.core.comm.isend(n.index(), tag, p))
            .collect();
        let recvs: Vec<_> = neighbors
            .iter()
            .map(|n| self.core.comm.irecv(n.index(), tag))
            .collect();

        for (handle, peer) in recvs.into_iter().zip(&neighbors) {
            let bytes = handle
                .wait()
                .ok_or_else(|| RepaError::Comm(format!("no data received from rank {peer}")))?;
            apply(self, &bytes)?;
        }
        for s in sends {
            s.wait();
        }
        Ok(())
    }

    /// First cell owned by this rank whose full shell contains an
    /// unresolved owner, if any. Must find nothing after stage B.
    fn find_unresolved_shell(&self) -> Option<GlobalCell> {
        let me = self.core.me();
        for raw in 0..self.core.part.ncells() {
            let g = GlobalCell::new(raw);
            if self.core.part.get(g) != Some(me) {
                continue;
            }
            for neigh in self.core.gbox.full_shell_neigh(g) {
                if self.core.part.get(neigh).is_none() {
                    return Some(neigh);
                }
            }
        }
        None
    }
}

impl<C: Communicator> ParallelGrid for DiffusionGrid<C> {
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
        // Contract checks first; nothing is mutated if they fail.
        let weights = self.core.fetch_weights(metric)?;

        let me = self.core.me();
        self.core.part.compress(&self.core.gbox, me);

        let local_load: f64 = weights.iter().sum();
        let send_volume = self.compute_send_volume(local_load)?;
        log::debug!(
            "rank {me}: load {local_load}, send volumes {send_volume:?} to {:?}",
            self.core.ix.neighbors
        );

        let nneigh = self.core.ix.neighbors.len();
        let mut to_send: Vec<Vec<GlobalCell>> = vec![Vec::new(); nneigh];
        if send_volume.iter().any(|&v| v > 0.0) {
            to_send = self.compute_send_list(send_volume, &weights);
            // Tentative write-back; the stages below make it global.
            for (i, cells) in to_send.iter().enumerate() {
                let dest = self.core.ix.neighbors[i];
                for &g in cells {
                    self.core.part.set(g, dest);
                }
            }
        }

        // Stage A: ship the full send-list matrix to every neighbor, so
        // ownership also reaches ranks that become neighbors only now.
        let matrix = Self::encode_send_matrix(&self.core.ix.neighbors, &to_send);
        let payloads = vec![matrix; nneigh];
        self.exchange_with_neighbors(PROPAGATION_TAGS.cells, payloads, |grid, bytes| {
            Self::apply_send_matrix(&mut grid.core.part, bytes)
        })?;

        // Stage B: ship the shell owners of every cell this rank gave
        // away; receivers resolve the surroundings of imported cells.
        let payloads: Vec<Vec<u8>> = to_send
            .iter()
            .map(|cells| self.encode_neighborhoods(cells))
            .collect();
        self.exchange_with_neighbors(PROPAGATION_TAGS.neighborhoods, payloads, |grid, bytes| {
            grid.apply_neighborhoods(bytes)
        })?;

        if let Some(cell) = self.find_unresolved_shell() {
            return Err(self.core.invalidate(format!(
                "cell {cell} adjacent to the local subdomain has no owner after repartitioning"
            )));
        }

        // From here on position_to_rank answers per the new ownership while
        // the local indexing still reflects the old layout.
        exchange_start(&*self);

        self.core.reinit();
        Ok(true)
    }
}
