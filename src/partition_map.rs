//! The replicated cell→owner map and the local/ghost rebuild.
//!
//! Every rank holds the full [`PartitionMap`]: one owner entry per global
//! cell, with an "unknown" sentinel for cells whose ownership is not
//! currently cached (the diffusion partitioner compresses far-away regions
//! this way). [`LocalIndexing::rebuild`] derives everything a rank needs
//! from the map deterministically:
//!
//! - the owned cells in ascending global order, followed by the ghost
//!   layer in first-visit order,
//! - the global→local index map,
//! - the deduplicated neighbor-rank set,
//! - the border cells and, per border cell, the adjacent foreign ranks,
//! - one [`GhostExchangeDesc`] per neighbor.
//!
//! Because both sides sort their send and receive lists by global cell
//! index, the descriptors of a rank pair line up position by position
//! without any extra negotiation. This function is the only place that
//! creates exchange descriptors; every partitioner funnels through it.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::error::{RepaError, Result};
use crate::globox::GlobalBox;
use crate::index::{CellIndex, GhostCell, GlobalCell, LocalCell, Rank};
use crate::invariants::{ensure, ensure_unreachable};

/// Wire value for "owner unknown".
const UNKNOWN_OWNER: i32 = -1;

/// Ghost exchange agreement with one neighbor rank.
///
/// `send` lists local cells to ship to `dest`, `recv` lists the ghost cells
/// filled from `dest`; both are sorted by global cell index, so the orders
/// on the two sides of the exchange match. The number of cells received
/// always equals the number the peer sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostExchangeDesc {
    pub dest: Rank,
    pub recv: Vec<GhostCell>,
    pub send: Vec<LocalCell>,
}

/// Globally replicated cell ownership with sentinel compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    owners: Vec<i32>,
    nranks: u32,
}

impl PartitionMap {
    /// A map of `ncells` entries, all unknown.
    pub fn new(ncells: u64, nranks: u32) -> Self {
        PartitionMap {
            owners: vec![UNKNOWN_OWNER; ncells as usize],
            nranks,
        }
    }

    #[inline]
    pub fn ncells(&self) -> u64 {
        self.owners.len() as u64
    }

    #[inline]
    pub fn nranks(&self) -> u32 {
        self.nranks
    }

    /// Owner of `cell`, or `None` if not cached on this rank.
    #[inline]
    pub fn get(&self, cell: GlobalCell) -> Option<Rank> {
        Rank::from_wire(self.owners[cell.index()])
    }

    #[inline]
    pub fn set(&mut self, cell: GlobalCell, owner: Rank) {
        ensure!(
            owner.get() < self.nranks,
            "owner {owner} of cell {cell} exceeds communicator size {}",
            self.nranks
        );
        self.owners[cell.index()] = owner.to_wire();
    }

    /// Forget the owner of `cell`.
    #[inline]
    pub fn clear(&mut self, cell: GlobalCell) {
        self.owners[cell.index()] = UNKNOWN_OWNER;
    }

    /// Number of cells currently mapped to `rank`.
    pub fn owned_count(&self, rank: Rank) -> usize {
        let wire = rank.to_wire();
        self.owners.iter().filter(|&&o| o == wire).count()
    }

    /// Forget every cell whose full shell contains no cell of `me`.
    ///
    /// This keeps the cached working set to the local subdomain plus its
    /// surroundings; the diffusion protocol restores the entries it needs
    /// during its neighborhood exchange.
    pub fn compress(&mut self, gbox: &GlobalBox, me: Rank) {
        let wire = me.to_wire();
        for raw in 0..self.owners.len() {
            let g = GlobalCell::new(raw as u64);
            if self
                .full_shell_owners(gbox, g)
                .all(|o| o != wire)
            {
                self.owners[raw] = UNKNOWN_OWNER;
            }
        }
    }

    fn full_shell_owners<'a>(
        &'a self,
        gbox: &'a GlobalBox,
        cell: GlobalCell,
    ) -> impl Iterator<Item = i32> + 'a {
        gbox.full_shell_neigh(cell).map(|n| self.owners[n.index()])
    }
}

/// Per-rank view derived from the partition map; see module docs.
#[derive(Debug, Clone, Default)]
pub struct LocalIndexing {
    /// Owned cells in ascending global order, then ghosts in visit order.
    pub cells: Vec<GlobalCell>,
    /// Inverse of `cells`.
    pub global_to_local: HashMap<GlobalCell, CellIndex>,
    pub n_local: usize,
    pub n_ghost: usize,
    /// Ranks owning at least one ghost cell, ascending, no duplicates.
    pub neighbors: Vec<Rank>,
    /// Owned cells with at least one foreign full-shell neighbor, ascending.
    pub border_cells: Vec<LocalCell>,
    /// Foreign ranks adjacent to each border cell, in visit order.
    pub border_cell_neighbors: HashMap<LocalCell, Vec<Rank>>,
    /// One exchange descriptor per neighbor, ascending by rank.
    pub exchange: Vec<GhostExchangeDesc>,
}

impl LocalIndexing {
    /// Rebuild the local view of `me` from the partition map.
    ///
    /// With `compress`, ownership entries with no local cell in their full
    /// shell are forgotten on the way (the diffusion partitioner's cache
    /// policy); other partitioners keep the map fully populated.
    ///
    /// Every full-shell neighbor of an owned cell must have a cached owner;
    /// the repartition protocols establish this before calling in.
    pub fn rebuild(part: &mut PartitionMap, gbox: &GlobalBox, me: Rank, compress: bool) -> Self {
        let mut ix = LocalIndexing::default();

        // Pass 1: extract the owned cells; optionally drop far-away entries.
        for raw in 0..part.ncells() {
            let g = GlobalCell::new(raw);
            match part.get(g) {
                Some(r) if r == me => {
                    ix.global_to_local
                        .insert(g, CellIndex::Local(LocalCell::new(ix.n_local as u32)));
                    ix.cells.push(g);
                    ix.n_local += 1;
                }
                Some(_) if compress => {
                    if gbox.full_shell_neigh(g).all(|n| part.get(n) != Some(me)) {
                        part.clear(g);
                    }
                }
                _ => {}
            }
        }

        // Pass 2: ghost layer, border bookkeeping and per-neighbor cell
        // lists, still keyed by global index.
        let mut tmp: BTreeMap<Rank, (Vec<GlobalCell>, Vec<GlobalCell>)> = BTreeMap::new();
        for i in 0..ix.n_local {
            let g = ix.cells[i];
            let lidx = LocalCell::new(i as u32);
            for neigh in gbox.full_shell_neigh_without_center(g) {
                let owner = part.get(neigh).unwrap_or_else(|| {
                    ensure_unreachable!(
                        "cell {neigh} in the shell of owned cell {g} has no cached owner"
                    )
                });
                if owner == me {
                    continue;
                }

                if ix.border_cells.last() != Some(&lidx) {
                    ix.border_cells.push(lidx);
                }
                let adjacent = ix.border_cell_neighbors.entry(lidx).or_default();
                if !adjacent.contains(&owner) {
                    adjacent.push(owner);
                }

                if !ix.global_to_local.contains_key(&neigh) {
                    ix.global_to_local
                        .insert(neigh, CellIndex::Ghost(GhostCell::new(ix.n_ghost as u32)));
                    ix.cells.push(neigh);
                    ix.n_ghost += 1;
                }

                let (recv, send) = tmp.entry(owner).or_default();
                recv.push(neigh);
                send.push(g);
            }
        }

        // Materialize the exchange descriptors: deduplicate, order by
        // global index, then translate into local/ghost indices.
        for (owner, (mut recv, mut send)) in tmp {
            recv.sort_unstable();
            recv.dedup();
            send.sort_unstable();
            send.dedup();

            let recv = recv
                .into_iter()
                .map(|g| match ix.global_to_local[&g] {
                    CellIndex::Ghost(gh) => gh,
                    CellIndex::Local(_) => {
                        ensure_unreachable!("foreign cell {g} mapped to a local index")
                    }
                })
                .collect();
            let send = send
                .into_iter()
                .map(|g| match ix.global_to_local[&g] {
                    CellIndex::Local(l) => l,
                    CellIndex::Ghost(_) => {
                        ensure_unreachable!("owned cell {g} mapped to a ghost index")
                    }
                })
                .collect();

            ix.neighbors.push(owner);
            ix.exchange.push(GhostExchangeDesc {
                dest: owner,
                recv,
                send,
            });
        }

        ix
    }

    /// Global index of a local or ghost cell, unchecked.
    #[inline]
    pub fn global_of(&self, idx: CellIndex) -> GlobalCell {
        self.cells[idx.combined_index(self.n_local)]
    }

    /// Global index of an owned cell.
    pub fn global_of_local(&self, cell: LocalCell) -> Result<GlobalCell> {
        self.cells
            .get(cell.index())
            .filter(|_| cell.index() < self.n_local)
            .copied()
            .ok_or(RepaError::CellIndexOutOfRange {
                index: cell.index(),
                limit: self.n_local,
            })
    }

    /// Position of `rank` in the neighbor list.
    pub fn neighbor_index_of(&self, rank: Rank) -> Result<usize> {
        self.neighbors
            .binary_search(&rank)
            .map_err(|_| RepaError::RankNotNeighbor(rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gbox4() -> GlobalBox {
        GlobalBox::new([4.0, 4.0, 4.0], 1.0).unwrap()
    }

    /// Owner map splitting the 4x4x4 grid into two z-slabs.
    fn slab_map(gbox: &GlobalBox) -> PartitionMap {
        let mut part = PartitionMap::new(gbox.ncells(), 2);
        for raw in 0..gbox.ncells() {
            let g = GlobalCell::new(raw);
            let owner = if gbox.unlinearize(g)[2] < 2 { 0 } else { 1 };
            part.set(g, Rank::new(owner));
        }
        part
    }

    #[test]
    fn single_rank_has_no_ghosts() {
        let gbox = gbox4();
        let mut part = PartitionMap::new(gbox.ncells(), 1);
        for raw in 0..gbox.ncells() {
            part.set(GlobalCell::new(raw), Rank::new(0));
        }
        let ix = LocalIndexing::rebuild(&mut part, &gbox, Rank::new(0), false);
        assert_eq!(ix.n_local, 64);
        assert_eq!(ix.n_ghost, 0);
        assert!(ix.neighbors.is_empty());
        assert!(ix.border_cells.is_empty());
        assert!(ix.exchange.is_empty());
    }

    #[test]
    fn local_cells_are_ascending() {
        let gbox = gbox4();
        let mut part = slab_map(&gbox);
        let ix = LocalIndexing::rebuild(&mut part, &gbox, Rank::new(0), false);
        assert_eq!(ix.n_local, 32);
        assert!(ix.cells[..ix.n_local].windows(2).all(|w| w[0] < w[1]));
        for (i, &g) in ix.cells[..ix.n_local].iter().enumerate() {
            assert_eq!(
                ix.global_to_local[&g],
                CellIndex::Local(LocalCell::new(i as u32))
            );
        }
    }

    #[test]
    fn slab_ghost_layer_is_the_other_slab_boundary() {
        // With periodic wrap, both z-slabs touch through both faces: the
        // entire other slab is in the ghost layer.
        let gbox = gbox4();
        let mut part = slab_map(&gbox);
        let ix = LocalIndexing::rebuild(&mut part, &gbox, Rank::new(0), false);
        assert_eq!(ix.n_ghost, 32);
        assert_eq!(ix.neighbors, vec![Rank::new(1)]);
        // All owned cells sit on the subdomain boundary.
        assert_eq!(ix.border_cells.len(), 32);
        for l in &ix.border_cells {
            assert_eq!(ix.border_cell_neighbors[l], vec![Rank::new(1)]);
        }
    }

    #[test]
    fn exchange_descriptors_are_reciprocal() {
        let gbox = gbox4();
        let mut part0 = slab_map(&gbox);
        let mut part1 = slab_map(&gbox);
        let ix0 = LocalIndexing::rebuild(&mut part0, &gbox, Rank::new(0), false);
        let ix1 = LocalIndexing::rebuild(&mut part1, &gbox, Rank::new(1), false);

        let d01 = &ix0.exchange[0];
        let d10 = &ix1.exchange[0];
        assert_eq!(d01.dest, Rank::new(1));
        assert_eq!(d10.dest, Rank::new(0));
        assert_eq!(d01.send.len(), d10.recv.len());
        assert_eq!(d01.recv.len(), d10.send.len());

        // Pairwise matching: entry i of the send list is the same global
        // cell as entry i of the peer's receive list.
        for (s, r) in d01.send.iter().zip(&d10.recv) {
            assert_eq!(
                ix0.global_of(CellIndex::Local(*s)),
                ix1.global_of(CellIndex::Ghost(*r))
            );
        }
        for (s, r) in d10.send.iter().zip(&d01.recv) {
            assert_eq!(
                ix1.global_of(CellIndex::Local(*s)),
                ix0.global_of(CellIndex::Ghost(*r))
            );
        }

        // Send lists are sorted by global index.
        for d in [d01, d10] {
            assert!(d.send.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn compress_forgets_far_cells() {
        let gbox = GlobalBox::new([8.0, 1.0, 1.0], 1.0).unwrap();
        let mut part = PartitionMap::new(gbox.ncells(), 4);
        for raw in 0..8 {
            part.set(GlobalCell::new(raw), Rank::new((raw / 2) as u32));
        }
        part.compress(&gbox, Rank::new(0));
        // Own cells 0,1 plus the periodic x-neighbors 2 and 7 survive.
        let known: Vec<u64> = (0..8)
            .filter(|&raw| part.get(GlobalCell::new(raw)).is_some())
            .collect();
        assert_eq!(known, vec![0, 1, 2, 7]);
    }

    #[test]
    fn owned_count_counts() {
        let gbox = gbox4();
        let part = slab_map(&gbox);
        assert_eq!(part.owned_count(Rank::new(0)), 32);
        assert_eq!(part.owned_count(Rank::new(1)), 32);
    }
}
