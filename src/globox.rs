//! Global indexing of the regular cell grid.
//!
//! [`GlobalBox`] is a pure indexing service over a fixed cubical grid: it
//! owns no per-process state and every method is a function of its inputs,
//! so all processes answer position and neighborhood queries identically.
//!
//! ## Full-shell enumeration
//!
//! `neighbor(cell, k)` enumerates the 27-cell periodic full shell:
//!
//! - `k = 0` is the cell itself,
//! - `k = 1..=13` is the half shell: the first 13 non-zero offsets of the
//!   lexicographic walk over `(dz, dy, dx) ∈ {-1, 0, 1}³`,
//! - `k = 14..=26` are their negations, in the same order.
//!
//! The half shell together with cell-self pairs visits every unordered
//! neighbor pair exactly once; host simulations rely on this to apply
//! Newton's third law by iterating `k < 14` only. This enumeration is a
//! published contract of the library.

use crate::error::{RepaError, Result};
use crate::index::GlobalCell;
use crate::{Vec3d, Vec3i};

/// Relative float tolerance for positions on box faces.
const ROUND_ERROR_PREC: f64 = 1e-14;

/// Offsets `[dx, dy, dz]` of the full-shell enumeration; see module docs.
pub const FULL_SHELL_OFFSETS: [[i32; 3]; 27] = [
    [0, 0, 0],
    // k = 1..=13: half shell.
    [-1, -1, -1],
    [0, -1, -1],
    [1, -1, -1],
    [-1, 0, -1],
    [0, 0, -1],
    [1, 0, -1],
    [-1, 1, -1],
    [0, 1, -1],
    [1, 1, -1],
    [-1, -1, 0],
    [0, -1, 0],
    [1, -1, 0],
    [-1, 0, 0],
    // k = 14..=26: the mirrored half.
    [1, 1, 1],
    [0, 1, 1],
    [-1, 1, 1],
    [1, 0, 1],
    [0, 0, 1],
    [-1, 0, 1],
    [1, -1, 1],
    [0, -1, 1],
    [-1, -1, 1],
    [1, 1, 0],
    [0, 1, 0],
    [-1, 1, 0],
    [1, 0, 0],
];

/// Indexing of the regular, fully periodic 3D cell grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalBox {
    box_size: Vec3d,
    grid: Vec3i,
    cell_size: Vec3d,
    inv_cell_size: Vec3d,
    ncells: u64,
}

impl GlobalBox {
    /// Build the grid for a box of size `box_size` with cells of edge at
    /// least `min_cell_size`: `Ni = max(floor(Li / min_cell_size), 1)`.
    pub fn new(box_size: Vec3d, min_cell_size: f64) -> Result<Self> {
        if !(min_cell_size > 0.0) {
            return Err(RepaError::InvalidGeometry(format!(
                "minimum cell size must be positive, got {min_cell_size}"
            )));
        }
        if box_size.iter().any(|&l| !(l > 0.0)) {
            return Err(RepaError::InvalidGeometry(format!(
                "box size must be positive in all directions, got {box_size:?}"
            )));
        }

        let mut grid = [1i32; 3];
        let mut cell_size = [0.0; 3];
        let mut inv_cell_size = [0.0; 3];
        for d in 0..3 {
            grid[d] = ((box_size[d] / min_cell_size).floor() as i32).max(1);
            cell_size[d] = box_size[d] / f64::from(grid[d]);
            inv_cell_size[d] = 1.0 / cell_size[d];
        }
        let ncells = grid.iter().map(|&n| n as u64).product();

        Ok(GlobalBox {
            box_size,
            grid,
            cell_size,
            inv_cell_size,
            ncells,
        })
    }

    /// Total number of grid cells.
    #[inline]
    pub fn ncells(&self) -> u64 {
        self.ncells
    }

    /// Number of cells in each direction.
    #[inline]
    pub fn grid_size(&self) -> Vec3i {
        self.grid
    }

    /// Edge lengths of a cell.
    #[inline]
    pub fn cell_size(&self) -> Vec3d {
        self.cell_size
    }

    /// Row-major linearization of a cell coordinate.
    #[inline]
    pub fn linearize(&self, c: Vec3i) -> GlobalCell {
        debug_assert!((0..3).all(|d| c[d] >= 0 && c[d] < self.grid[d]));
        let [nx, ny, _] = self.grid;
        GlobalCell::new(((c[2] as u64 * ny as u64) + c[1] as u64) * nx as u64 + c[0] as u64)
    }

    /// Cell coordinate of a global index.
    #[inline]
    pub fn unlinearize(&self, cell: GlobalCell) -> Vec3i {
        let [nx, ny, _] = self.grid;
        let g = cell.get();
        let x = (g % nx as u64) as i32;
        let y = ((g / nx as u64) % ny as u64) as i32;
        let z = (g / (nx as u64 * ny as u64)) as i32;
        [x, y, z]
    }

    /// Morton index of a cell on the padded power-of-two cube.
    #[inline]
    pub fn morton_of_cell(&self, cell: GlobalCell) -> u64 {
        let [x, y, z] = self.unlinearize(cell);
        crate::morton::encode(x as u64, y as u64, z as u64)
    }

    /// The `k`-th full-shell neighbor of `cell`, periodic in all directions.
    pub fn neighbor(&self, cell: GlobalCell, k: usize) -> Result<GlobalCell> {
        let off = FULL_SHELL_OFFSETS
            .get(k)
            .ok_or(RepaError::NeighborIndexOutOfRange(k))?;
        Ok(self.shifted(cell, off))
    }

    #[inline]
    fn shifted(&self, cell: GlobalCell, off: &[i32; 3]) -> GlobalCell {
        let c = self.unlinearize(cell);
        let mut n = [0i32; 3];
        for d in 0..3 {
            n[d] = (c[d] + off[d]).rem_euclid(self.grid[d]);
        }
        self.linearize(n)
    }

    /// The full shell of `cell`: itself followed by its 26 periodic
    /// neighbors, in the published enumeration order.
    pub fn full_shell_neigh(
        &self,
        cell: GlobalCell,
    ) -> impl Iterator<Item = GlobalCell> + '_ {
        FULL_SHELL_OFFSETS.iter().map(move |off| self.shifted(cell, off))
    }

    /// The 26 periodic neighbors of `cell`, excluding the cell itself.
    pub fn full_shell_neigh_without_center(
        &self,
        cell: GlobalCell,
    ) -> impl Iterator<Item = GlobalCell> + '_ {
        FULL_SHELL_OFFSETS[1..]
            .iter()
            .map(move |off| self.shifted(cell, off))
    }

    /// The cell containing position `pos`.
    ///
    /// Positions within a half-cell-sized rounding margin of a box face are
    /// snapped onto the adjacent cell; anything further outside the box is
    /// an error. The lookup is a pure function of the grid geometry, so all
    /// processes resolve the same position to the same cell.
    pub fn cell_at_pos(&self, pos: Vec3d) -> Result<GlobalCell> {
        let mut p = pos;
        for d in 0..3 {
            let errmar = 0.5 * ROUND_ERROR_PREC * self.box_size[d];
            if p[d] < 0.0 && p[d] > -errmar {
                p[d] = 0.0;
            } else if p[d] >= self.box_size[d] && p[d] < self.box_size[d] + errmar {
                p[d] -= 0.5 * self.cell_size[d];
            }
            if p[d] < 0.0 || p[d] >= self.box_size[d] {
                return Err(RepaError::PositionOutsideBox(pos[0], pos[1], pos[2]));
            }
        }

        let mut c = [0i32; 3];
        for d in 0..3 {
            c[d] = ((p[d] * self.inv_cell_size[d]) as i32).min(self.grid[d] - 1);
        }
        Ok(self.linearize(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn offset_table_is_a_full_shell() {
        use std::collections::HashSet;
        assert_eq!(FULL_SHELL_OFFSETS[0], [0, 0, 0]);
        let set: HashSet<_> = FULL_SHELL_OFFSETS.iter().collect();
        assert_eq!(set.len(), 27);
        // k+13 is the negation of k for the half shell.
        for k in 1..=13 {
            let m = FULL_SHELL_OFFSETS[k];
            let n = FULL_SHELL_OFFSETS[k + 13];
            assert_eq!([-m[0], -m[1], -m[2]], n, "k = {k}");
        }
    }

    #[test]
    fn grid_dimensions() {
        let gbox = GlobalBox::new([1.0, 1.0, 1.0], 0.1).unwrap();
        assert_eq!(gbox.grid_size(), [10, 10, 10]);
        assert_eq!(gbox.ncells(), 1000);
        for d in 0..3 {
            assert!((gbox.cell_size()[d] - 0.1).abs() < 1e-12);
        }

        let gbox = GlobalBox::new([2.0, 1.0, 0.5], 0.5).unwrap();
        assert_eq!(gbox.grid_size(), [4, 2, 1]);
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        assert!(GlobalBox::new([1.0, 1.0, 1.0], 0.0).is_err());
        assert!(GlobalBox::new([1.0, -1.0, 1.0], 0.1).is_err());
        // A very coarse minimum still yields one cell per direction.
        let gbox = GlobalBox::new([1.0, 1.0, 1.0], 10.0).unwrap();
        assert_eq!(gbox.ncells(), 1);
    }

    #[test]
    fn neighbor_wraps_periodically() {
        let gbox = GlobalBox::new([1.0, 1.0, 1.0], 0.25).unwrap();
        let origin = gbox.linearize([0, 0, 0]);
        // k = 5 is offset (0, 0, -1): wraps to the top layer.
        assert_eq!(
            gbox.neighbor(origin, 5).unwrap(),
            gbox.linearize([0, 0, 3])
        );
        // k = 26 is offset (1, 0, 0).
        assert_eq!(
            gbox.neighbor(origin, 26).unwrap(),
            gbox.linearize([1, 0, 0])
        );
        assert_eq!(gbox.neighbor(origin, 0).unwrap(), origin);
        assert!(gbox.neighbor(origin, 27).is_err());
    }

    #[test]
    fn full_shell_covers_all_neighbors() {
        use std::collections::HashSet;
        let gbox = GlobalBox::new([1.0, 1.0, 1.0], 0.25).unwrap();
        let cell = gbox.linearize([1, 2, 3]);
        let shell: Vec<_> = gbox.full_shell_neigh(cell).collect();
        assert_eq!(shell.len(), 27);
        assert_eq!(shell[0], cell);
        let unique: HashSet<_> = shell.iter().collect();
        assert_eq!(unique.len(), 27);
    }

    #[test]
    fn tiny_grid_shell_lists_duplicate_images() {
        // On a 2x2x2 grid every neighbor is reached through several
        // periodic images; the 26-entry walk must list them all.
        let gbox = GlobalBox::new([1.0, 1.0, 1.0], 0.5).unwrap();
        let cell = gbox.linearize([0, 0, 0]);
        let shell: Vec<_> = gbox.full_shell_neigh_without_center(cell).collect();
        assert_eq!(shell.len(), 26);
        let mut counts = [0usize; 8];
        for n in shell {
            counts[n.index()] += 1;
        }
        // Face neighbors through opposite faces coincide (count 2), as do
        // edge and corner images; the center shows up twice per axis pair.
        assert_eq!(counts.iter().sum::<usize>(), 26);
        assert!(counts[1..].iter().all(|&c| c >= 2));
    }

    #[test]
    fn cell_at_pos_contract() {
        let gbox = GlobalBox::new([1.0, 1.0, 1.0], 0.1).unwrap();
        assert_eq!(
            gbox.cell_at_pos([0.05, 0.05, 0.05]).unwrap(),
            gbox.linearize([0, 0, 0])
        );
        assert_eq!(
            gbox.cell_at_pos([0.99, 0.99, 0.99]).unwrap(),
            gbox.linearize([9, 9, 9])
        );
        // Face positions within the rounding margin snap inside.
        assert_eq!(
            gbox.cell_at_pos([-1e-16, 0.0, 0.0]).unwrap(),
            gbox.linearize([0, 0, 0])
        );
        assert_eq!(
            gbox.cell_at_pos([1.0, 0.0, 0.0]).unwrap(),
            gbox.linearize([9, 0, 0])
        );
        assert!(gbox.cell_at_pos([1.1, 0.0, 0.0]).is_err());
        assert!(gbox.cell_at_pos([0.0, -0.2, 0.0]).is_err());
    }

    proptest! {
        #[test]
        fn linearize_roundtrip(x in 0i32..7, y in 0i32..5, z in 0i32..3) {
            let gbox = GlobalBox::new([7.0, 5.0, 3.0], 1.0).unwrap();
            prop_assert_eq!(gbox.grid_size(), [7, 5, 3]);
            let g = gbox.linearize([x, y, z]);
            prop_assert_eq!(gbox.unlinearize(g), [x, y, z]);
        }

        #[test]
        fn positions_resolve_to_containing_cell(
            px in 0.0f64..1.0, py in 0.0f64..1.0, pz in 0.0f64..1.0,
        ) {
            let gbox = GlobalBox::new([1.0, 1.0, 1.0], 0.25).unwrap();
            let cell = gbox.cell_at_pos([px, py, pz]).unwrap();
            let c = gbox.unlinearize(cell);
            for (d, &p) in [px, py, pz].iter().enumerate() {
                let lo = f64::from(c[d]) * gbox.cell_size()[d];
                let hi = lo + gbox.cell_size()[d];
                prop_assert!(lo <= p && p < hi);
            }
        }

        #[test]
        fn neighbor_relation_is_symmetric(x in 0i32..4, y in 0i32..4, z in 0i32..4, k in 1usize..14) {
            let gbox = GlobalBox::new([4.0, 4.0, 4.0], 1.0).unwrap();
            let g = gbox.linearize([x, y, z]);
            let n = gbox.neighbor(g, k).unwrap();
            // The mirrored index leads back to the original cell.
            prop_assert_eq!(gbox.neighbor(n, k + 13).unwrap(), g);
        }
    }
}
