//! Strongly typed cell and rank indices.
//!
//! Four integer domains occur throughout the crate and must never be mixed:
//!
//! - [`GlobalCell`]: index into the global cell grid, `0..ncells`,
//! - [`LocalCell`]: index into this process's owned cells,
//! - [`GhostCell`]: index into this process's ghost layer,
//! - [`Rank`]: id of a participating process.
//!
//! [`CellIndex`] is the tagged "local or ghost" union used wherever a cell
//! may come from either section (neighborhood queries, exchange
//! descriptors). All newtypes are `repr(transparent)` wrappers with the
//! same layout as their underlying integer, so they can travel through
//! wire buffers and FFI without conversion cost.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a cell on the global grid (row-major linearization).
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    bytemuck::Pod, bytemuck::Zeroable,
)]
#[repr(transparent)]
pub struct GlobalCell(u64);

impl GlobalCell {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        GlobalCell(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Value as a container index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for GlobalCell {
    #[inline]
    fn from(raw: u64) -> Self {
        GlobalCell(raw)
    }
}

impl From<GlobalCell> for u64 {
    #[inline]
    fn from(g: GlobalCell) -> Self {
        g.0
    }
}

impl fmt::Debug for GlobalCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobalCell").field(&self.0).finish()
    }
}

impl fmt::Display for GlobalCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an owned cell, `0..n_local_cells`.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct LocalCell(u32);

impl LocalCell {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        LocalCell(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for LocalCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalCell").field(&self.0).finish()
    }
}

impl fmt::Display for LocalCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a ghost cell, `0..n_ghost_cells`.
///
/// Ghost indices count from zero; the combined "cells" ordering used by the
/// exchange machinery places ghost `i` at position `n_local_cells + i`.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct GhostCell(u32);

impl GhostCell {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        GhostCell(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for GhostCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GhostCell").field(&self.0).finish()
    }
}

impl fmt::Display for GhostCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a participating process, `0..communicator_size`.
///
/// The "owner unknown" sentinel of the replicated partition map is *not*
/// representable here; [`crate::partition_map::PartitionMap`] stores owners
/// as `i32` with `-1` internally and hands out `Option<Rank>`.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Rank(u32);

impl Rank {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Rank(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Value as a communicator peer / container index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Wire representation (`-1` is reserved for "unknown").
    #[inline]
    pub const fn to_wire(self) -> i32 {
        self.0 as i32
    }

    /// Decode the wire representation; `-1` maps to `None`.
    #[inline]
    pub fn from_wire(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Rank)
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rank").field(&self.0).finish()
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a cell that is either owned or in the ghost layer.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize,
)]
pub enum CellIndex {
    Local(LocalCell),
    Ghost(GhostCell),
}

impl CellIndex {
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(self, CellIndex::Local(_))
    }

    #[inline]
    pub fn is_ghost(self) -> bool {
        matches!(self, CellIndex::Ghost(_))
    }

    #[inline]
    pub fn as_local(self) -> Option<LocalCell> {
        match self {
            CellIndex::Local(l) => Some(l),
            CellIndex::Ghost(_) => None,
        }
    }

    #[inline]
    pub fn as_ghost(self) -> Option<GhostCell> {
        match self {
            CellIndex::Local(_) => None,
            CellIndex::Ghost(g) => Some(g),
        }
    }

    /// Position in the combined cells ordering (locals first, then ghosts).
    #[inline]
    pub fn combined_index(self, n_local: usize) -> usize {
        match self {
            CellIndex::Local(l) => l.index(),
            CellIndex::Ghost(g) => n_local + g.index(),
        }
    }
}

impl From<LocalCell> for CellIndex {
    #[inline]
    fn from(l: LocalCell) -> Self {
        CellIndex::Local(l)
    }
}

impl From<GhostCell> for CellIndex {
    #[inline]
    fn from(g: GhostCell) -> Self {
        CellIndex::Ghost(g)
    }
}

/// `GlobalCell` travels over MPI as a plain `u64`.
#[cfg(feature = "mpi-support")]
unsafe impl mpi::datatype::Equivalence for GlobalCell {
    type Out = <u64 as mpi::datatype::Equivalence>::Out;

    fn equivalent_datatype() -> Self::Out {
        u64::equivalent_datatype()
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::{assert_eq_align, assert_eq_size};

    assert_eq_size!(GlobalCell, u64);
    assert_eq_align!(GlobalCell, u64);
    assert_eq_size!(LocalCell, u32);
    assert_eq_size!(GhostCell, u32);
    assert_eq_size!(Rank, u32);
}
