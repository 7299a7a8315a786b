//! Communication abstraction for single-process, multi-thread (test) and
//! MPI message passing.
//!
//! Wire format conventions (for higher-level protocols):
//! - All integers are LE fixed width (u32 counts/ranks, u64 cell ids).
//! - Structs are `#[repr(C)]` and `bytemuck::Pod`-safe; no `#[repr(packed)]`.
//! - A receive resolves to the complete message of its `(peer, tag)` pair;
//!   transports that need a size up front obtain it from a matched probe.
//!
//! Every `repartition` protocol in this crate is built from `isend`/`irecv`
//! pairs over these backends, with all sends posted before any receive is
//! waited on. Messages with the same peer and tag match in program order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

pub mod collectives;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Start sending `buf` to `peer`. The data is copied out immediately.
    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle;
    /// Start receiving the next message from `peer` with `tag`.
    fn irecv(&self, peer: usize, tag: CommTag) -> Self::RecvHandle;

    /// Rank of this process (`0..size`).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for serial backends).
    fn barrier(&self) {}
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Tags of the two-stage diffusion propagation. The stages are separated by
/// completed receives, but distinct tags keep the phases unambiguous on the
/// wire as well.
#[derive(Copy, Clone, Debug)]
pub struct DiffusionCommTags {
    /// Stage A: full send-list matrices.
    pub cells: CommTag,
    /// Stage B: full-shell ownership of shipped cells.
    pub neighborhoods: CommTag,
}

impl DiffusionCommTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            cells: base,
            neighborhoods: base.offset(1),
        }
    }
}

/// Compile-time no-op comm for single-process use and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: CommTag, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: CommTag) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- ThreadComm: one "rank" per thread, shared in-process mailbox ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

type Cell = Arc<(Mutex<Slot>, Condvar)>;

struct BarrierState {
    arrived: usize,
    epoch: usize,
}

/// Mailbox shared by every member of one [`ThreadComm::group`].
struct Mailbox {
    slots: Mutex<HashMap<Key, Cell>>,
    barrier: (Mutex<BarrierState>, Condvar),
    size: usize,
}

impl Mailbox {
    fn entry(&self, key: Key) -> Cell {
        let mut g = self.slots.lock().expect("mailbox poisoned");
        g.entry(key)
            .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
            .clone()
    }
}

/// In-process communicator: each group member lives on its own thread and
/// exchanges messages through a mailbox owned by the group. Groups are
/// independent, so concurrently running tests cannot observe each other's
/// traffic.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    shared: Arc<Mailbox>,
}

impl ThreadComm {
    /// Create a communicator group of `size` members, one per prospective
    /// thread. Member `i` of the returned vector has rank `i`.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "communicator group must have at least one rank");
        let shared = Arc::new(Mailbox {
            slots: Mutex::new(HashMap::new()),
            barrier: (
                Mutex::new(BarrierState { arrived: 0, epoch: 0 }),
                Condvar::new(),
            ),
            size,
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct ThreadRecvHandle {
    cell: Cell,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("mailbox slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("mailbox condvar poisoned");
        }
        slot.q.pop_front()
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> ThreadSendHandle {
        let cell = self.shared.entry((self.rank, peer, tag.get()));
        let (lock, cv) = &*cell;
        {
            let mut slot = lock.lock().expect("mailbox slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: CommTag) -> ThreadRecvHandle {
        ThreadRecvHandle {
            cell: self.shared.entry((peer, self.rank, tag.get())),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        let (lock, cv) = &self.shared.barrier;
        let mut b = lock.lock().expect("barrier poisoned");
        let epoch = b.epoch;
        b.arrived += 1;
        if b.arrived == self.shared.size {
            b.arrived = 0;
            b.epoch += 1;
            cv.notify_all();
        } else {
            while b.epoch == epoch {
                b = cv.wait(b).expect("barrier condvar poisoned");
            }
        }
    }
}

// --- MPI backend ---

#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::datatype::Equivalence;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    struct MpiCommInner {
        _universe: Universe,
        world: SimpleCommunicator,
    }

    unsafe impl Send for MpiCommInner {}
    unsafe impl Sync for MpiCommInner {}

    /// MPI communicator over the world of the process-local universe.
    pub struct MpiComm {
        inner: Arc<MpiCommInner>,
        rank: usize,
        size: usize,
    }

    impl Default for MpiComm {
        fn default() -> Self {
            let universe = mpi::initialize().expect("MPI initialization failed");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                inner: Arc::new(MpiCommInner {
                    _universe: universe,
                    world,
                }),
                rank,
                size,
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> MpiSendHandle {
            use core::ptr::NonNull;
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .inner
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, i32::from(tag.get()));
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: CommTag) -> MpiRecvHandle {
            MpiRecvHandle {
                inner: Arc::clone(&self.inner),
                peer,
                tag,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            use mpi::collective::CommunicatorCollectives;
            self.inner.world.barrier();
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<core::ptr::NonNull<[u8]>>,
    }

    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
        }
    }

    /// Deferred receive: the message is matched and pulled in `wait`, with
    /// the exact size taken from the matched probe.
    pub struct MpiRecvHandle {
        inner: Arc<MpiCommInner>,
        peer: usize,
        tag: CommTag,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (msg, status) = self
                .inner
                .world
                .process_at_rank(self.peer as i32)
                .matched_probe_with_tag(i32::from(self.tag.get()));
            let count = status.count(u8::equivalent_datatype()) as usize;
            let mut buf = vec![0u8; count];
            msg.matched_receive_into(&mut buf[..]);
            Some(buf)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_comm_round_trip() {
        let tag = CommTag::new(0x100);
        let mut group = ThreadComm::group(2);
        let c1 = group.pop().unwrap();
        let c0 = group.pop().unwrap();

        let msg = b"hello";
        let _s = c0.isend(1, tag, msg);
        let got = c1.irecv(0, tag).wait().unwrap();
        assert_eq!(&got, msg);
    }

    #[test]
    fn thread_comm_fifo_order() {
        let tag = CommTag::new(0x101);
        let group = ThreadComm::group(2);

        for i in 0..10u8 {
            let _ = group[0].isend(1, tag, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            out.push(group[1].irecv(0, tag).wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn groups_are_isolated() {
        let tag = CommTag::new(0x102);
        let a = ThreadComm::group(2);
        let b = ThreadComm::group(2);
        let _ = a[0].isend(1, tag, b"from group a");
        let _ = b[0].isend(1, tag, b"from group b");
        assert_eq!(b[1].irecv(0, tag).wait().unwrap(), b"from group b");
        assert_eq!(a[1].irecv(0, tag).wait().unwrap(), b"from group a");
    }

    #[test]
    fn cross_thread_blocking_receive() {
        let tag = CommTag::new(0x103);
        let mut group = ThreadComm::group(2);
        let c1 = group.pop().unwrap();
        let c0 = group.pop().unwrap();

        let receiver = std::thread::spawn(move || c1.irecv(0, tag).wait().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = c0.isend(1, tag, &[42]);
        assert_eq!(receiver.join().unwrap(), vec![42]);
    }

    #[test]
    fn barrier_synchronizes_the_group() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = ThreadComm::group(3)
            .into_iter()
            .map(|comm| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    comm.barrier();
                    counter.load(Ordering::SeqCst)
                })
            })
            .collect();
        for h in handles {
            // Everyone arrived before anyone passed the barrier.
            assert_eq!(h.join().unwrap(), 3);
        }
    }

    #[test]
    fn no_comm_is_singleton() {
        let c = NoComm;
        assert_eq!(c.rank(), 0);
        assert_eq!(c.size(), 1);
        c.barrier();
    }

    #[test]
    fn tag_offsets() {
        let tags = DiffusionCommTags::from_base(CommTag::new(3));
        assert_eq!(tags.cells.get(), 3);
        assert_eq!(tags.neighborhoods.get(), 4);
        assert_ne!(tags.cells, tags.neighborhoods);
    }
}
