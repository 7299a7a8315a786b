//! Collective operations composed from point-to-point messages.
//!
//! The partitioners need a handful of small collectives: an allgather over
//! the process neighborhood (scalar loads), sum reductions and an exclusive
//! prefix sum over the whole communicator, and a byte-blob allgather for
//! replicated inputs. All of them are expressed over `isend`/`irecv` so
//! that every [`Communicator`] backend supports them; sends are posted
//! first, then receives are completed.
//!
//! Floating-point sums are accumulated in rank order, so every rank
//! computes bit-identical results from identical contributions.

use super::{CommTag, Communicator, Wait};
use crate::error::{RepaError, Result};
use crate::index::Rank;

fn recv_exact<H: Wait>(handle: H, peer: usize, want: usize) -> Result<Vec<u8>> {
    let data = handle
        .wait()
        .ok_or_else(|| RepaError::Comm(format!("no data received from rank {peer}")))?;
    if data.len() != want {
        return Err(RepaError::Comm(format!(
            "message from rank {peer} has {} bytes, expected {want}",
            data.len()
        )));
    }
    Ok(data)
}

/// Allgather of `data` over an explicit peer set.
///
/// Returns one payload per entry of `peers`, in order. Every peer must call
/// this with a peer list that mirrors the relation (the process
/// neighborhood is symmetric).
pub fn subset_allgather<C: Communicator>(
    comm: &C,
    peers: &[Rank],
    tag: CommTag,
    data: &[u8],
) -> Result<Vec<Vec<u8>>> {
    let sends: Vec<_> = peers
        .iter()
        .map(|p| comm.isend(p.index(), tag, data))
        .collect();
    let recvs: Vec<_> = peers
        .iter()
        .map(|p| comm.irecv(p.index(), tag))
        .collect();

    let mut out = Vec::with_capacity(peers.len());
    for (handle, peer) in recvs.into_iter().zip(peers) {
        out.push(
            handle
                .wait()
                .ok_or_else(|| RepaError::Comm(format!("no data received from rank {peer}")))?,
        );
    }
    for s in sends {
        s.wait();
    }
    Ok(out)
}

/// Allgather of a scalar load over the process neighborhood.
pub fn neighbor_allgather_f64<C: Communicator>(
    comm: &C,
    neighbors: &[Rank],
    tag: CommTag,
    value: f64,
) -> Result<Vec<f64>> {
    let raw = subset_allgather(comm, neighbors, tag, &value.to_le_bytes())?;
    raw.into_iter()
        .zip(neighbors)
        .map(|(bytes, peer)| {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| RepaError::Comm(format!("bad load message from rank {peer}")))?;
            Ok(f64::from_le_bytes(arr))
        })
        .collect()
}

/// Sum of `value` over all ranks; identical on every rank.
pub fn allreduce_sum_f64<C: Communicator>(comm: &C, tag: CommTag, value: f64) -> Result<f64> {
    let me = comm.rank();
    let peers: Vec<Rank> = (0..comm.size())
        .filter(|&r| r != me)
        .map(|r| Rank::new(r as u32))
        .collect();

    let sends: Vec<_> = peers
        .iter()
        .map(|p| comm.isend(p.index(), tag, &value.to_le_bytes()))
        .collect();
    let recvs: Vec<_> = peers.iter().map(|p| comm.irecv(p.index(), tag)).collect();

    let mut by_rank = vec![0.0f64; comm.size()];
    by_rank[me] = value;
    for (handle, peer) in recvs.into_iter().zip(&peers) {
        let bytes = recv_exact(handle, peer.index(), 8)?;
        by_rank[peer.index()] = f64::from_le_bytes(bytes.try_into().unwrap());
    }
    for s in sends {
        s.wait();
    }
    Ok(by_rank.iter().sum())
}

/// Exclusive prefix sum: rank `r` obtains the sum of the values of ranks
/// `0..r` (zero on rank 0).
pub fn exscan_sum_f64<C: Communicator>(comm: &C, tag: CommTag, value: f64) -> Result<f64> {
    let me = comm.rank();
    let sends: Vec<_> = (me + 1..comm.size())
        .map(|r| comm.isend(r, tag, &value.to_le_bytes()))
        .collect();
    let recvs: Vec<_> = (0..me).map(|r| comm.irecv(r, tag)).collect();

    let mut prefix = 0.0;
    for (handle, peer) in recvs.into_iter().zip(0..me) {
        let bytes = recv_exact(handle, peer, 8)?;
        prefix += f64::from_le_bytes(bytes.try_into().unwrap());
    }
    for s in sends {
        s.wait();
    }
    Ok(prefix)
}

/// Element-wise sum of a `u64` vector over all ranks.
pub fn allreduce_sum_u64_vec<C: Communicator>(
    comm: &C,
    tag: CommTag,
    values: &[u64],
) -> Result<Vec<u64>> {
    let me = comm.rank();
    let peers: Vec<Rank> = (0..comm.size())
        .filter(|&r| r != me)
        .map(|r| Rank::new(r as u32))
        .collect();
    let payload: &[u8] = bytemuck::cast_slice(values);
    let raw = subset_allgather(comm, &peers, tag, payload)?;

    let mut sum = values.to_vec();
    for (bytes, peer) in raw.into_iter().zip(&peers) {
        if bytes.len() != payload.len() {
            return Err(RepaError::Comm(format!(
                "reduction message from rank {peer} has wrong length"
            )));
        }
        let theirs: &[u64] = bytemuck::cast_slice(&bytes);
        for (acc, v) in sum.iter_mut().zip(theirs) {
            *acc += v;
        }
    }
    Ok(sum)
}

/// Allgather of arbitrary per-rank byte blobs, indexed by rank.
pub fn allgather_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    data: &[u8],
) -> Result<Vec<Vec<u8>>> {
    let me = comm.rank();
    let peers: Vec<Rank> = (0..comm.size())
        .filter(|&r| r != me)
        .map(|r| Rank::new(r as u32))
        .collect();
    let raw = subset_allgather(comm, &peers, tag, data)?;

    let mut out = vec![Vec::new(); comm.size()];
    out[me] = data.to_vec();
    for (bytes, peer) in raw.into_iter().zip(&peers) {
        out[peer.index()] = bytes;
    }
    Ok(out)
}
