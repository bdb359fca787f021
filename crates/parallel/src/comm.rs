//! The message-passing seam.
//!
//! All inter-process coordination goes through the [`Communicator`] trait so
//! that the manager is independent of the transport: [`SerialComm`] for a
//! single process, [`crate::cluster::LocalCluster`] for in-process multi-rank
//! runs, and the rsmpi-backed world behind the `mpi` feature. The trait is the
//! drop-in seam; swapping transports changes no coordination code.

use crate::error::{ParallelError, Result};

/// Element-wise reduction operator for [`Communicator::allreduce_f64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Element-wise sum.
    Sum,
}

/// Message-passing interface between cooperating ranks.
///
/// Collectives must be entered by every rank at the same logical time; the
/// point-to-point pair matches messages on `(source, tag)`. Any transport
/// failure is fatal to the simulation.
pub trait Communicator {
    /// This process's rank in `0..size`.
    fn rank(&self) -> usize;

    /// Number of cooperating ranks.
    fn size(&self) -> usize;

    /// Gather one variable-length byte buffer from every rank, on every rank.
    /// Entry `r` of the result is rank `r`'s contribution.
    fn allgatherv_bytes(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Send `bytes` to `dest`, identified by `tag`.
    fn send_bytes(&self, dest: usize, tag: u32, bytes: &[u8]) -> Result<()>;

    /// Receive the message from `src` carrying `tag`.
    fn recv_bytes(&self, src: usize, tag: u32) -> Result<Vec<u8>>;

    /// Whether more than one rank is cooperating.
    fn in_parallel(&self) -> bool {
        self.size() > 1
    }

    /// Element-wise reduction over equal-length `f64` vectors from all ranks.
    fn allreduce_f64(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
        let per_rank = self.allgatherv_f64(values)?;
        let identity = match op {
            ReduceOp::Min => f64::INFINITY,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Sum => 0.0,
        };
        let mut out = vec![identity; values.len()];
        for (rank, contribution) in per_rank.iter().enumerate() {
            if contribution.len() != values.len() {
                return Err(ParallelError::size_mismatch(format!(
                    "allreduce: rank {rank} contributed {} values, expected {}",
                    contribution.len(),
                    values.len()
                )));
            }
            for (acc, &v) in out.iter_mut().zip(contribution) {
                *acc = match op {
                    ReduceOp::Min => acc.min(v),
                    ReduceOp::Max => acc.max(v),
                    ReduceOp::Sum => *acc + v,
                };
            }
        }
        Ok(out)
    }

    /// Gather one `usize` from every rank, on every rank.
    fn allgather_usize(&self, value: usize) -> Result<Vec<usize>> {
        let raw = self.allgatherv_bytes(&(value as u64).to_le_bytes())?;
        let mut out = Vec::with_capacity(raw.len());
        for (rank, bytes) in raw.iter().enumerate() {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                ParallelError::size_mismatch(format!(
                    "allgather: rank {rank} contributed {} bytes, expected 8",
                    bytes.len()
                ))
            })?;
            out.push(u64::from_le_bytes(arr) as usize);
        }
        Ok(out)
    }

    /// Typed wrapper over [`Communicator::allgatherv_bytes`] for `f64` data.
    fn allgatherv_f64(&self, values: &[f64]) -> Result<Vec<Vec<f64>>> {
        let gathered = self.allgatherv_bytes(bytemuck::cast_slice(values))?;
        Ok(gathered
            .iter()
            .map(|bytes| bytemuck::pod_collect_to_vec(bytes))
            .collect())
    }

    /// Typed wrapper over [`Communicator::allgatherv_bytes`] for `u32` data.
    fn allgatherv_u32(&self, values: &[u32]) -> Result<Vec<Vec<u32>>> {
        let gathered = self.allgatherv_bytes(bytemuck::cast_slice(values))?;
        Ok(gathered
            .iter()
            .map(|bytes| bytemuck::pod_collect_to_vec(bytes))
            .collect())
    }
}

/// Assign this rank a dense, contiguous id range `[start, start + local)`
/// from the global prefix sum of per-rank counts.
///
/// Returns `(start, total)`. The multiset of ids handed out across all ranks
/// is exactly `{0, 1, ..., total - 1}`.
pub fn dense_id_range(comm: &dyn Communicator, local_count: usize) -> Result<(u32, u32)> {
    let counts = comm.allgather_usize(local_count)?;
    let start: usize = counts[..comm.rank()].iter().sum();
    let total: usize = counts.iter().sum();
    Ok((start as u32, total as u32))
}

/// Trivial single-process communicator.
///
/// Collectives are identities; point-to-point has no peers and is an
/// invariant violation if reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allgatherv_bytes(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![bytes.to_vec()])
    }

    fn send_bytes(&self, dest: usize, tag: u32, _bytes: &[u8]) -> Result<()> {
        Err(ParallelError::invariant(format!(
            "serial communicator has no peer rank {dest} (tag {tag})"
        )))
    }

    fn recv_bytes(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        Err(ParallelError::invariant(format!(
            "serial communicator has no peer rank {src} (tag {tag})"
        )))
    }
}
