//! rsmpi-backed communicator (`--features mpi`).
//!
//! Maps the [`Communicator`] seam onto a real MPI world: the bounds reduction
//! becomes `MPI_Allreduce`, gid renumbering `MPI_Allgather`, and the exchange
//! schedule tagged blocking `MPI_Send` / `MPI_Recv`. Any MPI-level failure
//! aborts the job; no recovery is attempted.

use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

use crate::comm::{Communicator, ReduceOp};
use crate::error::Result;

/// MPI world wrapper implementing [`Communicator`].
pub struct MpiWorld {
    world: SimpleCommunicator,
}

impl MpiWorld {
    /// Initialize MPI and wrap the world communicator.
    ///
    /// Returns `None` when MPI was already initialized. The returned
    /// `Universe` must stay alive for the duration of the run; dropping it
    /// finalizes MPI.
    pub fn initialize() -> Option<(mpi::environment::Universe, MpiWorld)> {
        let universe = mpi::initialize()?;
        let world = universe.world();
        Some((universe, MpiWorld { world }))
    }

    /// Wrap an existing world communicator.
    pub fn from_world(world: SimpleCommunicator) -> Self {
        MpiWorld { world }
    }
}

impl Communicator for MpiWorld {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn allreduce_f64(&self, values: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
        let mut out = vec![0.0f64; values.len()];
        match op {
            ReduceOp::Min => self
                .world
                .all_reduce_into(values, &mut out[..], SystemOperation::min()),
            ReduceOp::Max => self
                .world
                .all_reduce_into(values, &mut out[..], SystemOperation::max()),
            ReduceOp::Sum => self
                .world
                .all_reduce_into(values, &mut out[..], SystemOperation::sum()),
        }
        Ok(out)
    }

    fn allgather_usize(&self, value: usize) -> Result<Vec<usize>> {
        let mine = value as u64;
        let mut out = vec![0u64; self.size()];
        self.world.all_gather_into(&mine, &mut out[..]);
        Ok(out.into_iter().map(|v| v as usize).collect())
    }

    fn allgatherv_bytes(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        let lengths = self.allgather_usize(bytes.len())?;
        let counts: Vec<Count> = lengths.iter().map(|&l| l as Count).collect();
        let displs: Vec<Count> = counts
            .iter()
            .scan(0, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect();
        let total: usize = lengths.iter().sum();

        let mut flat = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut flat[..], counts, &displs[..]);
            self.world.all_gather_varcount_into(bytes, &mut partition);
        }

        let mut out = Vec::with_capacity(lengths.len());
        let mut offset = 0usize;
        for len in lengths {
            out.push(flat[offset..offset + len].to_vec());
            offset += len;
        }
        Ok(out)
    }

    fn send_bytes(&self, dest: usize, tag: u32, bytes: &[u8]) -> Result<()> {
        self.world
            .process_at_rank(dest as i32)
            .send_with_tag(bytes, tag as i32);
        Ok(())
    }

    fn recv_bytes(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        let (data, _status) = self
            .world
            .process_at_rank(src as i32)
            .receive_vec_with_tag::<u8>(tag as i32);
        Ok(data)
    }
}
