//! Parallel Manager
//!
//! Distributed spatial indexing and load balancing for particle-based
//! simulations. Given particle arrays spread across cooperating processes,
//! this crate maintains a per-process cell decomposition of space, rebalances
//! particle ownership to equalize work, replicates a halo of neighboring
//! particles sufficient for short-range interactions, and answers
//! constant-time neighbor queries against the augmented local view.
//!
//! # Modules
//! - [`comm`] -- The message-passing seam: [`Communicator`] trait and the
//!   single-process [`SerialComm`].
//! - [`cluster`] -- [`LocalCluster`], an in-process multi-rank communicator
//!   (one thread per rank) for tests and single-machine runs.
//! - [`mpi_comm`] -- rsmpi-backed communicator (`--features mpi`).
//! - [`config`] -- Manager configuration and the load-balance method enum.
//! - [`cell`] -- Cell data model and the floor-quantized cell key.
//! - [`fields`] -- Typed property-slice accessor for one particle array.
//! - [`partition`] -- Geometric partitioner adapter (RCB / RIB / HSFC).
//! - [`exchange`] -- Bulk particle migration and halo replication protocols.
//! - [`manager`] -- The [`ParallelManager`] update cycle and neighbor query.
//!
//! # Collective discipline
//!
//! Every rank must call [`ParallelManager::update`] at the same logical time:
//! the bounds reduction, gid renumbering, partitioner balance and the
//! property exchange schedule are all collective operations. A rank that
//! skips one hangs the others.

#![warn(missing_docs)]

pub mod cell;
pub mod cluster;
pub mod comm;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fields;
pub mod manager;
pub mod partition;

#[cfg(feature = "mpi")]
pub mod mpi_comm;

pub use cell::{find_cell_id, Cell, CellId, CellMap};
pub use cluster::LocalCluster;
pub use comm::{Communicator, ReduceOp, SerialComm};
pub use config::{DomainBounds, LbMethod, ManagerConfig};
pub use error::{ParallelError, Result};
pub use manager::ParallelManager;
pub use partition::{GeometricPartitioner, ObjectList};

#[cfg(feature = "mpi")]
pub use mpi_comm::MpiWorld;
