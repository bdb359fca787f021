//! In-process multi-rank communicator.
//!
//! [`LocalCluster`] runs one OS thread per rank, each holding a
//! [`ClusterComm`] endpoint. Point-to-point messages travel over
//! `std::sync::mpsc` channels and are matched on `(source, tag)`; collectives
//! go through a barrier-synchronized slot table. The API matches the real
//! transport so that distributed runs are a drop-in replacement for local
//! ones. This is also the test vehicle for every multi-rank code path: no MPI
//! launcher is needed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};

use crate::comm::Communicator;
use crate::error::{ParallelError, Result};

/// One point-to-point message in flight.
struct Packet {
    src: usize,
    tag: u32,
    bytes: Vec<u8>,
}

/// Shared state for barrier-synchronized collectives.
struct CollectiveTable {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
}

/// Communicator endpoint owned by one rank's thread.
pub struct ClusterComm {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Packet>>,
    receiver: Receiver<Packet>,
    /// Messages received ahead of their matching `recv_bytes` call.
    pending: RefCell<VecDeque<Packet>>,
    collective: Arc<CollectiveTable>,
}

impl Communicator for ClusterComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allgatherv_bytes(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        {
            let mut slots = self
                .collective
                .slots
                .lock()
                .map_err(|_| ParallelError::transport("collective slot table poisoned"))?;
            slots[self.rank] = bytes.to_vec();
        }
        // First barrier: every slot written. Second barrier: every rank has
        // read; nobody may overwrite a slot for the next collective before
        // the stragglers are done.
        self.collective.barrier.wait();
        let gathered = {
            let slots = self
                .collective
                .slots
                .lock()
                .map_err(|_| ParallelError::transport("collective slot table poisoned"))?;
            slots.clone()
        };
        self.collective.barrier.wait();
        Ok(gathered)
    }

    fn send_bytes(&self, dest: usize, tag: u32, bytes: &[u8]) -> Result<()> {
        if dest >= self.size {
            return Err(ParallelError::transport(format!(
                "send to rank {dest} outside communicator of size {}",
                self.size
            )));
        }
        self.senders[dest]
            .send(Packet {
                src: self.rank,
                tag,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| {
                ParallelError::transport(format!("rank {dest} hung up (tag {tag})"))
            })
    }

    fn recv_bytes(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        let mut pending = self.pending.borrow_mut();
        if let Some(pos) = pending
            .iter()
            .position(|p| p.src == src && p.tag == tag)
        {
            if let Some(packet) = pending.remove(pos) {
                return Ok(packet.bytes);
            }
        }
        loop {
            let packet = self.receiver.recv().map_err(|_| {
                ParallelError::transport(format!(
                    "channel closed while waiting on rank {src} (tag {tag})"
                ))
            })?;
            if packet.src == src && packet.tag == tag {
                return Ok(packet.bytes);
            }
            pending.push_back(packet);
        }
    }
}

/// Harness that runs an SPMD closure on `size` in-process ranks.
pub struct LocalCluster;

impl LocalCluster {
    /// Spawn `size` rank threads, hand each a [`ClusterComm`], and collect
    /// the per-rank return values in rank order.
    ///
    /// The closure runs once per rank, concurrently. A panic on any rank
    /// propagates to the caller after the others are joined or have hung up.
    pub fn run<T, F>(size: usize, body: F) -> Vec<T>
    where
        F: Fn(ClusterComm) -> T + Sync,
        T: Send,
    {
        assert!(size >= 1, "cluster needs at least one rank");

        let collective = Arc::new(CollectiveTable {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });

        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let comms: Vec<ClusterComm> = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ClusterComm {
                rank,
                size,
                senders: senders.clone(),
                receiver,
                pending: RefCell::new(VecDeque::new()),
                collective: Arc::clone(&collective),
            })
            .collect();
        drop(senders);

        std::thread::scope(|scope| {
            let body = &body;
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || body(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("cluster rank thread panicked"))
                .collect()
        })
    }
}
