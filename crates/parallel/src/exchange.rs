//! Bulk particle migration and halo replication.
//!
//! [`ParticleArrayExchange`] owns one particle array and executes the two
//! data-movement protocols against precomputed export lists: load-balance
//! migration (exported rows leave, imported rows arrive as Local) and halo
//! replication (rows are copied, imported rows arrive as Remote).
//!
//! Every transfer runs the same deterministic, deadlock-free schedule:
//! receive from each lower rank, send to every other rank, receive from each
//! upper rank. The lower-half-first, upper-half-last ordering aligns the
//! send/receive pairs without non-blocking posts, independent of transport
//! buffering. Properties move one at a time, in the configured `lb_props`
//! order, which must be identical on every rank.

use particles::{ParticleArray, ParticleTag, PropertyData};

use crate::comm::Communicator;
use crate::error::{ParallelError, Result};
use crate::partition::ObjectList;

/// Tag block for load-balance transfers (array `k` uses `TAG_LB_BASE + k * TAG_STRIDE`).
pub(crate) const TAG_LB_BASE: u32 = 0x1000;
/// Tag block for halo transfers.
pub(crate) const TAG_REMOTE_BASE: u32 = 0x2000;
/// Tag for list inversion.
pub(crate) const TAG_INVERT: u32 = 0x3000;
/// Tag distance between consecutive particle arrays.
pub(crate) const TAG_STRIDE: u32 = 0x100;

/// Run the deterministic pairwise exchange for one payload per peer.
///
/// `outgoing` must hold one buffer per rank (the self slot is ignored).
/// Returns one buffer per rank (the self slot is empty). Collective: every
/// rank must call this with the same `tag` at the same logical time.
pub fn ordered_exchange(
    comm: &dyn Communicator,
    tag: u32,
    outgoing: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>> {
    let rank = comm.rank();
    let size = comm.size();
    debug_assert_eq!(outgoing.len(), size);

    let mut incoming = vec![Vec::new(); size];
    for src in 0..rank {
        incoming[src] = comm.recv_bytes(src, tag)?;
    }
    for (dest, payload) in outgoing.iter().enumerate() {
        if dest != rank {
            comm.send_bytes(dest, tag, payload)?;
        }
    }
    for src in rank + 1..size {
        incoming[src] = comm.recv_bytes(src, tag)?;
    }
    Ok(incoming)
}

/// Exchange per-peer row counts: send `send_counts[r]` to rank `r`, return
/// the count each source rank will send here.
pub fn exchange_counts(
    comm: &dyn Communicator,
    tag: u32,
    send_counts: &[usize],
) -> Result<Vec<usize>> {
    let outgoing: Vec<Vec<u8>> = send_counts
        .iter()
        .map(|&c| (c as u64).to_le_bytes().to_vec())
        .collect();
    let incoming = ordered_exchange(comm, tag, &outgoing)?;
    let mut recv_counts = vec![0usize; comm.size()];
    for (src, bytes) in incoming.iter().enumerate() {
        if src == comm.rank() {
            continue;
        }
        let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            ParallelError::size_mismatch(format!(
                "count exchange: rank {src} sent {} bytes, expected 8",
                bytes.len()
            ))
        })?;
        recv_counts[src] = u64::from_le_bytes(arr) as usize;
    }
    Ok(recv_counts)
}

/// Gather the given rows of a property into a contiguous byte buffer.
fn gather_rows(data: &PropertyData, rows: &[usize]) -> Vec<u8> {
    match data {
        PropertyData::Double(v) => {
            let picked: Vec<f64> = rows.iter().map(|&r| v[r]).collect();
            bytemuck::cast_slice(&picked).to_vec()
        }
        PropertyData::UInt(v) => {
            let picked: Vec<u32> = rows.iter().map(|&r| v[r]).collect();
            bytemuck::cast_slice(&picked).to_vec()
        }
        PropertyData::Int(v) => {
            let picked: Vec<i32> = rows.iter().map(|&r| v[r]).collect();
            bytemuck::cast_slice(&picked).to_vec()
        }
        PropertyData::Long(v) => {
            let picked: Vec<i64> = rows.iter().map(|&r| v[r]).collect();
            bytemuck::cast_slice(&picked).to_vec()
        }
    }
}

/// Scatter a received byte buffer into a property starting at row `start`.
fn scatter_rows(data: &mut PropertyData, start: usize, bytes: &[u8]) {
    match data {
        PropertyData::Double(v) => {
            let vals: Vec<f64> = bytemuck::pod_collect_to_vec(bytes);
            v[start..start + vals.len()].copy_from_slice(&vals);
        }
        PropertyData::UInt(v) => {
            let vals: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
            v[start..start + vals.len()].copy_from_slice(&vals);
        }
        PropertyData::Int(v) => {
            let vals: Vec<i32> = bytemuck::pod_collect_to_vec(bytes);
            v[start..start + vals.len()].copy_from_slice(&vals);
        }
        PropertyData::Long(v) => {
            let vals: Vec<i64> = bytemuck::pod_collect_to_vec(bytes);
            v[start..start + vals.len()].copy_from_slice(&vals);
        }
    }
}

/// Owner of one particle array and executor of its data-movement protocols.
#[derive(Debug)]
pub struct ParticleArrayExchange {
    array: ParticleArray,
    num_local: usize,
    num_remote: usize,
}

impl ParticleArrayExchange {
    /// Take ownership of `array`. All current rows are counted as Local.
    pub fn new(array: ParticleArray) -> Self {
        let num_local = array.len();
        Self {
            array,
            num_local,
            num_remote: 0,
        }
    }

    /// The owned particle array.
    pub fn array(&self) -> &ParticleArray {
        &self.array
    }

    /// Mutable access to the owned particle array.
    ///
    /// Structural changes (adding or removing rows) invalidate the cached
    /// counts and the manager's cell map until the next `update`.
    pub fn array_mut(&mut self) -> &mut ParticleArray {
        &mut self.array
    }

    /// Rows owned by this rank.
    pub fn num_local(&self) -> usize {
        self.num_local
    }

    /// Halo rows replicated from other ranks.
    pub fn num_remote(&self) -> usize {
        self.num_remote
    }

    /// Drop every row whose tag is not Local and reset the cached counts.
    pub fn remove_remote_particles(&mut self) -> Result<()> {
        let doomed: Vec<usize> = self
            .array
            .ints("tag")?
            .iter()
            .enumerate()
            .filter(|(_, &t)| t != ParticleTag::Local as i32)
            .map(|(i, _)| i)
            .collect();
        self.array.remove_particles(&doomed);
        self.num_local = self.array.len();
        self.num_remote = 0;
        Ok(())
    }

    /// Reassign global ids densely as `start, start + 1, ...` in row order.
    pub fn update_gids(&mut self, start: u32) -> Result<()> {
        let gids = self.array.uints_mut("gid")?;
        for (i, gid) in gids.iter_mut().enumerate() {
            *gid = start + i as u32;
        }
        Ok(())
    }

    /// Execute the load-balance migration protocol.
    ///
    /// `export` lists the rows leaving this rank, each with exactly one
    /// destination. Exported rows are removed, imported rows are appended
    /// (grouped by ascending source rank) and tagged Local. Collective.
    pub fn lb_exchange_data(
        &mut self,
        comm: &dyn Communicator,
        props: &[String],
        export: &ObjectList,
        tag_base: u32,
    ) -> Result<()> {
        let size = comm.size();

        // Group export rows by destination before touching the array.
        let mut rows_by_dest: Vec<Vec<usize>> = vec![Vec::new(); size];
        for i in 0..export.len() {
            rows_by_dest[export.procs[i]].push(export.local_ids[i]);
        }

        // Gather every property's send buffers while row ids are still valid.
        let buffers = self.gather_send_buffers(props, &rows_by_dest)?;

        // Count expectation exchange: after this every rank knows how many
        // rows it receives from each source.
        let send_counts: Vec<usize> = rows_by_dest.iter().map(Vec::len).collect();
        let recv_counts = exchange_counts(comm, tag_base, &send_counts)?;
        let num_export: usize = send_counts.iter().sum();
        let num_import: usize = recv_counts.iter().sum();

        // Remove the exported rows.
        let mut doomed: Vec<usize> = export.local_ids.clone();
        doomed.sort_unstable();
        let before_dedup = doomed.len();
        doomed.dedup();
        if doomed.len() != before_dedup {
            return Err(ParallelError::invariant(
                "load-balance export lists a row with more than one destination",
            ));
        }
        self.array.remove_particles(&doomed);

        // Resize and tag the appended range Local.
        let kept = self.array.len();
        self.array.resize(kept + num_import);
        {
            let tags = self.array.ints_mut("tag")?;
            for t in &mut tags[kept..] {
                *t = ParticleTag::Local as i32;
            }
        }

        self.transfer_properties(comm, props, buffers, &recv_counts, kept, tag_base)?;

        self.num_local = self.array.len();
        self.num_remote = 0;
        tracing::debug!(
            array = self.array.name(),
            exported = num_export,
            imported = num_import,
            local = self.num_local,
            "load-balance exchange complete"
        );
        Ok(())
    }

    /// Execute the halo replication protocol.
    ///
    /// `export` may list one row toward several destinations. Nothing is
    /// removed; imported rows are appended and tagged Remote.
    /// `expected_import` is the count predicted by list inversion; a
    /// disagreement with the count exchange is fatal. Collective.
    pub fn remote_exchange_data(
        &mut self,
        comm: &dyn Communicator,
        props: &[String],
        export: &ObjectList,
        expected_import: Option<usize>,
        tag_base: u32,
    ) -> Result<()> {
        let size = comm.size();

        let mut rows_by_dest: Vec<Vec<usize>> = vec![Vec::new(); size];
        for i in 0..export.len() {
            rows_by_dest[export.procs[i]].push(export.local_ids[i]);
        }
        let buffers = self.gather_send_buffers(props, &rows_by_dest)?;

        let send_counts: Vec<usize> = rows_by_dest.iter().map(Vec::len).collect();
        let recv_counts = exchange_counts(comm, tag_base, &send_counts)?;
        let num_import: usize = recv_counts.iter().sum();

        if let Some(expected) = expected_import {
            if expected != num_import {
                return Err(ParallelError::size_mismatch(format!(
                    "halo exchange on '{}': list inversion predicted {expected} \
                     imports, count exchange delivered {num_import}",
                    self.array.name()
                )));
            }
        }

        let owned = self.array.len();
        self.array.resize(owned + num_import);

        self.transfer_properties(comm, props, buffers, &recv_counts, owned, tag_base)?;

        // Senders ship their rows tagged Local; the copies are Remote here.
        {
            let tags = self.array.ints_mut("tag")?;
            for t in &mut tags[owned..] {
                *t = ParticleTag::Remote as i32;
            }
        }

        self.num_remote = num_import;
        tracing::debug!(
            array = self.array.name(),
            exported = export.len(),
            imported = num_import,
            "halo exchange complete"
        );
        Ok(())
    }

    /// Stable reorder into [Local | Remote | Ghost] segments.
    pub fn align(&mut self) -> Result<()> {
        let (n_local, n_remote, _n_ghost) = self.array.align_particles()?;
        self.num_local = n_local;
        self.num_remote = n_remote;
        Ok(())
    }

    /// Gather per-destination, per-property send buffers.
    fn gather_send_buffers(
        &self,
        props: &[String],
        rows_by_dest: &[Vec<usize>],
    ) -> Result<Vec<Vec<Vec<u8>>>> {
        let mut buffers = Vec::with_capacity(rows_by_dest.len());
        for rows in rows_by_dest {
            let mut per_prop = Vec::with_capacity(props.len());
            for prop in props {
                per_prop.push(gather_rows(self.array.get_carray(prop)?, rows));
            }
            buffers.push(per_prop);
        }
        Ok(buffers)
    }

    /// Move every property through the ordered schedule, appending received
    /// rows at `base`, grouped by ascending source rank.
    fn transfer_properties(
        &mut self,
        comm: &dyn Communicator,
        props: &[String],
        mut buffers: Vec<Vec<Vec<u8>>>,
        recv_counts: &[usize],
        base: usize,
        tag_base: u32,
    ) -> Result<()> {
        let rank = comm.rank();
        let size = comm.size();

        // Received rows land grouped by source rank in ascending order; the
        // layout is identical for every property because the schedule is.
        let mut offsets = vec![0usize; size];
        let mut cursor = base;
        for src in 0..size {
            if src != rank {
                offsets[src] = cursor;
                cursor += recv_counts[src];
            }
        }

        for (prop_index, prop) in props.iter().enumerate() {
            let tag = tag_base + 1 + prop_index as u32;
            let outgoing: Vec<Vec<u8>> = buffers
                .iter_mut()
                .map(|per_prop| std::mem::take(&mut per_prop[prop_index]))
                .collect();
            let incoming = ordered_exchange(comm, tag, &outgoing)?;

            let data = self.array.get_carray_mut(prop)?;
            let elem_size = data.kind().elem_size();
            for src in 0..size {
                if src == rank {
                    continue;
                }
                let bytes = &incoming[src];
                if bytes.len() != recv_counts[src] * elem_size {
                    return Err(ParallelError::size_mismatch(format!(
                        "property '{prop}' from rank {src}: expected {} rows \
                         ({} bytes), received {} bytes",
                        recv_counts[src],
                        recv_counts[src] * elem_size,
                        bytes.len()
                    )));
                }
                scatter_rows(data, offsets[src], bytes);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::config::ManagerConfig;

    fn props() -> Vec<String> {
        ManagerConfig::default().lb_props
    }

    #[test]
    fn ordered_exchange_delivers_pairwise() {
        let results = LocalCluster::run(3, |comm| {
            let rank = comm.rank();
            let outgoing: Vec<Vec<u8>> = (0..comm.size())
                .map(|dest| vec![(10 * rank + dest) as u8])
                .collect();
            ordered_exchange(&comm, 7, &outgoing).unwrap()
        });
        // Rank 1 hears 01 from rank 0 and 21 from rank 2.
        assert_eq!(results[1][0], vec![1u8]);
        assert_eq!(results[1][2], vec![21u8]);
        assert!(results[1][1].is_empty());
    }

    #[test]
    fn count_exchange_reports_per_source() {
        let results = LocalCluster::run(2, |comm| {
            let send = if comm.rank() == 0 { vec![0, 3] } else { vec![5, 0] };
            exchange_counts(&comm, 9, &send).unwrap()
        });
        assert_eq!(results[0], vec![0, 5]);
        assert_eq!(results[1], vec![3, 0]);
    }

    #[test]
    fn lb_exchange_migrates_rows() {
        let results = LocalCluster::run(2, |comm| {
            let mut pa = ParticleArray::new("fluid");
            if comm.rank() == 0 {
                // Rows 0..4; rows 2 and 3 migrate to rank 1.
                for i in 0..4 {
                    pa.push_particle(i as f64, 0.5, 0.0, 1.0, 0.1);
                }
            }
            {
                let gids = pa.uints_mut("gid").unwrap();
                for (i, g) in gids.iter_mut().enumerate() {
                    *g = i as u32;
                }
            }
            let mut ex = ParticleArrayExchange::new(pa);
            let mut export = ObjectList::default();
            if comm.rank() == 0 {
                export.push(2, 2, 1);
                export.push(3, 3, 1);
            }
            ex.lb_exchange_data(&comm, &props(), &export, TAG_LB_BASE)
                .unwrap();
            (
                ex.num_local(),
                ex.array().doubles("x").unwrap().to_vec(),
                ex.array().uints("gid").unwrap().to_vec(),
                ex.array().ints("tag").unwrap().to_vec(),
            )
        });

        let (n0, x0, gid0, _tag0) = &results[0];
        let (n1, x1, gid1, tag1) = &results[1];
        assert_eq!(*n0, 2);
        assert_eq!(x0, &vec![0.0, 1.0]);
        assert_eq!(gid0, &vec![0, 1]);
        assert_eq!(*n1, 2);
        assert_eq!(x1, &vec![2.0, 3.0]);
        assert_eq!(gid1, &vec![2, 3]);
        assert!(tag1.iter().all(|&t| t == ParticleTag::Local as i32));
    }

    #[test]
    fn remote_exchange_appends_tagged_copies() {
        let results = LocalCluster::run(2, |comm| {
            let mut pa = ParticleArray::new("fluid");
            let rank = comm.rank();
            // Each rank owns two rows; row 0 is shared with the peer.
            pa.push_particle(rank as f64, 0.0, 0.0, 1.0, 0.1);
            pa.push_particle(rank as f64 + 10.0, 0.0, 0.0, 1.0, 0.1);
            {
                let gids = pa.uints_mut("gid").unwrap();
                gids[0] = 100 + rank as u32;
                gids[1] = 200 + rank as u32;
            }
            let mut ex = ParticleArrayExchange::new(pa);
            let peer = 1 - rank;
            let mut export = ObjectList::default();
            export.push(0, 100 + rank as u32, peer);
            ex.remote_exchange_data(&comm, &props(), &export, Some(1), TAG_REMOTE_BASE)
                .unwrap();
            (
                ex.num_local(),
                ex.num_remote(),
                ex.array().doubles("x").unwrap().to_vec(),
                ex.array().uints("gid").unwrap().to_vec(),
                ex.array().ints("tag").unwrap().to_vec(),
            )
        });

        for rank in 0..2usize {
            let peer = 1 - rank;
            let (n_local, n_remote, x, gid, tag) = &results[rank];
            assert_eq!(*n_local, 2, "local rows untouched by halo");
            assert_eq!(*n_remote, 1);
            assert_eq!(x[2], peer as f64, "halo copy carries peer coordinates");
            assert_eq!(gid[2], 100 + peer as u32);
            assert_eq!(tag[2], ParticleTag::Remote as i32);
            assert_eq!(tag[0], ParticleTag::Local as i32);
        }
    }

    #[test]
    fn remote_exchange_detects_wrong_expectation() {
        let results = LocalCluster::run(2, |comm| {
            let mut pa = ParticleArray::new("fluid");
            pa.push_particle(0.0, 0.0, 0.0, 1.0, 0.1);
            let mut ex = ParticleArrayExchange::new(pa);
            let peer = 1 - comm.rank();
            let mut export = ObjectList::default();
            export.push(0, 0, peer);
            // Both ranks predict two imports but each receives one.
            ex.remote_exchange_data(&comm, &props(), &export, Some(2), TAG_REMOTE_BASE)
                .err()
        });
        for err in results {
            assert!(matches!(err, Some(ParallelError::SizeMismatch(_))));
        }
    }

    #[test]
    fn remove_remote_drops_only_non_local() {
        let mut pa = ParticleArray::new("fluid");
        for i in 0..3 {
            pa.push_particle(i as f64, 0.0, 0.0, 1.0, 0.1);
        }
        pa.ints_mut("tag").unwrap()[1] = ParticleTag::Remote as i32;
        let mut ex = ParticleArrayExchange::new(pa);
        ex.remove_remote_particles().unwrap();
        assert_eq!(ex.num_local(), 2);
        assert_eq!(ex.array().doubles("x").unwrap(), &[0.0, 2.0]);
    }
}
