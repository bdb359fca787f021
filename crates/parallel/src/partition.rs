//! Geometric partitioner adapter.
//!
//! The manager registers its cells as partition objects (centroid coordinates
//! plus dense global ids); [`GeometricPartitioner::balance`] assigns every
//! object to a rank and derives cell-granularity export/import lists. The
//! concrete algorithm (RCB, RIB or Hilbert-curve ordering) is selected at
//! construction; callers depend only on this interface.
//!
//! All three algorithms run redundantly on every rank over the rank-ordered
//! global object table (reconstructed with one variable-length allgather), so
//! the assignment is identical everywhere without a second round of
//! communication. Ties break on the global table index, which makes the
//! result deterministic for repeated balances over unchanged objects.

use crate::comm::{dense_id_range, Communicator};
use crate::config::LbMethod;
use crate::error::{ParallelError, Result};
use crate::exchange::{ordered_exchange, TAG_INVERT};

/// Parallel sequences describing one side of a transfer: local row/object
/// ids, their global ids, and the peer rank per entry.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    /// Local ids on the owning side of the transfer.
    pub local_ids: Vec<usize>,
    /// Global ids, parallel to `local_ids`.
    pub global_ids: Vec<u32>,
    /// Peer rank per entry (destination for exports, source for imports).
    pub procs: Vec<usize>,
}

impl ObjectList {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.local_ids.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.local_ids.is_empty()
    }

    /// Append one entry.
    pub fn push(&mut self, local_id: usize, global_id: u32, proc: usize) {
        self.local_ids.push(local_id);
        self.global_ids.push(global_id);
        self.procs.push(proc);
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.local_ids.clear();
        self.global_ids.clear();
        self.procs.clear();
    }
}

/// Axis-aligned bounding box of one rank's partition.
#[derive(Debug, Clone, Copy)]
struct PartitionBox {
    min: [f64; 3],
    max: [f64; 3],
}

impl PartitionBox {
    fn expand(&mut self, point: [f64; 3], half: f64) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis] - half);
            self.max[axis] = self.max[axis].max(point[axis] + half);
        }
    }

    fn intersects(&self, boxmin: [f64; 3], boxmax: [f64; 3]) -> bool {
        (0..3).all(|axis| self.min[axis] <= boxmax[axis] && self.max[axis] >= boxmin[axis])
    }
}

/// One object in the rank-ordered global table assembled by `balance`.
struct ObjectRecord {
    x: f64,
    y: f64,
    z: f64,
    gid: u32,
    owner: usize,
    local_id: usize,
}

/// Adapter between the manager's cell map and a geometric partitioning
/// algorithm.
#[derive(Debug)]
pub struct GeometricPartitioner {
    method: LbMethod,
    num_local: usize,
    num_global: usize,
    cx: Vec<f64>,
    cy: Vec<f64>,
    cz: Vec<f64>,
    gids: Vec<u32>,
    /// Spatial extent of one object tile, for partition-box inflation.
    object_extent: f64,
    export: ObjectList,
    import: ObjectList,
    boxes: Vec<Option<PartitionBox>>,
}

impl GeometricPartitioner {
    /// Create an adapter for the given method.
    pub fn new(method: LbMethod) -> Self {
        Self {
            method,
            num_local: 0,
            num_global: 0,
            cx: Vec::new(),
            cy: Vec::new(),
            cz: Vec::new(),
            gids: Vec::new(),
            object_extent: 0.0,
            export: ObjectList::default(),
            import: ObjectList::default(),
            boxes: Vec::new(),
        }
    }

    /// The configured method.
    pub fn method(&self) -> LbMethod {
        self.method
    }

    /// Record the local and global object counts.
    pub fn set_num_objects(&mut self, local: usize, global: usize) {
        self.num_local = local;
        self.num_global = global;
    }

    /// Register the local objects: centroid coordinate arrays and the tile
    /// extent used to turn assigned centroids into partition boxes.
    pub fn set_object_data(
        &mut self,
        cx: Vec<f64>,
        cy: Vec<f64>,
        cz: Vec<f64>,
        object_extent: f64,
    ) -> Result<()> {
        if cx.len() != self.num_local || cy.len() != self.num_local || cz.len() != self.num_local
        {
            return Err(ParallelError::invariant(format!(
                "object coordinate arrays ({}, {}, {}) disagree with the \
                 registered local count {}",
                cx.len(),
                cy.len(),
                cz.len(),
                self.num_local
            )));
        }
        self.cx = cx;
        self.cy = cy;
        self.cz = cz;
        self.object_extent = object_extent;
        Ok(())
    }

    /// Assign dense global ids to the registered objects via the prefix-sum
    /// scheme and return them.
    pub fn update_global_ids(&mut self, comm: &dyn Communicator) -> Result<&[u32]> {
        let (start, total) = dense_id_range(comm, self.num_local)?;
        if total as usize != self.num_global {
            return Err(ParallelError::invariant(format!(
                "registered global object count {} disagrees with the \
                 reduced count {total}",
                self.num_global
            )));
        }
        self.gids = (start..start + self.num_local as u32).collect();
        Ok(&self.gids)
    }

    /// Cell-granularity export lists populated by the last `balance`.
    pub fn export_lists(&self) -> &ObjectList {
        &self.export
    }

    /// Cell-granularity import lists populated by the last `balance`.
    /// Local ids are the exporting rank's object ids.
    pub fn import_lists(&self) -> &ObjectList {
        &self.import
    }

    /// Run the configured partitioning algorithm over all objects and
    /// populate the export/import lists and per-rank partition boxes.
    ///
    /// Collective. Returns whether any object changed owner.
    pub fn balance(&mut self, comm: &dyn Communicator) -> Result<bool> {
        let rank = comm.rank();
        let size = comm.size();

        // Reconstruct the rank-ordered global object table on every rank.
        let all_x = comm.allgatherv_f64(&self.cx)?;
        let all_y = comm.allgatherv_f64(&self.cy)?;
        let all_z = comm.allgatherv_f64(&self.cz)?;
        let all_gids = comm.allgatherv_u32(&self.gids)?;

        let mut objects = Vec::with_capacity(self.num_global);
        for owner in 0..size {
            let (xs, ys, zs, gids) = (&all_x[owner], &all_y[owner], &all_z[owner], &all_gids[owner]);
            if xs.len() != gids.len() || ys.len() != gids.len() || zs.len() != gids.len() {
                return Err(ParallelError::size_mismatch(format!(
                    "rank {owner} contributed inconsistent object arrays"
                )));
            }
            for local_id in 0..gids.len() {
                objects.push(ObjectRecord {
                    x: xs[local_id],
                    y: ys[local_id],
                    z: zs[local_id],
                    gid: gids[local_id],
                    owner,
                    local_id,
                });
            }
        }
        if objects.len() != self.num_global {
            return Err(ParallelError::invariant(format!(
                "gathered {} objects, expected the global count {}",
                objects.len(),
                self.num_global
            )));
        }

        let points: Vec<(f64, f64)> = objects.iter().map(|o| (o.x, o.y)).collect();
        let assignment = match self.method {
            LbMethod::Rcb => rcb_partition(&points, size),
            LbMethod::Rib => rib_partition(&points, size),
            LbMethod::Hsfc => hsfc_partition(&points, size),
        };

        // Partition boxes: union of assigned object tiles per rank.
        let half = 0.5 * self.object_extent;
        self.boxes = vec![None; size];
        for (object, &part) in objects.iter().zip(&assignment) {
            if part >= size {
                return Err(ParallelError::invariant(format!(
                    "object gid {} assigned outside the rank range ({part} >= {size})",
                    object.gid
                )));
            }
            let point = [object.x, object.y, object.z];
            match &mut self.boxes[part] {
                Some(existing) => existing.expand(point, half),
                slot @ None => {
                    let mut fresh = PartitionBox {
                        min: point,
                        max: point,
                    };
                    fresh.expand(point, half);
                    *slot = Some(fresh);
                }
            }
        }

        self.export.clear();
        self.import.clear();
        let mut moved = 0usize;
        for (object, &part) in objects.iter().zip(&assignment) {
            if part != object.owner {
                moved += 1;
            }
            if object.owner == rank && part != rank {
                self.export.push(object.local_id, object.gid, part);
            }
            if part == rank && object.owner != rank {
                self.import.push(object.local_id, object.gid, object.owner);
            }
        }

        tracing::debug!(
            method = ?self.method,
            objects = objects.len(),
            moved,
            exports = self.export.len(),
            imports = self.import.len(),
            "balance complete"
        );
        Ok(moved > 0)
    }

    /// Ranks whose partition intersects the query box. `self` may appear in
    /// the result; callers filter it as needed.
    pub fn box_assign(&self, boxmin: [f64; 3], boxmax: [f64; 3]) -> Vec<usize> {
        self.boxes
            .iter()
            .enumerate()
            .filter_map(|(rank, pbox)| match pbox {
                Some(b) if b.intersects(boxmin, boxmax) => Some(rank),
                _ => None,
            })
            .collect()
    }

    /// Given one side of a transfer, compute the other: every entry of
    /// `export` becomes an import entry on its destination rank, carrying
    /// the exporter's local id and the source rank. Collective.
    pub fn invert_lists(
        &self,
        comm: &dyn Communicator,
        export: &ObjectList,
    ) -> Result<ObjectList> {
        let rank = comm.rank();
        let size = comm.size();

        let mut payloads: Vec<Vec<u8>> = vec![Vec::new(); size];
        for i in 0..export.len() {
            let dest = export.procs[i];
            if dest >= size {
                return Err(ParallelError::invariant(format!(
                    "export destination {dest} outside communicator of size {size}"
                )));
            }
            payloads[dest].extend_from_slice(&(export.local_ids[i] as u64).to_le_bytes());
            payloads[dest].extend_from_slice(&export.global_ids[i].to_le_bytes());
        }

        let incoming = ordered_exchange(comm, TAG_INVERT, &payloads)?;

        let mut import = ObjectList::default();
        for (src, bytes) in incoming.iter().enumerate() {
            if src == rank {
                continue;
            }
            if bytes.len() % 12 != 0 {
                return Err(ParallelError::size_mismatch(format!(
                    "list inversion: rank {src} sent {} bytes, not a multiple \
                     of one 12-byte entry",
                    bytes.len()
                )));
            }
            for entry in bytes.chunks_exact(12) {
                let local = u64::from_le_bytes([
                    entry[0], entry[1], entry[2], entry[3], entry[4], entry[5], entry[6],
                    entry[7],
                ]) as usize;
                let gid = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
                import.push(local, gid, src);
            }
        }
        Ok(import)
    }
}

/// Recursive coordinate bisection: split the longer axis at the weighted
/// median, recursing until one part remains per subrange.
fn rcb_partition(points: &[(f64, f64)], nparts: usize) -> Vec<usize> {
    let mut assignment = vec![0usize; points.len()];
    let mut ids: Vec<usize> = (0..points.len()).collect();
    rcb_recurse(points, &mut ids, 0, nparts, &mut assignment);
    assignment
}

fn rcb_recurse(
    points: &[(f64, f64)],
    ids: &mut [usize],
    first_part: usize,
    nparts: usize,
    assignment: &mut [usize],
) {
    if nparts <= 1 || ids.len() <= 1 {
        for &i in ids.iter() {
            assignment[i] = first_part;
        }
        return;
    }

    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for &i in ids.iter() {
        let (x, y) = points[i];
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    let split_x = (max_x - min_x) >= (max_y - min_y);

    if split_x {
        ids.sort_unstable_by(|&a, &b| {
            points[a]
                .0
                .partial_cmp(&points[b].0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
    } else {
        ids.sort_unstable_by(|&a, &b| {
            points[a]
                .1
                .partial_cmp(&points[b].1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
    }

    let left_parts = nparts / 2;
    let right_parts = nparts - left_parts;
    let n_left = ids.len() * left_parts / nparts;
    let (lo, hi) = ids.split_at_mut(n_left);
    rcb_recurse(points, lo, first_part, left_parts, assignment);
    rcb_recurse(points, hi, first_part + left_parts, right_parts, assignment);
}

/// Recursive inertial bisection: bisect along the principal axis of the
/// point cloud's 2x2 covariance instead of a coordinate axis.
fn rib_partition(points: &[(f64, f64)], nparts: usize) -> Vec<usize> {
    let mut assignment = vec![0usize; points.len()];
    let mut ids: Vec<usize> = (0..points.len()).collect();
    rib_recurse(points, &mut ids, 0, nparts, &mut assignment);
    assignment
}

fn rib_recurse(
    points: &[(f64, f64)],
    ids: &mut [usize],
    first_part: usize,
    nparts: usize,
    assignment: &mut [usize],
) {
    if nparts <= 1 || ids.len() <= 1 {
        for &i in ids.iter() {
            assignment[i] = first_part;
        }
        return;
    }

    let n = ids.len() as f64;
    let (mut mean_x, mut mean_y) = (0.0, 0.0);
    for &i in ids.iter() {
        mean_x += points[i].0;
        mean_y += points[i].1;
    }
    mean_x /= n;
    mean_y /= n;

    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for &i in ids.iter() {
        let dx = points[i].0 - mean_x;
        let dy = points[i].1 - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }

    // Principal eigenvector angle of [[sxx, sxy], [sxy, syy]].
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    let dir = (theta.cos(), theta.sin());

    ids.sort_unstable_by(|&a, &b| {
        let pa = points[a].0 * dir.0 + points[a].1 * dir.1;
        let pb = points[b].0 * dir.0 + points[b].1 * dir.1;
        pa.partial_cmp(&pb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let left_parts = nparts / 2;
    let right_parts = nparts - left_parts;
    let n_left = ids.len() * left_parts / nparts;
    let (lo, hi) = ids.split_at_mut(n_left);
    rib_recurse(points, lo, first_part, left_parts, assignment);
    rib_recurse(points, hi, first_part + left_parts, right_parts, assignment);
}

/// Order of the Hilbert curve used for HSFC keys (2^16 cells per axis).
const HILBERT_ORDER: u32 = 16;

/// Hilbert-curve ordering: map each point to its curve index over the
/// bounding square, sort, and cut the sorted order into contiguous,
/// equally-weighted ranges.
fn hsfc_partition(points: &[(f64, f64)], nparts: usize) -> Vec<usize> {
    let n = points.len();
    let mut assignment = vec![0usize; n];
    if n == 0 {
        return assignment;
    }

    let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    let span = (max_x - min_x).max(max_y - min_y).max(f64::MIN_POSITIVE);
    let cells = (1u32 << HILBERT_ORDER) as f64;

    let mut keyed: Vec<(u64, usize)> = points
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| {
            let qx = (((x - min_x) / span * cells) as u32).min((1 << HILBERT_ORDER) - 1);
            let qy = (((y - min_y) / span * cells) as u32).min((1 << HILBERT_ORDER) - 1);
            (hilbert_index(HILBERT_ORDER, qx, qy), i)
        })
        .collect();
    keyed.sort_unstable();

    for (position, &(_key, i)) in keyed.iter().enumerate() {
        assignment[i] = (position * nparts / n).min(nparts - 1);
    }
    assignment
}

/// Map quantized coordinates to the distance along a Hilbert curve of the
/// given order (the classic rotation walk).
fn hilbert_index(order: u32, mut x: u32, mut y: u32) -> u64 {
    let n: u32 = 1 << order;
    let mut d: u64 = 0;
    let mut s: u32 = n / 2;
    while s > 0 {
        let rx = u32::from((x & s) > 0);
        let ry = u32::from((y & s) > 0);
        d += (s as u64) * (s as u64) * ((3 * rx) ^ ry) as u64;
        // Rotate the quadrant.
        if ry == 0 {
            if rx == 1 {
                x = n.wrapping_sub(1).wrapping_sub(x);
                y = n.wrapping_sub(1).wrapping_sub(y);
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}
