//! The parallel manager.
//!
//! Binds a set of particle arrays to a communicator and drives the full
//! coordination cycle: drop halo, renumber global ids, bin, balance cell
//! ownership, migrate particles, replicate the halo, rebin, compact. Between
//! cycles the augmented local view answers constant-time neighbor queries.

use particles::ParticleArray;

use crate::cell::{find_cell_id, Cell, CellId, CellMap};
use crate::comm::{dense_id_range, Communicator, ReduceOp};
use crate::config::ManagerConfig;
use crate::error::{ParallelError, Result};
use crate::exchange::{ParticleArrayExchange, TAG_LB_BASE, TAG_REMOTE_BASE, TAG_STRIDE};
use crate::fields::ArrayView;
use crate::partition::{GeometricPartitioner, ObjectList};

/// Below this the reduced kernel support is considered degenerate and the
/// cell size falls back to 1.0.
const MIN_CELL_SIZE: f64 = 1.0e-6;

/// Globally reduced particle extrema.
#[derive(Debug, Clone, Copy)]
pub struct GlobalBounds {
    /// Minimum corner over all ranks and arrays.
    pub min: [f64; 3],
    /// Maximum corner over all ranks and arrays.
    pub max: [f64; 3],
    /// Maximum smoothing length over all ranks and arrays.
    pub hmax: f64,
}

impl Default for GlobalBounds {
    fn default() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
            hmax: f64::NEG_INFINITY,
        }
    }
}

/// Coordinator of the distributed spatial index.
///
/// # Collective discipline
///
/// [`ParallelManager::update`] is collective: every rank must call it at the
/// same logical time. All suspension points are inside the communicator
/// primitives; manager and cell-map state are touched only by the owning
/// rank's single control thread.
pub struct ParallelManager {
    comm: Box<dyn Communicator>,
    config: ManagerConfig,
    exchanges: Vec<ParticleArrayExchange>,
    cells: CellMap,
    /// Ascending cell ids in partitioner-object order, rebuilt with the map.
    cell_order: Vec<CellId>,
    cell_size: f64,
    bounds: GlobalBounds,
    partitioner: GeometricPartitioner,
}

impl ParallelManager {
    /// Bind `arrays` to `comm` under `config`.
    ///
    /// Configuration violations (unknown `lb_props` name, bad domain, bad
    /// scales) are fatal here, before any collective runs.
    pub fn new(
        arrays: Vec<ParticleArray>,
        comm: Box<dyn Communicator>,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate(&arrays)?;
        let partitioner = GeometricPartitioner::new(config.lb_method);
        let exchanges = arrays.into_iter().map(ParticleArrayExchange::new).collect();
        Ok(Self {
            comm,
            config,
            exchanges,
            cells: CellMap::new(),
            cell_order: Vec::new(),
            cell_size: 1.0,
            bounds: GlobalBounds::default(),
            partitioner,
        })
    }

    /// Number of bound particle arrays.
    pub fn num_arrays(&self) -> usize {
        self.exchanges.len()
    }

    /// Borrow particle array `k`.
    pub fn array(&self, k: usize) -> &ParticleArray {
        self.exchanges[k].array()
    }

    /// Mutably borrow particle array `k`.
    ///
    /// Editing property values is fine between cycles; structural changes
    /// (adding or removing rows) invalidate the cell map until the next
    /// [`ParallelManager::update`].
    pub fn array_mut(&mut self, k: usize) -> &mut ParticleArray {
        self.exchanges[k].array_mut()
    }

    /// Rows of array `k` owned by this rank.
    pub fn local_count(&self, k: usize) -> usize {
        self.exchanges[k].num_local()
    }

    /// Halo rows of array `k` replicated from other ranks.
    pub fn remote_count(&self, k: usize) -> usize {
        self.exchanges[k].num_remote()
    }

    /// The current uniform cell size.
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// The current cell map.
    pub fn cells(&self) -> &CellMap {
        &self.cells
    }

    /// The globally reduced bounds of the last cycle.
    pub fn global_bounds(&self) -> GlobalBounds {
        self.bounds
    }

    /// The communicator this manager coordinates over.
    pub fn comm(&self) -> &dyn Communicator {
        &*self.comm
    }

    /// The partitioner adapter (export/import lists and partition boxes of
    /// the last balance).
    pub fn partitioner(&self) -> &GeometricPartitioner {
        &self.partitioner
    }

    /// Run one full coordination cycle. Collective.
    ///
    /// Pass `initial = true` on the first cycle after construction; it skips
    /// only the halo drop (there is no halo yet). Neighbor queries are valid
    /// from the return of this call until the next structural change.
    pub fn update(&mut self, initial: bool) -> Result<()> {
        let narrays = self.exchanges.len();
        tracing::debug!(rank = self.comm.rank(), initial, "update cycle start");

        // 1. Drop every non-Local row and reset cached counts.
        if !initial {
            for exchange in &mut self.exchanges {
                exchange.remove_remote_particles()?;
            }
        }

        // 2. Dense, contiguous global ids for the rest of the cycle.
        self.update_particle_gids()?;

        // 3. Recompute the cell size and bin every array from scratch.
        self.cell_size = self.compute_cell_size()?;
        self.cells.clear();
        for k in 0..narrays {
            self.bin_array(k, 0)?;
        }

        // 4. Number the cells: they are the partitioner's objects.
        self.update_cell_gids()?;

        if self.comm.in_parallel() {
            let props = self.config.lb_props.clone();

            // 5a. Cell-granularity balance.
            self.partitioner.balance(&*self.comm)?;

            // 5b. Project cell exports to particle exports and migrate.
            for k in 0..narrays {
                let export = self.create_particle_export_lists(k)?;
                let tag = TAG_LB_BASE + k as u32 * TAG_STRIDE;
                self.exchanges[k].lb_exchange_data(&*self.comm, &props, &export, tag)?;
            }

            // 5c. Rebind every array over its new Local rows.
            self.cells.clear();
            for k in 0..narrays {
                self.bin_array(k, 0)?;
            }
            self.refresh_cell_order();

            // 5d. Halo: overlap detection, list inversion, replication.
            for k in 0..narrays {
                let export = self.compute_remote_export_lists(k)?;
                let import = self.partitioner.invert_lists(&*self.comm, &export)?;
                let tag = TAG_REMOTE_BASE + k as u32 * TAG_STRIDE;
                self.exchanges[k].remote_exchange_data(
                    &*self.comm,
                    &props,
                    &export,
                    Some(import.len()),
                    tag,
                )?;
            }

            // 5e. Bind the arrived Remote rows, appended to Local bindings.
            for k in 0..narrays {
                let first_remote = self.exchanges[k].num_local();
                self.bin_array(k, first_remote)?;
            }

            // 5f. Compact: Local before Remote before Ghost.
            for exchange in &mut self.exchanges {
                exchange.align()?;
            }
        }

        tracing::info!(
            rank = self.comm.rank(),
            cells = self.cells.len(),
            cell_size = self.cell_size,
            local = self
                .exchanges
                .iter()
                .map(ParticleArrayExchange::num_local)
                .sum::<usize>(),
            remote = self
                .exchanges
                .iter()
                .map(ParticleArrayExchange::num_remote)
                .sum::<usize>(),
            "update cycle complete"
        );
        Ok(())
    }

    /// All source-array rows within kernel support of destination row `row`.
    ///
    /// Visits the 3x3 cell block around the destination position and applies
    /// the symmetric cutoff: a source row `j` is a neighbor when
    /// `d < radius_scale * h[row]` or `d < radius_scale * h[j]` (3-D
    /// distance). `nbrs` is cleared first; no ordering is guaranteed.
    pub fn get_nearest_particles(
        &self,
        src: usize,
        dst: usize,
        row: usize,
        nbrs: &mut Vec<usize>,
    ) -> Result<()> {
        nbrs.clear();
        let dst_view = ArrayView::bind(self.exchanges[dst].array())?;
        let src_view = ArrayView::bind(self.exchanges[src].array())?;

        let (xi, yi, zi) = (dst_view.x[row], dst_view.y[row], dst_view.z[row]);
        let hi = self.config.radius_scale * dst_view.h[row];
        let hi2 = hi * hi;

        let center = find_cell_id(xi, yi, self.cell_size);
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let cid = CellId {
                    x: center.x + dx,
                    y: center.y + dy,
                };
                let Some(cell) = self.cells.get(&cid) else {
                    continue;
                };
                for &j in &cell.lindices[src] {
                    let ddx = xi - src_view.x[j];
                    let ddy = yi - src_view.y[j];
                    let ddz = zi - src_view.z[j];
                    let d2 = ddx * ddx + ddy * ddy + ddz * ddz;
                    let hj = self.config.radius_scale * src_view.h[j];
                    if d2 < hi2 || d2 < hj * hj {
                        nbrs.push(j);
                    }
                }
            }
        }
        Ok(())
    }

    /// Step 2: per-array dense gid renumbering over the prefix sum of
    /// per-rank Local counts.
    fn update_particle_gids(&mut self) -> Result<()> {
        for k in 0..self.exchanges.len() {
            let local = self.exchanges[k].array().len();
            let (start, total) = dense_id_range(&*self.comm, local)?;
            self.exchanges[k].update_gids(start)?;
            tracing::debug!(array = k, start, total, "gids renumbered");
        }
        Ok(())
    }

    /// Local extrema over all arrays, reduced globally; the cell size is
    /// `radius_scale * hmax`, clamped when the kernel support is degenerate.
    fn compute_cell_size(&mut self) -> Result<f64> {
        let mut mins = [f64::INFINITY; 3];
        let mut maxs = [f64::NEG_INFINITY; 3];
        let mut hmax = f64::NEG_INFINITY;
        for exchange in &self.exchanges {
            let view = ArrayView::bind(exchange.array())?;
            for r in 0..view.len() {
                mins[0] = mins[0].min(view.x[r]);
                mins[1] = mins[1].min(view.y[r]);
                mins[2] = mins[2].min(view.z[r]);
                maxs[0] = maxs[0].max(view.x[r]);
                maxs[1] = maxs[1].max(view.y[r]);
                maxs[2] = maxs[2].max(view.z[r]);
                hmax = hmax.max(view.h[r]);
            }
        }
        if let Some(domain) = &self.config.domain {
            for axis in 0..3 {
                mins[axis] = mins[axis].min(domain.min[axis]);
                maxs[axis] = maxs[axis].max(domain.max[axis]);
            }
        }

        let reduced_min = self.comm.allreduce_f64(&mins, ReduceOp::Min)?;
        let reduced_max = self
            .comm
            .allreduce_f64(&[maxs[0], maxs[1], maxs[2], hmax], ReduceOp::Max)?;
        self.bounds = GlobalBounds {
            min: [reduced_min[0], reduced_min[1], reduced_min[2]],
            max: [reduced_max[0], reduced_max[1], reduced_max[2]],
            hmax: reduced_max[3],
        };

        let mut cell_size = self.config.radius_scale * self.bounds.hmax;
        if !(cell_size > MIN_CELL_SIZE) {
            tracing::warn!(
                cell_size,
                hmax = self.bounds.hmax,
                "degenerate cell size, clamping to 1.0"
            );
            cell_size = 1.0;
        }
        Ok(cell_size)
    }

    /// Bin rows `start_row..` of array `k` into the cell map.
    fn bin_array(&mut self, k: usize, start_row: usize) -> Result<()> {
        let narrays = self.exchanges.len();
        let cell_size = self.cell_size;
        let layers = self.config.ghost_layers;
        let view = ArrayView::bind(self.exchanges[k].array())?;
        for row in start_row..view.len() {
            let cid = find_cell_id(view.x[row], view.y[row], cell_size);
            let cell = self
                .cells
                .entry(cid)
                .or_insert_with(|| Cell::new(cid, cell_size, narrays, layers));
            cell.push(k, row, view.gid[row]);
        }
        Ok(())
    }

    /// Rebuild the ascending cell-id order that defines partitioner-object
    /// indexing.
    fn refresh_cell_order(&mut self) {
        self.cell_order = self.cells.keys().copied().collect();
        self.cell_order.sort_unstable();
    }

    /// Step 4: register cells as partition objects with dense global ids.
    fn update_cell_gids(&mut self) -> Result<()> {
        self.refresh_cell_order();
        let local = self.cell_order.len();
        let (_start, total) = dense_id_range(&*self.comm, local)?;

        let mut cx = Vec::with_capacity(local);
        let mut cy = Vec::with_capacity(local);
        let mut cz = Vec::with_capacity(local);
        for cid in &self.cell_order {
            let cell = &self.cells[cid];
            cx.push(cell.centroid[0]);
            cy.push(cell.centroid[1]);
            cz.push(cell.centroid[2]);
        }
        self.partitioner.set_num_objects(local, total as usize);
        self.partitioner.set_object_data(cx, cy, cz, self.cell_size)?;
        self.partitioner.update_global_ids(&*self.comm)?;
        Ok(())
    }

    /// Step 5b projection: cell-granularity exports become one particle
    /// export entry per Local row of the departing cell.
    fn create_particle_export_lists(&self, k: usize) -> Result<ObjectList> {
        let mut export = ObjectList::default();
        let cell_exports = self.partitioner.export_lists();
        for e in 0..cell_exports.len() {
            let object = cell_exports.local_ids[e];
            let dest = cell_exports.procs[e];
            let cid = self.cell_order.get(object).ok_or_else(|| {
                ParallelError::invariant(format!(
                    "cell export names object {object}, but only {} cells are \
                     registered",
                    self.cell_order.len()
                ))
            })?;
            let cell = self.cells.get(cid).ok_or_else(|| {
                ParallelError::invariant(format!(
                    "cell export names unmapped cell ({}, {})",
                    cid.x, cid.y
                ))
            })?;
            for (i, &row) in cell.lindices[k].iter().enumerate() {
                export.push(row, cell.gindices[k][i], dest);
            }
        }
        Ok(export)
    }

    /// Step 5d overlap detection: every cell whose inflated box intersects
    /// another rank's partition exports all its Local rows of array `k`
    /// toward that rank.
    fn compute_remote_export_lists(&mut self, k: usize) -> Result<ObjectList> {
        let rank = self.comm.rank();
        let mut export = ObjectList::default();

        let mut order: Vec<CellId> = self.cells.keys().copied().collect();
        order.sort_unstable();
        for cid in order {
            let overlapping = {
                let cell = &self.cells[&cid];
                self.partitioner.box_assign(cell.boxmin, cell.boxmax)
            };
            let cell = self.cells.get_mut(&cid).ok_or_else(|| {
                ParallelError::invariant(format!("cell ({}, {}) vanished mid-phase", cid.x, cid.y))
            })?;
            for peer in overlapping {
                if peer == rank {
                    continue;
                }
                cell.add_neighbor_proc(peer);
                for (i, &row) in cell.lindices[k].iter().enumerate() {
                    export.push(row, cell.gindices[k][i], peer);
                }
            }
        }
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;

    fn manager_with(points: &[(f64, f64)], h: f64) -> ParallelManager {
        let mut pa = ParticleArray::new("fluid");
        for &(x, y) in points {
            pa.push_particle(x, y, 0.0, 1.0, h);
        }
        ParallelManager::new(vec![pa], Box::new(SerialComm), ManagerConfig::default()).unwrap()
    }

    #[test]
    fn single_rank_binning_matches_cell_size() {
        // Four particles, h = 0.5, radius_scale = 2.0 -> cell_size = 1.0.
        let mut manager = manager_with(
            &[(0.1, 0.1), (0.4, 0.2), (1.2, 0.2), (0.3, 1.1)],
            0.5,
        );
        manager.update(true).unwrap();

        assert_eq!(manager.cell_size(), 1.0);
        assert_eq!(manager.cells().len(), 3);
        let origin = &manager.cells()[&CellId { x: 0, y: 0 }];
        assert_eq!(origin.lindices[0], vec![0, 1]);
        assert_eq!(
            manager.cells()[&CellId { x: 1, y: 0 }].lindices[0],
            vec![2]
        );
        assert_eq!(
            manager.cells()[&CellId { x: 0, y: 1 }].lindices[0],
            vec![3]
        );
    }

    #[test]
    fn cell_contents_agree_with_find_cell_id() {
        let mut manager = manager_with(
            &[(0.1, 0.1), (0.4, 0.2), (1.2, 0.2), (0.3, 1.1), (-0.7, 2.3)],
            0.5,
        );
        manager.update(true).unwrap();

        let view = ArrayView::bind(manager.array(0)).unwrap();
        for (cid, cell) in manager.cells() {
            for (i, &row) in cell.lindices[0].iter().enumerate() {
                assert_eq!(
                    find_cell_id(view.x[row], view.y[row], manager.cell_size()),
                    *cid,
                    "row {row} binned into the wrong cell"
                );
                assert_eq!(cell.gindices[0][i], view.gid[row]);
            }
        }
    }

    #[test]
    fn serial_gids_are_dense_in_row_order() {
        let mut manager = manager_with(&[(0.0, 0.0), (0.5, 0.5), (1.5, 0.5)], 0.5);
        manager.update(true).unwrap();
        assert_eq!(manager.array(0).uints("gid").unwrap(), &[0, 1, 2]);
    }

    #[test]
    fn degenerate_support_clamps_cell_size() {
        let mut manager = manager_with(&[(0.2, 0.3)], 0.0);
        manager.update(true).unwrap();
        assert_eq!(manager.cell_size(), 1.0);
    }

    #[test]
    fn neighbor_query_applies_symmetric_cutoff() {
        let mut manager = manager_with(
            &[(0.1, 0.1), (0.4, 0.2), (1.2, 0.2), (0.3, 1.1)],
            0.5,
        );
        manager.update(true).unwrap();

        let mut nbrs = Vec::new();
        manager.get_nearest_particles(0, 0, 0, &mut nbrs).unwrap();
        nbrs.sort_unstable();
        // hi = 1.0: row 0 itself (d = 0), row 1 (d ~ 0.32). Row 3 is at
        // d ~ 1.02 and row 2 at d ~ 1.10, both outside either support.
        assert_eq!(nbrs, vec![0, 1]);
    }

    #[test]
    fn neighbor_query_far_from_everything_is_empty() {
        // Source cluster entirely inside cell (0, 0).
        let mut fluid = ParticleArray::new("fluid");
        for &(x, y) in &[(0.1, 0.1), (0.2, 0.2), (0.3, 0.3)] {
            fluid.push_particle(x, y, 0.0, 1.0, 0.5);
        }
        // Destination probe parked in cell (5, 5).
        let mut probes = ParticleArray::new("probes");
        probes.push_particle(5.5, 5.5, 0.0, 1.0, 0.5);

        let mut manager = ParallelManager::new(
            vec![fluid, probes],
            Box::new(SerialComm),
            ManagerConfig::default(),
        )
        .unwrap();
        manager.update(true).unwrap();

        let mut nbrs = vec![42];
        manager.get_nearest_particles(0, 1, 0, &mut nbrs).unwrap();
        assert!(nbrs.is_empty(), "no fluid rows anywhere near cell (5, 5)");
    }

    #[test]
    fn repeated_serial_updates_are_stable() {
        let mut manager = manager_with(&[(0.1, 0.1), (1.4, 0.2), (0.3, 1.9)], 0.5);
        manager.update(true).unwrap();
        let gids_first = manager.array(0).uints("gid").unwrap().to_vec();
        let cells_first = manager.cells().len();
        manager.update(false).unwrap();
        assert_eq!(manager.array(0).uints("gid").unwrap(), &gids_first[..]);
        assert_eq!(manager.cells().len(), cells_first);
    }
}
