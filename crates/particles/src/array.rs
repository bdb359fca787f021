//! The `ParticleArray` container.
//!
//! All property vectors are parallel: index `i` across every property refers
//! to the same particle. Separate named vectors (rather than an array of
//! structs) are used deliberately so the coordination layer can move one
//! property at a time through contiguous buffers.

use std::collections::HashMap;

use crate::property::{PropertyData, PropertyKind};
use crate::{ParticlesError, Result};

/// Ownership classification of one particle row.
///
/// Stored in the `tag` property as an `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ParticleTag {
    /// Owned by this process.
    Local = 0,
    /// Owned by another process, replicated here for kernel support.
    Remote = 1,
    /// Periodic image of a local particle.
    Ghost = 2,
}

impl ParticleTag {
    /// Classify a raw tag value. Unknown values sort after `Ghost`.
    fn order(tag: i32) -> i32 {
        match tag {
            t if t == ParticleTag::Local as i32 => 0,
            t if t == ParticleTag::Remote as i32 => 1,
            _ => 2,
        }
    }
}

/// The standard double-precision SPH property set created on every array.
const DOUBLE_PROPS: [&str; 16] = [
    "x", "y", "z", "u", "v", "w", "ax", "ay", "az", "au", "av", "aw", "rho", "arho", "m", "h",
];

/// Named mapping from property name to a dense, homogeneously-typed vector.
///
/// Every array carries the standard SPH set (`x y z`, `u v w`, `ax ay az`,
/// `au av aw`, `rho arho`, `m h` as doubles; `gid` unsigned; `tag` signed)
/// and may grow additional properties via [`ParticleArray::add_property`].
#[derive(Debug, Clone)]
pub struct ParticleArray {
    name: String,
    props: HashMap<String, PropertyData>,
    num_particles: usize,
}

impl ParticleArray {
    /// Create an empty array with the standard property set.
    pub fn new(name: &str) -> Self {
        let mut props = HashMap::new();
        for prop in DOUBLE_PROPS {
            props.insert(prop.to_string(), PropertyData::new(PropertyKind::Double));
        }
        props.insert("gid".to_string(), PropertyData::new(PropertyKind::UInt));
        props.insert("tag".to_string(), PropertyData::new(PropertyKind::Int));
        Self {
            name: name.to_string(),
            props,
            num_particles: 0,
        }
    }

    /// Name of this array.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current particle count.
    pub fn len(&self) -> usize {
        self.num_particles
    }

    /// Whether the array holds no particles.
    pub fn is_empty(&self) -> bool {
        self.num_particles == 0
    }

    /// Whether a property of the given name exists.
    pub fn has_property(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    /// Add a new property of the given kind, sized to the current count.
    pub fn add_property(&mut self, name: &str, kind: PropertyKind) -> Result<()> {
        if self.props.contains_key(name) {
            return Err(ParticlesError::DuplicateProperty {
                array: self.name.clone(),
                name: name.to_string(),
            });
        }
        let mut data = PropertyData::new(kind);
        data.resize(self.num_particles);
        self.props.insert(name.to_string(), data);
        Ok(())
    }

    /// Look up a property with kind introspection.
    pub fn get_carray(&self, name: &str) -> Result<&PropertyData> {
        self.props
            .get(name)
            .ok_or_else(|| ParticlesError::UnknownProperty {
                array: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Mutable variant of [`ParticleArray::get_carray`].
    pub fn get_carray_mut(&mut self, name: &str) -> Result<&mut PropertyData> {
        match self.props.get_mut(name) {
            Some(data) => Ok(data),
            None => Err(ParticlesError::UnknownProperty {
                array: self.name.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Borrow a double property as a slice.
    pub fn doubles(&self, name: &str) -> Result<&[f64]> {
        match self.get_carray(name)? {
            PropertyData::Double(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::Double,
            }),
        }
    }

    /// Borrow a double property mutably.
    pub fn doubles_mut(&mut self, name: &str) -> Result<&mut Vec<f64>> {
        match self.get_carray_mut(name)? {
            PropertyData::Double(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::Double,
            }),
        }
    }

    /// Borrow an unsigned-int property as a slice.
    pub fn uints(&self, name: &str) -> Result<&[u32]> {
        match self.get_carray(name)? {
            PropertyData::UInt(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::UInt,
            }),
        }
    }

    /// Borrow an unsigned-int property mutably.
    pub fn uints_mut(&mut self, name: &str) -> Result<&mut Vec<u32>> {
        match self.get_carray_mut(name)? {
            PropertyData::UInt(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::UInt,
            }),
        }
    }

    /// Borrow a signed-int property as a slice.
    pub fn ints(&self, name: &str) -> Result<&[i32]> {
        match self.get_carray(name)? {
            PropertyData::Int(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::Int,
            }),
        }
    }

    /// Borrow a signed-int property mutably.
    pub fn ints_mut(&mut self, name: &str) -> Result<&mut Vec<i32>> {
        match self.get_carray_mut(name)? {
            PropertyData::Int(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::Int,
            }),
        }
    }

    /// Borrow a long property as a slice.
    pub fn longs(&self, name: &str) -> Result<&[i64]> {
        match self.get_carray(name)? {
            PropertyData::Long(v) => Ok(v),
            other => Err(ParticlesError::KindMismatch {
                name: name.to_string(),
                actual: other.kind(),
                requested: PropertyKind::Long,
            }),
        }
    }

    /// Resize every property to `new_n` rows.
    ///
    /// Existing rows are preserved in place; appended rows are
    /// zero-initialized.
    pub fn resize(&mut self, new_n: usize) {
        for data in self.props.values_mut() {
            data.resize(new_n);
        }
        self.num_particles = new_n;
    }

    /// Remove the rows listed in `ids` (strictly ascending) from every
    /// property in one pass.
    pub fn remove_particles(&mut self, ids: &[usize]) {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "row ids must ascend");
        debug_assert!(ids.iter().all(|&i| i < self.num_particles));
        if ids.is_empty() {
            return;
        }
        for data in self.props.values_mut() {
            data.remove_sorted(ids);
        }
        self.num_particles -= ids.len();
    }

    /// Stable partition of all rows into [Local | Remote | Ghost] segments by
    /// the `tag` property. Returns the count of each segment.
    pub fn align_particles(&mut self) -> Result<(usize, usize, usize)> {
        let tags = self.ints("tag")?;
        let n = tags.len();

        let mut counts = [0usize; 3];
        for &t in tags {
            counts[ParticleTag::order(t) as usize] += 1;
        }
        let (n_local, n_remote, n_ghost) = (counts[0], counts[1], counts[2]);

        // Already aligned in the common case; skip the reorder.
        let mut sorted = true;
        for w in tags.windows(2) {
            if ParticleTag::order(w[0]) > ParticleTag::order(w[1]) {
                sorted = false;
                break;
            }
        }
        if sorted {
            return Ok((n_local, n_remote, n_ghost));
        }

        let mut perm = Vec::with_capacity(n);
        for class in 0..3 {
            for (i, &t) in tags.iter().enumerate() {
                if ParticleTag::order(t) == class {
                    perm.push(i);
                }
            }
        }
        for data in self.props.values_mut() {
            data.gather(&perm);
        }
        Ok((n_local, n_remote, n_ghost))
    }

    /// Append one particle with the given position, mass and smoothing
    /// length. All other properties are zero-initialized; the row is tagged
    /// Local.
    pub fn push_particle(&mut self, x: f64, y: f64, z: f64, m: f64, h: f64) {
        for (name, data) in self.props.iter_mut() {
            match (name.as_str(), data) {
                ("x", PropertyData::Double(v)) => v.push(x),
                ("y", PropertyData::Double(v)) => v.push(y),
                ("z", PropertyData::Double(v)) => v.push(z),
                ("m", PropertyData::Double(v)) => v.push(m),
                ("h", PropertyData::Double(v)) => v.push(h),
                ("tag", PropertyData::Int(v)) => v.push(ParticleTag::Local as i32),
                (_, other) => other.push_zero(),
            }
        }
        self.num_particles += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_array_has_standard_props() {
        let pa = ParticleArray::new("fluid");
        assert_eq!(pa.len(), 0);
        for prop in ["x", "y", "z", "u", "v", "w", "rho", "m", "h"] {
            assert!(pa.has_property(prop), "missing {prop}");
        }
        assert_eq!(pa.get_carray("gid").unwrap().kind(), PropertyKind::UInt);
        assert_eq!(pa.get_carray("tag").unwrap().kind(), PropertyKind::Int);
    }

    #[test]
    fn push_particle_sets_fields() {
        let mut pa = ParticleArray::new("fluid");
        pa.push_particle(1.0, 2.0, 3.0, 0.1, 0.5);
        assert_eq!(pa.len(), 1);
        assert_eq!(pa.doubles("x").unwrap()[0], 1.0);
        assert_eq!(pa.doubles("y").unwrap()[0], 2.0);
        assert_eq!(pa.doubles("z").unwrap()[0], 3.0);
        assert_eq!(pa.doubles("m").unwrap()[0], 0.1);
        assert_eq!(pa.doubles("h").unwrap()[0], 0.5);
        assert_eq!(pa.ints("tag").unwrap()[0], ParticleTag::Local as i32);
        assert_eq!(pa.doubles("u").unwrap()[0], 0.0);
    }

    #[test]
    fn unknown_property_errors() {
        let pa = ParticleArray::new("fluid");
        assert!(matches!(
            pa.get_carray("vorticity"),
            Err(ParticlesError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn kind_mismatch_errors() {
        let pa = ParticleArray::new("fluid");
        assert!(matches!(
            pa.doubles("tag"),
            Err(ParticlesError::KindMismatch { .. })
        ));
    }

    #[test]
    fn add_property_rejects_duplicates() {
        let mut pa = ParticleArray::new("fluid");
        assert!(pa.add_property("color", PropertyKind::Int).is_ok());
        assert!(matches!(
            pa.add_property("color", PropertyKind::Int),
            Err(ParticlesError::DuplicateProperty { .. })
        ));
    }

    #[test]
    fn resize_preserves_and_zero_fills() {
        let mut pa = ParticleArray::new("fluid");
        pa.push_particle(1.0, 0.0, 0.0, 1.0, 0.1);
        pa.resize(3);
        assert_eq!(pa.len(), 3);
        let x = pa.doubles("x").unwrap();
        assert_eq!(x, &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn remove_particles_drops_rows_in_order() {
        let mut pa = ParticleArray::new("fluid");
        for i in 0..5 {
            pa.push_particle(i as f64, 0.0, 0.0, 1.0, 0.1);
        }
        pa.remove_particles(&[1, 3]);
        assert_eq!(pa.len(), 3);
        assert_eq!(pa.doubles("x").unwrap(), &[0.0, 2.0, 4.0]);
    }

    #[test]
    fn align_partitions_by_tag_stably() {
        let mut pa = ParticleArray::new("fluid");
        for i in 0..6 {
            pa.push_particle(i as f64, 0.0, 0.0, 1.0, 0.1);
        }
        {
            let tags = pa.ints_mut("tag").unwrap();
            tags.copy_from_slice(&[1, 0, 2, 0, 1, 0]);
        }
        let (n_local, n_remote, n_ghost) = pa.align_particles().unwrap();
        assert_eq!((n_local, n_remote, n_ghost), (3, 2, 1));
        // Stable: locals keep their relative order 1, 3, 5, then remotes 0, 4.
        assert_eq!(pa.doubles("x").unwrap(), &[1.0, 3.0, 5.0, 0.0, 4.0, 2.0]);
        assert_eq!(pa.ints("tag").unwrap(), &[0, 0, 0, 1, 1, 2]);
    }

    #[test]
    fn align_is_noop_when_already_sorted() {
        let mut pa = ParticleArray::new("fluid");
        for i in 0..3 {
            pa.push_particle(i as f64, 0.0, 0.0, 1.0, 0.1);
        }
        let (n_local, n_remote, n_ghost) = pa.align_particles().unwrap();
        assert_eq!((n_local, n_remote, n_ghost), (3, 0, 0));
        assert_eq!(pa.doubles("x").unwrap(), &[0.0, 1.0, 2.0]);
    }
}
