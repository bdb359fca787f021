//! Configuration parsing and validation for the parallel manager.

use std::fs;
use std::str::FromStr;

use particles::ParticleArray;
use serde::{Deserialize, Serialize};

use crate::error::{ParallelError, Result};

/// Geometric partitioning algorithm used for load balancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbMethod {
    /// Recursive coordinate bisection.
    #[default]
    Rcb,
    /// Recursive inertial bisection (bisect along the principal axis).
    Rib,
    /// Hilbert space-filling-curve ordering.
    Hsfc,
}

impl FromStr for LbMethod {
    type Err = ParallelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rcb" => Ok(LbMethod::Rcb),
            "rib" => Ok(LbMethod::Rib),
            "hsfc" => Ok(LbMethod::Hsfc),
            other => Err(ParallelError::config(format!(
                "unknown load-balance method '{other}' (expected rcb, rib or hsfc)"
            ))),
        }
    }
}

/// Optional fixed domain bounding box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBounds {
    /// Minimum corner `[x, y, z]`.
    pub min: [f64; 3],
    /// Maximum corner `[x, y, z]`.
    pub max: [f64; 3],
}

/// Manager configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Spatial dimension. Binning is two-dimensional; values beyond 2 are
    /// accepted and ignored (coordinates still carry z).
    #[serde(default = "default_dim")]
    pub dim: usize,
    /// Kernel support scale: the cell size is `radius_scale * max(h)`.
    #[serde(default = "default_radius_scale")]
    pub radius_scale: f64,
    /// Number of cell widths by which each cell's bounding box is inflated
    /// for halo-overlap detection.
    #[serde(default = "default_ghost_layers")]
    pub ghost_layers: u32,
    /// Optional fixed domain limits. When absent, bounds are reduced from
    /// the particle data every update.
    #[serde(default)]
    pub domain: Option<DomainBounds>,
    /// Properties moved by the load-balance and halo exchanges, in wire
    /// order. The order must be identical on every rank.
    #[serde(default = "default_lb_props")]
    pub lb_props: Vec<String>,
    /// Partitioning algorithm.
    #[serde(default)]
    pub lb_method: LbMethod,
}

fn default_dim() -> usize {
    2
}

fn default_radius_scale() -> f64 {
    2.0
}

fn default_ghost_layers() -> u32 {
    2
}

fn default_lb_props() -> Vec<String> {
    [
        "x", "y", "z", "ax", "ay", "az", "u", "v", "w", "au", "av", "aw", "rho", "arho", "m",
        "h", "gid", "tag",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            radius_scale: default_radius_scale(),
            ghost_layers: default_ghost_layers(),
            domain: None,
            lb_props: default_lb_props(),
            lb_method: LbMethod::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ParallelError::config(format!("failed to read {path}: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| ParallelError::config(format!("failed to parse {path}: {e}")))
    }

    /// Validate this configuration against the particle arrays it will
    /// coordinate. Every violation here is fatal at construction.
    pub fn validate(&self, arrays: &[ParticleArray]) -> Result<()> {
        if self.dim == 0 || self.dim > 3 {
            return Err(ParallelError::config(format!(
                "dimension must be 1, 2 or 3, got {}",
                self.dim
            )));
        }
        if !(self.radius_scale > 0.0) {
            return Err(ParallelError::config(format!(
                "radius_scale must be positive, got {}",
                self.radius_scale
            )));
        }
        if self.ghost_layers == 0 {
            return Err(ParallelError::config(
                "ghost_layers must be at least 1 for halo overlap detection",
            ));
        }
        if let Some(domain) = &self.domain {
            for axis in 0..3 {
                if domain.min[axis] >= domain.max[axis] {
                    return Err(ParallelError::config(format!(
                        "domain min must be below max on axis {axis}: {} >= {}",
                        domain.min[axis], domain.max[axis]
                    )));
                }
            }
        }
        if self.lb_props.is_empty() {
            return Err(ParallelError::config("lb_props must not be empty"));
        }
        for required in ["gid", "tag"] {
            if !self.lb_props.iter().any(|p| p == required) {
                return Err(ParallelError::config(format!(
                    "lb_props must include '{required}': exchanged rows carry \
                     their identity and ownership through it"
                )));
            }
        }
        for array in arrays {
            for prop in &self.lb_props {
                if !array.has_property(prop) {
                    return Err(ParallelError::config(format!(
                        "lb_props names '{prop}', which does not exist on \
                         particle array '{}'",
                        array.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ManagerConfig::default();
        let arrays = vec![ParticleArray::new("fluid")];
        assert!(config.validate(&arrays).is_ok());
        assert_eq!(config.radius_scale, 2.0);
        assert_eq!(config.ghost_layers, 2);
        assert_eq!(config.lb_method, LbMethod::Rcb);
    }

    #[test]
    fn unknown_lb_prop_is_config_error() {
        let mut config = ManagerConfig::default();
        config.lb_props.push("vorticity".to_string());
        let arrays = vec![ParticleArray::new("fluid")];
        assert!(matches!(
            config.validate(&arrays),
            Err(ParallelError::Config(_))
        ));
    }

    #[test]
    fn lb_props_must_carry_identity() {
        let mut config = ManagerConfig::default();
        config.lb_props.retain(|p| p != "gid");
        let arrays = vec![ParticleArray::new("fluid")];
        assert!(config.validate(&arrays).is_err());
    }

    #[test]
    fn inverted_domain_rejected() {
        let mut config = ManagerConfig::default();
        config.domain = Some(DomainBounds {
            min: [1.0, 0.0, 0.0],
            max: [0.0, 1.0, 1.0],
        });
        assert!(config.validate(&[]).is_err());
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("RCB".parse::<LbMethod>().unwrap(), LbMethod::Rcb);
        assert_eq!("hsfc".parse::<LbMethod>().unwrap(), LbMethod::Hsfc);
        assert!("metis".parse::<LbMethod>().is_err());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = ManagerConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: ManagerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.lb_props, config.lb_props);
        assert_eq!(back.lb_method, config.lb_method);
    }
}
