//! Material value objects.
//!
//! A [`MaterialTrackRecord`] is what an upstream simulation hands to the
//! mapping job: the start vertex and direction of a track plus the ordered
//! [`MaterialStep`]s it deposited. Layers describe their own material with a
//! [`SurfaceMaterial`]; a `Proxy` marks a layer that still has to be mapped
//! and carries the binning the mapped result will use.

use nalgebra::{Point3, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::bin_utility::BinUtility;


/// Bulk material description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Radiation length.
    pub x0: f64,
    /// Nuclear interaction length.
    pub l0: f64,
    pub a: f64,
    pub z: f64,
    pub rho: f64,
}

impl Material {
    pub fn new(x0: f64, l0: f64, a: f64, z: f64, rho: f64) -> Self {
        Self { x0, l0, a, z, rho }
    }

    pub fn vacuum() -> Self {
        Self {
            x0: f64::INFINITY,
            l0: f64::INFINITY,
            a: 0.0,
            z: 0.0,
            rho: 0.0,
        }
    }

    /// Silicon, lengths in mm and density in g/mm3.
    pub fn silicon() -> Self {
        Self::new(93.7, 465.2, 28.0855, 14.0, 2.329e-3)
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::vacuum()
    }
}

/// Material with a thickness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialProperties {
    pub material: Material,
    pub thickness: f64,
}

impl MaterialProperties {
    pub fn new(material: Material, thickness: f64) -> Self {
        Self {
            material,
            thickness,
        }
    }

    pub fn thickness_in_x0(&self) -> f64 {
        if self.material.x0.is_finite() && self.material.x0 > 0.0 {
            self.thickness / self.material.x0
        } else {
            0.0
        }
    }

    pub fn thickness_in_l0(&self) -> f64 {
        if self.material.l0.is_finite() && self.material.l0 > 0.0 {
            self.thickness / self.material.l0
        } else {
            0.0
        }
    }

    /// Same material with a scaled thickness.
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.material, self.thickness * factor)
    }

    /// Combines several slabs into one equivalent slab.
    ///
    /// Thickness and thickness in X0/L0 are additive; density is thickness
    /// weighted; A and Z are weighted by mass per area.
    pub fn combine(slabs: &[MaterialProperties]) -> MaterialProperties {
        let thickness: f64 = slabs.iter().map(|s| s.thickness).sum();
        if thickness <= 0.0 {
            return MaterialProperties::default();
        }
        let t_in_x0: f64 = slabs.iter().map(MaterialProperties::thickness_in_x0).sum();
        let t_in_l0: f64 = slabs.iter().map(MaterialProperties::thickness_in_l0).sum();
        let mass: f64 = slabs.iter().map(|s| s.material.rho * s.thickness).sum();

        let (a, z) = if mass > 0.0 {
            (
                slabs.iter().map(|s| s.material.a * s.material.rho * s.thickness).sum::<f64>() / mass,
                slabs.iter().map(|s| s.material.z * s.material.rho * s.thickness).sum::<f64>() / mass,
            )
        } else {
            (0.0, 0.0)
        };

        let length = |t_in: f64| if t_in > 0.0 { thickness / t_in } else { f64::INFINITY };

        MaterialProperties::new(
            Material::new(length(t_in_x0), length(t_in_l0), a, z, mass / thickness),
            thickness,
        )
    }
}

/// Material deposited at a position along a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialStep {
    pub properties: MaterialProperties,
    pub position: Point3<f64>,
}

impl MaterialStep {
    pub fn new(properties: MaterialProperties, position: Point3<f64>) -> Self {
        Self {
            properties,
            position,
        }
    }
}

/// The material a single track traversed, as produced by simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialTrackRecord {
    vertex: Point3<f64>,
    theta: f64,
    phi: f64,
    steps: Vec<MaterialStep>,
}

impl MaterialTrackRecord {
    pub fn new(vertex: Point3<f64>, theta: f64, phi: f64, steps: Vec<MaterialStep>) -> Self {
        Self {
            vertex,
            theta,
            phi,
            steps,
        }
    }

    pub fn vertex(&self) -> &Point3<f64> {
        &self.vertex
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn phi(&self) -> f64 {
        self.phi
    }

    pub fn material_steps(&self) -> &[MaterialStep] {
        &self.steps
    }

    /// Unit direction from the polar and azimuthal angles.
    pub fn direction(&self) -> Vector3<f64> {
        let (sin_theta, cos_theta) = self.theta.sin_cos();
        let (sin_phi, cos_phi) = self.phi.sin_cos();
        Vector3::new(cos_phi * sin_theta, sin_phi * sin_theta, cos_theta)
    }

    pub fn thickness_in_x0(&self) -> f64 {
        self.steps
            .iter()
            .map(|s| s.properties.thickness_in_x0())
            .sum()
    }
}

/// Per-bin material of a surface after mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinnedSurfaceMaterial {
    bin_utility: BinUtility,
    /// Indexed `[bin along axis 1, bin along axis 0]`.
    properties: Array2<MaterialProperties>,
}

impl BinnedSurfaceMaterial {
    pub fn new(bin_utility: BinUtility, properties: Array2<MaterialProperties>) -> Self {
        Self {
            bin_utility,
            properties,
        }
    }

    pub fn bin_utility(&self) -> &BinUtility {
        &self.bin_utility
    }

    pub fn properties(&self) -> &Array2<MaterialProperties> {
        &self.properties
    }

    pub fn material_properties(&self, pos: &Point3<f64>) -> Option<MaterialProperties> {
        let bin = self.bin_utility.bin(pos);
        self.properties.get([bin[1], bin[0]]).copied()
    }
}

/// Material description attached to a surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SurfaceMaterial {
    Homogeneous(MaterialProperties),
    /// Placeholder for material still to be mapped, with its target binning.
    Proxy(BinUtility),
    Binned(BinnedSurfaceMaterial),
}

impl SurfaceMaterial {
    pub fn bin_utility(&self) -> Option<&BinUtility> {
        match self {
            SurfaceMaterial::Homogeneous(_) => None,
            SurfaceMaterial::Proxy(utility) => Some(utility),
            SurfaceMaterial::Binned(binned) => Some(binned.bin_utility()),
        }
    }

    /// Material at a position; a proxy carries none.
    pub fn material_properties(&self, pos: &Point3<f64>) -> Option<MaterialProperties> {
        match self {
            SurfaceMaterial::Homogeneous(props) => Some(*props),
            SurfaceMaterial::Proxy(_) => None,
            SurfaceMaterial::Binned(binned) => binned.material_properties(pos),
        }
    }
}
