//! Volume shapes and their decomposition into boundary surfaces.
//!
//! Decomposition is a pure factory: every call allocates fresh surfaces,
//! placed by the given transform, with normals pointing out of the volume.

use nalgebra::{Isometry3, Point3, Vector3};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::sync::Arc;

use crate::bin_utility::BinningValue;
use crate::error::{GeometryError, Result};
use crate::settings::NUMERICAL_STABLE;
use crate::surface::Surface;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Asserts that a step along the normal from each surface center leaves the volume.
    fn assert_outward(bounds: &dyn VolumeBounds, surfaces: &[Surface]) {
        for surface in surfaces {
            let center = match surface.bounds() {
                crate::surface::SurfaceBounds::Cylinder { radius, .. } => {
                    surface.local_to_global(&Point3::new(*radius, 0.0, 0.0))
                }
                crate::surface::SurfaceBounds::Disc { r_min, r_max, .. } => {
                    surface.local_to_global(&Point3::new(0.5 * (r_min + r_max), 0.0, 0.0))
                }
                _ => surface.center(),
            };
            let normal = surface.normal(&center);
            assert!(bounds.inside(&(center - normal * 0.5), 0.0), "{:?}", surface.bounds());
            assert!(!bounds.inside(&(center + normal * 0.5), 0.0), "{:?}", surface.bounds());
        }
    }

    #[test]
    fn hollow_full_cylinder_has_four_surfaces() {
        let bounds = CylinderVolumeBounds::new(50.0, 150.0, PI, 100.0).unwrap();
        let surfaces = bounds.decompose_to_surfaces(&Isometry3::identity()).unwrap();
        assert_eq!(surfaces.len(), 4);
        assert_relative_eq!(surfaces[0].center().z, -100.0, epsilon = 1e-12);
        assert_relative_eq!(surfaces[1].center().z, 100.0, epsilon = 1e-12);
        assert_outward(&bounds, &surfaces);
    }

    #[test]
    fn solid_sector_has_five_surfaces() {
        // two discs, the outer cylinder and the two sector planes
        let bounds = CylinderVolumeBounds::new(0.0, 150.0, FRAC_PI_2, 100.0).unwrap();
        let surfaces = bounds.decompose_to_surfaces(&Isometry3::identity()).unwrap();
        assert_eq!(surfaces.len(), 5);
        assert_outward(&bounds, &surfaces);
    }

    #[test]
    fn stability_threshold_is_a_parameter() {
        let bounds = CylinderVolumeBounds::new(0.05, 150.0, PI, 100.0).unwrap();
        let default = bounds.decompose_to_surfaces(&Isometry3::identity()).unwrap();
        assert_eq!(default.len(), 3);
        let strict = bounds
            .decompose_to_surfaces_with(&Isometry3::identity(), 0.01)
            .unwrap();
        assert_eq!(strict.len(), 4);
    }

    #[test]
    fn cuboid_faces_point_outwards() {
        let bounds = CuboidVolumeBounds::new(10.0, 20.0, 30.0).unwrap();
        let surfaces = bounds.decompose_to_surfaces(&Isometry3::identity()).unwrap();
        assert_eq!(surfaces.len(), 6);
        assert_outward(&bounds, &surfaces);
    }

    #[test]
    fn invalid_volume_bounds() {
        assert!(CylinderVolumeBounds::new(10.0, 5.0, PI, 100.0).is_err());
        assert!(CylinderVolumeBounds::new(0.0, 5.0, PI, 0.0).is_err());
        assert!(CuboidVolumeBounds::new(1.0, -1.0, 1.0).is_err());
    }

    #[test]
    fn placed_volume_inside() {
        let volume = AbstractVolume::new(
            Isometry3::translation(0.0, 0.0, 500.0),
            Arc::new(CylinderVolumeBounds::new(0.0, 100.0, PI, 50.0).unwrap()),
        );
        assert!(volume.inside(&Point3::new(10.0, 0.0, 520.0), 0.0));
        assert!(!volume.inside(&Point3::new(10.0, 0.0, 20.0), 0.0));
    }
}

/// Shape of a volume in its local frame.
pub trait VolumeBounds: Send + Sync + fmt::Debug {
    /// Whether a local position lies inside, within `tolerance`.
    fn inside(&self, pos: &Point3<f64>, tolerance: f64) -> bool;

    /// Boundary surfaces placed by `transform`; `numerical_stable` is the
    /// threshold below which radii and angular differences count as degenerate.
    fn decompose_to_surfaces_with(
        &self,
        transform: &Isometry3<f64>,
        numerical_stable: f64,
    ) -> Result<Vec<Surface>>;

    fn decompose_to_surfaces(&self, transform: &Isometry3<f64>) -> Result<Vec<Surface>> {
        self.decompose_to_surfaces_with(transform, NUMERICAL_STABLE)
    }

    fn binning_offset(&self, _value: BinningValue) -> Vector3<f64> {
        Vector3::zeros()
    }

    /// Extent of the volume along a binning value.
    fn binning_border(&self, value: BinningValue) -> f64;
}

/// A (possibly hollow, possibly sectored) cylinder around the local z axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CylinderVolumeBounds {
    r_min: f64,
    r_max: f64,
    half_phi: f64,
    half_z: f64,
}

impl CylinderVolumeBounds {
    pub fn new(r_min: f64, r_max: f64, half_phi: f64, half_z: f64) -> Result<Self> {
        if !(r_min >= 0.0 && r_max > r_min && half_z > 0.0 && half_phi > 0.0 && half_phi <= PI) {
            return Err(GeometryError::InvalidBounds(format!(
                "cylinder volume r [{r_min}, {r_max}], half phi {half_phi}, half z {half_z}"
            )));
        }
        Ok(Self {
            r_min,
            r_max,
            half_phi,
            half_z,
        })
    }

    pub fn r_min(&self) -> f64 {
        self.r_min
    }

    pub fn r_max(&self) -> f64 {
        self.r_max
    }

    pub fn half_phi(&self) -> f64 {
        self.half_phi
    }

    pub fn half_z(&self) -> f64 {
        self.half_z
    }
}

impl VolumeBounds for CylinderVolumeBounds {
    fn inside(&self, pos: &Point3<f64>, tolerance: f64) -> bool {
        let r = pos.x.hypot(pos.y);
        if r < self.r_min - tolerance || r > self.r_max + tolerance {
            return false;
        }
        if pos.z.abs() > self.half_z + tolerance {
            return false;
        }
        if self.half_phi < PI && r > 0.0 {
            let phi = pos.y.atan2(pos.x);
            return phi.abs() <= self.half_phi + tolerance / r;
        }
        true
    }

    fn decompose_to_surfaces_with(
        &self,
        transform: &Isometry3<f64>,
        numerical_stable: f64,
    ) -> Result<Vec<Surface>> {
        let mut surfaces = Vec::with_capacity(6);
        let flip = Isometry3::rotation(Vector3::x() * PI);
        let to_top = Isometry3::translation(0.0, 0.0, self.half_z);

        // bottom disc faces -z, top disc +z
        surfaces.push(Surface::disc(
            transform * flip * to_top,
            self.r_min,
            self.r_max,
            self.half_phi,
        )?);
        surfaces.push(Surface::disc(
            transform * to_top,
            self.r_min,
            self.r_max,
            self.half_phi,
        )?);
        surfaces.push(Surface::cylinder(*transform, self.r_max, self.half_phi, self.half_z)?);
        if self.r_min > numerical_stable {
            surfaces.push(
                Surface::cylinder(*transform, self.r_min, self.half_phi, self.half_z)?
                    .with_inverted_normal(),
            );
        }

        if (self.half_phi - PI).abs() > numerical_stable {
            let medium_r = 0.5 * (self.r_min + self.r_max);
            let half_r = 0.5 * (self.r_max - self.r_min);
            for side in [-1.0, 1.0] {
                let placement = transform
                    * Isometry3::rotation(Vector3::z() * (side * self.half_phi))
                    * Isometry3::translation(medium_r, 0.0, 0.0)
                    * Isometry3::rotation(Vector3::x() * (-side * FRAC_PI_2));
                surfaces.push(Surface::plane(placement, half_r, self.half_z)?);
            }
        }
        Ok(surfaces)
    }

    fn binning_border(&self, value: BinningValue) -> f64 {
        match value {
            BinningValue::R => self.r_max,
            BinningValue::Z => self.half_z,
            BinningValue::Phi => self.half_phi,
            _ => 0.0,
        }
    }
}

/// An axis aligned box in its local frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CuboidVolumeBounds {
    half_x: f64,
    half_y: f64,
    half_z: f64,
}

impl CuboidVolumeBounds {
    pub fn new(half_x: f64, half_y: f64, half_z: f64) -> Result<Self> {
        if !(half_x > 0.0 && half_y > 0.0 && half_z > 0.0) {
            return Err(GeometryError::InvalidBounds(format!(
                "cuboid half lengths {half_x}, {half_y}, {half_z}"
            )));
        }
        Ok(Self {
            half_x,
            half_y,
            half_z,
        })
    }
}

impl VolumeBounds for CuboidVolumeBounds {
    fn inside(&self, pos: &Point3<f64>, tolerance: f64) -> bool {
        pos.x.abs() <= self.half_x + tolerance
            && pos.y.abs() <= self.half_y + tolerance
            && pos.z.abs() <= self.half_z + tolerance
    }

    fn decompose_to_surfaces_with(
        &self,
        transform: &Isometry3<f64>,
        _numerical_stable: f64,
    ) -> Result<Vec<Surface>> {
        let face = |axis: Vector3<f64>, angle: f64, distance: f64, half_a: f64, half_b: f64| {
            Surface::plane(
                transform
                    * Isometry3::rotation(axis * angle)
                    * Isometry3::translation(0.0, 0.0, distance),
                half_a,
                half_b,
            )
        };
        Ok(vec![
            face(Vector3::x(), PI, self.half_z, self.half_x, self.half_y)?,
            face(Vector3::x(), 0.0, self.half_z, self.half_x, self.half_y)?,
            face(Vector3::y(), -FRAC_PI_2, self.half_x, self.half_z, self.half_y)?,
            face(Vector3::y(), FRAC_PI_2, self.half_x, self.half_z, self.half_y)?,
            face(Vector3::x(), FRAC_PI_2, self.half_y, self.half_x, self.half_z)?,
            face(Vector3::x(), -FRAC_PI_2, self.half_y, self.half_x, self.half_z)?,
        ])
    }

    fn binning_border(&self, value: BinningValue) -> f64 {
        match value {
            BinningValue::X => self.half_x,
            BinningValue::Y => self.half_y,
            BinningValue::Z => self.half_z,
            BinningValue::R | BinningValue::Mag => {
                Vector3::new(self.half_x, self.half_y, self.half_z).norm()
            }
            _ => 0.0,
        }
    }
}

/// Bounds placed in space.
#[derive(Debug, Clone)]
pub struct AbstractVolume {
    transform: Isometry3<f64>,
    bounds: Arc<dyn VolumeBounds>,
}

impl AbstractVolume {
    pub fn new(transform: Isometry3<f64>, bounds: Arc<dyn VolumeBounds>) -> Self {
        Self { transform, bounds }
    }

    pub fn transform(&self) -> &Isometry3<f64> {
        &self.transform
    }

    pub fn bounds(&self) -> &Arc<dyn VolumeBounds> {
        &self.bounds
    }

    pub fn inside(&self, pos: &Point3<f64>, tolerance: f64) -> bool {
        self.bounds
            .inside(&self.transform.inverse_transform_point(pos), tolerance)
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::from(self.transform.translation.vector)
    }

    /// The same volume moved by `shift`.
    pub fn shifted(&self, shift: &Isometry3<f64>) -> Self {
        Self {
            transform: shift * self.transform,
            bounds: Arc::clone(&self.bounds),
        }
    }
}
