//! Bounded surfaces.
//!
//! **Context**: Every navigation decision ends in a straight line being
//! intersected with some bounded surface: a sensitive module, a layer's
//! representing surface or a volume boundary. All of them are a placed
//! [`SurfaceBounds`] shape.
//!
//! **How it Works**: Positions and directions are moved into the surface frame
//! with the inverse of its transform. Planes and discs are solved linearly,
//! cylinders and cones through their quadratic. The surviving solutions are
//! tested against the bounds and the nearest one is reported.

use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::{Arc, PoisonError, RwLock};

use crate::bin_utility::BinningValue;
use crate::detector_element::DetectorElement;
use crate::error::{GeometryError, Result};
use crate::geometry_object::{GeometryId, GeometryIdCell, GeometryObject};
use crate::intersection::{BoundaryCheck, Intersection};
use crate::material::SurfaceMaterial;
use crate::settings::ON_SURFACE_TOLERANCE;


/// Shape and extent of a surface, in its local frame.
///
/// Angular extents are half openings around local phi = 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SurfaceBounds {
    /// Rectangle in the local xy plane.
    Plane { half_x: f64, half_y: f64 },
    /// Ring sector in the local xy plane.
    Disc { r_min: f64, r_max: f64, half_phi: f64 },
    /// Cylinder around the local z axis.
    Cylinder { radius: f64, half_phi: f64, half_z: f64 },
    /// Cone with its apex at the origin, opening along +z and -z.
    Cone {
        alpha: f64,
        z_min: f64,
        z_max: f64,
        half_phi: f64,
    },
}

impl SurfaceBounds {
    fn validate(&self) -> Result<()> {
        let invalid = |what: String| Err(GeometryError::InvalidBounds(what));
        let phi_ok = |half_phi: f64| half_phi > 0.0 && half_phi <= PI;
        match *self {
            SurfaceBounds::Plane { half_x, half_y } => {
                if !(half_x > 0.0 && half_y > 0.0) {
                    return invalid(format!("plane half lengths {half_x}, {half_y}"));
                }
            }
            SurfaceBounds::Disc {
                r_min,
                r_max,
                half_phi,
            } => {
                if !(r_min >= 0.0 && r_max > r_min) || !phi_ok(half_phi) {
                    return invalid(format!(
                        "disc bounds r [{r_min}, {r_max}], half phi {half_phi}"
                    ));
                }
            }
            SurfaceBounds::Cylinder {
                radius,
                half_phi,
                half_z,
            } => {
                if !(radius > 0.0 && half_z > 0.0) || !phi_ok(half_phi) {
                    return invalid(format!(
                        "cylinder radius {radius}, half z {half_z}, half phi {half_phi}"
                    ));
                }
            }
            SurfaceBounds::Cone {
                alpha,
                z_min,
                z_max,
                half_phi,
            } => {
                if !(alpha > 0.0 && alpha < 0.5 * PI && z_max > z_min) || !phi_ok(half_phi) {
                    return invalid(format!(
                        "cone alpha {alpha}, z [{z_min}, {z_max}], half phi {half_phi}"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether a local position lies within the bounds, given a tolerance.
    ///
    /// Only the coordinates along the surface are checked, not the distance to it.
    pub fn inside(&self, local: &Point3<f64>, tolerance: f64) -> bool {
        let r = local.x.hypot(local.y);
        let phi = local.y.atan2(local.x);
        match *self {
            SurfaceBounds::Plane { half_x, half_y } => {
                local.x.abs() <= half_x + tolerance && local.y.abs() <= half_y + tolerance
            }
            SurfaceBounds::Disc {
                r_min,
                r_max,
                half_phi,
            } => {
                r >= r_min - tolerance
                    && r <= r_max + tolerance
                    && inside_phi(phi, half_phi, tolerance, r)
            }
            SurfaceBounds::Cylinder {
                radius,
                half_phi,
                half_z,
            } => local.z.abs() <= half_z + tolerance && inside_phi(phi, half_phi, tolerance, radius),
            SurfaceBounds::Cone {
                z_min,
                z_max,
                half_phi,
                ..
            } => {
                local.z >= z_min - tolerance
                    && local.z <= z_max + tolerance
                    && inside_phi(phi, half_phi, tolerance, r)
            }
        }
    }

    /// Distance of a local position from the (unbounded) surface.
    fn distance(&self, local: &Point3<f64>) -> f64 {
        let r = local.x.hypot(local.y);
        match *self {
            SurfaceBounds::Plane { .. } | SurfaceBounds::Disc { .. } => local.z.abs(),
            SurfaceBounds::Cylinder { radius, .. } => (r - radius).abs(),
            SurfaceBounds::Cone { alpha, .. } => (r - local.z.abs() * alpha.tan()).abs() * alpha.cos(),
        }
    }
}

fn inside_phi(phi: f64, half_phi: f64, tolerance: f64, radius: f64) -> bool {
    if half_phi >= PI {
        return true;
    }
    let angular_tolerance = if radius > 0.0 { tolerance / radius } else { 0.0 };
    phi.abs() <= half_phi + angular_tolerance
}

/// A bounded surface placed in space.
///
/// A surface is sensitive iff it refers to a detector element. Its material
/// may be replaced during material mapping; its geometry id is set once.
#[derive(Debug)]
pub struct Surface {
    transform: Isometry3<f64>,
    bounds: SurfaceBounds,
    inverted_normal: bool,
    detector_element: Option<Arc<DetectorElement>>,
    material: RwLock<Option<Arc<SurfaceMaterial>>>,
    geometry_id: GeometryIdCell,
}

impl Surface {
    pub fn new(transform: Isometry3<f64>, bounds: SurfaceBounds) -> Result<Self> {
        bounds.validate()?;
        Ok(Self {
            transform,
            bounds,
            inverted_normal: false,
            detector_element: None,
            material: RwLock::new(None),
            geometry_id: GeometryIdCell::default(),
        })
    }

    pub fn plane(transform: Isometry3<f64>, half_x: f64, half_y: f64) -> Result<Self> {
        Self::new(transform, SurfaceBounds::Plane { half_x, half_y })
    }

    pub fn disc(transform: Isometry3<f64>, r_min: f64, r_max: f64, half_phi: f64) -> Result<Self> {
        Self::new(
            transform,
            SurfaceBounds::Disc {
                r_min,
                r_max,
                half_phi,
            },
        )
    }

    pub fn cylinder(transform: Isometry3<f64>, radius: f64, half_phi: f64, half_z: f64) -> Result<Self> {
        Self::new(
            transform,
            SurfaceBounds::Cylinder {
                radius,
                half_phi,
                half_z,
            },
        )
    }

    pub fn cone(
        transform: Isometry3<f64>,
        alpha: f64,
        z_min: f64,
        z_max: f64,
        half_phi: f64,
    ) -> Result<Self> {
        Self::new(
            transform,
            SurfaceBounds::Cone {
                alpha,
                z_min,
                z_max,
                half_phi,
            },
        )
    }

    /// Makes this surface the representation of a detector element.
    pub fn with_detector_element(mut self, element: Arc<DetectorElement>) -> Self {
        self.detector_element = Some(element);
        self
    }

    pub fn with_material(self, material: SurfaceMaterial) -> Self {
        *self.material.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(material));
        self
    }

    /// Flips the reported normal, e.g. for inner volume boundaries that face inwards.
    pub fn with_inverted_normal(mut self) -> Self {
        self.inverted_normal = !self.inverted_normal;
        self
    }

    /// A copy moved by `shift`, applied after the own transform.
    ///
    /// Material and detector element are shared; the geometry id is not copied.
    pub fn shifted(&self, shift: &Isometry3<f64>) -> Surface {
        Surface {
            transform: shift * self.transform,
            bounds: self.bounds,
            inverted_normal: self.inverted_normal,
            detector_element: self.detector_element.clone(),
            material: RwLock::new(self.material()),
            geometry_id: GeometryIdCell::default(),
        }
    }

    pub fn transform(&self) -> &Isometry3<f64> {
        &self.transform
    }

    pub fn bounds(&self) -> &SurfaceBounds {
        &self.bounds
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::from(self.transform.translation.vector)
    }

    pub fn detector_element(&self) -> Option<&Arc<DetectorElement>> {
        self.detector_element.as_ref()
    }

    pub fn is_sensitive(&self) -> bool {
        self.detector_element.is_some()
    }

    pub fn material(&self) -> Option<Arc<SurfaceMaterial>> {
        self.material
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_material(&self) -> bool {
        self.material
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replaces the material; used when mapped material is finalised.
    pub(crate) fn assign_material(&self, material: SurfaceMaterial) {
        *self.material.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(material));
    }

    pub(crate) fn assign_geometry_id(&self, id: GeometryId) -> Result<()> {
        self.geometry_id.assign(id)
    }

    pub fn global_to_local(&self, pos: &Point3<f64>) -> Point3<f64> {
        self.transform.inverse_transform_point(pos)
    }

    pub fn local_to_global(&self, local: &Point3<f64>) -> Point3<f64> {
        self.transform.transform_point(local)
    }

    pub fn inside_bounds(&self, pos: &Point3<f64>, bcheck: BoundaryCheck) -> bool {
        !bcheck.enabled
            || self
                .bounds
                .inside(&self.global_to_local(pos), bcheck.tolerance)
    }

    /// Whether a global position lies on the surface (and within bounds, if checked).
    pub fn is_on_surface(&self, pos: &Point3<f64>, bcheck: BoundaryCheck) -> bool {
        let local = self.global_to_local(pos);
        self.bounds.distance(&local) <= ON_SURFACE_TOLERANCE + bcheck.tolerance
            && (!bcheck.enabled || self.bounds.inside(&local, bcheck.tolerance))
    }

    /// Unit normal at a global position.
    pub fn normal(&self, pos: &Point3<f64>) -> Vector3<f64> {
        let local = self.global_to_local(pos);
        let local_normal = match self.bounds {
            SurfaceBounds::Plane { .. } | SurfaceBounds::Disc { .. } => Vector3::z(),
            SurfaceBounds::Cylinder { .. } => {
                let radial = Vector3::new(local.x, local.y, 0.0);
                radial.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::x)
            }
            SurfaceBounds::Cone { alpha, .. } => {
                let phi = local.y.atan2(local.x);
                let slope = if local.z < 0.0 { alpha.tan() } else { -alpha.tan() };
                Vector3::new(phi.cos(), phi.sin(), slope).normalize()
            }
        };
        let normal = self.transform.transform_vector(&local_normal);
        if self.inverted_normal {
            -normal
        } else {
            normal
        }
    }

    /// Factor by which a thickness grows when crossed along `dir` at `pos`.
    pub fn path_correction(&self, pos: &Point3<f64>, dir: &Vector3<f64>) -> f64 {
        let cos_incidence = self.normal(pos).dot(&dir.normalize()).abs();
        1.0 / cos_incidence.max(f64::EPSILON)
    }

    /// Straight line intersection from `pos` along `dir`.
    ///
    /// With `force_direction` only solutions ahead of `pos` are considered;
    /// otherwise the solution with the smallest absolute path length is taken.
    /// If no solution passes the boundary check, the nearest one is returned
    /// marked invalid.
    pub fn intersection_estimate(
        &self,
        pos: &Point3<f64>,
        dir: &Vector3<f64>,
        force_direction: bool,
        bcheck: BoundaryCheck,
    ) -> Intersection {
        let Some(dir) = dir.try_normalize(f64::EPSILON) else {
            return Intersection::invalid();
        };
        let local_pos = self.global_to_local(pos);
        let local_dir = self.transform.inverse_transform_vector(&dir);

        let mut solutions = self.solve(&local_pos, &local_dir);
        if force_direction {
            solutions.retain(|t| *t > 0.0);
            solutions.sort_by(f64::total_cmp);
        } else {
            // equal distances prefer the forward solution
            solutions.sort_by(|a, b| a.abs().total_cmp(&b.abs()).then(b.total_cmp(a)));
        }

        let Some(&nearest) = solutions.first() else {
            return Intersection::invalid();
        };
        let accepted = solutions.iter().copied().find(|t| {
            !bcheck.enabled
                || self
                    .bounds
                    .inside(&(local_pos + local_dir * *t), bcheck.tolerance)
        });
        match accepted {
            Some(t) => Intersection::new(pos + dir * t, t, true),
            None => Intersection::new(pos + dir * nearest, nearest, false),
        }
    }

    /// Path lengths at which the local line meets the unbounded surface.
    fn solve(&self, p: &Point3<f64>, d: &Vector3<f64>) -> Vec<f64> {
        match self.bounds {
            SurfaceBounds::Plane { .. } | SurfaceBounds::Disc { .. } => {
                if d.z.abs() < f64::EPSILON {
                    Vec::new()
                } else {
                    vec![-p.z / d.z]
                }
            }
            SurfaceBounds::Cylinder { radius, .. } => solve_quadratic(
                d.x * d.x + d.y * d.y,
                2.0 * (p.x * d.x + p.y * d.y),
                p.x * p.x + p.y * p.y - radius * radius,
            ),
            SurfaceBounds::Cone { alpha, .. } => {
                let k = alpha.tan().powi(2);
                solve_quadratic(
                    d.x * d.x + d.y * d.y - k * d.z * d.z,
                    2.0 * (p.x * d.x + p.y * d.y - k * p.z * d.z),
                    p.x * p.x + p.y * p.y - k * p.z * p.z,
                )
            }
        }
    }
}

/// Real roots of `a t^2 + b t + c`, degrading to the linear case for vanishing `a`.
fn solve_quadratic(a: f64, b: f64, c: f64) -> Vec<f64> {
    if a.abs() < f64::EPSILON {
        if b.abs() < f64::EPSILON {
            return Vec::new();
        }
        return vec![-c / b];
    }
    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return Vec::new();
    }
    let root = discriminant.sqrt();
    vec![(-b - root) / (2.0 * a), (-b + root) / (2.0 * a)]
}

impl GeometryObject for Surface {
    fn geometry_id(&self) -> GeometryId {
        self.geometry_id.get()
    }

    fn binning_position(&self, value: BinningValue) -> Point3<f64> {
        match (value, self.bounds) {
            (BinningValue::R, SurfaceBounds::Cylinder { radius, .. }) => {
                self.local_to_global(&Point3::new(radius, 0.0, 0.0))
            }
            (BinningValue::R, SurfaceBounds::Disc { r_min, r_max, .. }) => {
                self.local_to_global(&Point3::new(0.5 * (r_min + r_max), 0.0, 0.0))
            }
            _ => self.center(),
        }
    }
}
