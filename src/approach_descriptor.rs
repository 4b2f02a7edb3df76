use nalgebra::{Point3, Vector3};
use std::fmt;
use std::sync::Arc;

use crate::intersection::{BoundaryCheck, PropDirection, SurfaceIntersection};
use crate::surface::Surface;

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Isometry3;
    use std::f64::consts::PI;

    #[test]
    fn nearest_forward_surface_wins() {
        let inner = Arc::new(Surface::cylinder(Isometry3::identity(), 30.0, PI, 100.0).unwrap());
        let outer = Arc::new(Surface::cylinder(Isometry3::identity(), 34.0, PI, 100.0).unwrap());
        let descriptor = GenericApproachDescriptor::new(vec![Arc::clone(&outer), Arc::clone(&inner)]);

        let hit = descriptor
            .approach_surface(&Point3::origin(), &Vector3::x(), BoundaryCheck::yes())
            .unwrap();
        assert!(Arc::ptr_eq(&hit.surface, &inner));

        // from between the two only the outer one lies ahead
        let hit = descriptor
            .approach_surface(&Point3::new(32.0, 0.0, 0.0), &Vector3::x(), BoundaryCheck::yes())
            .unwrap();
        assert!(Arc::ptr_eq(&hit.surface, &outer));

        assert!(descriptor
            .approach_surface(&Point3::new(0.0, 0.0, 500.0), &Vector3::z(), BoundaryCheck::yes())
            .is_none());
        assert_eq!(descriptor.containing_surfaces().len(), 2);
    }
}

/// Provides the surfaces a navigator meets when approaching a layer.
pub trait ApproachDescriptor: Send + Sync + fmt::Debug {
    /// The nearest approach surface crossed along `dir`, if any.
    fn approach_surface(
        &self,
        pos: &Point3<f64>,
        dir: &Vector3<f64>,
        bcheck: BoundaryCheck,
    ) -> Option<SurfaceIntersection>;

    fn containing_surfaces(&self) -> &[Arc<Surface>];

    fn clone_box(&self) -> Box<dyn ApproachDescriptor>;
}

impl Clone for Box<dyn ApproachDescriptor> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Approach through a fixed list of surfaces.
#[derive(Debug, Clone)]
pub struct GenericApproachDescriptor {
    surfaces: Vec<Arc<Surface>>,
}

impl GenericApproachDescriptor {
    pub fn new(surfaces: Vec<Arc<Surface>>) -> Self {
        Self { surfaces }
    }
}

impl ApproachDescriptor for GenericApproachDescriptor {
    fn approach_surface(
        &self,
        pos: &Point3<f64>,
        dir: &Vector3<f64>,
        bcheck: BoundaryCheck,
    ) -> Option<SurfaceIntersection> {
        self.surfaces
            .iter()
            .filter_map(|surface| {
                let intersection = surface.intersection_estimate(pos, dir, true, bcheck);
                intersection.valid.then(|| {
                    SurfaceIntersection::new(intersection, Arc::clone(surface), PropDirection::Forward)
                })
            })
            .min_by(SurfaceIntersection::nearest_first)
    }

    fn containing_surfaces(&self) -> &[Arc<Surface>] {
        &self.surfaces
    }

    fn clone_box(&self) -> Box<dyn ApproachDescriptor> {
        Box::new(self.clone())
    }
}
