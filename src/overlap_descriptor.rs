use nalgebra::{Point3, Vector3};
use std::fmt;
use std::sync::Arc;

use crate::surface::Surface;
use crate::surface_array::SurfaceArray;


/// Decides which further surfaces of a layer can be reached from a surface,
/// e.g. overlapping modules.
pub trait OverlapDescriptor: Send + Sync + fmt::Debug {
    /// Appends reachable surfaces to `out`; returns whether any were found.
    fn reachable_surfaces(
        &self,
        out: &mut Vec<Arc<Surface>>,
        surface: &Surface,
        surface_array: &SurfaceArray,
        pos: &Point3<f64>,
        dir: &Vector3<f64>,
    ) -> bool;

    fn clone_box(&self) -> Box<dyn OverlapDescriptor>;
}

impl Clone for Box<dyn OverlapDescriptor> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Reaches the neighbours and bin members registered on the detector element
/// behind a surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElementOverlapDescriptor;

impl OverlapDescriptor for ElementOverlapDescriptor {
    fn reachable_surfaces(
        &self,
        out: &mut Vec<Arc<Surface>>,
        surface: &Surface,
        surface_array: &SurfaceArray,
        _pos: &Point3<f64>,
        _dir: &Vector3<f64>,
    ) -> bool {
        let Some(element) = surface.detector_element() else {
            return false;
        };
        let before = out.len();
        let candidates = element
            .neighbours()
            .into_iter()
            .chain(element.bin_members())
            .filter_map(|id| surface_array.surface_by_element(id));
        for candidate in candidates {
            if !out.iter().any(|s| Arc::ptr_eq(s, candidate)) {
                out.push(Arc::clone(candidate));
            }
        }
        out.len() > before
    }

    fn clone_box(&self) -> Box<dyn OverlapDescriptor> {
        Box::new(*self)
    }
}
