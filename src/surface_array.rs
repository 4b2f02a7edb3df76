use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{Point3, Vector3};

use crate::bin_utility::BinUtility;
use crate::detector_element::Identifier;
use crate::geometry_object::GeometryObject;
use crate::surface::Surface;


/// Binned lookup of the surfaces of a layer.
///
/// Every surface is placed into the bin its own binning position maps to
/// under the array's [`BinUtility`]; lookups use the same utility.
#[derive(Debug)]
pub struct SurfaceArray {
    bin_utility: BinUtility,
    bins: Vec<Vec<Arc<Surface>>>,
    surfaces: Vec<Arc<Surface>>,
    by_element: HashMap<Identifier, Arc<Surface>>,
}

impl SurfaceArray {
    pub fn new(surfaces: Vec<Arc<Surface>>, bin_utility: BinUtility) -> Self {
        let mut bins = vec![Vec::new(); bin_utility.bins()];
        let mut unique: Vec<Arc<Surface>> = Vec::with_capacity(surfaces.len());
        let mut by_element = HashMap::new();
        let value = bin_utility.binning_data()[0].value;

        for surface in surfaces {
            if unique.iter().any(|s| Arc::ptr_eq(s, &surface)) {
                continue;
            }
            let bin = bin_utility.bin(&surface.binning_position(value));
            bins[bin_utility.serialize(bin)].push(Arc::clone(&surface));
            if let Some(element) = surface.detector_element() {
                by_element.insert(element.identify(), Arc::clone(&surface));
            }
            unique.push(surface);
        }

        Self {
            bin_utility,
            bins,
            surfaces: unique,
            by_element,
        }
    }

    pub fn bin_utility(&self) -> &BinUtility {
        &self.bin_utility
    }

    /// The first surface in the bin of `pos`.
    pub fn object(&self, pos: &Point3<f64>) -> Option<&Arc<Surface>> {
        self.objects_at(pos).first()
    }

    pub fn objects_at(&self, pos: &Point3<f64>) -> &[Arc<Surface>] {
        self.objects_at_bin(self.bin_utility.bin(pos))
    }

    pub fn objects_at_bin(&self, bin: [usize; 3]) -> &[Arc<Surface>] {
        self.bins
            .get(self.bin_utility.serialize(bin))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every surface held by the array, once.
    pub fn array_objects(&self) -> &[Arc<Surface>] {
        &self.surfaces
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Surfaces of the bin of `pos` and all bins adjacent to it.
    pub fn neighbour_objects(&self, pos: &Point3<f64>) -> Vec<Arc<Surface>> {
        let bins = self.bin_utility.neighbour_bins(self.bin_utility.bin(pos));
        self.collect_bins(&bins)
    }

    /// Surfaces of the bins one step further along `dir`.
    pub fn next_objects(&self, pos: &Point3<f64>, dir: &Vector3<f64>) -> Vec<Arc<Surface>> {
        let bins = self.bin_utility.next_bins(pos, dir);
        self.collect_bins(&bins)
    }

    pub fn surface_by_element(&self, identifier: Identifier) -> Option<&Arc<Surface>> {
        self.by_element.get(&identifier)
    }

    fn collect_bins(&self, bins: &[[usize; 3]]) -> Vec<Arc<Surface>> {
        let mut result: Vec<Arc<Surface>> = Vec::new();
        for surface in bins.iter().flat_map(|bin| self.objects_at_bin(*bin)) {
            if !result.iter().any(|s| Arc::ptr_eq(s, surface)) {
                result.push(Arc::clone(surface));
            }
        }
        result
    }
}
