//! Navigation layers.
//!
//! **Context**: A layer is a slab of the detector, represented by a single
//! surface (cylinder, disc, plane or cone), that optionally holds a
//! [`SurfaceArray`] of sensitive modules and carries material. Navigators ask
//! a layer where they enter it, which of its surfaces they cross, and which
//! layer comes next.
//!
//! **How it Works**: Compatible surfaces are gathered according to a search
//! depth, from an exhaustive test of every array surface down to a lookup of
//! the bin at the query position plus its neighbours. The candidates are
//! intersected, filtered and ordered by path length. The next layer is
//! chosen from a fixed previous/next pair by the sign of the direction along
//! a bin utility installed by the enclosing tracking volume.
//!
//! Back-references to the enclosing volumes and the next-layer links are set
//! exactly once, by the tracking volume module.

use nalgebra::{Isometry3, Point3, Vector3};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use tracing::trace;

use crate::approach_descriptor::ApproachDescriptor;
use crate::bin_utility::{BinUtility, BinningValue};
use crate::error::{GeometryError, Result};
use crate::geometry_object::{GeometryId, GeometryObject};
use crate::intersection::{
    BoundaryCheck, PropDirection, SurfaceIntersection, TrackParameters,
};
use crate::material::SurfaceMaterial;
use crate::overlap_descriptor::{ElementOverlapDescriptor, OverlapDescriptor};
use crate::settings::MAX_PATH_LENGTH;
use crate::surface::Surface;
use crate::surface_array::SurfaceArray;
use crate::tracking_volume::{DetachedTrackingVolume, TrackingVolume};
use crate::volume_bounds::AbstractVolume;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approach_descriptor::GenericApproachDescriptor;
    use crate::bin_utility::{BinningData, BinningOption};
    use crate::detector_element::{DetectorElement, Identifier};
    use crate::volume_bounds::CylinderVolumeBounds;
    use crate::material::{Material, MaterialProperties};
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};
    use std::f64::consts::PI;

    const RADIUS: f64 = 50.0;

    /// A cylinder layer with eight modules in phi at the layer radius.
    fn module_layer() -> Arc<Layer> {
        let n = 8;
        let surfaces: Vec<Arc<Surface>> = (0..n)
            .map(|i| {
                let phi = -PI + (i as f64 + 0.5) * 2.0 * PI / n as f64;
                let rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), phi)
                    * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5 * PI);
                let transform = Isometry3::from_parts(
                    Translation3::new(RADIUS * phi.cos(), RADIUS * phi.sin(), 0.0),
                    rotation,
                );
                let element = Arc::new(DetectorElement::new(Identifier(i), transform, 0.3));
                Arc::new(
                    Surface::plane(transform, 100.0, 21.0)
                        .unwrap()
                        .with_detector_element(element),
                )
            })
            .collect();
        let utility = BinUtility::new(
            BinningData::equidistant(BinningValue::Phi, BinningOption::Closed, n as usize, -PI, PI)
                .unwrap(),
        );
        Layer::cylinder(
            Isometry3::identity(),
            RADIUS,
            100.0,
            LayerConfig {
                surface_array: Some(SurfaceArray::new(surfaces, utility)),
                thickness: 2.0,
                layer_type: LayerType::Active,
                ..Default::default()
            },
        )
        .unwrap()
    }

    /// The same layer with each module linked to its phi neighbours.
    fn linked_module_layer() -> Arc<Layer> {
        let layer = module_layer();
        let n = 8;
        for (i, surface) in layer.surface_array().unwrap().array_objects().iter().enumerate() {
            let i = i as u64;
            surface
                .detector_element()
                .unwrap()
                .register_neighbours(&[Identifier((i + n - 1) % n), Identifier((i + 1) % n)]);
        }
        layer
    }

    fn module(layer: &Layer, i: usize) -> &Arc<Surface> {
        &layer.surface_array().unwrap().array_objects()[i]
    }

    fn holds(hits: &[SurfaceIntersection], surface: &Arc<Surface>) -> bool {
        hits.iter().any(|h| Arc::ptr_eq(&h.surface, surface))
    }

    fn search_from(
        layer: &Layer,
        pos: Point3<f64>,
        dir: Vector3<f64>,
        depth: i32,
        end_surface: Option<&Surface>,
    ) -> Vec<SurfaceIntersection> {
        let mut out = Vec::new();
        layer.compatible_surfaces(
            &mut out,
            &TrackParameters::new(pos, dir),
            PropDirection::Forward,
            BoundaryCheck::yes(),
            true,
            false,
            depth,
            None,
            end_surface,
        );
        out
    }

    fn search(layer: &Layer, dir: Vector3<f64>, depth: i32) -> Vec<SurfaceIntersection> {
        search_from(layer, Point3::origin(), dir, depth, None)
    }

    /// A point on the layer inside the phi bin of module 4, and the radial direction there.
    fn on_module_four() -> (Point3<f64>, Vector3<f64>) {
        let dir = Vector3::new(0.3_f64.cos(), 0.3_f64.sin(), 0.0);
        (Point3::from(dir * RADIUS), dir)
    }

    #[test]
    fn untested_search_returns_every_surface() {
        let layer = module_layer();
        for dir in [Vector3::x(), Vector3::z(), Vector3::new(-1.0, 2.0, 0.3)] {
            assert_eq!(search(&layer, dir, -1).len(), 8);
        }
    }

    #[test]
    fn filtered_search_is_sorted() {
        let layer = module_layer();
        let hits = search(&layer, Vector3::new(1.0, 0.2, 0.1), 0);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.intersection.valid));
        for pair in hits.windows(2) {
            assert!(pair[0].path_length() <= pair[1].path_length());
        }
    }

    #[test]
    fn start_surface_is_excluded() {
        let layer = module_layer();
        let dir = Vector3::new(1.0, 0.2, 0.0);
        let first = search(&layer, dir, 0).remove(0);
        let mut out = Vec::new();
        layer.compatible_surfaces(
            &mut out,
            &TrackParameters::new(Point3::origin(), dir),
            PropDirection::Forward,
            BoundaryCheck::yes(),
            true,
            false,
            0,
            Some(first.surface.as_ref()),
            None,
        );
        assert!(out.iter().all(|h| !Arc::ptr_eq(&h.surface, &first.surface)));
    }

    #[test]
    fn passive_collection_toggles() {
        let layer = module_layer();
        let mut out = Vec::new();
        let found = layer.compatible_surfaces(
            &mut out,
            &TrackParameters::new(Point3::origin(), Vector3::x()),
            PropDirection::Forward,
            BoundaryCheck::yes(),
            false,
            true,
            0,
            None,
            None,
        );
        // the layer surface has no material and the modules are sensitive
        assert!(!found);

        layer.assign_material(SurfaceMaterial::Homogeneous(MaterialProperties::new(
            Material::silicon(),
            1.0,
        )));
        assert!(layer.compatible_surfaces(
            &mut out,
            &TrackParameters::new(Point3::origin(), Vector3::x()),
            PropDirection::Forward,
            BoundaryCheck::yes(),
            false,
            true,
            0,
            None,
            None,
        ));
        assert!(Arc::ptr_eq(&out[0].surface, layer.surface_representation()));
    }

    #[test]
    fn approach_resolves_the_module() {
        let layer = module_layer();
        let dir = Vector3::new(1.0, 0.1, 0.0);
        let plain = layer.surface_on_approach(
            &Point3::origin(),
            &dir,
            PropDirection::Forward,
            BoundaryCheck::yes(),
            false,
        );
        assert!(Arc::ptr_eq(&plain.surface, layer.surface_representation()));
        assert_relative_eq!(plain.position().coords.xy().norm(), RADIUS, epsilon = 1e-9);

        let resolved = layer.surface_on_approach(
            &Point3::origin(),
            &dir,
            PropDirection::Forward,
            BoundaryCheck::yes(),
            true,
        );
        assert!(resolved.surface.is_sensitive());
    }

    #[test]
    fn no_utility_no_next_layer() {
        let layer = module_layer();
        assert!(layer.next_layer(&Point3::origin(), &Vector3::x()).is_none());
    }

    #[test]
    fn links_are_set_once() {
        let layer = module_layer();
        let other = module_layer();
        layer.register_next_layers(None, Some(&other)).unwrap();
        assert_eq!(
            layer.register_next_layers(Some(&other), None),
            Err(GeometryError::AlreadySet("next layers"))
        );
        let utility = BinUtility::new(
            BinningData::equidistant(BinningValue::R, BinningOption::Open, 1, 0.0, 100.0).unwrap(),
        );
        layer.register_next_layer_utility(utility.clone()).unwrap();
        assert!(layer.register_next_layer_utility(utility).is_err());

        let outward = layer.next_layer(&Point3::new(50.0, 0.0, 0.0), &Vector3::x()).unwrap();
        assert!(Arc::ptr_eq(&outward, &other));
        assert!(layer
            .next_layer(&Point3::new(50.0, 0.0, 0.0), &-Vector3::x())
            .is_none());
    }

    #[test]
    fn shifted_clone_round_trip() {
        let layer = module_layer();
        let shift = Isometry3::translation(3.0, -2.0, 40.0);
        let moved = layer.clone_with_shift(&shift);
        assert_relative_eq!(moved.surface_representation().center(), Point3::new(3.0, -2.0, 40.0));
        assert_relative_eq!(layer.surface_representation().center(), Point3::origin());
        assert!(Arc::ptr_eq(
            moved.surface_array().unwrap(),
            layer.surface_array().unwrap()
        ));

        let back = moved.clone_with_shift(&shift.inverse());
        assert_relative_eq!(
            back.surface_representation().transform().to_homogeneous(),
            layer.surface_representation().transform().to_homogeneous(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn on_layer_uses_half_thickness() {
        let layer = module_layer();
        assert!(layer.is_on_layer(&Point3::new(50.9, 0.0, 0.0), BoundaryCheck::yes()));
        assert!(!layer.is_on_layer(&Point3::new(51.5, 0.0, 0.0), BoundaryCheck::yes()));
        assert!(layer.has_sensitive());
        assert!(layer.has_sub_structure(false));
    }

    #[test]
    fn bin_and_neighbour_search() {
        let layer = linked_module_layer();
        let (pos, dir) = on_module_four();

        let raw = search_from(&layer, pos, dir, 1, None);
        assert_eq!(raw.len(), 3);
        for i in [3, 4, 5] {
            assert!(holds(&raw, module(&layer, i)));
        }

        // only the module under the track is actually crossed
        let filtered = search_from(&layer, pos, dir, 2, None);
        assert_eq!(filtered.len(), 1);
        assert!(Arc::ptr_eq(&filtered[0].surface, module(&layer, 4)));
        assert!(filtered[0].intersection.valid);
    }

    #[test]
    fn next_bin_search_follows_the_direction() {
        let layer = module_layer();
        let (pos, radial) = on_module_four();
        let backwards = radial - 0.5 * Vector3::new(-0.3_f64.sin(), 0.3_f64.cos(), 0.0);

        let raw = search_from(&layer, pos, backwards, 3, None);
        assert_eq!(raw.len(), 2);
        assert!(holds(&raw, module(&layer, 4)));
        assert!(holds(&raw, module(&layer, 3)));

        let filtered = search_from(&layer, pos, backwards, 4, None);
        assert!(!filtered.is_empty());
        assert!(filtered.iter().all(|h| h.intersection.valid));
        assert!(filtered.iter().all(|h| {
            Arc::ptr_eq(&h.surface, module(&layer, 3)) || Arc::ptr_eq(&h.surface, module(&layer, 4))
        }));
    }

    #[test]
    fn overlap_search_uses_the_descriptor() {
        // from the origin the bin lookup lands on module 4, but the track heads for module 0
        let phi = -PI + PI / 8.0;
        let dir = Vector3::new(phi.cos(), phi.sin(), 0.0);

        let layer = linked_module_layer();
        let fallback = search(&layer, dir, 5);
        assert_eq!(fallback.len(), 1);
        assert!(Arc::ptr_eq(&fallback[0].surface, module(&layer, 0)));

        layer.set_overlap_descriptor(Some(Box::new(ElementOverlapDescriptor)));
        assert!(search(&layer, dir, 5).is_empty());

        let (pos, radial) = on_module_four();
        let hits = search_from(&layer, pos, radial, 5, None);
        assert_eq!(hits.len(), 1);
        assert!(Arc::ptr_eq(&hits[0].surface, module(&layer, 4)));
    }

    #[test]
    fn end_surface_caps_and_filters() {
        let layer = module_layer();
        let phi = PI / 8.0;
        let dir = Vector3::new(phi.cos(), phi.sin(), 0.0);
        let end_plane = |distance: f64| {
            let rotation = UnitQuaternion::rotation_between(&Vector3::z(), &dir).unwrap();
            Surface::plane(
                Isometry3::from_parts(Translation3::from(dir * distance), rotation),
                10.0,
                10.0,
            )
            .unwrap()
        };
        assert_eq!(search(&layer, dir, -1).len(), 8);

        // an end surface turns the unfiltered search into the filtered one
        let far = end_plane(80.0);
        let hits = search_from(&layer, Point3::origin(), dir, -1, Some(&far));
        assert_eq!(hits.len(), 1);
        assert!(Arc::ptr_eq(&hits[0].surface, module(&layer, 4)));
        assert_relative_eq!(hits[0].path_length(), RADIUS, epsilon = 1e-9);

        // nothing beyond the end surface
        let near = end_plane(20.0);
        assert!(search_from(&layer, Point3::origin(), dir, -1, Some(&near)).is_empty());

        // the end surface itself is never returned
        let end = Arc::clone(module(&layer, 4));
        assert!(search_from(&layer, Point3::origin(), dir, 0, Some(end.as_ref())).is_empty());
    }

    #[test]
    fn on_layer_uses_the_representing_volume() {
        let layer = module_layer();
        layer.register_representing_volume(AbstractVolume::new(
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(45.0, 55.0, PI, 100.0).unwrap()),
        ));
        // well outside half the thickness, but inside the volume
        assert!(layer.is_on_layer(&Point3::new(53.0, 0.0, 0.0), BoundaryCheck::yes()));
        assert!(layer.is_on_layer(&Point3::new(0.0, -46.0, 90.0), BoundaryCheck::yes()));
        assert!(!layer.is_on_layer(&Point3::new(56.0, 0.0, 0.0), BoundaryCheck::yes()));
        assert!(!layer.is_on_layer(&Point3::new(50.0, 0.0, 101.0), BoundaryCheck::yes()));
    }

    #[test]
    fn approach_surface_material_counts() {
        let layer = module_layer();
        assert!(!layer.has_material());
        let approach = Surface::cylinder(Isometry3::identity(), RADIUS - 1.0, PI, 100.0)
            .unwrap()
            .with_material(SurfaceMaterial::Homogeneous(MaterialProperties::new(
                Material::silicon(),
                0.5,
            )));
        layer.set_approach_descriptor(Some(Box::new(GenericApproachDescriptor::new(vec![
            Arc::new(approach),
        ]))));
        assert!(layer.has_material());
        assert!(layer.material().is_none());
    }

    #[test]
    fn descriptors_are_replaced() {
        let layer = module_layer();
        assert!(layer.overlap_descriptor().is_none());
        layer.set_overlap_descriptor(Some(Box::new(ElementOverlapDescriptor)));
        assert!(layer.overlap_descriptor().is_some());
        layer.set_overlap_descriptor(None);
        assert!(layer.overlap_descriptor().is_none());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Passive,
    Active,
}

/// Everything a layer is built from besides its surface.
#[derive(Debug)]
pub struct LayerConfig {
    pub surface_array: Option<SurfaceArray>,
    pub thickness: f64,
    pub overlap_descriptor: Option<Box<dyn OverlapDescriptor>>,
    pub approach_descriptor: Option<Box<dyn ApproachDescriptor>>,
    pub layer_type: LayerType,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            surface_array: None,
            thickness: 0.0,
            overlap_descriptor: None,
            approach_descriptor: None,
            layer_type: LayerType::Passive,
        }
    }
}

#[derive(Debug)]
struct NextLayers {
    previous: Weak<Layer>,
    next: Weak<Layer>,
}

#[derive(Debug)]
pub struct Layer {
    surface: Arc<Surface>,
    surface_array: Option<Arc<SurfaceArray>>,
    thickness: f64,
    layer_type: LayerType,
    overlap_descriptor: RwLock<Option<Box<dyn OverlapDescriptor>>>,
    approach_descriptor: RwLock<Option<Box<dyn ApproachDescriptor>>>,
    representing_volume: RwLock<Option<AbstractVolume>>,
    next_layers: OnceLock<NextLayers>,
    next_layer_utility: OnceLock<BinUtility>,
    enclosing_volume: OnceLock<Weak<TrackingVolume>>,
    enclosing_detached_volume: OnceLock<Weak<DetachedTrackingVolume>>,
}

impl Layer {
    /// Builds a layer around its representing surface.
    pub fn new(surface: Surface, config: LayerConfig) -> Result<Arc<Layer>> {
        if !(config.thickness >= 0.0) {
            return Err(GeometryError::InvalidBounds(format!(
                "layer thickness {}",
                config.thickness
            )));
        }
        Ok(Arc::new(Self::assemble(
            Arc::new(surface),
            config.surface_array.map(Arc::new),
            config.thickness,
            config.layer_type,
            config.overlap_descriptor,
            config.approach_descriptor,
        )))
    }

    fn assemble(
        surface: Arc<Surface>,
        surface_array: Option<Arc<SurfaceArray>>,
        thickness: f64,
        layer_type: LayerType,
        overlap_descriptor: Option<Box<dyn OverlapDescriptor>>,
        approach_descriptor: Option<Box<dyn ApproachDescriptor>>,
    ) -> Self {
        Self {
            surface,
            surface_array,
            thickness,
            layer_type,
            overlap_descriptor: RwLock::new(overlap_descriptor),
            approach_descriptor: RwLock::new(approach_descriptor),
            representing_volume: RwLock::new(None),
            next_layers: OnceLock::new(),
            next_layer_utility: OnceLock::new(),
            enclosing_volume: OnceLock::new(),
            enclosing_detached_volume: OnceLock::new(),
        }
    }

    /// Full phi cylinder layer around the local z axis.
    pub fn cylinder(
        transform: Isometry3<f64>,
        radius: f64,
        half_z: f64,
        config: LayerConfig,
    ) -> Result<Arc<Layer>> {
        let surface = Surface::cylinder(transform, radius, std::f64::consts::PI, half_z)?;
        Self::new(surface, config)
    }

    /// Full phi disc layer.
    pub fn disc(
        transform: Isometry3<f64>,
        r_min: f64,
        r_max: f64,
        config: LayerConfig,
    ) -> Result<Arc<Layer>> {
        let surface = Surface::disc(transform, r_min, r_max, std::f64::consts::PI)?;
        Self::new(surface, config)
    }

    pub fn plane(
        transform: Isometry3<f64>,
        half_x: f64,
        half_y: f64,
        config: LayerConfig,
    ) -> Result<Arc<Layer>> {
        Self::new(Surface::plane(transform, half_x, half_y)?, config)
    }

    pub fn cone(
        transform: Isometry3<f64>,
        alpha: f64,
        z_min: f64,
        z_max: f64,
        config: LayerConfig,
    ) -> Result<Arc<Layer>> {
        let surface = Surface::cone(transform, alpha, z_min, z_max, std::f64::consts::PI)?;
        Self::new(surface, config)
    }

    /// A copy of this layer moved by `shift`.
    ///
    /// The copy shares the surface array, clones the descriptors and is not
    /// linked into any volume. The original is untouched.
    pub fn clone_with_shift(&self, shift: &Isometry3<f64>) -> Arc<Layer> {
        let layer = Self::assemble(
            Arc::new(self.surface.shifted(shift)),
            self.surface_array.clone(),
            self.thickness,
            self.layer_type,
            self.overlap_descriptor(),
            self.approach_descriptor(),
        );
        if let Some(volume) = self.representing_volume() {
            layer.register_representing_volume(volume.shifted(shift));
        }
        Arc::new(layer)
    }

    pub fn surface_representation(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn surface_array(&self) -> Option<&Arc<SurfaceArray>> {
        self.surface_array.as_ref()
    }

    pub fn thickness(&self) -> f64 {
        self.thickness
    }

    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }

    pub fn overlap_descriptor(&self) -> Option<Box<dyn OverlapDescriptor>> {
        self.overlap_descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn approach_descriptor(&self) -> Option<Box<dyn ApproachDescriptor>> {
        self.approach_descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the overlap descriptor; the previous one is dropped.
    pub fn set_overlap_descriptor(&self, descriptor: Option<Box<dyn OverlapDescriptor>>) {
        *self
            .overlap_descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = descriptor;
    }

    /// Replaces the approach descriptor; the previous one is dropped.
    pub fn set_approach_descriptor(&self, descriptor: Option<Box<dyn ApproachDescriptor>>) {
        *self
            .approach_descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = descriptor;
    }

    pub fn representing_volume(&self) -> Option<AbstractVolume> {
        self.representing_volume
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the volume the layer occupies, replacing any previous one.
    pub fn register_representing_volume(&self, volume: AbstractVolume) {
        *self
            .representing_volume
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(volume);
    }

    pub fn enclosing_tracking_volume(&self) -> Option<Arc<TrackingVolume>> {
        self.enclosing_volume.get().and_then(Weak::upgrade)
    }

    pub fn enclosing_detached_tracking_volume(&self) -> Option<Arc<DetachedTrackingVolume>> {
        self.enclosing_detached_volume.get().and_then(Weak::upgrade)
    }

    pub(crate) fn enclose_tracking_volume(&self, volume: Weak<TrackingVolume>) -> Result<()> {
        self.enclosing_volume
            .set(volume)
            .map_err(|_| GeometryError::AlreadySet("enclosing tracking volume"))
    }

    pub(crate) fn enclose_detached_tracking_volume(
        &self,
        volume: Weak<DetachedTrackingVolume>,
    ) -> Result<()> {
        self.enclosing_detached_volume
            .set(volume)
            .map_err(|_| GeometryError::AlreadySet("enclosing detached tracking volume"))
    }

    pub(crate) fn register_next_layers(
        &self,
        previous: Option<&Arc<Layer>>,
        next: Option<&Arc<Layer>>,
    ) -> Result<()> {
        let links = NextLayers {
            previous: previous.map_or_else(Weak::new, Arc::downgrade),
            next: next.map_or_else(Weak::new, Arc::downgrade),
        };
        self.next_layers
            .set(links)
            .map_err(|_| GeometryError::AlreadySet("next layers"))
    }

    pub(crate) fn register_next_layer_utility(&self, utility: BinUtility) -> Result<()> {
        self.next_layer_utility
            .set(utility)
            .map_err(|_| GeometryError::AlreadySet("next layer utility"))
    }

    pub(crate) fn assign_geometry_id(&self, id: GeometryId) -> Result<()> {
        self.surface.assign_geometry_id(id)
    }

    pub(crate) fn assign_material(&self, material: SurfaceMaterial) {
        self.surface.assign_material(material);
    }

    pub fn material(&self) -> Option<Arc<SurfaceMaterial>> {
        self.surface.material()
    }

    /// Whether the layer surface or any of its approach surfaces carries material.
    pub fn has_material(&self) -> bool {
        self.surface.has_material()
            || self
                .approach_descriptor
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|approach| {
                    approach
                        .containing_surfaces()
                        .iter()
                        .any(|surface| surface.has_material())
                })
    }

    pub fn has_sensitive(&self) -> bool {
        self.surface_array
            .as_ref()
            .is_some_and(|array| array.array_objects().iter().any(|s| s.is_sensitive()))
    }

    /// Whether there is anything below the layer surface to resolve.
    pub fn has_sub_structure(&self, resolve_sensitive: bool) -> bool {
        let has_approach = self
            .approach_descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        has_approach || (self.surface_array.is_some() && (!resolve_sensitive || self.has_sensitive()))
    }

    /// Whether a position lies within the layer, using its representing
    /// volume if set and half the thickness around the surface otherwise.
    pub fn is_on_layer(&self, pos: &Point3<f64>, bcheck: BoundaryCheck) -> bool {
        if let Some(volume) = self
            .representing_volume
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return volume.inside(pos, bcheck.tolerance);
        }
        let widened = BoundaryCheck {
            enabled: bcheck.enabled,
            tolerance: bcheck.tolerance + 0.5 * self.thickness,
        };
        self.surface.is_on_surface(pos, widened)
    }

    pub fn on_layer(&self, pars: &TrackParameters, bcheck: BoundaryCheck) -> bool {
        self.is_on_layer(pars.position(), bcheck)
    }

    /// Collects the surfaces of this layer a track may cross.
    ///
    /// Appends intersections to `out`, ordered by path length along the
    /// propagation direction, and returns whether anything was appended.
    /// `search_type` selects the depth:
    ///
    /// | depth | candidates                                    | intersection filter |
    /// |-------|-----------------------------------------------|---------------------|
    /// | -1    | every array surface                           | no                  |
    /// | 0     | every array surface                           | yes                 |
    /// | 1, 2  | bin surface, its neighbours and bin members   | 2 only              |
    /// | 3, 4  | bin surface and the next bins along the track | 4 only              |
    /// | 5     | bin surface and the overlap descriptor's pick | yes                 |
    ///
    /// An end surface caps the path length and promotes unfiltered depths to
    /// their filtered counterpart. Start and end surfaces are never returned.
    #[allow(clippy::too_many_arguments)]
    pub fn compatible_surfaces(
        &self,
        out: &mut Vec<SurfaceIntersection>,
        pars: &TrackParameters,
        pdir: PropDirection,
        bcheck: BoundaryCheck,
        collect_sensitive: bool,
        collect_passive: bool,
        search_type: i32,
        start_surface: Option<&Surface>,
        end_surface: Option<&Surface>,
    ) -> bool {
        let pos = pars.position();
        let dir = pars.propagation_direction(pdir);
        let force = pdir.is_forced();
        let before = out.len();

        let mut max_path = MAX_PATH_LENGTH;
        let mut search_type = search_type;
        if let Some(end) = end_surface {
            let end_hit = end.intersection_estimate(pos, &dir, force, bcheck);
            if end_hit.valid {
                max_path = end_hit.path_length.abs();
            }
            search_type = match search_type {
                -1 => 0,
                1 => 2,
                3 => 4,
                depth => depth,
            };
        }

        let excluded = |surface: &Surface| {
            start_surface.is_some_and(|s| std::ptr::eq(s, surface))
                || end_surface.is_some_and(|s| std::ptr::eq(s, surface))
        };
        let test_surface = |out: &mut Vec<SurfaceIntersection>, surface: &Arc<Surface>, filter: bool| {
            if excluded(surface.as_ref()) || out[before..].iter().any(|h| Arc::ptr_eq(&h.surface, surface)) {
                return;
            }
            let wanted = if surface.is_sensitive() {
                collect_sensitive
            } else {
                collect_passive
            };
            if !wanted {
                return;
            }
            let intersection = surface.intersection_estimate(pos, &dir, force, bcheck);
            if !filter || (intersection.valid && intersection.path_length.abs() <= max_path) {
                out.push(SurfaceIntersection::new(intersection, Arc::clone(surface), pdir));
            }
        };

        if search_type >= 0 && collect_passive {
            let approach = self
                .approach_descriptor
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(approach) = approach.as_ref() {
                for surface in approach.containing_surfaces() {
                    if surface.has_material() {
                        test_surface(out, surface, true);
                    }
                }
            }
            if self.surface.has_material() {
                test_surface(out, &self.surface, true);
            }
        }

        if let Some(array) = &self.surface_array {
            if collect_sensitive || collect_passive {
                let bin_surface = array.object(pos).cloned();
                let (candidates, filter): (Vec<Arc<Surface>>, bool) = match search_type {
                    -1 | 0 => (array.array_objects().to_vec(), search_type == 0),
                    1 | 2 => {
                        let mut candidates: Vec<Arc<Surface>> = bin_surface.iter().cloned().collect();
                        if let Some(surface) = &bin_surface {
                            ElementOverlapDescriptor.reachable_surfaces(
                                &mut candidates,
                                surface,
                                array,
                                pos,
                                &dir,
                            );
                        }
                        (candidates, search_type == 2)
                    }
                    3 | 4 => {
                        let mut candidates: Vec<Arc<Surface>> = bin_surface.iter().cloned().collect();
                        candidates.extend(array.next_objects(pos, &dir));
                        (candidates, search_type == 4)
                    }
                    _ => {
                        let overlap = self
                            .overlap_descriptor
                            .read()
                            .unwrap_or_else(PoisonError::into_inner);
                        match (overlap.as_ref(), &bin_surface) {
                            (Some(descriptor), Some(surface)) => {
                                let mut candidates = vec![Arc::clone(surface)];
                                descriptor.reachable_surfaces(&mut candidates, surface, array, pos, &dir);
                                (candidates, true)
                            }
                            _ => {
                                trace!(search_type, "no overlap descriptor, testing every surface");
                                (array.array_objects().to_vec(), true)
                            }
                        }
                    }
                };
                for surface in &candidates {
                    test_surface(out, surface, filter);
                }
            }
        }

        out[before..].sort_by(SurfaceIntersection::nearest_first);
        out.len() > before
    }

    /// The surface crossed when entering the layer.
    ///
    /// With `resolve_sub_surfaces` the approach descriptor is asked first,
    /// then the array surface in the bin of the layer crossing. Otherwise, or
    /// if neither yields a valid crossing, the layer surface itself is
    /// intersected.
    pub fn surface_on_approach(
        &self,
        pos: &Point3<f64>,
        dir: &Vector3<f64>,
        pdir: PropDirection,
        bcheck: BoundaryCheck,
        resolve_sub_surfaces: bool,
    ) -> SurfaceIntersection {
        let dir = dir * pdir.sign();
        let force = pdir.is_forced();
        let layer_hit = self.surface.intersection_estimate(pos, &dir, force, bcheck);

        if resolve_sub_surfaces {
            let approach = self
                .approach_descriptor
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = approach
                .as_ref()
                .and_then(|descriptor| descriptor.approach_surface(pos, &dir, bcheck))
            {
                return SurfaceIntersection::new(hit.intersection, hit.surface, pdir);
            }
            if let (Some(array), true) = (&self.surface_array, layer_hit.valid) {
                if let Some(surface) = array.object(&layer_hit.position) {
                    let hit = surface.intersection_estimate(pos, &dir, force, bcheck);
                    if hit.valid {
                        return SurfaceIntersection::new(hit, Arc::clone(surface), pdir);
                    }
                }
            }
        }
        SurfaceIntersection::new(layer_hit, Arc::clone(&self.surface), pdir)
    }

    /// The neighbouring layer in the direction of travel.
    ///
    /// `None` without a next-layer utility, or at the end of the layer stack.
    pub fn next_layer(&self, pos: &Point3<f64>, dir: &Vector3<f64>) -> Option<Arc<Layer>> {
        let utility = self.next_layer_utility.get()?;
        let links = self.next_layers.get()?;
        let link = if utility.next_direction(pos, dir) < 0 {
            &links.previous
        } else {
            &links.next
        };
        link.upgrade()
    }
}

impl GeometryObject for Layer {
    fn geometry_id(&self) -> GeometryId {
        self.surface.geometry_id()
    }

    fn binning_position(&self, value: BinningValue) -> Point3<f64> {
        self.surface.binning_position(value)
    }
}
