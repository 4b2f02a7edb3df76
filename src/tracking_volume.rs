//! Tracking volumes: ordered layer stacks inside bounded regions.
//!
//! **Context**: The geometry is a tree of volumes. Each volume owns an
//! ordered stack of layers and any number of child volumes, and is closed by
//! the boundary surfaces its bounds decompose into.
//!
//! **How it Works**: On creation the layers are sorted along the binning
//! value and binned with boundaries halfway between neighbours. Each layer
//! learns its previous and next layer, gets a one-bin utility to decide
//! between them, and is told which volume encloses it. Geometry identifiers
//! are handed out in the same pass.

use nalgebra::{Isometry3, Point3, Vector3};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

use crate::bin_utility::{BinUtility, BinningData, BinningOption, BinningValue};
use crate::error::{GeometryError, Result};
use crate::geometry_object::{GeometryId, GeometryIdCell, GeometryObject};
use crate::intersection::{BoundaryCheck, PropDirection, SurfaceIntersection};
use crate::layer::Layer;
use crate::settings::NUMERICAL_STABLE;
use crate::surface::Surface;
use crate::volume_bounds::{AbstractVolume, VolumeBounds};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerConfig;
    use crate::volume_bounds::CylinderVolumeBounds;
    use std::f64::consts::PI;

    fn cylinder_layer(radius: f64) -> Arc<Layer> {
        Layer::cylinder(
            Isometry3::identity(),
            radius,
            100.0,
            LayerConfig {
                thickness: 1.0,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn barrel(layers: Vec<Arc<Layer>>) -> Result<Arc<TrackingVolume>> {
        TrackingVolume::create(
            "barrel",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, 80.0, PI, 110.0).unwrap()),
            layers,
            BinningValue::R,
            Vec::new(),
            1,
        )
    }

    #[test]
    fn layers_are_sorted_and_linked() {
        let volume = barrel(vec![cylinder_layer(60.0), cylinder_layer(20.0), cylinder_layer(40.0)])
            .unwrap();
        let radii: Vec<f64> = volume.layers().iter().map(|l| l.binning_radius()).collect();
        assert_eq!(radii, vec![20.0, 40.0, 60.0]);

        let pos = Point3::new(40.0, 0.0, 0.0);
        let middle = volume.associated_layer(&pos).unwrap();
        assert!(Arc::ptr_eq(&middle, &volume.layers()[1]));
        // halfway between the layers is the bin boundary
        assert!(Arc::ptr_eq(
            &volume.associated_layer(&Point3::new(29.0, 0.0, 0.0)).unwrap(),
            &volume.layers()[0]
        ));
        assert!(Arc::ptr_eq(
            &volume.associated_layer(&Point3::new(31.0, 0.0, 0.0)).unwrap(),
            &volume.layers()[1]
        ));

        let outward = middle.next_layer(&pos, &Vector3::x()).unwrap();
        assert!(Arc::ptr_eq(&outward, &volume.layers()[2]));
        let inward = middle.next_layer(&pos, &-Vector3::x()).unwrap();
        assert!(Arc::ptr_eq(&inward, &volume.layers()[0]));
        assert!(volume.layers()[2].next_layer(&pos, &Vector3::x()).is_none());

        let enclosing = middle.enclosing_tracking_volume().unwrap();
        assert!(Arc::ptr_eq(&enclosing, &volume));
        assert_eq!(middle.geometry_id().volume(), 1);
        assert_eq!(middle.geometry_id().layer(), 2);
    }

    #[test]
    fn layers_cannot_be_enclosed_twice() {
        let layers = vec![cylinder_layer(20.0), cylinder_layer(40.0)];
        let _first = barrel(layers.clone()).unwrap();
        let second = barrel(layers);
        assert!(matches!(second, Err(GeometryError::AlreadySet(_))));
    }

    #[test]
    fn coincident_layers_are_rejected() {
        let result = barrel(vec![cylinder_layer(20.0), cylinder_layer(20.0)]);
        assert!(matches!(result, Err(GeometryError::LayerOrdering(_))));
    }

    #[test]
    fn detached_volume_encloses_its_layer_once() {
        let layer = cylinder_layer(30.0);
        let volume = barrel(Vec::new()).unwrap();
        let detached =
            DetachedTrackingVolume::create("support", Arc::clone(&volume), Arc::clone(&layer)).unwrap();
        assert_eq!(detached.name(), "support");
        assert!(Arc::ptr_eq(detached.layer(), &layer));
        assert!(Arc::ptr_eq(detached.tracking_volume(), &volume));
        assert!(Arc::ptr_eq(
            &layer.enclosing_detached_tracking_volume().unwrap(),
            &detached
        ));
        assert!(layer.enclosing_tracking_volume().is_none());

        let again = DetachedTrackingVolume::create("copy", volume, Arc::clone(&layer));
        assert_eq!(
            again.unwrap_err(),
            GeometryError::AlreadySet("enclosing detached tracking volume")
        );
        assert!(Arc::ptr_eq(
            &layer.enclosing_detached_tracking_volume().unwrap(),
            &detached
        ));

        // the layer does not keep its detached volume alive
        drop(detached);
        assert!(layer.enclosing_detached_tracking_volume().is_none());
    }

    #[test]
    fn boundaries_and_lowest_volume() {
        let inner = barrel(vec![cylinder_layer(20.0)]).unwrap();
        let world = TrackingVolume::create(
            "world",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, 200.0, PI, 300.0).unwrap()),
            Vec::new(),
            BinningValue::R,
            vec![Arc::clone(&inner)],
            2,
        )
        .unwrap();
        assert_eq!(world.boundary_surfaces().len(), 3);
        assert_eq!(world.boundary_surfaces()[2].geometry_id().boundary(), 3);

        let found = world.lowest_tracking_volume(&Point3::new(10.0, 0.0, 0.0)).unwrap();
        assert!(Arc::ptr_eq(&found, &inner));
        let found = world.lowest_tracking_volume(&Point3::new(150.0, 0.0, 0.0)).unwrap();
        assert!(Arc::ptr_eq(&found, &world));
        assert!(world.lowest_tracking_volume(&Point3::new(500.0, 0.0, 0.0)).is_none());
        assert!(Arc::ptr_eq(&inner.mother_volume().unwrap(), &world));

        let exits = inner.boundary_surfaces_ordered(&Point3::origin(), &Vector3::new(1.0, 0.0, 0.1));
        assert_eq!(exits.len(), 1);
        assert!((exits[0].path_length() - 80.0 * (1.0_f64 + 0.01).sqrt()).abs() < 1e-9);
    }
}

/// A volume holding an ordered stack of layers and child volumes.
#[derive(Debug)]
pub struct TrackingVolume {
    name: String,
    volume: AbstractVolume,
    layers: Vec<Arc<Layer>>,
    layer_utility: Option<BinUtility>,
    children: Vec<Arc<TrackingVolume>>,
    boundary_surfaces: Vec<Arc<Surface>>,
    mother: OnceLock<Weak<TrackingVolume>>,
    geometry_id: GeometryIdCell,
}

impl TrackingVolume {
    /// Creates a volume and wires up its layers and children.
    ///
    /// Fails if two layers sit at the same binning value, or if a layer or
    /// child already belongs to another volume.
    pub fn create(
        name: &str,
        transform: Isometry3<f64>,
        bounds: Arc<dyn VolumeBounds>,
        mut layers: Vec<Arc<Layer>>,
        binning_value: BinningValue,
        children: Vec<Arc<TrackingVolume>>,
        volume_id: u64,
    ) -> Result<Arc<TrackingVolume>> {
        let value_of = |layer: &Arc<Layer>| binning_value.value(&layer.binning_position(binning_value));
        layers.sort_by(|a, b| value_of(a).total_cmp(&value_of(b)));
        let values: Vec<f64> = layers.iter().map(value_of).collect();
        if values.windows(2).any(|w| w[1] - w[0] < NUMERICAL_STABLE) {
            return Err(GeometryError::LayerOrdering(format!(
                "layers of {name} are not separated along {binning_value:?}: {values:?}"
            )));
        }
        let boundaries = layer_boundaries(&layers, &values);

        let layer_utility = match boundaries.len() {
            0 => None,
            _ => Some(BinUtility::new(BinningData::arbitrary(
                binning_value,
                BinningOption::Open,
                boundaries.clone(),
            )?)),
        };
        let boundary_surfaces = bounds
            .decompose_to_surfaces(&transform)?
            .into_iter()
            .map(Arc::new)
            .collect();

        let volume = Arc::new(TrackingVolume {
            name: name.to_string(),
            volume: AbstractVolume::new(transform, bounds),
            layers,
            layer_utility,
            children,
            boundary_surfaces,
            mother: OnceLock::new(),
            geometry_id: GeometryIdCell::default(),
        });

        let volume_geo_id = GeometryId::default().with_volume(volume_id);
        volume.geometry_id.assign(volume_geo_id)?;

        for (i, layer) in volume.layers.iter().enumerate() {
            layer.enclose_tracking_volume(Arc::downgrade(&volume))?;
            let previous = i.checked_sub(1).map(|p| &volume.layers[p]);
            layer.register_next_layers(previous, volume.layers.get(i + 1))?;
            layer.register_next_layer_utility(BinUtility::new(BinningData::equidistant(
                binning_value,
                BinningOption::Open,
                1,
                boundaries[i],
                boundaries[i + 1],
            )?))?;
            assign_layer_ids(layer, volume_geo_id.with_layer(i as u64 + 1))?;
        }

        for child in &volume.children {
            child
                .mother
                .set(Arc::downgrade(&volume))
                .map_err(|_| GeometryError::AlreadySet("mother volume"))?;
        }

        for (i, surface) in volume.boundary_surfaces.iter().enumerate() {
            surface.assign_geometry_id(volume_geo_id.with_boundary(i as u64 + 1))?;
        }

        debug!(
            name,
            layers = volume.layers.len(),
            children = volume.children.len(),
            "created tracking volume"
        );
        Ok(volume)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_id(&self) -> u64 {
        self.geometry_id.get().volume()
    }

    pub fn transform(&self) -> &Isometry3<f64> {
        self.volume.transform()
    }

    pub fn bounds(&self) -> &Arc<dyn VolumeBounds> {
        self.volume.bounds()
    }

    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    pub fn children(&self) -> &[Arc<TrackingVolume>] {
        &self.children
    }

    pub fn mother_volume(&self) -> Option<Arc<TrackingVolume>> {
        self.mother.get().and_then(Weak::upgrade)
    }

    pub fn boundary_surfaces(&self) -> &[Arc<Surface>] {
        &self.boundary_surfaces
    }

    pub fn inside(&self, pos: &Point3<f64>, tolerance: f64) -> bool {
        self.volume.inside(pos, tolerance)
    }

    /// The layer whose bin contains `pos`.
    pub fn associated_layer(&self, pos: &Point3<f64>) -> Option<Arc<Layer>> {
        let utility = self.layer_utility.as_ref()?;
        self.layers.get(utility.bin_along(pos, 0)).cloned()
    }

    /// The innermost volume of this tree containing `pos`.
    pub fn lowest_tracking_volume(self: &Arc<Self>, pos: &Point3<f64>) -> Option<Arc<TrackingVolume>> {
        if !self.inside(pos, 0.0) {
            return None;
        }
        self.children
            .iter()
            .find_map(|child| child.lowest_tracking_volume(pos))
            .or_else(|| Some(Arc::clone(self)))
    }

    /// Boundary surfaces crossed ahead of `pos` along `dir`, nearest first.
    pub fn boundary_surfaces_ordered(
        &self,
        pos: &Point3<f64>,
        dir: &Vector3<f64>,
    ) -> Vec<SurfaceIntersection> {
        let mut hits: Vec<SurfaceIntersection> = self
            .boundary_surfaces
            .iter()
            .filter_map(|surface| {
                let hit = surface.intersection_estimate(pos, dir, true, BoundaryCheck::yes());
                hit.valid
                    .then(|| SurfaceIntersection::new(hit, Arc::clone(surface), PropDirection::Forward))
            })
            .collect();
        hits.sort_by(SurfaceIntersection::nearest_first);
        hits
    }
}

impl GeometryObject for TrackingVolume {
    fn geometry_id(&self) -> GeometryId {
        self.geometry_id.get()
    }

    fn binning_position(&self, value: BinningValue) -> Point3<f64> {
        self.volume.center() + self.volume.bounds().binning_offset(value)
    }
}

/// Bin boundaries of a sorted layer stack: halfway between neighbours, and
/// just outside the outer layers' half thickness at both ends.
fn layer_boundaries(layers: &[Arc<Layer>], values: &[f64]) -> Vec<f64> {
    let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
        return Vec::new();
    };
    let mut boundaries = Vec::with_capacity(values.len() + 1);
    boundaries.push(values[0] - 0.5 * first.thickness() - NUMERICAL_STABLE);
    boundaries.extend(values.windows(2).map(|w| 0.5 * (w[0] + w[1])));
    boundaries.push(values[values.len() - 1] + 0.5 * last.thickness() + NUMERICAL_STABLE);
    boundaries
}

/// Identifiers for a layer and the surfaces below it.
///
/// Sub-surfaces that already carry an identifier (shared with a shifted
/// copy placed elsewhere) keep it.
fn assign_layer_ids(layer: &Layer, layer_id: GeometryId) -> Result<()> {
    layer.assign_geometry_id(layer_id)?;
    let sub_ids = layer
        .surface_array()
        .into_iter()
        .flat_map(|array| array.array_objects().iter().filter(|s| s.is_sensitive()))
        .enumerate()
        .map(|(i, surface)| (surface, layer_id.with_sensitive(i as u64 + 1)));
    for (surface, id) in sub_ids {
        if let Err(err) = surface.assign_geometry_id(id) {
            debug!(%err, id = %id, "sensitive surface keeps its geometry id");
        }
    }
    if let Some(approach) = layer.approach_descriptor() {
        for (i, surface) in approach.containing_surfaces().iter().enumerate() {
            if let Err(err) = surface.assign_geometry_id(layer_id.with_approach(i as u64 + 1)) {
                debug!(%err, "approach surface keeps its geometry id");
            }
        }
    }
    Ok(())
}

/// A tracking volume that is not part of the static volume tree, wrapping a
/// single layer.
#[derive(Debug)]
pub struct DetachedTrackingVolume {
    name: String,
    volume: Arc<TrackingVolume>,
    layer: Arc<Layer>,
}

impl DetachedTrackingVolume {
    pub fn create(name: &str, volume: Arc<TrackingVolume>, layer: Arc<Layer>) -> Result<Arc<Self>> {
        let detached = Arc::new(Self {
            name: name.to_string(),
            volume,
            layer,
        });
        detached
            .layer
            .enclose_detached_tracking_volume(Arc::downgrade(&detached))?;
        Ok(detached)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracking_volume(&self) -> &Arc<TrackingVolume> {
        &self.volume
    }

    pub fn layer(&self) -> &Arc<Layer> {
        &self.layer
    }
}
