//! A generic cylindrical detector and synthetic material tracks for it.
//!
//! **Context**: Navigation and material mapping need a geometry to run on.
//! The detector built here is the usual layout of a tracker: nested barrel
//! layers of flat modules around the beam line, closed by passive endcap
//! discs, all inside one world volume.
//!
//! **How it Works**: Every barrel layer is a cylinder carrying a ring of
//! planar modules binned in phi and z, with module neighbours registered so
//! overlaps can be resolved. Endcap discs sit in their own volumes on both
//! sides. Each layer carries a material proxy describing the binning its
//! mapped material will get.

use anyhow::Result;
use itertools::iproduct;
use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, info};

use crate::approach_descriptor::GenericApproachDescriptor;
use crate::bin_utility::{BinUtility, BinningData, BinningOption, BinningValue};
use crate::detector_element::{DetectorElement, Identifier};
use crate::error;
use crate::intersection::BoundaryCheck;
use crate::layer::{Layer, LayerConfig, LayerType};
use crate::material::{Material, MaterialProperties, MaterialStep, MaterialTrackRecord, SurfaceMaterial};
use crate::overlap_descriptor::ElementOverlapDescriptor;
use crate::settings::{DetectorSettings, MappingSettings};
use crate::surface::Surface;
use crate::surface_array::SurfaceArray;
use crate::tracking_volume::TrackingVolume;
use crate::volume_bounds::CylinderVolumeBounds;


/// The built detector.
#[derive(Debug, Clone)]
pub struct Detector {
    world: Arc<TrackingVolume>,
}

impl Detector {
    pub fn build(settings: &DetectorSettings) -> error::Result<Self> {
        let thickness = settings.layer_thickness;
        let r_outer = settings.barrel_radii.iter().fold(0.0_f64, |a, r| a.max(*r)) + thickness;
        let volume_r = r_outer + settings.envelope;

        let barrel_layers = settings
            .barrel_radii
            .iter()
            .enumerate()
            .map(|(index, radius)| barrel_layer(settings, index, *radius))
            .collect::<error::Result<Vec<_>>>()?;

        let ((barrel_half_z, world_half_z), endcaps) = match settings
            .endcap_z
            .iter()
            .copied()
            .reduce(f64::min)
        {
            Some(first) => {
                let last = settings.endcap_z.iter().fold(first, |a, z| a.max(*z));
                let inner = 0.5 * (settings.barrel_half_z + first);
                let outer = last + thickness + settings.envelope;
                let negative = endcap_volume(settings, -1.0, inner, outer, r_outer, volume_r, 1)?;
                let positive = endcap_volume(settings, 1.0, inner, outer, r_outer, volume_r, 3)?;
                ((inner, outer), Some((negative, positive)))
            }
            None => {
                let half_z = settings.barrel_half_z + settings.envelope;
                ((half_z, half_z), None)
            }
        };

        let barrel = TrackingVolume::create(
            "barrel",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, volume_r, PI, barrel_half_z)?),
            barrel_layers,
            BinningValue::R,
            Vec::new(),
            2,
        )?;

        let children = match endcaps {
            Some((negative, positive)) => vec![negative, barrel, positive],
            None => vec![barrel],
        };
        let world = TrackingVolume::create(
            "world",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, volume_r, PI, world_half_z)?),
            Vec::new(),
            BinningValue::R,
            children,
            4,
        )?;
        info!(
            barrel_layers = settings.barrel_radii.len(),
            endcap_layers = 2 * settings.endcap_z.len(),
            radius = volume_r,
            half_z = world_half_z,
            "built detector"
        );
        Ok(Self { world })
    }

    pub fn world(&self) -> &Arc<TrackingVolume> {
        &self.world
    }

    /// Layers of every volume, children before their mother.
    pub fn layers(&self) -> Vec<Arc<Layer>> {
        fn collect(volume: &TrackingVolume, out: &mut Vec<Arc<Layer>>) {
            for child in volume.children() {
                collect(child, out);
            }
            out.extend(volume.layers().iter().cloned());
        }
        let mut layers = Vec::new();
        collect(&self.world, &mut layers);
        layers
    }

    /// Generates straight material tracks from the origin, uniform in eta and phi.
    pub fn generate_material_tracks(&self, settings: &MappingSettings) -> Result<Vec<MaterialTrackRecord>> {
        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let eta = Uniform::new_inclusive(-settings.eta_max, settings.eta_max)?;
        let phi = Uniform::new(-PI, PI)?;

        let records: Vec<MaterialTrackRecord> = (0..settings.num_tracks)
            .map(|_| {
                let theta = 2.0 * (-eta.sample(&mut rng)).exp().atan();
                self.material_track(theta, phi.sample(&mut rng), settings.steps_per_layer)
            })
            .collect();
        debug!(
            tracks = records.len(),
            steps = records.iter().map(|r| r.material_steps().len()).sum::<usize>(),
            "generated material tracks"
        );
        Ok(records)
    }

    /// The silicon a straight track from the origin sees, as `steps_per_layer`
    /// slices through every layer it crosses, ordered along the track.
    pub fn material_track(&self, theta: f64, phi: f64, steps_per_layer: usize) -> MaterialTrackRecord {
        let vertex = Point3::origin();
        let dir = MaterialTrackRecord::new(vertex, theta, phi, Vec::new()).direction();

        let mut steps: Vec<MaterialStep> = Vec::new();
        for layer in self.layers() {
            let surface = layer.surface_representation();
            let hit = surface.intersection_estimate(&vertex, &dir, true, BoundaryCheck::yes());
            if !hit.valid {
                continue;
            }
            if steps_per_layer == 0 {
                break;
            }
            let path = layer.thickness() * surface.path_correction(&hit.position, &dir);
            let slice = path / steps_per_layer as f64;
            steps.extend((0..steps_per_layer).map(|k| {
                let offset = (k as f64 + 0.5) * slice - 0.5 * path;
                MaterialStep::new(
                    MaterialProperties::new(Material::silicon(), slice),
                    hit.position + dir * offset,
                )
            }));
        }
        steps.sort_by(|a, b| {
            (a.position - vertex)
                .norm()
                .total_cmp(&(b.position - vertex).norm())
        });
        MaterialTrackRecord::new(vertex, theta, phi, steps)
    }
}

/// Rotation taking local z to the radial direction at `phi` and local y to global z.
fn module_rotation(phi: f64) -> UnitQuaternion<f64> {
    let (s, c) = phi.sin_cos();
    let x = Vector3::new(-s, c, 0.0);
    let y = Vector3::z();
    let z = Vector3::new(c, s, 0.0);
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[
        x, y, z,
    ])))
}

fn module_id(layer: usize, phi_bin: usize, z_bin: usize, modules_z: usize) -> Identifier {
    Identifier((layer as u64 + 1) * 100_000 + (phi_bin * modules_z + z_bin) as u64)
}

fn barrel_layer(settings: &DetectorSettings, index: usize, radius: f64) -> error::Result<Arc<Layer>> {
    let (n_phi, n_z) = (settings.modules_phi, settings.modules_z);
    let half_z = settings.barrel_half_z;
    let thickness = settings.layer_thickness;
    // slight overlap in phi so the ring has no gaps
    let module_half_x = 1.05 * radius * (PI / n_phi as f64).tan();
    let module_half_y = half_z / n_z as f64;

    let surfaces: Vec<Arc<Surface>> = iproduct!(0..n_phi, 0..n_z)
        .map(|(i, j)| {
            let phi = -PI + (i as f64 + 0.5) * 2.0 * PI / n_phi as f64;
            let z = -half_z + (2 * j + 1) as f64 * module_half_y;
            let transform = Isometry3::from_parts(
                Translation3::new(radius * phi.cos(), radius * phi.sin(), z),
                module_rotation(phi),
            );
            let element = Arc::new(DetectorElement::new(
                module_id(index, i, j, n_z),
                transform,
                0.5 * thickness,
            ));
            Surface::plane(transform, module_half_x, module_half_y)
                .map(|surface| Arc::new(surface.with_detector_element(element)))
        })
        .collect::<error::Result<_>>()?;

    for (i, j) in iproduct!(0..n_phi, 0..n_z) {
        let neighbours: Vec<Identifier> = iproduct!([n_phi - 1, 0, 1], [-1_i64, 0, 1])
            .filter(|(di, dj)| (*di, *dj) != (0, 0))
            .filter_map(|(di, dj)| {
                let jj = j as i64 + dj;
                (0..n_z as i64)
                    .contains(&jj)
                    .then(|| module_id(index, (i + di) % n_phi, jj as usize, n_z))
            })
            .filter(|id| *id != module_id(index, i, j, n_z))
            .collect();
        if let Some(element) = surfaces[i * n_z + j].detector_element() {
            element.register_neighbours(&neighbours);
        }
    }

    let utility = BinUtility::new(BinningData::equidistant(
        BinningValue::Phi,
        BinningOption::Closed,
        n_phi,
        -PI,
        PI,
    )?)
    .add_binning(BinningData::equidistant(
        BinningValue::Z,
        BinningOption::Open,
        n_z,
        -half_z,
        half_z,
    )?)?;
    let array = SurfaceArray::new(surfaces, utility);
    for surface in array.array_objects() {
        let Some(element) = surface.detector_element() else {
            continue;
        };
        let members: Vec<Identifier> = array
            .objects_at(&surface.center())
            .iter()
            .filter_map(|s| s.detector_element().map(|e| e.identify()))
            .filter(|id| *id != element.identify())
            .collect();
        element.register_bin_members(&members);
    }

    let proxy = BinUtility::new(BinningData::equidistant(
        BinningValue::Phi,
        BinningOption::Closed,
        settings.material_bins_phi,
        -PI,
        PI,
    )?)
    .add_binning(BinningData::equidistant(
        BinningValue::Z,
        BinningOption::Open,
        settings.material_bins_z,
        -half_z,
        half_z,
    )?)?;

    let approach = [radius - 0.5 * thickness, radius + 0.5 * thickness]
        .into_iter()
        .map(|r| Surface::cylinder(Isometry3::identity(), r, PI, half_z).map(Arc::new))
        .collect::<error::Result<Vec<_>>>()?;

    let surface = Surface::cylinder(Isometry3::identity(), radius, PI, half_z)?
        .with_material(SurfaceMaterial::Proxy(proxy));
    Layer::new(
        surface,
        LayerConfig {
            surface_array: Some(array),
            thickness,
            overlap_descriptor: Some(Box::new(ElementOverlapDescriptor)),
            approach_descriptor: Some(Box::new(GenericApproachDescriptor::new(approach))),
            layer_type: LayerType::Active,
        },
    )
}

/// Endcap volume on the `side` of the barrel, spanning `inner..outer` in |z|.
fn endcap_volume(
    settings: &DetectorSettings,
    side: f64,
    inner: f64,
    outer: f64,
    disc_r_max: f64,
    volume_r: f64,
    volume_id: u64,
) -> error::Result<Arc<TrackingVolume>> {
    let layers = settings
        .endcap_z
        .iter()
        .map(|z| {
            let proxy = BinUtility::new(BinningData::equidistant(
                BinningValue::R,
                BinningOption::Open,
                settings.material_bins_r,
                settings.endcap_r_min,
                disc_r_max,
            )?)
            .add_binning(BinningData::equidistant(
                BinningValue::Phi,
                BinningOption::Closed,
                settings.material_bins_phi,
                -PI,
                PI,
            )?)?;
            let transform = Isometry3::translation(0.0, 0.0, side * z);
            let surface = Surface::disc(transform, settings.endcap_r_min, disc_r_max, PI)?
                .with_material(SurfaceMaterial::Proxy(proxy));
            Layer::new(
                surface,
                LayerConfig {
                    thickness: settings.layer_thickness,
                    layer_type: LayerType::Passive,
                    ..Default::default()
                },
            )
        })
        .collect::<error::Result<Vec<_>>>()?;

    let name = if side < 0.0 { "negative endcap" } else { "positive endcap" };
    TrackingVolume::create(
        name,
        Isometry3::translation(0.0, 0.0, side * 0.5 * (inner + outer)),
        Arc::new(CylinderVolumeBounds::new(0.0, volume_r, PI, 0.5 * (outer - inner))?),
        layers,
        BinningValue::Z,
        Vec::new(),
        volume_id,
    )
}
