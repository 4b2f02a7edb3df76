//! Material mapping: folding simulated material tracks onto layers.
//!
//! **Context**: Reconstruction wants material on a few layer surfaces rather
//! than the fine grained material steps a simulation records. A mapping job
//! replays many recorded tracks through the navigation, assigns each step to
//! the nearest layer the track crosses, and averages the result per bin of
//! each layer's material proxy.
//!
//! **How it Works**: Every record is extrapolated as a straight line from its
//! vertex; the layers with material it crosses come back ordered by path
//! length. A forward-only cursor walks the steps and the layer crossings
//! together, moving to the next layer as soon as it is strictly closer. The
//! steps of a layer, corrected for the crossing angle, become one entry of
//! the layer's [`SurfaceMaterialRecord`] in the bin of the crossing. The job
//! runs Idle -> Accumulating -> Averaged -> Finalized.
//!
//! The cursor assumes the crossing order follows the track parameter, which
//! holds for straight tracks through nested layers. Curved tracks or layers
//! crossed twice can get steps assigned to the wrong layer.

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::Point3;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::error::MappingError;
use crate::extrapolation::{
    ExtrapolationCell, ExtrapolationEngine, ExtrapolationMode, StepKind,
};
use crate::geometry_object::{GeometryId, GeometryObject};
use crate::intersection::TrackParameters;
use crate::layer::Layer;
use crate::material::{BinnedSurfaceMaterial, MaterialProperties, MaterialTrackRecord, SurfaceMaterial};
use crate::surface_material_record::SurfaceMaterialRecord;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_utility::{BinUtility, BinningData, BinningOption, BinningValue};
    use crate::extrapolation::{ExtrapolationCode, StraightLineNavigator};
    use crate::layer::LayerConfig;
    use crate::material::{Material, MaterialStep};
    use crate::surface::Surface;
    use crate::tracking_volume::TrackingVolume;
    use crate::volume_bounds::CylinderVolumeBounds;
    use approx::assert_relative_eq;
    use nalgebra::Isometry3;
    use std::f64::consts::PI;

    fn proxy_layer(radius: f64) -> Arc<Layer> {
        let utility = BinUtility::new(
            BinningData::equidistant(BinningValue::Phi, BinningOption::Closed, 4, -PI, PI).unwrap(),
        );
        let surface = Surface::cylinder(Isometry3::identity(), radius, PI, 100.0)
            .unwrap()
            .with_material(SurfaceMaterial::Proxy(utility));
        Layer::new(
            surface,
            LayerConfig {
                thickness: 1.0,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn engine() -> Arc<dyn ExtrapolationEngine> {
        let barrel = TrackingVolume::create(
            "barrel",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, 80.0, PI, 110.0).unwrap()),
            vec![proxy_layer(30.0), proxy_layer(60.0)],
            BinningValue::R,
            Vec::new(),
            1,
        )
        .unwrap();
        Arc::new(StraightLineNavigator::new(barrel))
    }

    fn mapping() -> MaterialMapping {
        MaterialMapping::new(Config {
            extrapolation_engine: Some(engine()),
            ..Default::default()
        })
        .unwrap()
    }

    /// A radial track along +x with silicon steps at the given radii.
    fn radial_record(radii: &[f64]) -> MaterialTrackRecord {
        let steps = radii
            .iter()
            .map(|r| {
                MaterialStep::new(
                    MaterialProperties::new(Material::silicon(), 0.1),
                    Point3::new(*r, 0.0, 0.0),
                )
            })
            .collect();
        MaterialTrackRecord::new(Point3::origin(), 0.5 * PI, 0.0, steps)
    }

    #[test]
    fn missing_engine_is_a_construction_error() {
        let result = MaterialMapping::new(Config::default());
        assert_eq!(result.err(), Some(MappingError::MissingExtrapolationEngine));
    }

    #[test]
    fn steps_go_to_the_nearest_layer() {
        let mut mapping = mapping();
        let record = radial_record(&[28.0, 32.0, 44.0, 46.0, 61.0]);
        let hits = mapping.layer_hits(&record);
        assert_eq!(hits.len(), 2);

        let assignment = assign_steps(&record, &hits);
        // 44 is still closer to 30 than to 60, 46 is past the midpoint
        assert_eq!(assignment, vec![0, 0, 0, 1, 1]);

        assert!(mapping.map_material_track_record(&record).unwrap());
        assert_eq!(mapping.state(), MappingState::Accumulating);
        let inner = &mapping.records()[&hits[0].0.geometry_id()];
        assert_eq!(inner.record.entries(&hits[0].1), 1);
    }

    #[test]
    fn ties_keep_the_current_layer() {
        let mapping = mapping();
        let record = radial_record(&[45.0]);
        let hits = mapping.layer_hits(&record);
        assert_eq!(assign_steps(&record, &hits), vec![0]);
    }

    #[test]
    fn thickness_is_path_corrected() {
        let mut mapping = mapping();
        // 45 degrees in the transverse plane is still a normal crossing of a cylinder,
        // so tilt the track out of it instead
        let step = MaterialStep::new(
            MaterialProperties::new(Material::silicon(), 0.2),
            Point3::new(30.0, 0.0, 30.0),
        );
        let record = MaterialTrackRecord::new(Point3::origin(), 0.25 * PI, 0.0, vec![step]);
        mapping.map_material_track_record(&record).unwrap();
        mapping.average_layer_material().unwrap();
        let hits = mapping.layer_hits(&record);
        let material = mapping.records()[&hits[0].0.geometry_id()].record.layer_material();
        let props = material.material_properties(&hits[0].1).unwrap();
        assert_relative_eq!(props.thickness, 0.2 / 2.0_f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn state_machine() {
        let mut mapping = mapping();
        assert_eq!(mapping.finalize_layer_material(), Err(MappingError::NotAveraged));

        let records: Vec<MaterialTrackRecord> = (0..8).map(|_| radial_record(&[30.0, 60.0])).collect();
        assert_eq!(mapping.map_material_track_records(&records).unwrap(), 8);
        assert_eq!(mapping.finalize_layer_material(), Err(MappingError::NotAveraged));

        assert_eq!(mapping.average_layer_material().unwrap(), 2);
        assert_eq!(mapping.state(), MappingState::Averaged);
        assert_eq!(mapping.finalize_layer_material().unwrap(), 2);
        assert_eq!(mapping.state(), MappingState::Finalized);

        for record in mapping.records().values() {
            assert!(matches!(
                record.layer.material().as_deref(),
                Some(SurfaceMaterial::Binned(_))
            ));
        }
        assert_eq!(
            mapping.map_material_track_record(&records[0]),
            Err(MappingError::AlreadyFinalized)
        );
    }

    #[test]
    fn parallel_matches_serial() {
        let records: Vec<MaterialTrackRecord> = [0.1, 0.7, 1.3, 2.9, -2.0, -0.4]
            .iter()
            .map(|phi| {
                let (s, c) = f64::sin_cos(*phi);
                let steps = [30.0, 60.0]
                    .iter()
                    .map(|r| {
                        MaterialStep::new(
                            MaterialProperties::new(Material::silicon(), 0.1),
                            Point3::new(r * c, r * s, 0.0),
                        )
                    })
                    .collect();
                MaterialTrackRecord::new(Point3::origin(), 0.5 * PI, *phi, steps)
            })
            .collect();

        let mut serial = mapping();
        for record in &records {
            serial.map_material_track_record(record).unwrap();
        }
        let mut parallel = mapping();
        parallel.map_material_track_records(&records).unwrap();

        let entries = |m: &MaterialMapping| -> Vec<usize> {
            m.records()
                .values()
                .flat_map(|r| r.record.sums().iter().map(|s| s.entries).collect::<Vec<_>>())
                .collect()
        };
        assert_eq!(entries(&serial), entries(&parallel));
    }

    #[test]
    fn engine_failure_maps_nothing() {
        let mut mapping = mapping();
        let record = MaterialTrackRecord::new(Point3::new(0.0, 0.0, 5000.0), 0.0, 0.0, Vec::new());
        let mut cell = ExtrapolationCell::new(TrackParameters::new(*record.vertex(), record.direction()));
        assert_eq!(
            mapping.engine.extrapolate(&mut cell),
            ExtrapolationCode::FailureNavigation
        );
        assert!(!mapping.map_material_track_record(&record).unwrap());
    }
}

/// Configuration of a [`MaterialMapping`] job.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub extrapolation_engine: Option<Arc<dyn ExtrapolationEngine>>,
    /// Search depth used when collecting sensitive surfaces.
    pub search_depth: i32,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Idle,
    Accumulating,
    Averaged,
    Finalized,
}

/// A layer together with the material mapped onto it.
#[derive(Debug, Clone)]
pub struct LayerMaterialRecord {
    pub layer: Arc<Layer>,
    pub record: SurfaceMaterialRecord,
}

type RecordMap = BTreeMap<GeometryId, LayerMaterialRecord>;

/// A layer crossing: the layer and where the track crosses it.
pub type LayerHit = (Arc<Layer>, Point3<f64>);

#[derive(Debug)]
pub struct MaterialMapping {
    engine: Arc<dyn ExtrapolationEngine>,
    search_depth: i32,
    show_progress: bool,
    state: MappingState,
    records: RecordMap,
}

impl MaterialMapping {
    pub fn new(config: Config) -> Result<Self, MappingError> {
        let Some(engine) = config.extrapolation_engine else {
            error!("No extrapolation engine given, material mapping cannot run");
            return Err(MappingError::MissingExtrapolationEngine);
        };
        info!(search_depth = config.search_depth, "extrapolation engine retrieved");
        Ok(Self {
            engine,
            search_depth: config.search_depth,
            show_progress: config.show_progress,
            state: MappingState::Idle,
            records: BTreeMap::new(),
        })
    }

    pub fn state(&self) -> MappingState {
        self.state
    }

    /// Accumulated records, keyed by the geometry id of their layer.
    pub fn records(&self) -> &BTreeMap<GeometryId, LayerMaterialRecord> {
        &self.records
    }

    /// Averaged material per layer, as it is (or will be) written to the layers.
    pub fn layer_material_maps(&self) -> Vec<(GeometryId, BinnedSurfaceMaterial)> {
        self.records
            .iter()
            .map(|(id, entry)| (*id, entry.record.layer_material()))
            .collect()
    }

    fn begin_accumulation(&mut self) -> Result<(), MappingError> {
        match self.state {
            MappingState::Finalized => return Err(MappingError::AlreadyFinalized),
            MappingState::Averaged => {
                warn!("mapping after averaging mixes averaged and raw material; average again before finalizing")
            }
            MappingState::Idle | MappingState::Accumulating => {}
        }
        self.state = MappingState::Accumulating;
        Ok(())
    }

    /// Layer crossings of a record, ordered by path length.
    pub fn layer_hits(&self, record: &MaterialTrackRecord) -> Vec<LayerHit> {
        layer_hits(self.engine.as_ref(), self.search_depth, record)
    }

    /// Maps one record; returns whether any layer received material.
    pub fn map_material_track_record(&mut self, record: &MaterialTrackRecord) -> Result<bool, MappingError> {
        self.begin_accumulation()?;
        Ok(map_record(
            self.engine.as_ref(),
            self.search_depth,
            record,
            &mut self.records,
        ))
    }

    /// Maps many records in parallel and returns how many received material.
    ///
    /// Each worker accumulates into its own records; the shards are merged
    /// once all records are mapped.
    pub fn map_material_track_records(
        &mut self,
        records: &[MaterialTrackRecord],
    ) -> Result<usize, MappingError> {
        self.begin_accumulation()?;

        let pb = if self.show_progress {
            ProgressBar::new(records.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
        ) {
            pb.set_style(style.progress_chars("█▇▆▅▄▃▂▁"));
        }
        pb.set_message("tracks".to_string());

        let engine = self.engine.as_ref();
        let search_depth = self.search_depth;
        let (shard, mapped) = records
            .par_iter()
            .fold(
                || (RecordMap::new(), 0usize),
                |(mut shard, mut mapped), record| {
                    if map_record(engine, search_depth, record, &mut shard) {
                        mapped += 1;
                    }
                    pb.inc(1);
                    (shard, mapped)
                },
            )
            .reduce(
                || (RecordMap::new(), 0usize),
                |(a, n), (b, m)| (merge_records(a, b), n + m),
            );
        pb.finish_and_clear();

        self.records = merge_records(std::mem::take(&mut self.records), shard);
        debug!(records = records.len(), mapped, "mapped material track records");
        Ok(mapped)
    }

    /// Assigns the steps of a record to the given layer crossings and adds
    /// them to the layers' records. Returns the number of layers touched.
    pub fn associate_layer_material(
        &mut self,
        record: &MaterialTrackRecord,
        hits: &[LayerHit],
    ) -> Result<usize, MappingError> {
        self.begin_accumulation()?;
        Ok(associate_layer_material(record, hits, &mut self.records))
    }

    /// Averages every record; returns how many there are.
    pub fn average_layer_material(&mut self) -> Result<usize, MappingError> {
        if self.state == MappingState::Finalized {
            return Err(MappingError::AlreadyFinalized);
        }
        for entry in self.records.values_mut() {
            entry.record.average_material();
        }
        self.state = MappingState::Averaged;
        debug!(records = self.records.len(), "averaged layer material");
        Ok(self.records.len())
    }

    /// Writes the averaged material onto the layers; returns how many were updated.
    pub fn finalize_layer_material(&mut self) -> Result<usize, MappingError> {
        match self.state {
            MappingState::Averaged => {}
            MappingState::Finalized => return Err(MappingError::AlreadyFinalized),
            MappingState::Idle | MappingState::Accumulating => {
                error!(state = ?self.state, "layer material must be averaged before it is finalized");
                return Err(MappingError::NotAveraged);
            }
        }
        for entry in self.records.values() {
            entry
                .layer
                .assign_material(SurfaceMaterial::Binned(entry.record.layer_material()));
        }
        self.state = MappingState::Finalized;
        info!(layers = self.records.len(), "finalized layer material");
        Ok(self.records.len())
    }
}

fn layer_hits(
    engine: &dyn ExtrapolationEngine,
    search_depth: i32,
    record: &MaterialTrackRecord,
) -> Vec<LayerHit> {
    let mut cell = ExtrapolationCell::new(TrackParameters::new(*record.vertex(), record.direction()));
    cell.add_mode(ExtrapolationMode::StopAtBoundary);
    cell.add_mode(ExtrapolationMode::CollectSensitive);
    cell.add_mode(ExtrapolationMode::CollectMaterial);
    cell.search_depth = search_depth;

    let code = engine.extrapolate(&mut cell);
    if !code.is_success() {
        debug!(?code, "extrapolation of material track failed");
        return Vec::new();
    }
    let material_steps: Vec<_> = cell
        .steps()
        .iter()
        .filter(|step| step.kind == StepKind::LayerMaterial)
        .collect();
    if material_steps
        .windows(2)
        .any(|w| w[1].path_length < w[0].path_length)
    {
        warn!("layer crossings are not ordered by path length, record skipped");
        return Vec::new();
    }
    material_steps
        .into_iter()
        .map(|step| (Arc::clone(&step.layer), step.position))
        .collect()
}

fn map_record(
    engine: &dyn ExtrapolationEngine,
    search_depth: i32,
    record: &MaterialTrackRecord,
    records: &mut RecordMap,
) -> bool {
    let hits = layer_hits(engine, search_depth, record);
    debug!(
        steps = record.material_steps().len(),
        layers = hits.len(),
        "mapping material track record"
    );
    associate_layer_material(record, &hits, records) > 0
}

/// Index into `hits` for every step of the record, using a forward-only
/// cursor that advances while the next crossing is strictly closer.
fn assign_steps(record: &MaterialTrackRecord, hits: &[LayerHit]) -> Vec<usize> {
    let mut cursor = 0;
    record
        .material_steps()
        .iter()
        .map(|step| {
            while cursor + 1 < hits.len() {
                let current = (step.position - hits[cursor].1).norm();
                let next = (step.position - hits[cursor + 1].1).norm();
                if next >= current {
                    break;
                }
                cursor += 1;
                trace!(cursor, "material step moved to the next layer");
            }
            cursor
        })
        .collect()
}

fn associate_layer_material(
    record: &MaterialTrackRecord,
    hits: &[LayerHit],
    records: &mut RecordMap,
) -> usize {
    if hits.is_empty() || record.material_steps().is_empty() {
        return 0;
    }
    let direction = record.direction();
    let mut per_layer: Vec<Vec<MaterialProperties>> = vec![Vec::new(); hits.len()];
    for (step, index) in record
        .material_steps()
        .iter()
        .zip(assign_steps(record, hits))
    {
        let (layer, position) = &hits[index];
        let correction = layer
            .surface_representation()
            .path_correction(position, &direction);
        per_layer[index].push(step.properties.scaled(1.0 / correction));
    }

    let mut touched = 0;
    for ((layer, position), steps) in hits.iter().zip(&per_layer) {
        if !steps.is_empty() && associate_hit(records, layer, position, steps) {
            touched += 1;
        }
    }
    touched
}

/// Adds one layer's share of a track to its record, creating the record on
/// first use. Layers without a material proxy are skipped.
fn associate_hit(
    records: &mut RecordMap,
    layer: &Arc<Layer>,
    position: &Point3<f64>,
    steps: &[MaterialProperties],
) -> bool {
    let id = layer.geometry_id();
    if !records.contains_key(&id) {
        let Some(SurfaceMaterial::Proxy(utility)) = layer.material().as_deref().cloned() else {
            trace!(layer = %id, "layer has no material proxy");
            return false;
        };
        trace!(layer = %id, bins = utility.bins(), "new surface material record");
        records.insert(
            id,
            LayerMaterialRecord {
                layer: Arc::clone(layer),
                record: SurfaceMaterialRecord::new(utility),
            },
        );
    }
    match records.get_mut(&id) {
        Some(entry) => {
            entry.record.add_layer_material_properties(position, steps);
            true
        }
        None => false,
    }
}

fn merge_records(mut into: RecordMap, from: RecordMap) -> RecordMap {
    for (id, entry) in from {
        match into.get_mut(&id) {
            Some(existing) => {
                if let Err(err) = existing.record.merge(&entry.record) {
                    warn!(layer = %id, %err, "material record shard dropped");
                }
            }
            None => {
                into.insert(id, entry);
            }
        }
    }
    into
}
