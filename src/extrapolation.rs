use nalgebra::Point3;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::geometry_object::GeometryObject;
use crate::intersection::{BoundaryCheck, PropDirection, SurfaceIntersection, TrackParameters};
use crate::layer::Layer;
use crate::settings::{BOUNDARY_STEP, MAX_NAVIGATION_STEPS, ON_SURFACE_TOLERANCE};
use crate::surface::Surface;
use crate::tracking_volume::TrackingVolume;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_utility::{BinUtility, BinningData, BinningOption, BinningValue};
    use crate::layer::LayerConfig;
    use crate::material::SurfaceMaterial;
    use crate::surface::Surface;
    use crate::volume_bounds::CylinderVolumeBounds;
    use nalgebra::{Isometry3, Vector3};
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

    fn world() -> Arc<TrackingVolume> {
        let barrel = TrackingVolume::create(
            "barrel",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, 80.0, PI, 110.0).unwrap()),
            vec![proxy_layer(60.0), proxy_layer(30.0)],
            BinningValue::R,
            Vec::new(),
            1,
        )
        .unwrap();
        TrackingVolume::create(
            "world",
            Isometry3::identity(),
            Arc::new(CylinderVolumeBounds::new(0.0, 200.0, PI, 300.0).unwrap()),
            Vec::new(),
            BinningValue::R,
            vec![barrel],
            2,
        )
        .unwrap()
    }

    fn material_cell(dir: Vector3<f64>) -> ExtrapolationCell {
        let mut cell = ExtrapolationCell::new(TrackParameters::new(Point3::origin(), dir));
        cell.add_mode(ExtrapolationMode::StopAtBoundary);
        cell.add_mode(ExtrapolationMode::CollectMaterial);
        cell
    }

    #[test]
    fn crosses_material_layers_in_order() {
        let navigator = StraightLineNavigator::new(world());
        let mut cell = material_cell(Vector3::new(1.0, 0.5, 0.2));
        let code = navigator.extrapolate(&mut cell);
        assert_eq!(code, ExtrapolationCode::SuccessBoundaryReached);
        let steps = cell.steps();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].path_length < steps[1].path_length);
        assert!((steps[0].position.coords.xy().norm() - 30.0).abs() < 1e-9);
        assert!(steps.iter().all(|s| s.kind == StepKind::LayerMaterial));
        assert!(cell.path_length() > 200.0);
    }

    #[test]
    fn forward_tracks_miss_barrel_layers() {
        let navigator = StraightLineNavigator::new(world());
        let mut cell = material_cell(Vector3::new(0.05, 0.0, 1.0));
        assert!(navigator.extrapolate(&mut cell).is_success());
        assert!(cell.steps().is_empty());
    }

    #[test]
    fn tracks_from_the_mother_enter_the_child() {
        let navigator = StraightLineNavigator::new(world());
        let mut cell = ExtrapolationCell::new(TrackParameters::new(
            Point3::new(150.0, 0.0, 0.0),
            -Vector3::x(),
        ));
        cell.add_mode(ExtrapolationMode::StopAtBoundary);
        cell.add_mode(ExtrapolationMode::CollectMaterial);
        assert_eq!(navigator.extrapolate(&mut cell), ExtrapolationCode::SuccessBoundaryReached);

        let steps = cell.steps();
        assert!(steps.len() >= 2);
        assert!((steps[0].position.x - 60.0).abs() < 1e-6);
        assert!((steps[0].path_length - 90.0).abs() < 1e-2);
        assert!((steps[1].position.x - 30.0).abs() < 1e-6);
        assert!(steps[0].path_length < steps[1].path_length);
        // out through the far side of the world
        assert!((cell.end_position().unwrap().x + 200.0).abs() < 1e-2);
    }

    #[test]
    fn start_outside_the_world_fails() {
        let navigator = StraightLineNavigator::new(world());
        let mut cell = ExtrapolationCell::new(TrackParameters::new(
            Point3::new(0.0, 0.0, 1000.0),
            Vector3::z(),
        ));
        assert_eq!(navigator.extrapolate(&mut cell), ExtrapolationCode::FailureNavigation);
        let mut cell = ExtrapolationCell::new(TrackParameters::new(Point3::origin(), Vector3::zeros()));
        assert_eq!(navigator.extrapolate(&mut cell), ExtrapolationCode::FailureConfiguration);
    }
}

/// Behaviour switches of an extrapolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrapolationMode {
    /// Leaving the world volume ends the extrapolation successfully.
    StopAtBoundary,
    CollectSensitive,
    CollectPassive,
    /// Record crossings of layers that carry material.
    CollectMaterial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrapolationCode {
    Success,
    SuccessBoundaryReached,
    FailureNavigation,
    FailureLoop,
    FailureConfiguration,
}

impl ExtrapolationCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::SuccessBoundaryReached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// The representing surface of a layer with material.
    LayerMaterial,
    Sensitive,
    Passive,
}

/// One recorded crossing.
#[derive(Debug, Clone)]
pub struct ExtrapolationStep {
    pub layer: Arc<Layer>,
    /// The crossed sub-surface; `None` for the layer surface itself.
    pub surface: Option<Arc<Surface>>,
    pub position: Point3<f64>,
    pub path_length: f64,
    pub kind: StepKind,
}

/// Input, configuration and output of a single extrapolation.
#[derive(Debug, Clone)]
pub struct ExtrapolationCell {
    start: TrackParameters,
    modes: Vec<ExtrapolationMode>,
    pub search_depth: i32,
    steps: Vec<ExtrapolationStep>,
    path_length: f64,
    end_position: Option<Point3<f64>>,
}

impl ExtrapolationCell {
    pub fn new(start: TrackParameters) -> Self {
        Self {
            start,
            modes: Vec::new(),
            search_depth: 0,
            steps: Vec::new(),
            path_length: 0.0,
            end_position: None,
        }
    }

    pub fn add_mode(&mut self, mode: ExtrapolationMode) {
        if !self.modes.contains(&mode) {
            self.modes.push(mode);
        }
    }

    pub fn check_mode(&self, mode: ExtrapolationMode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn start(&self) -> &TrackParameters {
        &self.start
    }

    /// Recorded crossings, ordered by path length.
    pub fn steps(&self) -> &[ExtrapolationStep] {
        &self.steps
    }

    pub fn path_length(&self) -> f64 {
        self.path_length
    }

    pub fn end_position(&self) -> Option<&Point3<f64>> {
        self.end_position.as_ref()
    }
}

/// Propagates track parameters through a geometry and records what it crosses.
pub trait ExtrapolationEngine: Send + Sync + fmt::Debug {
    fn extrapolate(&self, cell: &mut ExtrapolationCell) -> ExtrapolationCode;
}

/// Straight line extrapolation through a tracking volume tree.
#[derive(Debug)]
pub struct StraightLineNavigator {
    world: Arc<TrackingVolume>,
    bcheck: BoundaryCheck,
}

impl StraightLineNavigator {
    pub fn new(world: Arc<TrackingVolume>) -> Self {
        Self {
            world,
            bcheck: BoundaryCheck::yes(),
        }
    }

    pub fn world(&self) -> &Arc<TrackingVolume> {
        &self.world
    }

    /// Walks the layer stack of one volume, from the layer associated with
    /// the entry position along the next-layer links, and returns what was
    /// crossed before `exit_path`, ordered by path length.
    #[allow(clippy::too_many_arguments)]
    fn traverse_layers(
        &self,
        volume: &TrackingVolume,
        pars: &TrackParameters,
        base_path: f64,
        exit_path: f64,
        cell: &ExtrapolationCell,
        visited: &mut Vec<Arc<Layer>>,
        budget: &mut usize,
    ) -> Vec<ExtrapolationStep> {
        let collect_material = cell.check_mode(ExtrapolationMode::CollectMaterial)
            || cell.check_mode(ExtrapolationMode::CollectPassive);
        let collect_sensitive = cell.check_mode(ExtrapolationMode::CollectSensitive);
        let collect_passive = cell.check_mode(ExtrapolationMode::CollectPassive);
        let dir = pars.direction();

        let mut steps = Vec::new();
        let mut layer = volume.associated_layer(pars.position());
        while let Some(current) = layer {
            if visited.iter().any(|l| Arc::ptr_eq(l, &current)) || *budget == 0 {
                break;
            }
            *budget -= 1;
            visited.push(Arc::clone(&current));

            let hit = current.surface_on_approach(
                pars.position(),
                dir,
                PropDirection::Forward,
                self.bcheck,
                false,
            );
            let mut probe = *pars.position();
            if hit.intersection.valid && hit.path_length() <= exit_path {
                probe = *hit.position();
                trace!(
                    layer = %current.geometry_id(),
                    path = base_path + hit.path_length(),
                    "layer crossed"
                );
                if collect_material && current.surface_representation().has_material() {
                    steps.push(ExtrapolationStep {
                        layer: Arc::clone(&current),
                        surface: None,
                        position: probe,
                        path_length: base_path + hit.path_length(),
                        kind: StepKind::LayerMaterial,
                    });
                }
                if (collect_sensitive || collect_passive) && current.has_sub_structure(false) {
                    let mut hits: Vec<SurfaceIntersection> = Vec::new();
                    current.compatible_surfaces(
                        &mut hits,
                        &TrackParameters::new(probe, *dir),
                        PropDirection::Any,
                        self.bcheck,
                        collect_sensitive,
                        collect_passive,
                        cell.search_depth,
                        None,
                        None,
                    );
                    // the search runs both ways from the crossing; keep what lies
                    // between the entry point and the exit
                    let ahead = |h: &SurfaceIntersection| {
                        let path = hit.path_length() + h.intersection.path_length;
                        (-ON_SURFACE_TOLERANCE..=exit_path).contains(&path)
                    };
                    let surface_steps = hits
                        .into_iter()
                        .filter(|h| {
                            h.intersection.valid
                                && ahead(h)
                                && !Arc::ptr_eq(&h.surface, current.surface_representation())
                        })
                        .map(|h| ExtrapolationStep {
                            layer: Arc::clone(&current),
                            kind: if h.surface.is_sensitive() {
                                StepKind::Sensitive
                            } else {
                                StepKind::Passive
                            },
                            position: h.intersection.position,
                            path_length: base_path + hit.path_length() + h.intersection.path_length,
                            surface: Some(h.surface),
                        });
                    steps.extend(surface_steps);
                }
            }
            layer = current.next_layer(&probe, dir);
        }
        steps.sort_by(|a, b| a.path_length.total_cmp(&b.path_length));
        steps
    }
}

impl ExtrapolationEngine for StraightLineNavigator {
    fn extrapolate(&self, cell: &mut ExtrapolationCell) -> ExtrapolationCode {
        let dir = *cell.start.direction();
        if dir.norm() < f64::EPSILON {
            return ExtrapolationCode::FailureConfiguration;
        }
        let mut pos = *cell.start.position();
        let Some(mut volume) = self.world.lowest_tracking_volume(&pos) else {
            debug!(?pos, "start position outside the world volume");
            return ExtrapolationCode::FailureNavigation;
        };

        let mut path = 0.0;
        let mut visited = Vec::new();
        let mut budget = MAX_NAVIGATION_STEPS;
        loop {
            // entering a child volume also ends the walk through this one
            let mut exits = volume.boundary_surfaces_ordered(&pos, &dir);
            exits.extend(
                volume
                    .children()
                    .iter()
                    .flat_map(|child| child.boundary_surfaces_ordered(&pos, &dir)),
            );
            exits.sort_by(SurfaceIntersection::nearest_first);
            let Some(exit) = exits.first() else {
                warn!(volume = volume.name(), ?pos, "no boundary surface ahead");
                cell.path_length = path;
                return ExtrapolationCode::FailureNavigation;
            };

            let pars = TrackParameters::new(pos, dir);
            let steps = self.traverse_layers(
                &volume,
                &pars,
                path,
                exit.path_length(),
                cell,
                &mut visited,
                &mut budget,
            );
            cell.steps.extend(steps);

            path += exit.path_length() + BOUNDARY_STEP;
            pos = exit.position() + dir * BOUNDARY_STEP;
            if budget == 0 {
                warn!(volume = volume.name(), "navigation step limit reached");
                cell.path_length = path;
                return ExtrapolationCode::FailureLoop;
            }
            budget -= 1;

            match self.world.lowest_tracking_volume(&pos) {
                Some(next) => {
                    trace!(from = volume.name(), to = next.name(), path, "volume transition");
                    volume = next;
                }
                None => {
                    cell.path_length = path;
                    cell.end_position = Some(pos);
                    debug!(steps = cell.steps.len(), path, "left the world volume");
                    return if cell.check_mode(ExtrapolationMode::StopAtBoundary) {
                        ExtrapolationCode::SuccessBoundaryReached
                    } else {
                        ExtrapolationCode::Success
                    };
                }
            }
        }
    }
}
