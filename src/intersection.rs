use nalgebra::{Point3, Vector3};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::surface::Surface;


/// Straight line track state: a position and a unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackParameters {
    position: Point3<f64>,
    direction: Vector3<f64>,
}

impl TrackParameters {
    /// A zero direction is kept as is; every intersection with it is invalid.
    pub fn new(position: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self {
            position,
            direction: direction.try_normalize(f64::EPSILON).unwrap_or(direction),
        }
    }

    pub fn position(&self) -> &Point3<f64> {
        &self.position
    }

    pub fn direction(&self) -> &Vector3<f64> {
        &self.direction
    }

    /// Direction of travel for a propagation direction; backward flips it.
    pub fn propagation_direction(&self, pdir: PropDirection) -> Vector3<f64> {
        self.direction * pdir.sign()
    }
}

/// Propagation direction relative to the track momentum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropDirection {
    Backward,
    Any,
    Forward,
}

impl PropDirection {
    pub fn sign(&self) -> f64 {
        match self {
            PropDirection::Backward => -1.0,
            PropDirection::Any | PropDirection::Forward => 1.0,
        }
    }

    /// Whether intersections must lie ahead along the direction.
    pub fn is_forced(&self) -> bool {
        !matches!(self, PropDirection::Any)
    }
}

/// Whether, and with which tolerance, intersections are checked against surface bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundaryCheck {
    pub enabled: bool,
    pub tolerance: f64,
}

impl BoundaryCheck {
    pub fn yes() -> Self {
        Self {
            enabled: true,
            tolerance: 0.0,
        }
    }

    pub fn no() -> Self {
        Self {
            enabled: false,
            tolerance: 0.0,
        }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            enabled: true,
            tolerance,
        }
    }
}

impl From<bool> for BoundaryCheck {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::yes()
        } else {
            Self::no()
        }
    }
}

/// A straight line crossing with a surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intersection {
    pub position: Point3<f64>,
    pub path_length: f64,
    pub valid: bool,
}

impl Intersection {
    pub fn new(position: Point3<f64>, path_length: f64, valid: bool) -> Self {
        Self {
            position,
            path_length,
            valid,
        }
    }

    /// No solution at all; the path length is infinite so it sorts last.
    pub fn invalid() -> Self {
        Self {
            position: Point3::origin(),
            path_length: f64::INFINITY,
            valid: false,
        }
    }
}

/// An [`Intersection`] together with the surface it belongs to.
#[derive(Debug, Clone)]
pub struct SurfaceIntersection {
    pub intersection: Intersection,
    pub surface: Arc<Surface>,
    pub direction: PropDirection,
}

impl SurfaceIntersection {
    pub fn new(intersection: Intersection, surface: Arc<Surface>, direction: PropDirection) -> Self {
        Self {
            intersection,
            surface,
            direction,
        }
    }

    pub fn path_length(&self) -> f64 {
        self.intersection.path_length
    }

    pub fn position(&self) -> &Point3<f64> {
        &self.intersection.position
    }

    /// Distance used to order candidates, nearest first.
    fn ordering_key(&self) -> f64 {
        match self.direction {
            PropDirection::Any => self.intersection.path_length.abs(),
            _ => self.intersection.path_length,
        }
    }

    /// Orders two intersections by path length along their propagation
    /// direction. At equal distance valid intersections come first.
    pub fn nearest_first(a: &Self, b: &Self) -> Ordering {
        a.ordering_key()
            .total_cmp(&b.ordering_key())
            .then_with(|| b.intersection.valid.cmp(&a.intersection.valid))
    }
}
