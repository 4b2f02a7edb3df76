use itertools::iproduct;
use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{GeometryError, Result};
use crate::settings::NEXT_DIRECTION_PROBE;


/// The coordinate a binning is defined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinningValue {
    X,
    Y,
    Z,
    R,
    Phi,
    RPhi,
    /// Polar angle theta.
    H,
    Eta,
    Mag,
}

impl BinningValue {
    /// Evaluates this coordinate at a position.
    pub fn value(&self, pos: &Point3<f64>) -> f64 {
        let r = pos.x.hypot(pos.y);
        match self {
            BinningValue::X => pos.x,
            BinningValue::Y => pos.y,
            BinningValue::Z => pos.z,
            BinningValue::R => r,
            BinningValue::Phi => pos.y.atan2(pos.x),
            BinningValue::RPhi => r * pos.y.atan2(pos.x),
            BinningValue::H => r.atan2(pos.z),
            BinningValue::Eta => (pos.z / r).asinh(),
            BinningValue::Mag => pos.coords.norm(),
        }
    }

    fn is_angular(&self) -> bool {
        matches!(self, BinningValue::Phi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinningOption {
    /// Values outside the range are clamped to the first or last bin.
    Open,
    /// The range is periodic; values wrap around.
    Closed,
}

/// Binning along a single coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinningData {
    pub value: BinningValue,
    pub option: BinningOption,
    pub min: f64,
    pub max: f64,
    boundaries: Vec<f64>,
    equidistant: bool,
}

impl BinningData {
    /// Creates `bins` bins of equal width between `min` and `max`.
    pub fn equidistant(
        value: BinningValue,
        option: BinningOption,
        bins: usize,
        min: f64,
        max: f64,
    ) -> Result<Self> {
        if bins == 0 {
            return Err(GeometryError::InvalidBinning(format!(
                "equidistant binning along {:?} needs at least one bin",
                value
            )));
        }
        if !(min < max) {
            return Err(GeometryError::InvalidBinning(format!(
                "binning range along {:?} is empty: [{}, {}]",
                value, min, max
            )));
        }
        let step = (max - min) / bins as f64;
        let boundaries = (0..=bins).map(|i| min + i as f64 * step).collect();
        Ok(Self {
            value,
            option,
            min,
            max,
            boundaries,
            equidistant: true,
        })
    }

    /// Creates bins from explicit, strictly increasing boundaries.
    pub fn arbitrary(value: BinningValue, option: BinningOption, boundaries: Vec<f64>) -> Result<Self> {
        if boundaries.len() < 2 {
            return Err(GeometryError::InvalidBinning(format!(
                "arbitrary binning along {:?} needs at least two boundaries",
                value
            )));
        }
        if boundaries.windows(2).any(|w| w[1] <= w[0]) {
            return Err(GeometryError::InvalidBinning(format!(
                "boundaries along {:?} are not strictly increasing: {:?}",
                value, boundaries
            )));
        }
        Ok(Self {
            value,
            option,
            min: boundaries[0],
            max: boundaries[boundaries.len() - 1],
            boundaries,
            equidistant: false,
        })
    }

    pub fn bins(&self) -> usize {
        self.boundaries.len() - 1
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    pub fn is_equidistant(&self) -> bool {
        self.equidistant
    }

    /// Value of the binned coordinate at a (local) position.
    pub fn value_at(&self, pos: &Point3<f64>) -> f64 {
        self.value.value(pos)
    }

    fn wrap(&self, value: f64) -> f64 {
        match self.option {
            BinningOption::Closed => self.min + (value - self.min).rem_euclid(self.max - self.min),
            BinningOption::Open => value,
        }
    }

    /// Bin index holding `value`.
    pub fn search(&self, value: f64) -> usize {
        let value = self.wrap(value);
        let last = self.bins() - 1;
        if self.equidistant {
            let step = (self.max - self.min) / self.bins() as f64;
            let bin = ((value - self.min) / step).floor();
            if bin <= 0.0 || bin.is_nan() {
                0
            } else {
                (bin as usize).min(last)
            }
        } else {
            // number of boundaries at or below the value, minus the lower edge
            let upper = self.boundaries.partition_point(|b| *b <= value);
            upper.saturating_sub(1).min(last)
        }
    }

    pub fn search_position(&self, pos: &Point3<f64>) -> usize {
        self.search(self.value_at(pos))
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        let bin = bin.min(self.bins() - 1);
        0.5 * (self.boundaries[bin] + self.boundaries[bin + 1])
    }

    /// Whether a value falls into the covered range. Closed binnings cover everything.
    pub fn inside(&self, value: f64) -> bool {
        match self.option {
            BinningOption::Closed => true,
            BinningOption::Open => value >= self.min && value <= self.max,
        }
    }

    /// Sign of the change of the binned value when moving along `dir`.
    pub fn next_direction(&self, pos: &Point3<f64>, dir: &Vector3<f64>) -> i32 {
        let value = self.value_at(pos);
        let probe = pos + dir.normalize() * NEXT_DIRECTION_PROBE;
        let mut delta = self.value_at(&probe) - value;
        if self.value.is_angular() {
            // shortest signed angular distance
            delta = (delta + PI).rem_euclid(2.0 * PI) - PI;
        }
        if delta < 0.0 {
            -1
        } else {
            1
        }
    }

    /// The bin itself plus its direct neighbours, wrapping for closed binnings.
    pub fn neighbour_bins(&self, bin: usize) -> Vec<usize> {
        let bins = self.bins();
        let mut result = Vec::with_capacity(3);
        match self.option {
            BinningOption::Closed => {
                for candidate in [(bin + bins - 1) % bins, bin, (bin + 1) % bins] {
                    if !result.contains(&candidate) {
                        result.push(candidate);
                    }
                }
            }
            BinningOption::Open => {
                if bin > 0 {
                    result.push(bin - 1);
                }
                result.push(bin);
                if bin + 1 < bins {
                    result.push(bin + 1);
                }
            }
        }
        result
    }

    /// The bin reached by stepping `offset` bins, or `None` when stepping off an open binning.
    pub fn offset_bin(&self, bin: usize, offset: i32) -> Option<usize> {
        let bins = self.bins() as i64;
        let target = bin as i64 + offset as i64;
        match self.option {
            BinningOption::Closed => Some(target.rem_euclid(bins) as usize),
            BinningOption::Open if (0..bins).contains(&target) => Some(target as usize),
            BinningOption::Open => None,
        }
    }
}

/// Maps a position to a bin in up to three dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinUtility {
    data: Vec<BinningData>,
    transform: Option<Isometry3<f64>>,
}

impl BinUtility {
    pub fn new(data: BinningData) -> Self {
        Self {
            data: vec![data],
            transform: None,
        }
    }

    /// Places the binning in a local frame; positions are transformed into it before lookup.
    pub fn with_transform(mut self, transform: Isometry3<f64>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Adds another binning axis, up to three.
    pub fn add_binning(mut self, data: BinningData) -> Result<Self> {
        if self.data.len() >= 3 {
            return Err(GeometryError::InvalidBinning(
                "a bin utility supports at most three dimensions".to_string(),
            ));
        }
        self.data.push(data);
        Ok(self)
    }

    pub fn binning_data(&self) -> &[BinningData] {
        &self.data
    }

    pub fn transform(&self) -> Option<&Isometry3<f64>> {
        self.transform.as_ref()
    }

    pub fn dimensions(&self) -> usize {
        self.data.len()
    }

    fn local_point(&self, pos: &Point3<f64>) -> Point3<f64> {
        match &self.transform {
            Some(t) => t.inverse_transform_point(pos),
            None => *pos,
        }
    }

    fn local_vector(&self, dir: &Vector3<f64>) -> Vector3<f64> {
        match &self.transform {
            Some(t) => t.inverse_transform_vector(dir),
            None => *dir,
        }
    }

    /// Bin triple of a global position; unused dimensions are 0.
    pub fn bin(&self, pos: &Point3<f64>) -> [usize; 3] {
        let local = self.local_point(pos);
        let mut bin = [0; 3];
        for (slot, data) in bin.iter_mut().zip(&self.data) {
            *slot = data.search_position(&local);
        }
        bin
    }

    pub fn bin_along(&self, pos: &Point3<f64>, axis: usize) -> usize {
        self.data
            .get(axis)
            .map_or(0, |data| data.search_position(&self.local_point(pos)))
    }

    /// Direction sign along the first binning axis.
    pub fn next_direction(&self, pos: &Point3<f64>, dir: &Vector3<f64>) -> i32 {
        self.data[0].next_direction(&self.local_point(pos), &self.local_vector(dir))
    }

    pub fn bins_along(&self, axis: usize) -> usize {
        self.data.get(axis).map_or(1, BinningData::bins)
    }

    /// Total number of bins.
    pub fn bins(&self) -> usize {
        (0..3).map(|axis| self.bins_along(axis)).product()
    }

    /// Flattens a bin triple into a single index.
    pub fn serialize(&self, bin: [usize; 3]) -> usize {
        let n0 = self.bins_along(0);
        let n1 = self.bins_along(1);
        bin[0] + bin[1] * n0 + bin[2] * n0 * n1
    }

    pub fn inside(&self, pos: &Point3<f64>) -> bool {
        let local = self.local_point(pos);
        self.data.iter().all(|data| data.inside(data.value_at(&local)))
    }

    /// All bins adjacent to `bin` (including itself).
    pub fn neighbour_bins(&self, bin: [usize; 3]) -> Vec<[usize; 3]> {
        let axis = |i: usize| -> Vec<usize> {
            self.data
                .get(i)
                .map_or_else(|| vec![0], |data| data.neighbour_bins(bin[i]))
        };
        iproduct!(axis(0), axis(1), axis(2))
            .map(|(a, b, c)| [a, b, c])
            .collect()
    }

    /// Bins one step further along the direction of travel, per axis and diagonally.
    pub fn next_bins(&self, pos: &Point3<f64>, dir: &Vector3<f64>) -> Vec<[usize; 3]> {
        let local = self.local_point(pos);
        let local_dir = self.local_vector(dir);
        let bin = self.bin(pos);
        let steps = |i: usize| -> Vec<usize> {
            match self.data.get(i) {
                None => vec![0],
                Some(data) => {
                    let sign = data.next_direction(&local, &local_dir);
                    let mut steps = vec![bin[i]];
                    if let Some(next) = data.offset_bin(bin[i], sign) {
                        if next != bin[i] {
                            steps.push(next);
                        }
                    }
                    steps
                }
            }
        };
        iproduct!(steps(0), steps(1), steps(2))
            .map(|(a, b, c)| [a, b, c])
            .filter(|candidate| *candidate != bin)
            .collect()
    }
}
