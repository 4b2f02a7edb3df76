use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{PoisonError, RwLock};


/// Read-out identifier of a detector element.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(pub u64);

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A read-out unit. It owns no surface; exactly one surface refers to it.
///
/// Bin members (elements sharing a spatial bin) and neighbours (spatially
/// adjacent elements) are non-owning references by identifier, registered by
/// the geometry builder after construction.
#[derive(Debug)]
pub struct DetectorElement {
    identifier: Identifier,
    transform: Isometry3<f64>,
    thickness: f64,
    bin_members: RwLock<Vec<Identifier>>,
    neighbours: RwLock<Vec<Identifier>>,
}

impl DetectorElement {
    pub fn new(identifier: Identifier, transform: Isometry3<f64>, thickness: f64) -> Self {
        Self {
            identifier,
            transform,
            thickness,
            bin_members: RwLock::new(Vec::new()),
            neighbours: RwLock::new(Vec::new()),
        }
    }

    pub fn identify(&self) -> Identifier {
        self.identifier
    }

    pub fn transform(&self) -> &Isometry3<f64> {
        &self.transform
    }

    pub fn thickness(&self) -> f64 {
        self.thickness
    }

    pub fn bin_members(&self) -> Vec<Identifier> {
        self.bin_members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn neighbours(&self) -> Vec<Identifier> {
        self.neighbours
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds bin members; identifiers already present are skipped.
    pub fn register_bin_members(&self, members: &[Identifier]) {
        let mut list = self
            .bin_members
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.insert_unique(&mut list, members);
    }

    /// Adds neighbours; identifiers already present are skipped.
    pub fn register_neighbours(&self, neighbours: &[Identifier]) {
        let mut list = self
            .neighbours
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.insert_unique(&mut list, neighbours);
    }

    fn insert_unique(&self, list: &mut Vec<Identifier>, candidates: &[Identifier]) {
        for candidate in candidates {
            if *candidate != self.identifier && !list.contains(candidate) {
                list.push(*candidate);
            }
        }
    }
}
