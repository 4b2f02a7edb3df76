//! Common identity and position queries shared by surfaces, layers and volumes.
//!
//! A [`GeometryId`] packs the position of an object inside the geometry
//! hierarchy into a single 64-bit value:
//!
//! | field     | bits |
//! |-----------|------|
//! | volume    | 8    |
//! | boundary  | 8    |
//! | layer     | 8    |
//! | approach  | 8    |
//! | sensitive | 20   |
//!
//! Identifiers are handed out once, when the owning tracking volume is
//! created, and never change afterwards.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::bin_utility::BinningValue;
use crate::error::{GeometryError, Result};


const VOLUME_SHIFT: u32 = 56;
const BOUNDARY_SHIFT: u32 = 48;
const LAYER_SHIFT: u32 = 40;
const APPROACH_SHIFT: u32 = 32;
const SENSITIVE_SHIFT: u32 = 0;

const BYTE_MASK: u64 = 0xff;
const SENSITIVE_MASK: u64 = 0xf_ffff;

/// Packed identifier of a geometry object.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeometryId(u64);

impl GeometryId {
    pub fn value(&self) -> u64 {
        self.0
    }

    fn get(&self, shift: u32, mask: u64) -> u64 {
        (self.0 >> shift) & mask
    }

    fn set(self, shift: u32, mask: u64, value: u64) -> Self {
        let cleared = self.0 & !(mask << shift);
        Self(cleared | ((value & mask) << shift))
    }

    pub fn volume(&self) -> u64 {
        self.get(VOLUME_SHIFT, BYTE_MASK)
    }

    pub fn boundary(&self) -> u64 {
        self.get(BOUNDARY_SHIFT, BYTE_MASK)
    }

    pub fn layer(&self) -> u64 {
        self.get(LAYER_SHIFT, BYTE_MASK)
    }

    pub fn approach(&self) -> u64 {
        self.get(APPROACH_SHIFT, BYTE_MASK)
    }

    pub fn sensitive(&self) -> u64 {
        self.get(SENSITIVE_SHIFT, SENSITIVE_MASK)
    }

    pub fn with_volume(self, value: u64) -> Self {
        self.set(VOLUME_SHIFT, BYTE_MASK, value)
    }

    pub fn with_boundary(self, value: u64) -> Self {
        self.set(BOUNDARY_SHIFT, BYTE_MASK, value)
    }

    pub fn with_layer(self, value: u64) -> Self {
        self.set(LAYER_SHIFT, BYTE_MASK, value)
    }

    pub fn with_approach(self, value: u64) -> Self {
        self.set(APPROACH_SHIFT, BYTE_MASK, value)
    }

    pub fn with_sensitive(self, value: u64) -> Self {
        self.set(SENSITIVE_SHIFT, SENSITIVE_MASK, value)
    }
}

impl fmt::Display for GeometryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[vol {} | bnd {} | lay {} | apr {} | sen {}]",
            self.volume(),
            self.boundary(),
            self.layer(),
            self.approach(),
            self.sensitive()
        )
    }
}

/// Set-once storage for a [`GeometryId`].
#[derive(Debug, Default)]
pub struct GeometryIdCell(OnceLock<GeometryId>);

impl GeometryIdCell {
    /// The assigned identifier, or the null identifier if none was assigned yet.
    pub fn get(&self) -> GeometryId {
        self.0.get().copied().unwrap_or_default()
    }

    pub(crate) fn assign(&self, id: GeometryId) -> Result<()> {
        self.0
            .set(id)
            .map_err(|_| GeometryError::AlreadySet("geometry id"))
    }
}

/// Base behaviour of every geometric entity.
pub trait GeometryObject {
    fn geometry_id(&self) -> GeometryId;

    /// Reference position of the object when it is binned along `value`.
    fn binning_position(&self, value: BinningValue) -> Point3<f64>;

    /// Radius at which the object is binned; defaults to the radial distance
    /// of the binning position.
    fn binning_radius(&self) -> f64 {
        let pos = self.binning_position(BinningValue::R);
        pos.x.hypot(pos.y)
    }
}
