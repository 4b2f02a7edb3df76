use nalgebra::Point3;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use crate::bin_utility::BinUtility;
use crate::error::{GeometryError, Result};
use crate::material::{BinnedSurfaceMaterial, Material, MaterialProperties};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_utility::{BinningData, BinningOption, BinningValue};
    use approx::assert_relative_eq;

    fn record() -> SurfaceMaterialRecord {
        SurfaceMaterialRecord::new(BinUtility::new(
            BinningData::equidistant(BinningValue::X, BinningOption::Open, 2, -10.0, 10.0).unwrap(),
        ))
    }

    fn silicon(thickness: f64) -> MaterialProperties {
        MaterialProperties::new(Material::silicon(), thickness)
    }

    #[test]
    fn tracks_are_averaged_per_bin() {
        let mut record = record();
        let left = Point3::new(-5.0, 0.0, 0.0);
        record.add_layer_material_properties(&left, &[silicon(0.1), silicon(0.2)]);
        record.add_layer_material_properties(&left, &[silicon(0.5)]);
        assert_eq!(record.entries(&left), 2);

        record.average_material();
        let material = record.layer_material();
        let averaged = material.material_properties(&left).unwrap();
        assert_relative_eq!(averaged.thickness, 0.4, epsilon = 1e-12);
        assert_relative_eq!(averaged.material.x0, Material::silicon().x0, epsilon = 1e-9);
        assert_relative_eq!(averaged.material.rho, Material::silicon().rho, epsilon = 1e-12);

        // the other bin stays empty
        let right = material.material_properties(&Point3::new(5.0, 0.0, 0.0)).unwrap();
        assert_eq!(right.thickness, 0.0);
    }

    #[test]
    fn second_average_is_a_no_op() {
        let mut record = record();
        let pos = Point3::new(3.0, 0.0, 0.0);
        record.add_layer_material_properties(&pos, &[silicon(0.3)]);
        record.add_layer_material_properties(&pos, &[silicon(0.2)]);
        record.add_layer_material_properties(&pos, &[silicon(0.7)]);
        record.average_material();
        let once = record.clone();
        record.average_material();
        assert_eq!(record, once);
    }

    #[test]
    fn merge_adds_entries() {
        let mut a = record();
        let mut b = record();
        let pos = Point3::new(-1.0, 0.0, 0.0);
        a.add_layer_material_properties(&pos, &[silicon(0.2)]);
        b.add_layer_material_properties(&pos, &[silicon(0.4)]);
        a.merge(&b).unwrap();
        assert_eq!(a.entries(&pos), 2);
        a.average_material();
        assert_relative_eq!(
            a.layer_material().material_properties(&pos).unwrap().thickness,
            0.3,
            epsilon = 1e-12
        );

        let other = SurfaceMaterialRecord::new(BinUtility::new(
            BinningData::equidistant(BinningValue::Z, BinningOption::Open, 2, -10.0, 10.0).unwrap(),
        ));
        assert!(a.merge(&other).is_err());
    }
}

/// Sums of the material seen in one bin.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialSums {
    pub thickness: f64,
    pub thickness_in_x0: f64,
    pub thickness_in_l0: f64,
    /// Density times thickness.
    pub rho_t: f64,
    pub a_rho_t: f64,
    pub z_rho_t: f64,
    pub entries: usize,
}

impl MaterialSums {
    fn add(&mut self, props: &MaterialProperties) {
        let rho_t = props.material.rho * props.thickness;
        self.thickness += props.thickness;
        self.thickness_in_x0 += props.thickness_in_x0();
        self.thickness_in_l0 += props.thickness_in_l0();
        self.rho_t += rho_t;
        self.a_rho_t += props.material.a * rho_t;
        self.z_rho_t += props.material.z * rho_t;
    }

    fn scale(&mut self, factor: f64) {
        self.thickness *= factor;
        self.thickness_in_x0 *= factor;
        self.thickness_in_l0 *= factor;
        self.rho_t *= factor;
        self.a_rho_t *= factor;
        self.z_rho_t *= factor;
    }

    /// Equivalent slab per entry.
    fn properties(&self) -> MaterialProperties {
        if self.entries == 0 || self.thickness <= 0.0 {
            return MaterialProperties::default();
        }
        let mut mean = *self;
        mean.scale(1.0 / self.entries as f64);
        let length = |t_in: f64| {
            if t_in > 0.0 {
                mean.thickness / t_in
            } else {
                f64::INFINITY
            }
        };
        let (a, z) = if mean.rho_t > 0.0 {
            (mean.a_rho_t / mean.rho_t, mean.z_rho_t / mean.rho_t)
        } else {
            (0.0, 0.0)
        };
        MaterialProperties::new(
            Material::new(
                length(mean.thickness_in_x0),
                length(mean.thickness_in_l0),
                a,
                z,
                mean.rho_t / mean.thickness,
            ),
            mean.thickness,
        )
    }
}

impl AddAssign<&MaterialSums> for MaterialSums {
    fn add_assign(&mut self, other: &MaterialSums) {
        self.thickness += other.thickness;
        self.thickness_in_x0 += other.thickness_in_x0;
        self.thickness_in_l0 += other.thickness_in_l0;
        self.rho_t += other.rho_t;
        self.a_rho_t += other.a_rho_t;
        self.z_rho_t += other.z_rho_t;
        self.entries += other.entries;
    }
}

/// Accumulates mapped material of one layer, binned like its material proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceMaterialRecord {
    bin_utility: BinUtility,
    /// Indexed `[bin along axis 1, bin along axis 0]`.
    sums: Array2<MaterialSums>,
}

impl SurfaceMaterialRecord {
    pub fn new(bin_utility: BinUtility) -> Self {
        let shape = (bin_utility.bins_along(1), bin_utility.bins_along(0));
        Self {
            bin_utility,
            sums: Array2::from_elem(shape, MaterialSums::default()),
        }
    }

    pub fn bin_utility(&self) -> &BinUtility {
        &self.bin_utility
    }

    pub fn sums(&self) -> &Array2<MaterialSums> {
        &self.sums
    }

    fn index(&self, pos: &Point3<f64>) -> [usize; 2] {
        let bin = self.bin_utility.bin(pos);
        [bin[1], bin[0]]
    }

    pub fn entries(&self, pos: &Point3<f64>) -> usize {
        self.sums
            .get(self.index(pos))
            .map_or(0, |sums| sums.entries)
    }

    /// Adds the material one track deposited in this layer, at its crossing position.
    ///
    /// All steps count as a single entry of the bin.
    pub fn add_layer_material_properties(&mut self, pos: &Point3<f64>, steps: &[MaterialProperties]) {
        let index = self.index(pos);
        if let Some(sums) = self.sums.get_mut(index) {
            for step in steps {
                sums.add(step);
            }
            sums.entries += 1;
        }
    }

    /// Turns the sums into per-entry averages.
    ///
    /// Each touched bin is divided by its entry count, which is then reset
    /// to one. Calling this again without new entries leaves the record as
    /// it is; adding entries afterwards mixes averaged and raw sums.
    pub fn average_material(&mut self) {
        for sums in self.sums.iter_mut().filter(|s| s.entries > 1) {
            sums.scale(1.0 / sums.entries as f64);
            sums.entries = 1;
        }
    }

    /// Adds another record with the same binning into this one.
    pub fn merge(&mut self, other: &SurfaceMaterialRecord) -> Result<()> {
        if self.bin_utility != other.bin_utility {
            return Err(GeometryError::InvalidBinning(
                "cannot merge material records with different binning".to_string(),
            ));
        }
        Zip::from(&mut self.sums)
            .and(&other.sums)
            .for_each(|mine, theirs| *mine += theirs);
        Ok(())
    }

    /// The averaged material as a binned surface material.
    pub fn layer_material(&self) -> BinnedSurfaceMaterial {
        BinnedSurfaceMaterial::new(self.bin_utility.clone(), self.sums.map(MaterialSums::properties))
    }
}
