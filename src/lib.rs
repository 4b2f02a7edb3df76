pub mod approach_descriptor;
pub mod bin_utility;
pub mod detector;
pub mod detector_element;
pub mod error;
pub mod extrapolation;
pub mod geometry_object;
pub mod intersection;
pub mod layer;
pub mod material;
pub mod material_mapping;
pub mod output;
pub mod overlap_descriptor;
pub mod settings;
pub mod surface;
pub mod surface_array;
pub mod surface_material_record;
pub mod tracking_volume;
pub mod volume_bounds;
