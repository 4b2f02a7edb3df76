use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracknav::detector::Detector;
use tracknav::extrapolation::{ExtrapolationEngine, StraightLineNavigator};
use tracknav::material_mapping::{self, MaterialMapping};
use tracknav::output;
use tracknav::settings;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = settings::load_config()?;

    let detector = Detector::build(&settings.detector)?;
    let records = detector.generate_material_tracks(&settings.mapping)?;

    let engine: Arc<dyn ExtrapolationEngine> = Arc::new(StraightLineNavigator::new(Arc::clone(detector.world())));
    let mut mapping = MaterialMapping::new(material_mapping::Config {
        extrapolation_engine: Some(engine),
        search_depth: settings.navigation.search_depth,
        show_progress: settings.mapping.show_progress,
    })?;

    let mapped = mapping.map_material_track_records(&records)?;
    mapping.average_layer_material()?;
    let layers = mapping.finalize_layer_material()?;
    info!(tracks = records.len(), mapped, layers, "material mapping done");

    output::write_material_maps(&mapping.layer_material_maps(), records.len(), &settings.directory)?;
    output::write_settings(&settings, &settings.directory)?;
    Ok(())
}
