use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};


/// Radius and angle threshold below which volume decomposition treats a value as degenerate.
pub const NUMERICAL_STABLE: f64 = 0.1;
/// Maximum distance from a surface for a point to be considered on it.
pub const ON_SURFACE_TOLERANCE: f64 = 1e-4;
/// Path length limit used when no end surface restricts a search.
pub const MAX_PATH_LENGTH: f64 = 1e10;
/// Probe distance along the direction when deciding the next bin direction.
pub const NEXT_DIRECTION_PROBE: f64 = 1.0;
/// Distance a navigator steps past a boundary before looking up the next volume.
pub const BOUNDARY_STEP: f64 = 1e-3;
/// Upper bound on navigation steps for a single extrapolation.
pub const MAX_NAVIGATION_STEPS: usize = 1000;

/// Runtime configuration for the application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    pub detector: DetectorSettings,
    pub mapping: MappingSettings,
    pub navigation: NavigationSettings,
}

/// Layout of the generic cylindrical detector.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DetectorSettings {
    pub barrel_radii: Vec<f64>,
    pub barrel_half_z: f64,
    pub modules_phi: usize,
    pub modules_z: usize,
    pub layer_thickness: f64,
    pub material_bins_phi: usize,
    pub material_bins_z: usize,
    /// Radial material bins of the endcap discs.
    #[serde(default = "default_material_bins_r")]
    pub material_bins_r: usize,
    /// Positive z positions of the endcap discs, mirrored to negative z.
    #[serde(default)]
    pub endcap_z: Vec<f64>,
    #[serde(default = "default_endcap_r_min")]
    pub endcap_r_min: f64,
    #[serde(default = "default_envelope")]
    pub envelope: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MappingSettings {
    pub num_tracks: usize,
    pub seed: Option<u64>,
    pub eta_max: f64,
    pub steps_per_layer: usize,
    #[serde(default)]
    pub show_progress: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NavigationSettings {
    pub search_depth: i32,
}

fn default_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_material_bins_r() -> usize {
    10
}

fn default_endcap_r_min() -> f64 {
    25.0
}

fn default_envelope() -> f64 {
    5.0
}

pub fn load_default_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    let default_config_file = root.join("config/default.toml");

    let settings = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .context("Error loading configuration")?;

    let config: Settings = settings
        .try_deserialize()
        .context("Error deserializing configuration")?;

    validate_config(&config)?;

    Ok(config)
}

/// Reads `config/default.toml` below `root`, then layers `config/local.toml`
/// (when present) and `TRACKNAV__` environment variables over it.
pub fn load_layered_config(root: &Path) -> Result<Settings> {
    let default_config_file = root.join("config/default.toml");
    let local_config = root.join("config/local.toml");

    if local_config.exists() {
        tracing::info!(path = ?local_config, "Using local configuration overrides");
    }

    let settings = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .add_source(File::from(local_config).required(false))
        .add_source(Environment::with_prefix("tracknav").separator("__"))
        .build()
        .context("Error loading configuration")?;

    settings
        .try_deserialize()
        .context("Error deserializing configuration")
}

pub fn load_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    let mut config = load_layered_config(&root)?;

    // Parse command-line arguments and override values
    let args = CliArgs::parse();

    if let Some(tracks) = args.tracks {
        config.mapping.num_tracks = tracks;
    }
    if let Some(seed) = args.seed {
        config.mapping.seed = Some(seed);
    }
    if let Some(eta) = args.eta_max {
        config.mapping.eta_max = eta;
    }
    if let Some(depth) = args.depth {
        config.navigation.search_depth = depth;
    }
    if let Some(dir) = args.output {
        config.directory = dir;
    }
    if args.progress {
        config.mapping.show_progress = true;
    }

    validate_config(&config)?;

    tracing::debug!("{:#?}", config);

    Ok(config)
}

/// Retrieve the project root directory.
/// Tries, in order: `CARGO_MANIFEST_DIR`, `TRACKNAV_ROOT_DIR`, and the nearest
/// parent of the executable that has a `config` subdirectory.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("TRACKNAV_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }

    let exe_path = env::current_exe().context("Failed to get current executable path")?;
    let mut current_dir = exe_path.parent().map(|p| p.to_path_buf());

    while let Some(dir) = current_dir {
        if dir.join("config").is_dir() {
            return Ok(dir);
        }
        current_dir = dir.parent().map(|p| p.to_path_buf());
    }

    bail!("Could not find project root directory")
}

fn validate_config(config: &Settings) -> Result<()> {
    let detector = &config.detector;
    if detector.barrel_radii.is_empty() {
        bail!("At least one barrel layer radius is required");
    }
    if detector.barrel_radii.windows(2).any(|w| w[1] <= w[0]) {
        bail!("Barrel layer radii must be strictly increasing");
    }
    if detector.barrel_half_z <= 0.0 {
        bail!("Barrel half length must be greater than 0");
    }
    if detector.layer_thickness <= 0.0 {
        bail!("Layer thickness must be greater than 0");
    }
    if detector.modules_phi == 0 || detector.modules_z == 0 {
        bail!("Every barrel layer needs at least one module in phi and z");
    }
    if detector.material_bins_phi == 0 || detector.material_bins_z == 0 || detector.material_bins_r == 0 {
        bail!("Material maps need at least one bin per axis");
    }
    if detector.endcap_z.iter().any(|z| *z <= detector.barrel_half_z) {
        bail!("Endcap discs must sit outside the barrel half length");
    }
    if !(-1..=5).contains(&config.navigation.search_depth) {
        bail!(
            "Search depth must be between -1 and 5, got {}",
            config.navigation.search_depth
        );
    }
    if config.mapping.eta_max <= 0.0 {
        bail!("Eta range must be greater than 0");
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(version, about = "tracknav - layer navigation and material mapping")]
pub struct CliArgs {
    /// Number of material track records to generate and map.
    #[arg(short, long)]
    tracks: Option<usize>,

    /// Random seed for the track generation.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Maximum absolute pseudorapidity of the generated tracks.
    #[arg(long)]
    eta_max: Option<f64>,

    /// Search depth used when collecting sensitive surfaces on a layer (-1 to 5).
    #[arg(short, long, allow_negative_numbers = true)]
    depth: Option<i32>,

    /// Directory the material maps are written to.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show a progress bar while mapping.
    #[arg(long)]
    progress: bool,
}
