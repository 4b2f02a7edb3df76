use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::geometry_object::GeometryId;
use crate::material::BinnedSurfaceMaterial;
use crate::settings::Settings;


#[derive(Serialize)]
struct LayerMaterialMap<'a> {
    geometry_id: String,
    volume: u64,
    layer: u64,
    material: &'a BinnedSurfaceMaterial,
}

#[derive(Serialize)]
struct MaterialMapFile<'a> {
    generated: String,
    tracks: usize,
    layers: Vec<LayerMaterialMap<'a>>,
}

fn prepare_directory(directory: &Path) -> Result<()> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create output directory {}", directory.display()))
}

/// Write the per-layer material maps to `material_maps.json` in `directory`.
pub fn write_material_maps(
    maps: &[(GeometryId, BinnedSurfaceMaterial)],
    tracks: usize,
    directory: &Path,
) -> Result<PathBuf> {
    prepare_directory(directory)?;
    let path = directory.join("material_maps.json");

    let document = MaterialMapFile {
        generated: Utc::now().to_rfc3339(),
        tracks,
        layers: maps
            .iter()
            .map(|(id, material)| LayerMaterialMap {
                geometry_id: id.to_string(),
                volume: id.volume(),
                layer: id.layer(),
                material,
            })
            .collect(),
    };

    let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &document)?;
    writeln!(writer)?;
    writer.flush()?;

    info!(path = %path.display(), layers = maps.len(), "wrote material maps");
    Ok(path)
}

/// Write the effective settings to `settings.toml` in `directory`.
pub fn write_settings(settings: &Settings, directory: &Path) -> Result<PathBuf> {
    prepare_directory(directory)?;
    let path = directory.join("settings.toml");
    let text = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
    fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
