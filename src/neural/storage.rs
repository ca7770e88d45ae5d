// projeto: lstmsensorforecast
// file: src/neural/storage.rs
// Versioned on-disk artifact set: config, scaler, model weights and manifest

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::neural::forecast::SensorForecaster;
use crate::neural::model::{ModelConfig, SequenceModel};
use crate::neural::scaler::ScalerParams;
use crate::neural::utils::ForecastError;

pub const CONFIG_FILE: &str = "config.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const MODEL_FILE: &str = "model.bin";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Written last. A directory without it is an incomplete save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// File name -> hex SHA-256 of its contents.
    pub files: BTreeMap<String, String>,
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn sibling(destination: &Path, suffix: &str) -> Result<PathBuf, ForecastError> {
    let name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ForecastError::InvalidInput(format!("{} has no directory name", destination.display())))?;
    Ok(destination.with_file_name(format!(".{}.{}", name, suffix)))
}

fn remove_dir_if_exists(path: &Path) -> Result<(), ForecastError> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn write_staged(
    staging: &Path,
    files: &[(&str, Vec<u8>)],
) -> Result<ArtifactManifest, ForecastError> {
    fs::create_dir_all(staging)?;
    let mut digests = BTreeMap::new();
    for (name, bytes) in files {
        fs::write(staging.join(name), bytes)?;
        digests.insert(name.to_string(), sha256_hex(bytes));
        debug!("[Storage] Staged {} ({} bytes)", name, bytes.len());
    }
    let manifest = ArtifactManifest {
        format_version: ARTIFACT_FORMAT_VERSION,
        created_at: Utc::now(),
        files: digests,
    };
    fs::write(staging.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;
    Ok(manifest)
}

/// Saves model, scaler and config as one unit under `destination`.
///
/// Files are staged in a sibling directory and moved into place only after
/// every file and the manifest are written; a previous set at `destination`
/// is replaced.
pub fn save_artifacts(
    model: &SequenceModel,
    scaler: Option<&ScalerParams>,
    config: &ModelConfig,
    destination: &Path,
) -> Result<ArtifactManifest, ForecastError> {
    config.validate()?;
    if config != model.config() {
        return Err(ForecastError::ArtifactMismatch(
            "config does not describe the model being saved".to_string(),
        ));
    }
    if let Some(scaler) = scaler {
        if scaler.channels() != &config.channel_names {
            return Err(ForecastError::ArtifactMismatch(format!(
                "scaler channels {:?} differ from config channels {:?}",
                scaler.channels().names(),
                config.channel_names.names()
            )));
        }
    }

    let mut files: Vec<(&str, Vec<u8>)> = vec![
        (CONFIG_FILE, serde_json::to_string_pretty(config)?.into_bytes()),
        (MODEL_FILE, model.save_weights()?),
    ];
    match scaler {
        Some(scaler) => files.push((SCALER_FILE, scaler.to_json()?.into_bytes())),
        None => warn!("⚠️ [Storage] Saving without scaler; the model will run on unscaled values"),
    }

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staging = sibling(destination, "staging")?;
    let retired = sibling(destination, "old")?;
    remove_dir_if_exists(&staging)?;

    let manifest = match write_staged(&staging, &files) {
        Ok(manifest) => manifest,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    remove_dir_if_exists(&retired)?;
    if destination.exists() {
        fs::rename(destination, &retired)?;
    }
    if let Err(e) = fs::rename(&staging, destination) {
        if retired.exists() {
            let _ = fs::rename(&retired, destination);
        }
        return Err(e.into());
    }
    remove_dir_if_exists(&retired)?;

    info!("💾 [Storage] Saved {} artifacts to {}", manifest.files.len(), destination.display());
    Ok(manifest)
}

pub fn read_manifest(source: &Path) -> Result<ArtifactManifest, ForecastError> {
    let path = source.join(MANIFEST_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ForecastError::ArtifactMismatch(format!(
                "{} has no {}; the artifact set is incomplete",
                source.display(),
                MANIFEST_FILE
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let manifest: ArtifactManifest = serde_json::from_str(&content)
        .map_err(|e| ForecastError::ArtifactMismatch(format!("unreadable manifest: {}", e)))?;
    if manifest.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(ForecastError::ArtifactMismatch(format!(
            "artifact format version {} (expected {})",
            manifest.format_version, ARTIFACT_FORMAT_VERSION
        )));
    }
    Ok(manifest)
}

/// Contents of `name` if the manifest lists it. Fails on a listed file that
/// is missing or whose digest changed.
fn read_verified(source: &Path, manifest: &ArtifactManifest, name: &str) -> Result<Option<Vec<u8>>, ForecastError> {
    let expected = match manifest.files.get(name) {
        Some(digest) => digest,
        None => return Ok(None),
    };
    let bytes = match fs::read(source.join(name)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ForecastError::ArtifactMismatch(format!(
                "manifest lists {} but it is missing from {}",
                name,
                source.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    if &sha256_hex(&bytes) != expected {
        return Err(ForecastError::ArtifactMismatch(format!("{} does not match its manifest digest", name)));
    }
    Ok(Some(bytes))
}

fn require(bytes: Option<Vec<u8>>, name: &str) -> Result<Vec<u8>, ForecastError> {
    bytes.ok_or_else(|| ForecastError::ArtifactMismatch(format!("artifact set has no {}", name)))
}

/// Loads a set written by [`save_artifacts`]: config first, then weights
/// checked against it, then the scaler if one was saved.
pub fn load_artifacts(source: &Path) -> Result<SensorForecaster, ForecastError> {
    info!("📂 [Storage] Loading artifacts from {}", source.display());
    let manifest = read_manifest(source)?;

    let config_bytes = require(read_verified(source, &manifest, CONFIG_FILE)?, CONFIG_FILE)?;
    let config: ModelConfig = serde_json::from_slice(&config_bytes)
        .map_err(|e| ForecastError::ArtifactMismatch(format!("unreadable {}: {}", CONFIG_FILE, e)))?;
    if config.channel_count != config.channel_names.len() {
        return Err(ForecastError::ArtifactMismatch(format!(
            "config declares {} channels but names {}",
            config.channel_count,
            config.channel_names.len()
        )));
    }

    let model_bytes = require(read_verified(source, &manifest, MODEL_FILE)?, MODEL_FILE)?;
    let model = SequenceModel::restore(config, &model_bytes)?;

    let scaler = match read_verified(source, &manifest, SCALER_FILE)? {
        Some(bytes) => {
            let json = String::from_utf8(bytes)
                .map_err(|e| ForecastError::ArtifactMismatch(format!("{} is not UTF-8: {}", SCALER_FILE, e)))?;
            Some(ScalerParams::from_json(&json, &model.config().channel_names)?)
        }
        None => {
            warn!("⚠️ [Storage] No scaler in {}; predictions will use unscaled values", source.display());
            None
        }
    };

    info!(
        "✅ [Storage] Loaded model {:?} -> {:?} for channels {:?}",
        model.input_shape(),
        model.output_shape(),
        model.config().channel_names.names()
    );
    SensorForecaster::new(model, scaler)
}
