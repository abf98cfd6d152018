use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::io::TiffCompression;

/// Engine settings that persist across sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of snapshots kept in history
    pub snapshot_capacity: usize,
    /// Memory cap for the snapshot history, in MiB
    pub snapshot_memory_mb: usize,
    /// Magic wand tolerance in [0, 1]
    pub default_tolerance: f32,
    /// Width bound of the interactive preview render
    pub preview_max_width: u32,
    pub jpeg_quality: u8,
    pub tiff_compression: TiffCompression,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            snapshot_capacity: 20,
            snapshot_memory_mb: 256,
            default_tolerance: 0.1,
            preview_max_width: 1024,
            jpeg_quality: 90,
            tiff_compression: TiffCompression::Lzw,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file:
    /// `<config dir>/layercraft/settings.json` (`~/.config` on Linux,
    /// `%APPDATA%` on Windows, `~/Library/Application Support` on macOS).
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("layercraft").join("settings.json"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`.  A missing file yields defaults silently; a
    /// malformed one yields defaults with a warning.
    pub fn load_from(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("could not read settings {}: {e}", path.display());
                }
                return Self::default();
            }
        };
        match serde_json::from_str::<Self>(&text) {
            Ok(mut settings) => {
                settings.validate();
                settings
            }
            Err(e) => {
                log::warn!("ignoring malformed settings {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::settings_path()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no config directory"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Clamp every field into its usable range.
    pub fn validate(&mut self) {
        self.snapshot_capacity = self.snapshot_capacity.clamp(1, 1000);
        self.snapshot_memory_mb = self.snapshot_memory_mb.clamp(1, 1 << 20);
        self.default_tolerance = if self.default_tolerance.is_finite() {
            self.default_tolerance.clamp(0.0, 1.0)
        } else {
            0.1
        };
        self.preview_max_width = self.preview_max_width.clamp(16, 16_384);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EngineSettings::load_from(&dir.path().join("nope.json"));
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = EngineSettings {
            snapshot_capacity: 7,
            tiff_compression: TiffCompression::Deflate,
            ..EngineSettings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(EngineSettings::load_from(&path), settings);
    }

    #[test]
    fn partial_and_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "default_tolerance": 4.0, "jpeg_quality": 0 }"#).unwrap();
        let settings = EngineSettings::load_from(&path);
        assert_eq!(settings.default_tolerance, 1.0);
        assert_eq!(settings.jpeg_quality, 1);
        assert_eq!(settings.snapshot_capacity, 20);
    }

    #[test]
    fn huge_memory_cap_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, format!(r#"{{ "snapshot_memory_mb": {} }}"#, usize::MAX)).unwrap();
        let settings = EngineSettings::load_from(&path);
        assert_eq!(settings.snapshot_memory_mb, 1 << 20);
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "snapshot_capacity = 3").unwrap();
        assert_eq!(EngineSettings::load_from(&path), EngineSettings::default());
    }
}
