// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file or a missing key never stops
// the renderer from starting.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub scene: SceneConfig,
    pub camera: CameraConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkrt".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// FIFO when true, otherwise MAILBOX > IMMEDIATE > FIFO
    pub vsync: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self { vsync: true }
    }
}

/// What to load and where the compiled shaders live
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// glTF file to trace. The built-in triangle is used when absent.
    pub mesh: Option<PathBuf>,
    pub shader_dir: PathBuf,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            mesh: None,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

/// Initial camera placement and projection
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    pub target: [f32; 3],
    /// Vertical field of view in degrees
    pub vfov: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.5],
            target: [0.0, 0.0, 0.0],
            vfov: 40.0,
            near: 0.001,
            far: 10000.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
        }
    }
}

impl DebugConfig {
    /// Parse `log_level` into a filter
    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown log level '{}'", self.log_level))
    }
}

impl Config {
    /// Load config.toml, falling back to defaults
    ///
    /// Runs before the logger exists, so any fallback comes back as a message
    /// for the caller to log once logging is initialized.
    pub fn load() -> (Self, Vec<String>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Vec<String>) {
        let path = path.as_ref();
        match Self::load_from_path(path) {
            Ok(config) => (config, Vec::new()),
            Err(e) => (
                Config::default(),
                vec![format!("Failed to load {:?}: {:#}. Using defaults.", path, e)],
            ),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert!(config.graphics.vsync);
        assert!(config.scene.mesh.is_none());
        assert_eq!(config.scene.shader_dir, PathBuf::from("shaders"));
        assert_eq!(config.camera.vfov, 40.0);
        assert_eq!(config.camera.position, [0.0, 0.0, 0.5]);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [window]
            width = 1024

            [graphics]
            vsync = false

            [scene]
            mesh = "assets/bunny.gltf"
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 600);
        assert!(!config.graphics.vsync);
        assert_eq!(config.scene.mesh, Some(PathBuf::from("assets/bunny.gltf")));
        assert_eq!(config.camera.far, 10000.0);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml("[window\nwidth = ").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.window.title, "vkrt");
    }

    #[test]
    fn log_level_parses_known_names() {
        let mut debug = DebugConfig::default();
        debug.log_level = "debug".to_string();
        assert_eq!(debug.level_filter().unwrap(), log::LevelFilter::Debug);
        debug.log_level = "nonsense".to_string();
        let err = debug.level_filter().unwrap_err();
        assert!(err.to_string().contains("nonsense"));
    }

    #[test]
    fn unreadable_config_falls_back_with_a_message() {
        let path = std::env::temp_dir().join(format!("vkrt_bad_config_{}.toml", std::process::id()));
        std::fs::write(&path, "[window\nwidth = ").unwrap();
        let (config, warnings) = Config::load_or_default(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(config.window.width, 800);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Using defaults"));
    }

    #[test]
    fn missing_config_has_no_messages() {
        let (_, warnings) = Config::load_or_default("definitely/not/here.toml");
        assert!(warnings.is_empty());
    }
}
