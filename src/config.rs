// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section and key is optional. A missing file means defaults; a broken
// file is reported and also falls back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use winit::keyboard::KeyCode;
use crate::model::MAX_SIERPINSKI_DEPTH;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub scene: SceneConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Ember App".to_string(),
            width: 960,
            height: 540,
            fullscreen: false,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Compiled SPIR-V binaries used by the graphics pipeline
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
    pub hot_reload: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/simple_shader.vert.spv"),
            fragment: PathBuf::from("shaders/simple_shader.frag.spv"),
            hot_reload: true,
        }
    }
}

/// Which hard-coded geometry to upload
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Triangle,
    Sierpinski,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub model: ModelKind,
    pub sierpinski_depth: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Triangle,
            sierpinski_depth: 5,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: PathBuf,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: PathBuf::from("ember.log"),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

/// Default config file, relative to the working directory
pub const CONFIG_PATH: &str = "config.toml";

impl Config {
    /// Load `config.toml`, falling back to defaults.
    ///
    /// Logging is configured from the result, so a load error is handed
    /// back to be reported once the logger is up.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default(CONFIG_PATH)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
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

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        if config.graphics.max_frames_in_flight == 0 {
            log::warn!("max_frames_in_flight must be at least 1, using 1");
            config.graphics.max_frames_in_flight = 1;
        }
        if config.scene.sierpinski_depth > MAX_SIERPINSKI_DEPTH {
            log::warn!(
                "sierpinski_depth {} is too deep, using {}",
                config.scene.sierpinski_depth,
                MAX_SIERPINSKI_DEPTH
            );
            config.scene.sierpinski_depth = MAX_SIERPINSKI_DEPTH;
        }
        Ok(config)
    }

    /// Preferred present mode as Vulkan enum
    pub fn present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::MAILBOX
            }
        }
    }

    pub fn fullscreen_key(&self) -> KeyCode {
        parse_key(&self.controls.fullscreen_key).unwrap_or_else(|| {
            log::warn!("Unknown fullscreen key '{}', using F11", self.controls.fullscreen_key);
            KeyCode::F11
        })
    }

    pub fn quit_key(&self) -> KeyCode {
        parse_key(&self.controls.quit_key).unwrap_or_else(|| {
            log::warn!("Unknown quit key '{}', using Escape", self.controls.quit_key);
            KeyCode::Escape
        })
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

/// Map a key name from the config file to a physical key code.
///
/// Accepts single letters and digits, F1-F12 and a handful of named keys.
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let name = name.trim();
    let key = match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "backspace" => KeyCode::Backspace,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "a" => KeyCode::KeyA,
        "b" => KeyCode::KeyB,
        "c" => KeyCode::KeyC,
        "d" => KeyCode::KeyD,
        "e" => KeyCode::KeyE,
        "f" => KeyCode::KeyF,
        "g" => KeyCode::KeyG,
        "h" => KeyCode::KeyH,
        "i" => KeyCode::KeyI,
        "j" => KeyCode::KeyJ,
        "k" => KeyCode::KeyK,
        "l" => KeyCode::KeyL,
        "m" => KeyCode::KeyM,
        "n" => KeyCode::KeyN,
        "o" => KeyCode::KeyO,
        "p" => KeyCode::KeyP,
        "q" => KeyCode::KeyQ,
        "r" => KeyCode::KeyR,
        "s" => KeyCode::KeyS,
        "t" => KeyCode::KeyT,
        "u" => KeyCode::KeyU,
        "v" => KeyCode::KeyV,
        "w" => KeyCode::KeyW,
        "x" => KeyCode::KeyX,
        "y" => KeyCode::KeyY,
        "z" => KeyCode::KeyZ,
        "0" => KeyCode::Digit0,
        "1" => KeyCode::Digit1,
        "2" => KeyCode::Digit2,
        "3" => KeyCode::Digit3,
        "4" => KeyCode::Digit4,
        "5" => KeyCode::Digit5,
        "6" => KeyCode::Digit6,
        "7" => KeyCode::Digit7,
        "8" => KeyCode::Digit8,
        "9" => KeyCode::Digit9,
        _ => return None,
    };
    Some(key)
}

/// Resolve an asset path: as given (relative to the working directory),
/// otherwise relative to the crate root.
pub fn resolve_asset_path(path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }
    let fallback = Path::new(env!("CARGO_MANIFEST_DIR")).join(path);
    if fallback.exists() {
        fallback
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.title, "Ember App");
        assert_eq!((config.window.width, config.window.height), (960, 540));
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.scene.model, ModelKind::Triangle);
        assert!(config.shaders.hot_reload);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 1920

            [scene]
            model = "sierpinski"
            sierpinski_depth = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.height, 540);
        assert_eq!(config.scene.model, ModelKind::Sierpinski);
        assert_eq!(config.scene.sierpinski_depth, 3);
        assert_eq!(config.controls.quit_key, "Escape");
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let config = Config::parse("[graphics]\nmax_frames_in_flight = 0").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 1);
    }

    #[test]
    fn excessive_sierpinski_depth_is_clamped() {
        let config = Config::parse("[scene]\nsierpinski_depth = 41").unwrap();
        assert_eq!(config.scene.sierpinski_depth, MAX_SIERPINSKI_DEPTH);

        let config = Config::parse("[scene]\nsierpinski_depth = 4").unwrap();
        assert_eq!(config.scene.sierpinski_depth, 4);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
        assert!(Config::parse("[scene]\nmodel = \"teapot\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist/config.toml").unwrap();
        assert_eq!(config.graphics.present_mode, "mailbox");
    }

    #[test]
    fn broken_file_falls_back_to_defaults_with_error() {
        let path = std::env::temp_dir().join(format!("ember-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[window]\nwidth = \"wide\"").unwrap();

        let (config, error) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.width, 960);
        let error = error.expect("malformed config should report an error");
        assert!(format!("{:#}", error).contains("Failed to parse config file"));
    }

    #[test]
    fn missing_file_falls_back_without_error() {
        let (config, error) = Config::load_or_default("does/not/exist/config.toml");
        assert!(error.is_none());
        assert_eq!(config.window.title, "Ember App");
    }

    #[test]
    fn present_mode_names() {
        let mut config = Config::default();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        config.graphics.present_mode = "FIFO".to_string();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        config.graphics.present_mode = "fifo_relaxed".to_string();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
        config.graphics.present_mode = "vsync please".to_string();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn key_names() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key(" f11 "), Some(KeyCode::F11));
        assert_eq!(parse_key("Q"), Some(KeyCode::KeyQ));
        assert_eq!(parse_key("7"), Some(KeyCode::Digit7));
        assert_eq!(parse_key("Hyper"), None);

        let mut config = Config::default();
        config.controls.quit_key = "Hyper".to_string();
        assert_eq!(config.quit_key(), KeyCode::Escape);
    }

    #[test]
    fn log_level_parsing() {
        let mut config = Config::default();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
        config.debug.log_level = "debug".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        config.debug.log_level = "loud".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }
}
